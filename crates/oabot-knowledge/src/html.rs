use anyhow::{Context, Result};
use regex::Regex;

/// Converts the knowledge source's HTML articles into message-ready plain
/// text. Just enough for chat output: line breaks for block boundaries,
/// bullets for list items, tags dropped, common entities decoded.
pub struct HtmlStripper {
    line_breaks: Regex,
    block_closers: Regex,
    list_items: Regex,
    tags: Regex,
    space_before_newline: Regex,
    newline_runs: Regex,
}

impl HtmlStripper {
    pub fn new() -> Result<Self> {
        Ok(Self {
            line_breaks: Regex::new(r"(?i)<br\s*/?>").context("line break pattern")?,
            block_closers: Regex::new(r"(?i)</(?:p|div|h[1-6]|li)>").context("block pattern")?,
            list_items: Regex::new(r"(?i)<li[^>]*>").context("list item pattern")?,
            tags: Regex::new(r"</?[^>]+>").context("tag pattern")?,
            space_before_newline: Regex::new(r"[ \t]+\n").context("space pattern")?,
            newline_runs: Regex::new(r"\n{3,}").context("newline run pattern")?,
        })
    }

    pub fn strip(&self, html: &str) -> String {
        let text = self.line_breaks.replace_all(html, "\n");
        let text = self.block_closers.replace_all(&text, "\n");
        let text = self.list_items.replace_all(&text, "• ");
        let text = self.tags.replace_all(&text, " ");
        let text = text
            .replace("&nbsp;", " ")
            .replace('\u{a0}', " ")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'");
        let text = self.space_before_newline.replace_all(&text, "\n");
        let text = self.newline_runs.replace_all(&text, "\n\n");
        text.split('\n')
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}
