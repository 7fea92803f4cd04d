//! Periodically refreshed in-memory snapshot of externally hosted knowledge
//! articles, with TTL-based staleness, stale-on-failure semantics, and a
//! lightweight lexical search used as reply-generation context.

mod html;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use oabot_core::{current_unix_timestamp_ms, normalize_text};
use serde::Deserialize;
use serde_json::Value;

pub use html::HtmlStripper;

const DEFAULT_TTL_MS: u64 = 30 * 60 * 1_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_ANSWER_MAX_CHARS: usize = 3_500;

/// One plain-text article from the last successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeDocument {
    pub id: String,
    pub title: String,
    pub text: String,
}

/// A title-matched answer produced by [`KnowledgeCache::find_title_answer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleAnswer {
    pub title: String,
    pub answer: String,
}

#[derive(Clone)]
pub struct KnowledgeCacheConfig {
    pub source_url: String,
    pub ttl_ms: u64,
    pub request_timeout_ms: u64,
    /// When true, a fetch failure on the very first refresh (empty cache)
    /// propagates so a deployment can fail fast at boot. When false it
    /// yields an empty list instead.
    pub strict_first_fetch: bool,
}

impl Default for KnowledgeCacheConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            ttl_ms: DEFAULT_TTL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            strict_first_fetch: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct KnowledgeListResponse {
    #[serde(default)]
    data: Vec<KnowledgeListItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct KnowledgeListItem {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

struct IndexedDocument {
    doc: KnowledgeDocument,
    title_norm: String,
    text_norm: String,
}

#[derive(Default)]
struct CacheState {
    docs: Arc<Vec<KnowledgeDocument>>,
    index: Arc<Vec<IndexedDocument>>,
    last_fetch_unix_ms: Option<u64>,
}

/// Snapshot cache over the knowledge-source endpoint.
///
/// The whole document list is replaced atomically on each successful
/// refresh; a failed refresh keeps serving the previous snapshot and leaves
/// the staleness clock untouched so the next trigger retries.
pub struct KnowledgeCache {
    http: reqwest::Client,
    stripper: HtmlStripper,
    config: KnowledgeCacheConfig,
    state: tokio::sync::Mutex<CacheState>,
}

impl KnowledgeCache {
    pub fn new(config: KnowledgeCacheConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create knowledge http client")?;
        Ok(Self {
            http,
            stripper: HtmlStripper::new()?,
            config,
            state: tokio::sync::Mutex::new(CacheState::default()),
        })
    }

    /// Refetches the snapshot when stale (or unconditionally with `force`).
    /// A cache with no source URL configured stays empty and never fetches.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        if self.config.source_url.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let now = current_unix_timestamp_ms();
        if !force {
            if let Some(last) = state.last_fetch_unix_ms {
                if now.saturating_sub(last) < self.config.ttl_ms {
                    return Ok(());
                }
            }
        }

        match self.fetch_documents().await {
            Ok(docs) => {
                tracing::debug!(count = docs.len(), "knowledge cache refreshed");
                let index = docs
                    .iter()
                    .map(|doc| IndexedDocument {
                        doc: doc.clone(),
                        title_norm: normalize_text(&doc.title),
                        text_norm: normalize_text(&doc.text),
                    })
                    .collect::<Vec<_>>();
                state.docs = Arc::new(docs);
                state.index = Arc::new(index);
                state.last_fetch_unix_ms = Some(now);
                Ok(())
            }
            Err(error) => {
                let first_fetch = state.last_fetch_unix_ms.is_none() && state.docs.is_empty();
                if first_fetch && self.config.strict_first_fetch {
                    return Err(error.context("first knowledge fetch failed with an empty cache"));
                }
                tracing::warn!(%error, "knowledge refresh failed; serving previous snapshot");
                Ok(())
            }
        }
    }

    /// Current snapshot, possibly stale.
    pub async fn list(&self) -> Arc<Vec<KnowledgeDocument>> {
        self.state.lock().await.docs.clone()
    }

    /// Scores every document by token overlap against the normalized query.
    ///
    /// A query token found in the title counts double what a body hit
    /// counts; zero-score documents are dropped; ties keep list order.
    pub async fn search(&self, query: &str, top_k: usize) -> Vec<KnowledgeDocument> {
        let query_norm = normalize_text(query);
        let tokens: Vec<&str> = query_norm.split(' ').filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let index = self.state.lock().await.index.clone();
        let mut scored: Vec<(usize, &IndexedDocument)> = index
            .iter()
            .map(|entry| {
                let mut score = 0_usize;
                for token in &tokens {
                    if entry.title_norm.contains(token) {
                        score += 2;
                    }
                    if entry.text_norm.contains(token) {
                        score += 1;
                    }
                }
                (score, entry)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(top_k)
            .map(|(_, entry)| entry.doc.clone())
            .collect()
    }

    /// Finds an article whose title matches the user's question, preferring
    /// an exact normalized match over mutual containment. Returns stripped
    /// text truncated to a message-safe length.
    pub async fn find_title_answer(&self, user_text: &str) -> Option<TitleAnswer> {
        let query = normalize_text(user_text);
        if query.is_empty() {
            return None;
        }

        let index = self.state.lock().await.index.clone();
        let mut best: Option<&IndexedDocument> = None;
        for entry in index.iter() {
            if entry.title_norm.is_empty() {
                continue;
            }
            if query == entry.title_norm {
                best = Some(entry);
                break;
            }
            if best.is_none()
                && (query.contains(&entry.title_norm) || entry.title_norm.contains(&query))
            {
                best = Some(entry);
            }
        }

        best.map(|entry| TitleAnswer {
            title: entry.doc.title.trim().to_string(),
            answer: truncate_chars(&entry.doc.text, DEFAULT_ANSWER_MAX_CHARS),
        })
    }

    async fn fetch_documents(&self) -> Result<Vec<KnowledgeDocument>> {
        let response = self
            .http
            .get(&self.config.source_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("knowledge fetch request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("knowledge fetch failed with status {}", status.as_u16());
        }
        let parsed = response
            .json::<KnowledgeListResponse>()
            .await
            .context("failed to decode knowledge list response")?;

        Ok(parsed
            .data
            .into_iter()
            .map(|item| KnowledgeDocument {
                id: value_to_id(&item.id),
                title: item.title.unwrap_or_default(),
                text: self.stripper.strip(item.content.as_deref().unwrap_or_default()),
            })
            .collect())
    }
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", truncated.trim_end())
}
