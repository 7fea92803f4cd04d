use unicode_normalization::UnicodeNormalization;

/// Canonical normalization for all string matching in the bot.
///
/// Lowercases, applies Unicode NFC so composed and decomposed Vietnamese
/// input compare equal, collapses consecutive whitespace to one space, and
/// trims. Diacritics are kept; every matcher must go through this one
/// function so search and FAQ lookup agree on what "equal" means.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.nfc().flat_map(char::to_lowercase) {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}
