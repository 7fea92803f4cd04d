use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use oabot_core::{is_expired_with_skew_ms, write_text_atomic};
use serde::{Deserialize, Serialize};

/// Persisted access/refresh token pair with an absolute expiry instant.
///
/// Records are replaced wholesale on every successful refresh or exchange;
/// no field is ever updated in isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Millisecond epoch instant, `issued_at + expires_in`.
    #[serde(rename = "expires_at")]
    pub expires_at_unix_ms: u64,
}

impl TokenRecord {
    /// True while `now < expires_at - skew`.
    pub fn is_valid(&self, now_unix_ms: u64, skew_ms: u64) -> bool {
        !is_expired_with_skew_ms(Some(self.expires_at_unix_ms), now_unix_ms, skew_ms)
    }
}

/// Durable persistence for the current token record.
///
/// `load` never fails on a missing record; it returns `Ok(None)`. `save`
/// failures are surfaced so the manager can log them, but the in-memory
/// cache stays the source of truth for the process lifetime.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenRecord>>;
    async fn save(&self, record: &TokenRecord) -> Result<()>;
}

/// File-backed token store holding one JSON object (`tokens.json` layout).
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<TokenRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read token file {}", self.path.display()))?;
        match serde_json::from_str::<TokenRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(error) => {
                // An unreadable record is treated as missing so the manager
                // can re-provision instead of wedging on corrupt state.
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "token file is not a valid record; ignoring it"
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &TokenRecord) -> Result<()> {
        let mut payload =
            serde_json::to_string_pretty(record).context("failed to serialize token record")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write token file {}", self.path.display()))
    }
}
