use std::sync::Arc;

use anyhow::anyhow;
use oabot_core::current_unix_timestamp_ms;
use thiserror::Error;

use crate::oauth_client::{OauthClient, OauthTokenResponse};
use crate::token_store::{TokenRecord, TokenStore};

const DEFAULT_OAUTH_BASE: &str = "https://oauth.zaloapp.com";
const DEFAULT_EXPIRY_SKEW_MS: u64 = 120_000;
const DEFAULT_STATIC_TOKEN_TTL_MS: u64 = 23 * 60 * 60 * 1_000;
const DEFAULT_REFRESH_RETRY_TTL_MS: u64 = 60_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no access token, refresh token, or bootstrap code is configured")]
    NoCredentials,
    #[error("token refresh failed: {0}")]
    Refresh(anyhow::Error),
    #[error("authorization code exchange failed: {0}")]
    Exchange(anyhow::Error),
}

/// Configuration for [`TokenManager`].
///
/// Static credentials take precedence over the store-backed mode; the
/// provider order is access-token-only, then access+refresh, then stored
/// record with optional one-time code bootstrap.
#[derive(Clone)]
pub struct TokenManagerConfig {
    pub app_id: String,
    pub secret_key: String,
    pub oauth_base: String,
    pub redirect_uri: Option<String>,
    pub static_access_token: Option<String>,
    pub static_refresh_token: Option<String>,
    pub bootstrap_code: Option<String>,
    pub expiry_skew_ms: u64,
    /// Cache TTL for a pre-provisioned access token that has no refresh
    /// token. After it lapses the same token is reissued, never refreshed.
    pub static_token_ttl_ms: u64,
    /// Cache TTL applied to the fallback token after a failed refresh so the
    /// next caller retries soon.
    pub refresh_retry_ttl_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            secret_key: String::new(),
            oauth_base: DEFAULT_OAUTH_BASE.to_string(),
            redirect_uri: None,
            static_access_token: None,
            static_refresh_token: None,
            bootstrap_code: None,
            expiry_skew_ms: DEFAULT_EXPIRY_SKEW_MS,
            static_token_ttl_ms: DEFAULT_STATIC_TOKEN_TTL_MS,
            refresh_retry_ttl_ms: DEFAULT_REFRESH_RETRY_TTL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

enum CredentialMode {
    AccessOnly { access: String },
    AccessWithRefresh { access: String, refresh: String },
    Stored,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Produces a currently-valid access token on demand.
///
/// The cached record is read and replaced only under one async mutex, so a
/// check-then-refresh-then-store sequence never races another caller into a
/// double refresh that would clobber a rotated refresh token.
pub struct TokenManager {
    config: TokenManagerConfig,
    oauth: OauthClient,
    store: Arc<dyn TokenStore>,
    cached: tokio::sync::Mutex<Option<TokenRecord>>,
}

impl TokenManager {
    pub fn new(config: TokenManagerConfig, store: Arc<dyn TokenStore>) -> anyhow::Result<Self> {
        let oauth = OauthClient::new(
            config.oauth_base.clone(),
            config.app_id.clone(),
            config.secret_key.clone(),
            config.redirect_uri.clone(),
            config.request_timeout_ms,
        )?;
        Ok(Self {
            config,
            oauth,
            store,
            cached: tokio::sync::Mutex::new(None),
        })
    }

    fn mode(&self) -> CredentialMode {
        let access = non_empty(self.config.static_access_token.as_deref());
        let refresh = non_empty(self.config.static_refresh_token.as_deref());
        match (access, refresh) {
            (Some(access), None) => CredentialMode::AccessOnly { access },
            (Some(access), Some(refresh)) => CredentialMode::AccessWithRefresh { access, refresh },
            (None, _) => CredentialMode::Stored,
        }
    }

    /// Returns a valid access token, refreshing or bootstrapping as needed.
    ///
    /// `force` bypasses the freshness check and performs an unconditional
    /// refresh; the outbound sender uses it after a token-expired send error.
    /// In access-token-only mode the refresh endpoint is never contacted,
    /// forced or not — there is nothing to refresh.
    pub async fn ensure_access_token(&self, force: bool) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        let now = current_unix_timestamp_ms();

        if !force {
            if let Some(record) = cached.as_ref() {
                if record.is_valid(now, self.config.expiry_skew_ms) {
                    return Ok(record.access_token.clone());
                }
            }
        }

        match self.mode() {
            CredentialMode::AccessOnly { access } => {
                let record = TokenRecord {
                    access_token: access.clone(),
                    refresh_token: None,
                    expires_at_unix_ms: now.saturating_add(self.config.static_token_ttl_ms),
                };
                *cached = Some(record);
                Ok(access)
            }
            CredentialMode::AccessWithRefresh { access, refresh } => {
                let refresh_source = cached
                    .as_ref()
                    .and_then(|record| record.refresh_token.clone())
                    .unwrap_or(refresh);
                match self.oauth.refresh(&refresh_source).await {
                    Ok(response) => {
                        let record =
                            self.record_from_response(&response, Some(refresh_source), now);
                        self.persist_best_effort(&record).await;
                        let access_token = record.access_token.clone();
                        *cached = Some(record);
                        Ok(access_token)
                    }
                    Err(error) => {
                        // Fall back to the last-known access token and retry
                        // soon rather than failing the caller outright.
                        tracing::warn!(%error, "token refresh failed; serving last-known access token");
                        let fallback = cached
                            .as_ref()
                            .map(|record| record.access_token.clone())
                            .unwrap_or(access);
                        *cached = Some(TokenRecord {
                            access_token: fallback.clone(),
                            refresh_token: Some(refresh_source),
                            expires_at_unix_ms: now
                                .saturating_add(self.config.refresh_retry_ttl_ms),
                        });
                        Ok(fallback)
                    }
                }
            }
            CredentialMode::Stored => self.ensure_stored(&mut cached, now, force).await,
        }
    }

    async fn ensure_stored(
        &self,
        cached: &mut Option<TokenRecord>,
        now: u64,
        force: bool,
    ) -> Result<String, TokenError> {
        if cached.is_none() {
            match self.store.load().await {
                Ok(record) => *cached = record,
                Err(error) => {
                    tracing::warn!(%error, "token store load failed; treating record as missing");
                }
            }
        }

        let Some(record) = cached.clone() else {
            // Nothing stored yet: bootstrap from an env refresh token first,
            // then from a one-time authorization code.
            let record = if let Some(refresh) = non_empty(self.config.static_refresh_token.as_deref())
            {
                let response = self
                    .oauth
                    .refresh(&refresh)
                    .await
                    .map_err(TokenError::Refresh)?;
                self.record_from_response(&response, Some(refresh), now)
            } else if let Some(code) = non_empty(self.config.bootstrap_code.as_deref()) {
                let response = self
                    .oauth
                    .exchange_code(&code)
                    .await
                    .map_err(TokenError::Exchange)?;
                self.record_from_response(&response, None, now)
            } else {
                return Err(TokenError::NoCredentials);
            };
            self.persist_best_effort(&record).await;
            let access_token = record.access_token.clone();
            *cached = Some(record);
            return Ok(access_token);
        };

        if !force && record.is_valid(now, self.config.expiry_skew_ms) {
            return Ok(record.access_token);
        }

        let Some(refresh) = record
            .refresh_token
            .clone()
            .or_else(|| non_empty(self.config.static_refresh_token.as_deref()))
        else {
            return Err(TokenError::Refresh(anyhow!(
                "stored token is no longer valid and no refresh token is available"
            )));
        };

        let response = self
            .oauth
            .refresh(&refresh)
            .await
            .map_err(TokenError::Refresh)?;
        let next = self.record_from_response(&response, Some(refresh), now);
        self.persist_best_effort(&next).await;
        let access_token = next.access_token.clone();
        *cached = Some(next);
        Ok(access_token)
    }

    fn record_from_response(
        &self,
        response: &OauthTokenResponse,
        previous_refresh: Option<String>,
        now: u64,
    ) -> TokenRecord {
        TokenRecord {
            access_token: response.access_token.clone().unwrap_or_default(),
            // Refresh tokens rotate; a response that omits one means the old
            // token stays usable and must be retained.
            refresh_token: response
                .refresh_token
                .clone()
                .filter(|value| !value.trim().is_empty())
                .or(previous_refresh),
            expires_at_unix_ms: now
                .saturating_add(response.expires_in_seconds().saturating_mul(1_000)),
        }
    }

    async fn persist_best_effort(&self, record: &TokenRecord) {
        if let Err(error) = self.store.save(record).await {
            tracing::warn!(%error, "failed to persist token record; continuing with in-memory copy");
        }
    }
}
