use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

const TOKEN_ENDPOINT_PATH: &str = "/v4/oa/access_token";
const DEFAULT_EXPIRES_IN_SECONDS: u64 = 90_000;

/// Token endpoint response. `expires_in` arrives as either a number or a
/// numeric string depending on platform version, so it is decoded leniently.
#[derive(Debug, Clone, Deserialize)]
pub struct OauthTokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
}

impl OauthTokenResponse {
    /// Seconds until expiry, defaulting conservatively when the field is
    /// missing or unparseable.
    pub fn expires_in_seconds(&self) -> u64 {
        match &self.expires_in {
            Some(Value::Number(number)) => number.as_u64().unwrap_or(DEFAULT_EXPIRES_IN_SECONDS),
            Some(Value::String(text)) => {
                text.trim().parse().unwrap_or(DEFAULT_EXPIRES_IN_SECONDS)
            }
            _ => DEFAULT_EXPIRES_IN_SECONDS,
        }
    }
}

/// HTTP client for the platform OAuth token endpoint.
///
/// The shared secret travels in the `secret_key` request header, never in the
/// form body or query string. That is a platform requirement, not a choice.
pub struct OauthClient {
    http: reqwest::Client,
    oauth_base: String,
    app_id: String,
    secret_key: String,
    redirect_uri: Option<String>,
}

impl OauthClient {
    pub fn new(
        oauth_base: String,
        app_id: String,
        secret_key: String,
        redirect_uri: Option<String>,
        request_timeout_ms: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create oauth http client")?;
        Ok(Self {
            http,
            oauth_base: oauth_base.trim_end_matches('/').to_string(),
            app_id,
            secret_key: secret_key.trim().to_string(),
            redirect_uri,
        })
    }

    /// Exchanges a one-time authorization code for the first token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<OauthTokenResponse> {
        let mut form = vec![
            ("app_id", self.app_id.clone()),
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
        ];
        if let Some(redirect_uri) = self
            .redirect_uri
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            form.push(("redirect_uri", redirect_uri.to_string()));
        }
        self.post_token_form("code exchange", &form).await
    }

    /// Mints a new access token from a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OauthTokenResponse> {
        let form = vec![
            ("app_id", self.app_id.clone()),
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.post_token_form("token refresh", &form).await
    }

    async fn post_token_form(
        &self,
        operation: &str,
        form: &[(&str, String)],
    ) -> Result<OauthTokenResponse> {
        let response = self
            .http
            .post(format!("{}{}", self.oauth_base, TOKEN_ENDPOINT_PATH))
            .header("secret_key", &self.secret_key)
            .form(form)
            .send()
            .await
            .with_context(|| format!("oauth {operation} request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "oauth {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 320)
            );
        }

        let parsed = response
            .json::<OauthTokenResponse>()
            .await
            .with_context(|| format!("failed to decode oauth {operation} response"))?;
        if parsed
            .access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .is_none()
        {
            bail!("oauth {operation} response did not include an access token");
        }
        Ok(parsed)
    }
}

fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let truncated: String = body.chars().take(max_chars).collect();
    format!("{truncated}…")
}
