use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use oabot_oauth::{TokenError, TokenManager};
use serde::Deserialize;
use serde_json::json;

/// Platform cap on outbound text length; longer replies are cut, not rejected.
pub const SEND_MAX_CHARS: usize = 2_000;

const SEND_ENDPOINT_PATH: &str = "/v2.0/oa/message";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Platform error codes meaning the access token lapsed or was invalidated.
/// Only these trigger the forced-refresh retry.
const TOKEN_EXPIRED_ERROR_CODES: [i64; 2] = [-124, -216];

/// Outcome of one platform send call. `error == 0` means delivered; any
/// other code is the platform's verdict. Transport failures are folded into
/// `error == -1` so the broadcast loop can keep counting instead of
/// unwinding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryResult {
    #[serde(default)]
    pub error: i64,
    #[serde(default)]
    pub message: Option<String>,
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        self.error == 0
    }

    pub fn is_token_expired(&self) -> bool {
        TOKEN_EXPIRED_ERROR_CODES.contains(&self.error)
    }

    fn transport_failure(detail: String) -> Self {
        Self {
            error: -1,
            message: Some(detail),
        }
    }
}

/// HTTP client for the platform message-send endpoint. The access token is
/// passed in the `access_token` header, never as a query parameter.
pub struct MessageClient {
    http: reqwest::Client,
    api_base: String,
}

impl MessageClient {
    pub fn new(api_base: String, request_timeout_ms: u64) -> Result<Self> {
        let timeout = if request_timeout_ms == 0 {
            DEFAULT_REQUEST_TIMEOUT_MS
        } else {
            request_timeout_ms
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout))
            .build()
            .context("failed to create message send client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn send_text(
        &self,
        access_token: &str,
        user_id: &str,
        text: &str,
    ) -> DeliveryResult {
        let truncated: String = text.chars().take(SEND_MAX_CHARS).collect();
        let payload = json!({
            "recipient": { "user_id": user_id },
            "message": { "text": truncated },
        });

        let response = self
            .http
            .post(format!("{}{}", self.api_base, SEND_ENDPOINT_PATH))
            .header("access_token", access_token)
            .json(&payload)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, user_id, "send request failed in transport");
                return DeliveryResult::transport_failure(error.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), user_id, "send rejected at http level");
            return DeliveryResult::transport_failure(format!("http status {}", status.as_u16()));
        }

        match response.json::<DeliveryResult>().await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(%error, user_id, "send response was not decodable");
                DeliveryResult::transport_failure(error.to_string())
            }
        }
    }
}

/// Send path with the bounded retry: one forced token refresh and one resend
/// when the platform reports an expired token, then whatever the second
/// attempt yields. Covers premature expiry from clock skew without opening
/// the door to retry loops.
pub struct OutboundSender {
    client: MessageClient,
    tokens: Arc<TokenManager>,
}

impl OutboundSender {
    pub fn new(client: MessageClient, tokens: Arc<TokenManager>) -> Self {
        Self { client, tokens }
    }

    pub async fn send(&self, user_id: &str, text: &str) -> Result<DeliveryResult, TokenError> {
        let access_token = self.tokens.ensure_access_token(false).await?;
        let first = self.client.send_text(&access_token, user_id, text).await;
        if !first.is_token_expired() {
            return Ok(first);
        }

        tracing::debug!(user_id, error = first.error, "token reported expired; retrying once");
        let refreshed = self.tokens.ensure_access_token(true).await?;
        Ok(self.client.send_text(&refreshed, user_id, text).await)
    }
}
