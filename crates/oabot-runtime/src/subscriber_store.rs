use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use oabot_core::write_text_atomic;
use serde::Deserialize;
use serde_json::json;

/// Durable, deduplicated set of user ids eligible for broadcasts.
///
/// `add` is idempotent. Callers on the webhook reply path treat failures as
/// log-and-continue; bookkeeping must never block a reply.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn add(&self, user_id: &str) -> Result<()>;
    async fn remove(&self, user_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// File-backed store holding one JSON array (`subscribers.json` layout).
pub struct FileSubscriberStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileSubscriberStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn load_list(&self) -> Vec<String> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let Ok(parsed) = serde_json::from_str::<Vec<String>>(&raw) else {
            tracing::warn!(
                path = %self.path.display(),
                "subscriber file is not a JSON string array; starting empty"
            );
            return Vec::new();
        };
        dedup_preserving_order(parsed)
    }

    fn save_list(&self, list: &[String]) -> Result<()> {
        let mut payload =
            serde_json::to_string_pretty(list).context("failed to serialize subscriber list")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write subscriber file {}", self.path.display()))
    }
}

#[async_trait]
impl SubscriberStore for FileSubscriberStore {
    async fn add(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut list = self.load_list();
        if list.iter().any(|existing| existing == user_id) {
            return Ok(());
        }
        list.push(user_id.to_string());
        self.save_list(&list)
    }

    async fn remove(&self, user_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut list = self.load_list();
        let before = list.len();
        list.retain(|existing| existing != user_id);
        if list.len() == before {
            return Ok(());
        }
        self.save_list(&list)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_list())
    }
}

fn dedup_preserving_order(list: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    list.into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
struct KvMembersResponse {
    #[serde(default)]
    members: Vec<String>,
}

/// Store backed by a remote set-add/set-members key-value service, with an
/// optional local file fallback when the remote write path is unavailable.
pub struct RemoteKvSubscriberStore {
    http: reqwest::Client,
    base_url: String,
    set_key: String,
    fallback: Option<FileSubscriberStore>,
}

impl RemoteKvSubscriberStore {
    pub fn new(
        base_url: String,
        set_key: String,
        request_timeout_ms: u64,
        fallback: Option<FileSubscriberStore>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create subscriber kv client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            set_key,
            fallback,
        })
    }

    async fn post_member(&self, operation: &str, user_id: &str) -> Result<()> {
        let url = format!("{}/sets/{}/{}", self.base_url, self.set_key, operation);
        let response = self
            .http
            .post(&url)
            .json(&json!({"member": user_id}))
            .send()
            .await
            .with_context(|| format!("subscriber kv {operation} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "subscriber kv {operation} failed with status {}",
                status.as_u16()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for RemoteKvSubscriberStore {
    async fn add(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Ok(());
        }
        match self.post_member("add", user_id).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if let Some(fallback) = &self.fallback {
                    tracing::warn!(%error, "remote subscriber add failed; writing local fallback");
                    return fallback.add(user_id).await;
                }
                Err(error)
            }
        }
    }

    async fn remove(&self, user_id: &str) -> Result<()> {
        match self.post_member("remove", user_id).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if let Some(fallback) = &self.fallback {
                    tracing::warn!(%error, "remote subscriber remove failed; updating local fallback");
                    return fallback.remove(user_id).await;
                }
                Err(error)
            }
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let url = format!("{}/sets/{}/members", self.base_url, self.set_key);
        let result: Result<KvMembersResponse> = async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .context("subscriber kv members request failed")?;
            let status = response.status();
            if !status.is_success() {
                bail!(
                    "subscriber kv members failed with status {}",
                    status.as_u16()
                );
            }
            response
                .json::<KvMembersResponse>()
                .await
                .context("failed to decode subscriber kv members response")
        }
        .await;

        match result {
            Ok(parsed) => Ok(dedup_preserving_order(parsed.members)),
            Err(error) => {
                if let Some(fallback) = &self.fallback {
                    tracing::warn!(%error, "remote subscriber list failed; serving local fallback");
                    return fallback.list().await;
                }
                Err(error)
            }
        }
    }
}
