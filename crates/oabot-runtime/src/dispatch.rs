use std::sync::Arc;

use oabot_knowledge::KnowledgeCache;
use serde_json::Value;

use crate::event::{extract_inbound_event, InboundEventKind};
use crate::reply::ReplyGenerator;
use crate::send::OutboundSender;
use crate::subscriber_store::SubscriberStore;

#[derive(Clone)]
pub struct DispatchConfig {
    /// Apology substituted for the reply when generation or credentials
    /// fail. Raw error detail never reaches the end user.
    pub fallback_reply: String,
    pub knowledge_top_k: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fallback_reply: "Xin lỗi, hệ thống đang bận. Bạn vui lòng thử lại sau nhé.".to_string(),
            knowledge_top_k: 3,
        }
    }
}

/// Background processor for acknowledged webhook events.
///
/// The HTTP handler acks immediately and hands the payload here; everything
/// below is best-effort and observable only through logs, so the platform
/// never sees a processing failure and never re-delivers.
pub struct WebhookDispatcher {
    subscribers: Arc<dyn SubscriberStore>,
    knowledge: Arc<KnowledgeCache>,
    replies: Arc<dyn ReplyGenerator>,
    sender: Arc<OutboundSender>,
    config: DispatchConfig,
}

impl WebhookDispatcher {
    pub fn new(
        subscribers: Arc<dyn SubscriberStore>,
        knowledge: Arc<KnowledgeCache>,
        replies: Arc<dyn ReplyGenerator>,
        sender: Arc<OutboundSender>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            subscribers,
            knowledge,
            replies,
            sender,
            config,
        }
    }

    pub async fn handle_event(&self, payload: &Value) {
        let event = extract_inbound_event(payload);
        match event.kind {
            InboundEventKind::Follow => {
                if let Some(user_id) = event.user_id.as_deref() {
                    self.register_subscriber(user_id).await;
                }
            }
            InboundEventKind::Unfollow => {
                if let Some(user_id) = event.user_id.as_deref() {
                    if let Err(error) = self.subscribers.remove(user_id).await {
                        tracing::warn!(%error, user_id, "failed to remove unfollowed subscriber");
                    }
                }
            }
            InboundEventKind::UserText => {
                let (Some(user_id), Some(text)) = (event.user_id.as_deref(), event.text.as_deref())
                else {
                    return;
                };
                self.register_subscriber(user_id).await;
                self.reply_to(user_id, text).await;
            }
            InboundEventKind::Ignored => {
                tracing::debug!("ignoring webhook event without user id or text");
            }
        }
    }

    async fn register_subscriber(&self, user_id: &str) {
        if let Err(error) = self.subscribers.add(user_id).await {
            tracing::warn!(%error, user_id, "failed to register subscriber; replying anyway");
        }
    }

    async fn reply_to(&self, user_id: &str, text: &str) {
        if let Err(error) = self.knowledge.refresh(false).await {
            tracing::warn!(%error, "knowledge refresh failed before reply");
        }

        // A direct title hit answers immediately; otherwise the generator
        // runs with the best-scoring documents as grounding.
        let reply = if let Some(answer) = self.knowledge.find_title_answer(text).await {
            answer.answer
        } else {
            let docs = self.knowledge.search(text, self.config.knowledge_top_k).await;
            match self.replies.generate(&[], text, &docs).await {
                Ok(reply) if !reply.trim().is_empty() => reply,
                Ok(_) => self.config.fallback_reply.clone(),
                Err(error) => {
                    tracing::warn!(%error, user_id, "reply generation failed; using fallback");
                    self.config.fallback_reply.clone()
                }
            }
        };

        match self.sender.send(user_id, &reply).await {
            Ok(result) if result.is_success() => {
                tracing::debug!(user_id, "reply delivered");
            }
            Ok(result) => {
                tracing::warn!(
                    user_id,
                    error = result.error,
                    message = result.message.as_deref().unwrap_or_default(),
                    "platform rejected the reply"
                );
            }
            Err(error) => {
                tracing::warn!(%error, user_id, "no usable token; reply skipped");
            }
        }
    }
}
