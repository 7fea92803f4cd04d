use anyhow::Result;
use async_trait::async_trait;
use oabot_knowledge::KnowledgeDocument;

/// One prior exchange in a conversation, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Black-box reply generation seam.
///
/// The dispatcher supplies knowledge-cache documents as optional grounding;
/// implementations may ignore them, match FAQs, or call a generative model.
/// The runtime depends only on this trait.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        history: &[ChatTurn],
        user_text: &str,
        knowledge: &[KnowledgeDocument],
    ) -> Result<String>;
}

/// Degenerate generator that always answers with one configured string.
/// Useful as a deploy-time placeholder and as the last-resort strategy.
pub struct FallbackReplyGenerator {
    message: String,
}

impl FallbackReplyGenerator {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

#[async_trait]
impl ReplyGenerator for FallbackReplyGenerator {
    async fn generate(
        &self,
        _history: &[ChatTurn],
        _user_text: &str,
        _knowledge: &[KnowledgeDocument],
    ) -> Result<String> {
        Ok(self.message.clone())
    }
}
