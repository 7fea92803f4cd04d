//! Runtime plumbing for the OA webhook bot: subscriber bookkeeping, the
//! platform send path with its single retry-on-expiry, inbound event
//! extraction, the reply-generation seam, background webhook dispatch, and
//! the scheduled broadcast fan-out.

mod broadcast;
mod dispatch;
mod event;
mod reply;
mod send;
mod subscriber_store;

pub use broadcast::{
    BroadcastConfig, BroadcastScheduler, BroadcastSummary, ScheduledBroadcastItem,
};
pub use dispatch::{DispatchConfig, WebhookDispatcher};
pub use event::{extract_inbound_event, InboundEvent, InboundEventKind};
pub use reply::{ChatTurn, FallbackReplyGenerator, ReplyGenerator};
pub use send::{DeliveryResult, MessageClient, OutboundSender, SEND_MAX_CHARS};
pub use subscriber_store::{FileSubscriberStore, RemoteKvSubscriberStore, SubscriberStore};

#[cfg(test)]
mod tests;
