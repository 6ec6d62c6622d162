//! Live fan-out of conversation events to open connections.
//!
//! Delivery is best-effort and current-subscribers-only: there is no replay,
//! a client that reconnects re-reads history through the message list.

pub mod in_memory;
pub mod redis_bus;
pub mod registry;

pub use in_memory::InMemoryPubSub;
pub use redis_bus::RedisPubSub;
pub use registry::{LocalRegistry, SubscriberId};

use crate::models::{ConversationId, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewMessage {
        message: Message,
    },
    TypingStart {
        conversation_id: ConversationId,
        user_id: Uuid,
    },
    TypingStop {
        conversation_id: ConversationId,
        user_id: Uuid,
    },
    MessageDelivered {
        conversation_id: ConversationId,
        message_id: Uuid,
        recipient_id: Uuid,
        delivered_at: DateTime<Utc>,
    },
    MessageRead {
        conversation_id: ConversationId,
        reader_id: Uuid,
        /// `None` for a bulk read of the whole conversation
        message_id: Option<Uuid>,
        updated: u64,
        read_at: DateTime<Utc>,
    },
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRead { .. } => "message_read",
        }
    }
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("event encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Deliver to the conversation's current subscribers.
    async fn publish(
        &self,
        conversation_id: &ConversationId,
        event: RealtimeEvent,
    ) -> Result<(), PubSubError>;

    /// Open a subscription; dropping it unregisters the subscriber.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        user_id: Uuid,
    ) -> Result<Subscription, PubSubError>;

    /// Whether `user_id` has an open subscription on the conversation.
    async fn has_live_subscriber(&self, conversation_id: &ConversationId, user_id: Uuid) -> bool;

    /// Local subscriber count, for diagnostics.
    fn subscriber_count(&self, conversation_id: &ConversationId) -> usize;
}

/// Releases a subscriber's registry entry (and any presence it holds) on drop
pub(crate) trait SubscriptionGuard: Send + Sync {}

/// Stream of events for one subscriber on one conversation
pub struct Subscription {
    id: SubscriberId,
    receiver: Receiver<RealtimeEvent>,
    _guard: Box<dyn SubscriptionGuard>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        receiver: Receiver<RealtimeEvent>,
        guard: Box<dyn SubscriptionGuard>,
    ) -> Self {
        Self {
            id,
            receiver,
            _guard: guard,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the registry dropped this subscriber.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = RealtimeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
