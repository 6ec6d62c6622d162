//! Storage seam for conversations, messages and usage.
//!
//! Every method is one atomic unit: the Postgres store runs it in a single
//! transaction, the in-memory store under a single lock. Callers never
//! compose two calls into a larger atomic operation.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{
    Conversation, ConversationId, DeliveryState, DeliveryUpdate, Feature, Message, NewMessage,
    PageCursor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Connection loss, pool exhaustion, serialization failure; safe to retry
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        match e.code() {
            Some(code)
                if *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::ADMIN_SHUTDOWN
                    || *code == SqlState::TOO_MANY_CONNECTIONS =>
            {
                StoreError::Transient(e.to_string())
            }
            Some(code) if *code == SqlState::UNIQUE_VIOLATION => StoreError::Conflict(e.to_string()),
            Some(_) => StoreError::Backend(e.to_string()),
            // No SQLSTATE means the connection itself failed
            None => StoreError::Transient(e.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Transient(e.to_string())
    }
}

/// Result of an append; `created == false` means an idempotent replay
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub created: bool,
}

/// Result of a counted-window consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowedConsume {
    /// Event recorded; `used` includes it
    Recorded { used: u32 },
    /// Limit reached; nothing recorded
    Full { oldest: Option<DateTime<Utc>> },
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert the conversation if absent and return the stored row.
    async fn get_or_create_conversation(
        &self,
        id: &ConversationId,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: &ConversationId)
        -> Result<Option<Conversation>, StoreError>;

    /// Append with state `Sent`, bump the conversation's last activity and
    /// the recipient's unread counter, and un-archive it for the recipient.
    /// Replays of `(sender_id, client_message_id)` return the stored message.
    async fn append_message(&self, message: NewMessage) -> Result<AppendOutcome, StoreError>;

    /// Newest-first page ordered by `(created_at DESC, id DESC)`.
    async fn list_messages(
        &self,
        id: &ConversationId,
        limit: usize,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<Message>, StoreError>;

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Message previously stored for `(sender_id, client_message_id)`, if any.
    async fn find_client_message(
        &self,
        sender_id: Uuid,
        client_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Apply one delivery transition under a row lock, appending a receipt
    /// and adjusting the recipient's unread counter when the message leaves
    /// the unread set.
    async fn transition_message(
        &self,
        message_id: Uuid,
        target: DeliveryState,
        now: DateTime<Utc>,
    ) -> Result<DeliveryUpdate, StoreError>;

    /// Mark every unread message addressed to `recipient_id` as read and zero
    /// the counter. Returns the number of messages changed.
    async fn mark_read_bulk(
        &self,
        id: &ConversationId,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn unread_counts(&self, user_id: Uuid) -> Result<HashMap<ConversationId, i64>, StoreError>;

    /// Flag the conversation as archived for one participant. Returns false
    /// when the user is not a participant.
    async fn archive_conversation(
        &self,
        id: &ConversationId,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Count events since `since` and record one more iff fewer than `limit`,
    /// atomically per `(user_id, feature)`.
    ///
    /// An `idempotency_key` already recorded for this `(user_id, feature)`
    /// records nothing and reports `Recorded` with the current count, even
    /// when the window is full.
    async fn consume_windowed(
        &self,
        user_id: Uuid,
        feature: Feature,
        limit: u32,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<WindowedConsume, StoreError>;

    /// Increment the monthly counter iff it is below `limit`. Returns the new
    /// count, or `None` when the limit is already reached. A repeated
    /// `idempotency_key` leaves the counter alone and returns its value.
    async fn consume_monthly(
        &self,
        user_id: Uuid,
        feature: Feature,
        limit: u32,
        month_key: &str,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<u32>, StoreError>;

    /// Audit-only event for unlimited features.
    async fn record_event(
        &self,
        user_id: Uuid,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Number of events since `since` and the oldest of them.
    async fn count_events(
        &self,
        user_id: Uuid,
        feature: Feature,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), StoreError>;

    async fn monthly_count(
        &self,
        user_id: Uuid,
        feature: Feature,
        month_key: &str,
    ) -> Result<u32, StoreError>;
}
