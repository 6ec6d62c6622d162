//! Per-recipient delivery state and unread counters.
//!
//! Every transition runs through the store's row-locked `transition_message`;
//! this layer only authorizes, publishes the resulting realtime event and
//! turns rejected transitions into "here is the current state".

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{utc_now, ConversationId, CurrentUser, DeliveryState, DeliveryUpdate, Message};
use crate::realtime::{PubSub, RealtimeEvent};
use crate::services::authorization::AccessPolicy;
use crate::store::{MessageStore, StoreError};
use chrono::{DateTime, Utc};
use resilience::{with_retry_if, RetryConfig, RetryError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct BulkReadResult {
    pub updated: u64,
    pub read_at: DateTime<Utc>,
}

pub struct DeliveryTracker {
    store: Arc<dyn MessageStore>,
    pubsub: Arc<dyn PubSub>,
    access: Arc<dyn AccessPolicy>,
    retry: RetryConfig,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        pubsub: Arc<dyn PubSub>,
        access: Arc<dyn AccessPolicy>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            pubsub,
            access,
            retry,
        }
    }

    async fn message_for_recipient(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<Message> {
        let message = with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.get_message(message_id)
        })
        .await
        .map_err(message_error)?
        .ok_or(AppError::MessageNotFound)?;

        if message.recipient_id != recipient_id {
            return Err(AppError::NotParticipant);
        }
        Ok(message)
    }

    async fn transition(&self, message_id: Uuid, target: DeliveryState) -> AppResult<DeliveryUpdate> {
        let now = utc_now();
        // Replays land on NoOp, so retrying a transition is safe
        let update = with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.transition_message(message_id, target, now)
        })
        .await
        .map_err(message_error)?;

        let outcome = if update.changed {
            "applied"
        } else if update.rejected {
            "invalid"
        } else {
            "noop"
        };
        metrics::record_delivery_transition(target.to_db(), outcome);

        if update.rejected {
            warn!(
                message_id = %message_id,
                current = %update.state,
                target = %target,
                "invalid delivery transition ignored"
            );
        }
        Ok(update)
    }

    async fn publish(&self, conversation_id: &ConversationId, event: RealtimeEvent) {
        let name = event.name();
        if let Err(e) = self.pubsub.publish(conversation_id, event).await {
            warn!(conversation_id = %conversation_id, event = name, error = %e, "realtime publish failed");
        }
    }

    /// `Sent -> Delivered`. Already delivered or read is a no-op.
    pub async fn mark_delivered(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<DeliveryUpdate> {
        self.message_for_recipient(message_id, recipient_id).await?;
        let update = self.transition(message_id, DeliveryState::Delivered).await?;

        if update.changed {
            self.publish(
                &update.conversation_id,
                RealtimeEvent::MessageDelivered {
                    conversation_id: update.conversation_id.clone(),
                    message_id,
                    recipient_id,
                    delivered_at: utc_now(),
                },
            )
            .await;
        }
        Ok(update)
    }

    /// `Sent | Delivered -> Read`, taking the message out of the unread counter.
    pub async fn mark_read(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<DeliveryUpdate> {
        self.message_for_recipient(message_id, recipient_id).await?;
        let update = self.transition(message_id, DeliveryState::Read).await?;

        if update.changed {
            self.publish(
                &update.conversation_id,
                RealtimeEvent::MessageRead {
                    conversation_id: update.conversation_id.clone(),
                    reader_id: recipient_id,
                    message_id: Some(message_id),
                    updated: 1,
                    read_at: utc_now(),
                },
            )
            .await;
        }
        Ok(update)
    }

    /// `Sending | Sent -> Failed`. A failed message no longer counts as unread.
    pub async fn mark_failed(&self, message_id: Uuid) -> AppResult<DeliveryUpdate> {
        self.transition(message_id, DeliveryState::Failed).await
    }

    /// Read everything addressed to the caller in one conversation and zero
    /// their counter, in a single store transaction.
    pub async fn mark_read_bulk(
        &self,
        conversation_id: &ConversationId,
        recipient: &CurrentUser,
    ) -> AppResult<BulkReadResult> {
        let conversation = with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.get_conversation(conversation_id)
        })
        .await?
        .ok_or(AppError::NotFound)?;
        if !conversation.is_participant(recipient.id) {
            return Err(AppError::NotParticipant);
        }

        let read_at = utc_now();
        let updated = with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.mark_read_bulk(conversation_id, recipient.id, read_at)
        })
        .await?;
        debug!(conversation_id = %conversation_id, updated, "bulk read applied");

        if updated > 0 {
            for _ in 0..updated {
                metrics::record_delivery_transition(DeliveryState::Read.to_db(), "applied");
            }
            self.publish(
                conversation_id,
                RealtimeEvent::MessageRead {
                    conversation_id: conversation_id.clone(),
                    reader_id: recipient.id,
                    message_id: None,
                    updated,
                    read_at,
                },
            )
            .await;
        }

        Ok(BulkReadResult { updated, read_at })
    }

    /// Per-conversation unread counters for `subject`, read from the
    /// denormalized counters only.
    pub async fn unread_counts(
        &self,
        caller: &CurrentUser,
        subject: Uuid,
    ) -> AppResult<HashMap<ConversationId, i64>> {
        self.access.require_act_for(caller, subject)?;
        Ok(with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.unread_counts(subject)
        })
        .await?)
    }
}

/// A missing row on a message lookup is a missing message, not a conversation.
fn message_error(e: RetryError<StoreError>) -> AppError {
    match AppError::from(e) {
        AppError::NotFound => AppError::MessageNotFound,
        other => other,
    }
}
