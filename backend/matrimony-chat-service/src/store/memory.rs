//! In-process store used by tests and single-node development.
//!
//! One mutex guards the whole state; holding it for the duration of a method
//! gives the same atomicity the Postgres store gets from a transaction.

use super::{AppendOutcome, MessageStore, StoreError, UsageStore, WindowedConsume};
use crate::models::{
    Conversation, ConversationId, DeliveryReceipt, DeliveryState, DeliveryUpdate, Feature,
    Message, NewMessage, PageCursor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<Uuid, Message>,
    // conversation -> message ids in insertion order
    timeline: HashMap<ConversationId, Vec<Uuid>>,
    client_ids: HashMap<(Uuid, String), Uuid>,
    usage_events: HashMap<(Uuid, Feature), Vec<DateTime<Utc>>>,
    monthly: HashMap<(Uuid, Feature, String), u32>,
    usage_keys: HashSet<(Uuid, Feature, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves no partial write behind:
        // every method mutates only after all of its checks pass.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn decrement_unread(conversation: &mut Conversation, user_id: Uuid) {
    let counter = conversation.unread_count.entry(user_id).or_insert(0);
    *counter = (*counter - 1).max(0);
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_or_create_conversation(
        &self,
        id: &ConversationId,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.lock();
        let conversation = state
            .conversations
            .entry(id.clone())
            .or_insert_with(|| Conversation::new(id.clone(), a, b, now));
        Ok(conversation.clone())
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.lock().conversations.get(id).cloned())
    }

    async fn append_message(&self, new: NewMessage) -> Result<AppendOutcome, StoreError> {
        let mut state = self.lock();

        if let Some(client_id) = &new.client_message_id {
            let key = (new.sender_id, client_id.clone());
            if let Some(existing) = state.client_ids.get(&key).and_then(|id| state.messages.get(id)) {
                return Ok(AppendOutcome {
                    message: existing.clone(),
                    created: false,
                });
            }
        }

        let conversation = state
            .conversations
            .get_mut(&new.conversation_id)
            .ok_or(StoreError::NotFound)?;
        conversation.last_message_id = Some(new.id);
        conversation.last_activity_at = new.created_at;
        *conversation.unread_count.entry(new.recipient_id).or_insert(0) += 1;
        conversation.archived_by.remove(&new.recipient_id);

        let message = new.into_message();
        if let Some(client_id) = &message.client_message_id {
            state
                .client_ids
                .insert((message.sender_id, client_id.clone()), message.id);
        }
        state
            .timeline
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.id);
        state.messages.insert(message.id, message.clone());

        Ok(AppendOutcome {
            message,
            created: true,
        })
    }

    async fn list_messages(
        &self,
        id: &ConversationId,
        limit: usize,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.lock();
        let mut page: Vec<Message> = state
            .timeline
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|message_id| state.messages.get(message_id))
            .filter(|m| cursor.map_or(true, |c| c.admits(m.created_at, m.id)))
            .cloned()
            .collect();

        page.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.lock().messages.get(&message_id).cloned())
    }

    async fn find_client_message(
        &self,
        sender_id: Uuid,
        client_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let state = self.lock();
        Ok(state
            .client_ids
            .get(&(sender_id, client_message_id.to_string()))
            .and_then(|id| state.messages.get(id))
            .cloned())
    }

    async fn transition_message(
        &self,
        message_id: Uuid,
        target: DeliveryState,
        now: DateTime<Utc>,
    ) -> Result<DeliveryUpdate, StoreError> {
        let mut state = self.lock();
        let state = &mut *state;

        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound)?;
        let before = message.delivery_state;
        let transition = before.transition_to(target);
        let update = DeliveryUpdate::from_transition(message, transition);

        if update.changed {
            message.delivery_state = update.state;
            message.delivery_receipts.push(DeliveryReceipt {
                user_id: message.receipt_user(update.state),
                status: update.state,
                timestamp: now,
            });

            if before.counts_as_unread() && !update.state.counts_as_unread() {
                if let Some(conversation) = state.conversations.get_mut(&message.conversation_id) {
                    decrement_unread(conversation, message.recipient_id);
                }
            }
        }

        Ok(update)
    }

    async fn mark_read_bulk(
        &self,
        id: &ConversationId,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let state = &mut *state;

        let conversation = state.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        if !conversation.is_participant(recipient_id) {
            return Err(StoreError::NotFound);
        }

        let mut updated = 0;
        for message_id in state.timeline.get(id).into_iter().flatten() {
            let Some(message) = state.messages.get_mut(message_id) else {
                continue;
            };
            if message.recipient_id != recipient_id || !message.delivery_state.counts_as_unread() {
                continue;
            }
            message.delivery_state = DeliveryState::Read;
            message.delivery_receipts.push(DeliveryReceipt {
                user_id: recipient_id,
                status: DeliveryState::Read,
                timestamp: now,
            });
            updated += 1;
        }

        conversation.unread_count.insert(recipient_id, 0);
        Ok(updated)
    }

    async fn unread_counts(
        &self,
        user_id: Uuid,
    ) -> Result<HashMap<ConversationId, i64>, StoreError> {
        Ok(self
            .lock()
            .conversations
            .values()
            .filter(|c| c.is_participant(user_id))
            .map(|c| (c.id.clone(), c.unread_for(user_id)))
            .collect())
    }

    async fn archive_conversation(
        &self,
        id: &ConversationId,
        user_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.conversations.get_mut(id) {
            Some(conversation) if conversation.is_participant(user_id) => {
                conversation.archived_by.insert(user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn consume_windowed(
        &self,
        user_id: Uuid,
        feature: Feature,
        limit: u32,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<WindowedConsume, StoreError> {
        let mut state = self.lock();
        let state = &mut *state;
        let events = state.usage_events.entry((user_id, feature)).or_default();

        let in_window: Vec<&DateTime<Utc>> = events.iter().filter(|t| **t >= since).collect();
        let used = in_window.len() as u32;

        let key = idempotency_key.map(|k| (user_id, feature, k.to_string()));
        if key.as_ref().is_some_and(|k| state.usage_keys.contains(k)) {
            return Ok(WindowedConsume::Recorded { used });
        }
        if used >= limit {
            return Ok(WindowedConsume::Full {
                oldest: in_window.into_iter().min().copied(),
            });
        }

        events.push(now);
        state.usage_keys.extend(key);
        Ok(WindowedConsume::Recorded { used: used + 1 })
    }

    async fn consume_monthly(
        &self,
        user_id: Uuid,
        feature: Feature,
        limit: u32,
        month_key: &str,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<u32>, StoreError> {
        let mut state = self.lock();
        let state = &mut *state;
        let counter = state
            .monthly
            .entry((user_id, feature, month_key.to_string()))
            .or_insert(0);

        let key = idempotency_key.map(|k| (user_id, feature, k.to_string()));
        if key.as_ref().is_some_and(|k| state.usage_keys.contains(k)) {
            return Ok(Some(*counter));
        }
        if *counter >= limit {
            return Ok(None);
        }
        *counter += 1;
        let count = *counter;

        state.usage_events.entry((user_id, feature)).or_default().push(now);
        state.usage_keys.extend(key);
        Ok(Some(count))
    }

    async fn record_event(
        &self,
        user_id: Uuid,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock()
            .usage_events
            .entry((user_id, feature))
            .or_default()
            .push(now);
        Ok(())
    }

    async fn count_events(
        &self,
        user_id: Uuid,
        feature: Feature,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), StoreError> {
        let state = self.lock();
        let in_window = state
            .usage_events
            .get(&(user_id, feature))
            .into_iter()
            .flatten()
            .filter(|t| **t >= since);

        let (count, oldest) = in_window.fold((0u32, None), |(count, oldest), t| {
            let oldest = match oldest {
                Some(o) if o <= *t => Some(o),
                _ => Some(*t),
            };
            (count + 1, oldest)
        });
        Ok((count, oldest))
    }

    async fn monthly_count(
        &self,
        user_id: Uuid,
        feature: Feature,
        month_key: &str,
    ) -> Result<u32, StoreError> {
        Ok(self
            .lock()
            .monthly
            .get(&(user_id, feature, month_key.to_string()))
            .copied()
            .unwrap_or(0))
    }
}
