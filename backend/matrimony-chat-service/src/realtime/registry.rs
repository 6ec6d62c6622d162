use super::RealtimeEvent;
use crate::metrics;
use crate::models::ConversationId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

/// Events buffered per subscriber before it is considered stalled and dropped
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Unique identifier for one open subscription
///
/// The same user may hold several subscriptions on a conversation (two
/// devices, two tabs); each is removed individually when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber {
    id: SubscriberId,
    user_id: Uuid,
    sender: Sender<RealtimeEvent>,
}

/// Subscribers on this process, keyed by conversation
///
/// A std mutex rather than an async lock: removal runs from `Drop`, and no
/// critical section awaits.
#[derive(Default, Clone)]
pub struct LocalRegistry {
    inner: Arc<Mutex<HashMap<ConversationId, Vec<Subscriber>>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, Vec<Subscriber>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_subscriber(
        &self,
        conversation_id: &ConversationId,
        user_id: Uuid,
    ) -> (SubscriberId, Receiver<RealtimeEvent>) {
        let (tx, rx) = channel(SUBSCRIBER_BUFFER);
        let subscriber_id = SubscriberId::new();

        let mut guard = self.lock();
        let subscribers = guard.entry(conversation_id.clone()).or_default();
        subscribers.push(Subscriber {
            id: subscriber_id,
            user_id,
            sender: tx,
        });
        metrics::subscriber_opened();

        tracing::debug!(
            subscriber_id = %subscriber_id,
            conversation_id = %conversation_id,
            total = subscribers.len(),
            "subscriber added"
        );

        (subscriber_id, rx)
    }

    pub fn remove_subscriber(&self, conversation_id: &ConversationId, subscriber_id: SubscriberId) {
        let mut guard = self.lock();

        if let Some(subscribers) = guard.get_mut(conversation_id) {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != subscriber_id);
            let removed = before - subscribers.len();
            for _ in 0..removed {
                metrics::subscriber_closed();
            }

            if subscribers.is_empty() {
                guard.remove(conversation_id);
                tracing::debug!(conversation_id = %conversation_id, "conversation removed from registry");
            }
        }
    }

    /// Send to every live subscriber without waiting. Closed subscribers and
    /// ones whose buffer is full are dropped; a dropped subscriber's stream
    /// ends once it drains what was already buffered. Returns how many
    /// received the event.
    pub fn broadcast(&self, conversation_id: &ConversationId, event: &RealtimeEvent) -> usize {
        let mut guard = self.lock();
        let Some(subscribers) = guard.get_mut(conversation_id) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    subscriber_id = %subscriber.id,
                    conversation_id = %conversation_id,
                    "subscriber stalled; dropping"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        let delivered = subscribers.len();

        if before != delivered {
            for _ in 0..(before - delivered) {
                metrics::subscriber_closed();
            }
            tracing::debug!(
                conversation_id = %conversation_id,
                dropped = before - delivered,
                active = delivered,
                "pruned subscribers during broadcast"
            );
        }
        if subscribers.is_empty() {
            guard.remove(conversation_id);
        }

        delivered
    }

    pub fn has_user(&self, conversation_id: &ConversationId, user_id: Uuid) -> bool {
        self.lock()
            .get(conversation_id)
            .map(|subs| {
                subs.iter()
                    .any(|s| s.user_id == user_id && !s.sender.is_closed())
            })
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        self.lock().get(conversation_id).map(|v| v.len()).unwrap_or(0)
    }
}

/// Removes its entry from the registry when the subscription is dropped
pub(crate) struct RegistryEntry {
    pub(crate) registry: LocalRegistry,
    pub(crate) conversation_id: ConversationId,
    pub(crate) id: SubscriberId,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.registry.remove_subscriber(&self.conversation_id, self.id);
    }
}

impl super::SubscriptionGuard for RegistryEntry {}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(conversation_id: &ConversationId, user_id: Uuid) -> RealtimeEvent {
        RealtimeEvent::TypingStart {
            conversation_id: conversation_id.clone(),
            user_id,
        }
    }

    #[tokio::test]
    async fn test_remove_cleans_up_empty_conversation() {
        let registry = LocalRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = ConversationId::between(a, b).unwrap();

        let (id1, _rx1) = registry.add_subscriber(&conv, a);
        let (id2, _rx2) = registry.add_subscriber(&conv, a);
        assert_eq!(registry.subscriber_count(&conv), 2);

        registry.remove_subscriber(&conv, id1);
        assert_eq!(registry.subscriber_count(&conv), 1);
        assert!(registry.has_user(&conv, a));

        registry.remove_subscriber(&conv, id2);
        assert_eq!(registry.subscriber_count(&conv), 0);
        assert!(!registry.has_user(&conv, a));
    }

    #[tokio::test]
    async fn test_broadcast_prunes_dropped_receivers() {
        let registry = LocalRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = ConversationId::between(a, b).unwrap();

        let (_id1, rx1) = registry.add_subscriber(&conv, a);
        let (_id2, mut rx2) = registry.add_subscriber(&conv, b);
        drop(rx1);

        assert!(!registry.has_user(&conv, a));
        assert_eq!(registry.broadcast(&conv, &typing(&conv, b)), 1);
        assert_eq!(registry.subscriber_count(&conv), 1);
        assert!(matches!(rx2.recv().await, Some(RealtimeEvent::TypingStart { .. })));
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_dropped() {
        let registry = LocalRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = ConversationId::between(a, b).unwrap();

        let (_slow_id, mut slow) = registry.add_subscriber(&conv, a);
        let (_fast_id, mut fast) = registry.add_subscriber(&conv, b);

        for _ in 0..SUBSCRIBER_BUFFER {
            assert_eq!(registry.broadcast(&conv, &typing(&conv, b)), 2);
            fast.recv().await.unwrap();
        }

        // `slow` never read; the next event overflows it
        assert_eq!(registry.broadcast(&conv, &typing(&conv, b)), 1);
        assert_eq!(registry.subscriber_count(&conv), 1);
        assert!(!registry.has_user(&conv, a));
        assert!(registry.has_user(&conv, b));

        // What was buffered is still delivered, then the stream ends
        let mut drained = 0;
        while slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, SUBSCRIBER_BUFFER);
    }
}
