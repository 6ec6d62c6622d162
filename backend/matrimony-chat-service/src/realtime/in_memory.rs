use super::registry::{LocalRegistry, RegistryEntry};
use super::{PubSub, PubSubError, RealtimeEvent, Subscription};
use crate::models::ConversationId;
use async_trait::async_trait;
use uuid::Uuid;

/// Single-process fan-out; the default backend
#[derive(Default, Clone)]
pub struct InMemoryPubSub {
    registry: LocalRegistry,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(
        &self,
        conversation_id: &ConversationId,
        event: RealtimeEvent,
    ) -> Result<(), PubSubError> {
        let delivered = self.registry.broadcast(conversation_id, &event);
        tracing::trace!(conversation_id = %conversation_id, event = event.name(), delivered, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        user_id: Uuid,
    ) -> Result<Subscription, PubSubError> {
        let (id, receiver) = self.registry.add_subscriber(conversation_id, user_id);
        let entry = RegistryEntry {
            registry: self.registry.clone(),
            conversation_id: conversation_id.clone(),
            id,
        };
        Ok(Subscription::new(id, receiver, Box::new(entry)))
    }

    async fn has_live_subscriber(&self, conversation_id: &ConversationId, user_id: Uuid) -> bool {
        self.registry.has_user(conversation_id, user_id)
    }

    fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        self.registry.subscriber_count(conversation_id)
    }
}
