use crate::error::{AppError, AppResult};
use crate::models::{
    utc_now, Conversation, ConversationId, CurrentUser, Message, MessageType, NewMessage,
    PageCursor,
};
use crate::services::authorization::AccessPolicy;
use crate::services::collaborators::SafetyCollaborator;
use crate::store::{AppendOutcome, MessageStore, StoreError};
use resilience::{with_retry_if, RetryConfig};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;
const MAX_CONTENT_LEN: usize = 4000;
const MAX_CLIENT_MESSAGE_ID_LEN: usize = 128;

/// Message body as submitted by the sender
#[derive(Debug, Clone)]
pub struct MessagePayload {
    pub message_type: MessageType,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub client_message_id: Option<String>,
}

impl MessagePayload {
    pub fn validate(&self) -> AppResult<()> {
        if self.content.trim().is_empty() {
            return Err(AppError::BadRequest("content must not be empty".into()));
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(AppError::BadRequest(format!(
                "content exceeds {MAX_CONTENT_LEN} bytes"
            )));
        }
        if let Some(client_id) = &self.client_message_id {
            if client_id.is_empty() || client_id.len() > MAX_CLIENT_MESSAGE_ID_LEN {
                return Err(AppError::BadRequest("invalid client_message_id".into()));
            }
        }
        Ok(())
    }
}

/// Conversations and their message history
pub struct ConversationService {
    store: Arc<dyn MessageStore>,
    safety: Arc<dyn SafetyCollaborator>,
    access: Arc<dyn AccessPolicy>,
    retry: RetryConfig,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        safety: Arc<dyn SafetyCollaborator>,
        access: Arc<dyn AccessPolicy>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            safety,
            access,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Idempotent: every caller for the same pair gets the same row.
    pub async fn get_or_create(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        let id = ConversationId::between(a, b)
            .ok_or_else(|| AppError::BadRequest("cannot start a conversation with yourself".into()))?;
        let now = utc_now();

        let conversation = with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.get_or_create_conversation(&id, a, b, now)
        })
        .await?;

        tracing::debug!(conversation_id = %conversation.id, "conversation resolved");
        Ok(conversation)
    }

    pub async fn get(&self, id: &ConversationId) -> AppResult<Conversation> {
        with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.get_conversation(id)
        })
        .await?
        .ok_or(AppError::NotFound)
    }

    /// Conversation as seen by `user`, enforcing read access.
    pub async fn get_for(&self, user: &CurrentUser, id: &ConversationId) -> AppResult<Conversation> {
        let conversation = self.get(id).await?;
        self.access.require_view(user, &conversation)?;
        Ok(conversation)
    }

    /// Participation and safety checks that gate a send, before any quota is spent.
    pub async fn ensure_can_send(
        &self,
        conversation: &Conversation,
        sender_id: Uuid,
        recipient_id: Uuid,
    ) -> AppResult<()> {
        if sender_id == recipient_id
            || !conversation.is_participant(sender_id)
            || !conversation.is_participant(recipient_id)
        {
            return Err(AppError::NotParticipant);
        }
        if !self.safety.can_interact(sender_id, recipient_id).await? {
            tracing::info!(
                conversation_id = %conversation.id,
                sender_id = %sender_id,
                "send refused: interaction blocked"
            );
            return Err(AppError::Blocked);
        }
        Ok(())
    }

    /// Persist a message after checking participation and safety.
    pub async fn append_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: Uuid,
        recipient_id: Uuid,
        payload: MessagePayload,
    ) -> AppResult<AppendOutcome> {
        payload.validate()?;
        let conversation = self.get(conversation_id).await?;
        self.ensure_can_send(&conversation, sender_id, recipient_id)
            .await?;
        self.append_checked(&conversation, sender_id, recipient_id, payload)
            .await
    }

    /// Persist without re-running [`Self::ensure_can_send`].
    pub(crate) async fn append_checked(
        &self,
        conversation: &Conversation,
        sender_id: Uuid,
        recipient_id: Uuid,
        payload: MessagePayload,
    ) -> AppResult<AppendOutcome> {
        let new = NewMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id.clone(),
            sender_id,
            recipient_id,
            message_type: payload.message_type,
            content: payload.content,
            reply_to_id: payload.reply_to_id,
            client_message_id: payload.client_message_id,
            created_at: utc_now(),
        };

        // Only a client-supplied id makes a blind retry safe
        let outcome = if new.client_message_id.is_some() {
            with_retry_if(self.retry.clone(), StoreError::is_transient, || {
                self.store.append_message(new.clone())
            })
            .await?
        } else {
            self.store.append_message(new).await?
        };

        if outcome.created {
            tracing::info!(
                message_id = %outcome.message.id,
                conversation_id = %outcome.message.conversation_id,
                "message appended"
            );
        } else {
            tracing::debug!(message_id = %outcome.message.id, "duplicate send resolved to stored message");
        }
        Ok(outcome)
    }

    pub async fn find_client_message(
        &self,
        sender_id: Uuid,
        client_message_id: &str,
    ) -> AppResult<Option<Message>> {
        Ok(with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.find_client_message(sender_id, client_message_id)
        })
        .await?)
    }

    /// Newest-first page; `limit` defaults to 50 and is capped at 100.
    pub async fn list_messages(
        &self,
        user: &CurrentUser,
        id: &ConversationId,
        limit: Option<usize>,
        cursor: Option<PageCursor>,
    ) -> AppResult<Vec<Message>> {
        let limit = match limit {
            Some(0) => return Err(AppError::BadRequest("limit must be at least 1".into())),
            Some(n) => n.min(MAX_PAGE_SIZE),
            None => DEFAULT_PAGE_SIZE,
        };
        self.get_for(user, id).await?;

        Ok(with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.list_messages(id, limit, cursor)
        })
        .await?)
    }

    pub async fn archive(&self, user: &CurrentUser, id: &ConversationId) -> AppResult<()> {
        let archived = with_retry_if(self.retry.clone(), StoreError::is_transient, || {
            self.store.archive_conversation(id, user.id, utc_now())
        })
        .await?;

        if !archived {
            return Err(AppError::NotParticipant);
        }
        tracing::info!(conversation_id = %id, user_id = %user.id, "conversation archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Plan, Role};
    use crate::services::authorization::RoleAccessPolicy;
    use crate::services::collaborators::StaticSafety;
    use crate::store::MemoryStore;

    fn service(safety: Arc<StaticSafety>) -> ConversationService {
        ConversationService::new(
            Arc::new(MemoryStore::new()),
            safety,
            Arc::new(RoleAccessPolicy),
            RetryConfig::store(),
        )
    }

    fn text(content: &str) -> MessagePayload {
        MessagePayload {
            message_type: MessageType::Text,
            content: content.to_string(),
            reply_to_id: None,
            client_message_id: None,
        }
    }

    #[tokio::test]
    async fn test_self_conversation_is_rejected() {
        let svc = service(Arc::new(StaticSafety::new()));
        let me = Uuid::new_v4();
        assert!(matches!(
            svc.get_or_create(me, me).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_outsider_cannot_append() {
        let svc = service(Arc::new(StaticSafety::new()));
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = svc.get_or_create(a, b).await.unwrap();

        let err = svc.append_message(&conv.id, c, b, text("hi")).await.unwrap_err();
        assert!(matches!(err, AppError::NotParticipant));
    }

    #[tokio::test]
    async fn test_blocked_pair_cannot_append() {
        let safety = Arc::new(StaticSafety::new());
        let svc = service(safety.clone());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc.get_or_create(a, b).await.unwrap();

        safety.block(b, a);
        let err = svc.append_message(&conv.id, a, b, text("hi")).await.unwrap_err();
        assert!(matches!(err, AppError::Blocked));
    }

    #[tokio::test]
    async fn test_client_message_id_deduplicates() {
        let svc = service(Arc::new(StaticSafety::new()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc.get_or_create(a, b).await.unwrap();

        let payload = MessagePayload {
            client_message_id: Some("c-1".into()),
            ..text("hello")
        };
        let first = svc.append_message(&conv.id, a, b, payload.clone()).await.unwrap();
        let second = svc.append_message(&conv.id, a, b, payload).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.message.id, second.message.id);
        assert_eq!(svc.get(&conv.id).await.unwrap().unread_for(b), 1);
    }

    #[tokio::test]
    async fn test_list_requires_view_access() {
        let svc = service(Arc::new(StaticSafety::new()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc.get_or_create(a, b).await.unwrap();
        let outsider = CurrentUser {
            id: Uuid::new_v4(),
            plan: Plan::Free,
            role: Role::Member,
        };

        let err = svc.list_messages(&outsider, &conv.id, None, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotParticipant));

        let moderator = CurrentUser {
            role: Role::Admin,
            ..outsider
        };
        assert!(svc.list_messages(&moderator, &conv.id, None, None).await.is_ok());
        assert!(matches!(
            svc.list_messages(&moderator, &conv.id, Some(0), None).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_payload_validation() {
        assert!(text("hi").validate().is_ok());
        assert!(text("   ").validate().is_err());
        assert!(text(&"x".repeat(MAX_CONTENT_LEN + 1)).validate().is_err());
    }
}
