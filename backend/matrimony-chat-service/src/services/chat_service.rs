use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{ConversationId, CurrentUser, Feature, Message, Plan, QuotaDecision};
use crate::realtime::{PubSub, RealtimeEvent, Subscription};
use crate::services::authorization::AccessPolicy;
use crate::services::conversation_service::{ConversationService, MessagePayload};
use crate::services::notification_bridge::NotificationBridge;
use crate::services::quota_ledger::QuotaLedger;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    /// Optional; resolved from the participant pair when absent
    pub conversation_id: Option<ConversationId>,
    pub recipient_id: Uuid,
    pub payload: MessagePayload,
}

/// The send path and the other caller-facing operations that span
/// several components
pub struct ChatService {
    conversations: Arc<ConversationService>,
    quota: Arc<QuotaLedger>,
    pubsub: Arc<dyn PubSub>,
    access: Arc<dyn AccessPolicy>,
    bridge: NotificationBridge,
}

impl ChatService {
    pub fn new(
        conversations: Arc<ConversationService>,
        quota: Arc<QuotaLedger>,
        pubsub: Arc<dyn PubSub>,
        access: Arc<dyn AccessPolicy>,
        bridge: NotificationBridge,
    ) -> Self {
        Self {
            conversations,
            quota,
            pubsub,
            access,
            bridge,
        }
    }

    /// Quota check, append, live fan-out, then notification scheduling.
    ///
    /// A replay of an already stored `client_message_id` returns the stored
    /// message without consuming quota or publishing again.
    pub async fn send_message(
        &self,
        sender: &CurrentUser,
        request: SendMessageRequest,
    ) -> AppResult<Message> {
        let SendMessageRequest {
            conversation_id,
            recipient_id,
            payload,
        } = request;
        payload.validate()?;

        let conversation = match conversation_id {
            Some(id) => self.conversations.get(&id).await?,
            None => {
                self.conversations
                    .get_or_create(sender.id, recipient_id)
                    .await?
            }
        };
        self.conversations
            .ensure_can_send(&conversation, sender.id, recipient_id)
            .await?;

        if let Some(client_id) = payload.client_message_id.as_deref() {
            if let Some(existing) = self
                .conversations
                .find_client_message(sender.id, client_id)
                .await?
            {
                return Ok(existing);
            }
        }

        // A concurrent retry can pass the lookup above too; keying the
        // consume on the client id keeps it from being charged twice.
        let feature = Feature::for_message(payload.message_type);
        let decision = self
            .quota
            .check_and_consume_keyed(
                sender.id,
                feature,
                sender.plan,
                payload.client_message_id.as_deref(),
            )
            .await?;
        if let QuotaDecision::Denied { reset_at, .. } = decision {
            tracing::info!(user_id = %sender.id, feature = %feature, %reset_at, "send denied by quota");
            return Err(AppError::QuotaExceeded { feature, reset_at });
        }

        let message_type = payload.message_type;
        let outcome = self
            .conversations
            .append_checked(&conversation, sender.id, recipient_id, payload)
            .await?;
        if !outcome.created {
            return Ok(outcome.message);
        }

        let message = outcome.message;
        metrics::record_message_sent(message_type.to_db());

        if let Err(e) = self
            .pubsub
            .publish(
                &message.conversation_id,
                RealtimeEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await
        {
            warn!(message_id = %message.id, error = %e, "new message fan-out failed");
        }
        self.bridge.on_message_persisted(&message).await;

        Ok(message)
    }

    /// Spend one profile boost.
    pub async fn consume_boost(&self, user: &CurrentUser) -> AppResult<Option<u32>> {
        let feature = Feature::ProfileBoostUsed;
        match self
            .quota
            .check_and_consume(user.id, feature, user.plan)
            .await?
        {
            QuotaDecision::Allowed { remaining } => {
                tracing::info!(user_id = %user.id, ?remaining, "profile boost used");
                Ok(remaining)
            }
            QuotaDecision::Denied { reset_at, .. } => {
                Err(AppError::QuotaExceeded { feature, reset_at })
            }
        }
    }

    /// Read-only quota status for `subject`.
    ///
    /// The caller's own plan comes from their token; for anyone else (admins
    /// only) the plan must be supplied and defaults to free.
    pub async fn quota_status(
        &self,
        caller: &CurrentUser,
        subject: Uuid,
        feature: Feature,
        plan: Option<Plan>,
    ) -> AppResult<QuotaDecision> {
        self.access.require_act_for(caller, subject)?;
        let plan = if subject == caller.id {
            caller.plan
        } else {
            plan.unwrap_or(Plan::Free)
        };
        self.quota.peek(subject, feature, plan).await
    }

    pub async fn set_typing(
        &self,
        user: &CurrentUser,
        conversation_id: &ConversationId,
        typing: bool,
    ) -> AppResult<()> {
        let conversation = self.conversations.get(conversation_id).await?;
        if !conversation.is_participant(user.id) {
            return Err(AppError::NotParticipant);
        }

        let event = if typing {
            RealtimeEvent::TypingStart {
                conversation_id: conversation_id.clone(),
                user_id: user.id,
            }
        } else {
            RealtimeEvent::TypingStop {
                conversation_id: conversation_id.clone(),
                user_id: user.id,
            }
        };
        // Typing indicators are ephemeral; a lost one is not an error
        if let Err(e) = self.pubsub.publish(conversation_id, event).await {
            warn!(conversation_id = %conversation_id, error = %e, "typing fan-out failed");
        }
        Ok(())
    }

    /// Live event stream for a conversation the caller may view.
    pub async fn subscribe(
        &self,
        user: &CurrentUser,
        conversation_id: &ConversationId,
    ) -> AppResult<Subscription> {
        self.conversations.get_for(user, conversation_id).await?;
        self.pubsub
            .subscribe(conversation_id, user.id)
            .await
            .map_err(|e| {
                tracing::error!(conversation_id = %conversation_id, error = %e, "subscribe failed");
                AppError::ServiceUnavailable("realtime bus unavailable".into())
            })
    }
}
