use crate::config::Config;
use crate::error::AppError;
use crate::realtime::PubSub;
use crate::services::collaborators::{
    AuthCollaborator, HttpProfiles, HttpSafety, JwtAuth, LogTransport, NotificationTransport,
    ProfileDirectory, SafetyCollaborator, StaticProfiles, StaticSafety, WebhookTransport,
};
use crate::services::{
    AccessPolicy, ChatService, ConversationService, DeliveryTracker, NotificationBridge,
    QuotaLedger, RoleAccessPolicy,
};
use crate::store::{MessageStore, UsageStore};
use std::sync::Arc;

/// External services the core talks to
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthCollaborator>,
    pub safety: Arc<dyn SafetyCollaborator>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub transport: Arc<dyn NotificationTransport>,
}

impl Collaborators {
    /// HTTP clients where a URL is configured, in-process fallbacks otherwise.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let timeout = config.collaborator_timeout();

        let safety: Arc<dyn SafetyCollaborator> = match &config.safety_service_url {
            Some(url) => Arc::new(HttpSafety::new(url, timeout)?),
            None => {
                tracing::warn!("SAFETY_SERVICE_URL not set; block list is in-process only");
                Arc::new(StaticSafety::new())
            }
        };
        let profiles: Arc<dyn ProfileDirectory> = match &config.profile_service_url {
            Some(url) => Arc::new(HttpProfiles::new(url, timeout)?),
            None => Arc::new(StaticProfiles::new()),
        };
        let transport: Arc<dyn NotificationTransport> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookTransport::new(url, timeout)?),
            None => {
                tracing::info!("NOTIFY_WEBHOOK_URL not set; notifications are logged only");
                Arc::new(LogTransport)
            }
        };

        Ok(Self {
            auth: Arc::new(JwtAuth::new(&config.jwt_secret)),
            safety,
            profiles,
            transport,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<dyn AuthCollaborator>,
    pub access: Arc<dyn AccessPolicy>,
    pub pubsub: Arc<dyn PubSub>,
    pub conversations: Arc<ConversationService>,
    pub delivery: Arc<DeliveryTracker>,
    pub quota: Arc<QuotaLedger>,
    pub chat: Arc<ChatService>,
    pub notifications: NotificationBridge,
}

impl AppState {
    /// Wire every component around one store and one bus.
    pub fn build<S>(
        config: Arc<Config>,
        store: Arc<S>,
        pubsub: Arc<dyn PubSub>,
        collaborators: Collaborators,
    ) -> Self
    where
        S: MessageStore + UsageStore + 'static,
    {
        let access: Arc<dyn AccessPolicy> = Arc::new(RoleAccessPolicy);
        let messages: Arc<dyn MessageStore> = store.clone();
        let usage: Arc<dyn UsageStore> = store;
        let retry = config.store_retry();

        let conversations = Arc::new(ConversationService::new(
            messages.clone(),
            collaborators.safety.clone(),
            access.clone(),
            retry.clone(),
        ));
        let delivery = Arc::new(DeliveryTracker::new(
            messages.clone(),
            pubsub.clone(),
            access.clone(),
            retry,
        ));
        let quota = Arc::new(QuotaLedger::from_config(usage, &config));
        let notifications = NotificationBridge::new(
            messages,
            pubsub.clone(),
            collaborators.profiles.clone(),
            collaborators.transport.clone(),
            config.notifications.clone(),
        );
        let chat = Arc::new(ChatService::new(
            conversations.clone(),
            quota.clone(),
            pubsub.clone(),
            access.clone(),
            notifications.clone(),
        ));

        Self {
            config,
            auth: collaborators.auth,
            access,
            pubsub,
            conversations,
            delivery,
            quota,
            chat,
            notifications,
        }
    }
}
