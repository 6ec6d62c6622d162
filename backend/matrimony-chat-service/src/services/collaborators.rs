//! Clients for the services the chat core depends on but does not own:
//! identity (bearer tokens), trust & safety (blocks), the profile directory
//! and the push/email notification transport.
//!
//! Each seam is a trait so the HTTP-backed clients can be swapped for the
//! static in-process ones in tests and single-node development.

use crate::error::AppError;
use crate::models::{ConversationId, CurrentUser, Plan, ProfileSummary, Role};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait AuthCollaborator: Send + Sync {
    async fn current_user(&self, token: &str) -> Result<CurrentUser, AppError>;
}

#[async_trait]
pub trait SafetyCollaborator: Send + Sync {
    /// False when either user has blocked the other
    async fn can_interact(&self, a: Uuid, b: Uuid) -> Result<bool, AppError>;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn profile_summary(&self, user_id: Uuid) -> Result<Option<ProfileSummary>, AppError>;
}

/// What the bridge decided to send; the transport owns the wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub recipient_id: Uuid,
    pub conversation_id: ConversationId,
    pub title: String,
    pub body: String,
    /// Set for single-message notifications, absent for batched ones
    pub message_id: Option<Uuid>,
    /// Number of messages this notification stands for
    pub unread_batch: u32,
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, user_id: Uuid, payload: &NotificationPayload) -> Result<(), AppError>;
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Claims issued by the identity service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub role: Option<Role>,
    pub exp: i64,
}

/// HS256 bearer token validation
pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl AuthCollaborator for JwtAuth {
    async fn current_user(&self, token: &str) -> Result<CurrentUser, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token validation failed");
            AppError::Unauthorized
        })?;

        Ok(CurrentUser {
            id: data.claims.sub,
            plan: data.claims.plan.unwrap_or(Plan::Free),
            role: data.claims.role.unwrap_or(Role::Member),
        })
    }
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

/// In-process block list
#[derive(Default)]
pub struct StaticSafety {
    blocked: RwLock<HashSet<(Uuid, Uuid)>>,
}

impl StaticSafety {
    pub fn new() -> Self {
        Self::default()
    }

    fn ordered(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn block(&self, a: Uuid, b: Uuid) {
        self.blocked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(Self::ordered(a, b));
    }

    pub fn unblock(&self, a: Uuid, b: Uuid) {
        self.blocked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&Self::ordered(a, b));
    }
}

#[async_trait]
impl SafetyCollaborator for StaticSafety {
    async fn can_interact(&self, a: Uuid, b: Uuid) -> Result<bool, AppError> {
        let blocked = self
            .blocked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&Self::ordered(a, b));
        Ok(!blocked)
    }
}

#[derive(Deserialize)]
struct CanInteractResponse {
    allowed: bool,
}

/// Trust & safety service over HTTP
pub struct HttpSafety {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSafety {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::StartServer(format!("safety client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SafetyCollaborator for HttpSafety {
    async fn can_interact(&self, a: Uuid, b: Uuid) -> Result<bool, AppError> {
        let url = format!("{}/api/v1/safety/can-interact", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("a", a.to_string()), ("b", b.to_string())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(user_a = %a, user_b = %b, error = %e, "safety service call failed");
                AppError::ServiceUnavailable("safety service unreachable".into())
            })?;

        let body: CanInteractResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "safety service returned an unreadable body");
            AppError::ServiceUnavailable("safety service response invalid".into())
        })?;
        Ok(body.allowed)
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticProfiles {
    profiles: RwLock<HashMap<Uuid, ProfileSummary>>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: ProfileSummary) {
        self.profiles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(profile.id, profile);
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfiles {
    async fn profile_summary(&self, user_id: Uuid) -> Result<Option<ProfileSummary>, AppError> {
        Ok(self
            .profiles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&user_id)
            .cloned())
    }
}

/// Profile directory over HTTP; 404 means no profile
pub struct HttpProfiles {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfiles {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::StartServer(format!("profile client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProfileDirectory for HttpProfiles {
    async fn profile_summary(&self, user_id: Uuid) -> Result<Option<ProfileSummary>, AppError> {
        let url = format!("{}/api/v1/profiles/{}/summary", self.base_url, user_id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "profile directory call failed");
            AppError::ServiceUnavailable("profile directory unreachable".into())
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| AppError::ServiceUnavailable(format!("profile directory: {e}")))?;
        let summary = response
            .json::<ProfileSummary>()
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("profile directory body: {e}")))?;
        Ok(Some(summary))
    }
}

// ---------------------------------------------------------------------------
// Notification transport
// ---------------------------------------------------------------------------

/// Writes notifications to the log; used when no webhook is configured
#[derive(Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, user_id: Uuid, payload: &NotificationPayload) -> Result<(), AppError> {
        tracing::info!(
            user_id = %user_id,
            conversation_id = %payload.conversation_id,
            batch = payload.unread_batch,
            title = %payload.title,
            "notification"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    user_id: Uuid,
    #[serde(flatten)]
    payload: &'a NotificationPayload,
}

/// Posts each notification as JSON to the push/email gateway
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::StartServer(format!("notification client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    async fn send(&self, user_id: Uuid, payload: &NotificationPayload) -> Result<(), AppError> {
        self.client
            .post(&self.url)
            .json(&WebhookBody { user_id, payload })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::ServiceUnavailable(format!("notification gateway: {e}")))?;
        Ok(())
    }
}
