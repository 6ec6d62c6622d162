#![allow(dead_code)]

use async_trait::async_trait;
use matrimony_chat_service::config::Config;
use matrimony_chat_service::error::AppError;
use matrimony_chat_service::models::{CurrentUser, Plan, Role};
use matrimony_chat_service::realtime::InMemoryPubSub;
use matrimony_chat_service::services::collaborators::{
    JwtAuth, NotificationPayload, NotificationTransport, StaticProfiles, StaticSafety,
};
use matrimony_chat_service::state::{AppState, Collaborators};
use matrimony_chat_service::store::MemoryStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret";

pub fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("STORE_BACKEND".to_string(), "memory".to_string()),
        ("JWT_SECRET".to_string(), JWT_SECRET.to_string()),
    ]);
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(move |key| vars.get(key).cloned()).expect("test config")
}

pub fn user(plan: Plan) -> CurrentUser {
    CurrentUser {
        id: Uuid::new_v4(),
        plan,
        role: Role::Member,
    }
}

/// Records every notification instead of sending it
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<NotificationPayload>>,
}

impl RecordingTransport {
    pub fn payloads(&self) -> Vec<NotificationPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, _user_id: Uuid, payload: &NotificationPayload) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<InMemoryPubSub>,
    pub safety: Arc<StaticSafety>,
    pub profiles: Arc<StaticProfiles>,
    pub transport: Arc<RecordingTransport>,
}

pub fn harness(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryPubSub::new());
    let safety = Arc::new(StaticSafety::new());
    let profiles = Arc::new(StaticProfiles::new());
    let transport = Arc::new(RecordingTransport::default());

    let collaborators = Collaborators {
        auth: Arc::new(JwtAuth::new(&config.jwt_secret)),
        safety: safety.clone(),
        profiles: profiles.clone(),
        transport: transport.clone(),
    };
    let state = AppState::build(Arc::new(config), store.clone(), bus.clone(), collaborators);

    Harness {
        state,
        store,
        bus,
        safety,
        profiles,
        transport,
    }
}
