use crate::error::AppError;
use crate::models::{FailurePolicy, Feature, PlanLimits};
use dotenvy::dotenv;
use resilience::RetryConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// How long a message may stay unseen before a push is considered
    pub grace: Duration,
    /// At most one push per (conversation, recipient) per window
    pub coalesce_window: Duration,
    /// Upper bound on tracked coalescing windows
    pub max_tracked_windows: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            coalesce_window: Duration::from_secs(60),
            max_tracked_windows: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub pubsub_backend: PubSubBackend,
    pub redis_url: String,
    pub presence_ttl_secs: u64,
    pub jwt_secret: String,
    pub notifications: NotificationConfig,
    pub notify_webhook_url: Option<String>,
    pub safety_service_url: Option<String>,
    pub profile_service_url: Option<String>,
    pub collaborator_timeout_ms: u64,
    pub plan_limits: PlanLimits,
    pub fail_open_features: Vec<Feature>,
    pub store_retry_max: u32,
    pub store_retry_base_ms: u64,
}

impl Config {
    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(AppError::Config(format!("unknown STORE_BACKEND: {other}")));
            }
        };
        let database_url = lookup("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL missing".into()));
        }

        let pubsub_backend = match lookup("PUBSUB_BACKEND").as_deref() {
            None | Some("memory") => PubSubBackend::Memory,
            Some("redis") => PubSubBackend::Redis,
            Some(other) => {
                return Err(AppError::Config(format!("unknown PUBSUB_BACKEND: {other}")));
            }
        };

        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Config("JWT_SECRET missing".into()))?;

        let plan_limits = match lookup("QUOTA_LIMITS_FILE") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| AppError::Config(format!("read {path}: {e}")))?;
                PlanLimits::from_json_overrides(&raw)
                    .map_err(|e| AppError::Config(format!("parse {path}: {e}")))?
            }
            None => PlanLimits::default(),
        };

        let fail_open_features = match lookup("QUOTA_FAIL_OPEN_FEATURES") {
            Some(list) => Self::parse_list(&list)
                .iter()
                .map(|f| f.parse::<Feature>().map_err(AppError::Config))
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![Feature::ProfileViewed],
        };

        let defaults = NotificationConfig::default();
        let notifications = NotificationConfig {
            grace: parsed("NOTIFY_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace),
            coalesce_window: parsed("NOTIFY_COALESCE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.coalesce_window),
            max_tracked_windows: parsed("NOTIFY_MAX_TRACKED_WINDOWS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_tracked_windows),
        };

        Ok(Self {
            port: parsed("PORT").and_then(|p| u16::try_from(p).ok()).unwrap_or(3000),
            store_backend,
            database_url,
            db_max_connections: parsed("DB_MAX_CONNECTIONS").unwrap_or(10) as u32,
            db_acquire_timeout_secs: parsed("DB_ACQUIRE_TIMEOUT_SECS").unwrap_or(10),
            pubsub_backend,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            presence_ttl_secs: parsed("PRESENCE_TTL_SECS").unwrap_or(30),
            jwt_secret,
            notifications,
            notify_webhook_url: lookup("NOTIFY_WEBHOOK_URL"),
            safety_service_url: lookup("SAFETY_SERVICE_URL"),
            profile_service_url: lookup("PROFILE_SERVICE_URL"),
            collaborator_timeout_ms: parsed("COLLABORATOR_TIMEOUT_MS").unwrap_or(2000),
            plan_limits,
            fail_open_features,
            store_retry_max: parsed("STORE_RETRY_MAX").unwrap_or(3) as u32,
            store_retry_base_ms: parsed("STORE_RETRY_BASE_MS").unwrap_or(50),
        })
    }

    pub fn failure_policy(&self, feature: Feature) -> FailurePolicy {
        if self.fail_open_features.contains(&feature) {
            FailurePolicy::FailOpen
        } else {
            FailurePolicy::FailClosed
        }
    }

    pub fn store_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.store_retry_max,
            initial_backoff: Duration::from_millis(self.store_retry_base_ms),
            ..RetryConfig::store()
        }
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_memory_backend_needs_no_database() {
        let cfg = Config::from_lookup(lookup(&[
            ("STORE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.notifications.grace, Duration::from_secs(10));
        assert_eq!(cfg.failure_policy(Feature::ProfileViewed), FailurePolicy::FailOpen);
        assert_eq!(cfg.failure_policy(Feature::MessageSent), FailurePolicy::FailClosed);
    }

    #[test]
    fn test_postgres_backend_requires_database_url() {
        let err = Config::from_lookup(lookup(&[("JWT_SECRET", "secret")])).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_missing_jwt_secret_is_rejected() {
        let err = Config::from_lookup(lookup(&[("STORE_BACKEND", "memory")])).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("JWT_SECRET")));
    }

    #[test]
    fn test_fail_open_features_are_configurable() {
        let cfg = Config::from_lookup(lookup(&[
            ("STORE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
            ("QUOTA_FAIL_OPEN_FEATURES", "icebreaker_sent, profile_viewed"),
            ("NOTIFY_GRACE_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(cfg.failure_policy(Feature::IcebreakerSent), FailurePolicy::FailOpen);
        assert_eq!(cfg.notifications.grace, Duration::from_secs(3));

        let err = Config::from_lookup(lookup(&[
            ("STORE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
            ("QUOTA_FAIL_OPEN_FEATURES", "superlike"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
