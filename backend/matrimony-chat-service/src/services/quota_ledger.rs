//! Metered-feature gate in front of every billable action.
//!
//! Each consume is a single atomic store call per `(user, feature)`, so N
//! concurrent callers against a limit of L see at most L allowances. When the
//! usage store cannot answer, the feature's [`FailurePolicy`] decides.

use crate::config::Config;
use crate::error::AppError;
use crate::metrics;
use crate::models::quota::{month_key, start_of_next_month};
use crate::models::{utc_now, FailurePolicy, Feature, Plan, PlanLimits, QuotaDecision, QuotaWindow};
use crate::store::{StoreError, UsageStore, WindowedConsume};
use chrono::{DateTime, Utc};
use resilience::{with_retry_if, RetryConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

pub struct QuotaLedger {
    store: Arc<dyn UsageStore>,
    limits: PlanLimits,
    fail_open: HashSet<Feature>,
    read_retry: RetryConfig,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn UsageStore>,
        limits: PlanLimits,
        fail_open: impl IntoIterator<Item = Feature>,
    ) -> Self {
        Self {
            store,
            limits,
            fail_open: fail_open.into_iter().collect(),
            read_retry: RetryConfig::store(),
        }
    }

    pub fn from_config(store: Arc<dyn UsageStore>, config: &Config) -> Self {
        Self {
            read_retry: config.store_retry(),
            ..Self::new(
                store,
                config.plan_limits.clone(),
                config.fail_open_features.iter().copied(),
            )
        }
    }

    pub fn limits(&self) -> &PlanLimits {
        &self.limits
    }

    pub fn failure_policy(&self, feature: Feature) -> FailurePolicy {
        if self.fail_open.contains(&feature) {
            FailurePolicy::FailOpen
        } else {
            FailurePolicy::FailClosed
        }
    }

    /// Check the limit and, if allowed, record the use.
    ///
    /// `Err` only when the store is unavailable and the feature fails closed.
    pub async fn check_and_consume(
        &self,
        user_id: Uuid,
        feature: Feature,
        plan: Plan,
    ) -> Result<QuotaDecision, AppError> {
        self.check_and_consume_at(user_id, feature, plan, utc_now())
            .await
    }

    /// Like [`check_and_consume`](Self::check_and_consume), but a retry
    /// carrying an `idempotency_key` that was already consumed is allowed
    /// without spending again.
    pub async fn check_and_consume_keyed(
        &self,
        user_id: Uuid,
        feature: Feature,
        plan: Plan,
        idempotency_key: Option<&str>,
    ) -> Result<QuotaDecision, AppError> {
        self.consume(user_id, feature, plan, idempotency_key, utc_now())
            .await
    }

    pub async fn check_and_consume_at(
        &self,
        user_id: Uuid,
        feature: Feature,
        plan: Plan,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, AppError> {
        self.consume(user_id, feature, plan, None, now).await
    }

    async fn consume(
        &self,
        user_id: Uuid,
        feature: Feature,
        plan: Plan,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, AppError> {
        let limit = self.limits.get(plan, feature);

        let outcome = match (limit.limit, limit.window) {
            (None, _) => match self.store.record_event(user_id, feature, now).await {
                Ok(()) => Ok(QuotaDecision::Allowed { remaining: None }),
                Err(e) => {
                    // Audit only; an unlimited feature is never refused for it
                    warn!(user_id = %user_id, feature = %feature, error = %e, "usage event not recorded");
                    Ok(QuotaDecision::Allowed { remaining: None })
                }
            },
            (Some(0), window) => Ok(denied(feature, window.reset_at(now, None))),
            (Some(limit), QuotaWindow::CalendarMonth) => self
                .store
                .consume_monthly(user_id, feature, limit, &month_key(now), now, idempotency_key)
                .await
                .map(|counted| match counted {
                    Some(count) => QuotaDecision::Allowed {
                        remaining: Some(limit.saturating_sub(count)),
                    },
                    None => denied(feature, start_of_next_month(now)),
                }),
            (Some(limit), window) => {
                let since = window.window_start(now).unwrap_or(now);
                self.store
                    .consume_windowed(user_id, feature, limit, since, now, idempotency_key)
                    .await
                    .map(|consumed| match consumed {
                        WindowedConsume::Recorded { used } => QuotaDecision::Allowed {
                            remaining: Some(limit.saturating_sub(used)),
                        },
                        WindowedConsume::Full { oldest } => {
                            denied(feature, window.reset_at(now, oldest))
                        }
                    })
            }
        };

        match outcome {
            Ok(decision) => {
                let label = if decision.is_allowed() { "allowed" } else { "denied" };
                metrics::record_quota_decision(feature.as_str(), label);
                Ok(decision)
            }
            Err(e) => self.on_store_failure(user_id, feature, e),
        }
    }

    fn on_store_failure(
        &self,
        user_id: Uuid,
        feature: Feature,
        err: StoreError,
    ) -> Result<QuotaDecision, AppError> {
        match self.failure_policy(feature) {
            FailurePolicy::FailOpen => {
                warn!(user_id = %user_id, feature = %feature, error = %err, "usage store unavailable; allowing");
                metrics::record_quota_decision(feature.as_str(), "fail_open");
                Ok(QuotaDecision::Allowed { remaining: None })
            }
            FailurePolicy::FailClosed => {
                error!(user_id = %user_id, feature = %feature, error = %err, "usage store unavailable; denying");
                metrics::record_quota_decision(feature.as_str(), "fail_closed");
                Err(AppError::TransientStore(format!("quota unavailable: {err}")))
            }
        }
    }

    /// Read-only view of what a consume would decide right now.
    pub async fn peek(
        &self,
        user_id: Uuid,
        feature: Feature,
        plan: Plan,
    ) -> Result<QuotaDecision, AppError> {
        let now = utc_now();
        let limit = self.limits.get(plan, feature);
        let Some(max) = limit.limit else {
            return Ok(QuotaDecision::Allowed { remaining: None });
        };

        match limit.window {
            QuotaWindow::CalendarMonth => {
                let key = month_key(now);
                let used = with_retry_if(self.read_retry.clone(), StoreError::is_transient, || {
                    self.store.monthly_count(user_id, feature, &key)
                })
                .await?;

                Ok(if used < max {
                    QuotaDecision::Allowed {
                        remaining: Some(max - used),
                    }
                } else {
                    denied(feature, start_of_next_month(now))
                })
            }
            window => {
                let since = window.window_start(now).unwrap_or(now);
                let (used, oldest) =
                    with_retry_if(self.read_retry.clone(), StoreError::is_transient, || {
                        self.store.count_events(user_id, feature, since)
                    })
                    .await?;

                Ok(if used < max {
                    QuotaDecision::Allowed {
                        remaining: Some(max - used),
                    }
                } else {
                    denied(feature, window.reset_at(now, oldest))
                })
            }
        }
    }
}

fn denied(feature: Feature, reset_at: DateTime<Utc>) -> QuotaDecision {
    QuotaDecision::Denied {
        reason: format!("{feature} limit reached"),
        reset_at,
    }
}
