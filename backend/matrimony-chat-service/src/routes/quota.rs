use crate::error::AppError;
use crate::models::{CurrentUser, Feature, Plan, QuotaDecision};
use crate::state::AppState;
use actix_web::{get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    pub user_id: Option<Uuid>,
    /// Plan to evaluate when an admin checks another user
    pub plan: Option<Plan>,
}

#[derive(Debug, Serialize)]
pub struct QuotaStatusResponse {
    pub feature: Feature,
    pub allowed: bool,
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaStatusResponse {
    fn from_decision(feature: Feature, decision: QuotaDecision) -> Self {
        match decision {
            QuotaDecision::Allowed { remaining } => Self {
                feature,
                allowed: true,
                remaining,
                reset_at: None,
            },
            QuotaDecision::Denied { reset_at, .. } => Self {
                feature,
                allowed: false,
                remaining: Some(0),
                reset_at: Some(reset_at),
            },
        }
    }
}

/// GET /api/v1/quota/{feature}?user_id
#[get("/quota/{feature}")]
pub async fn check_quota(
    state: web::Data<AppState>,
    feature: web::Path<String>,
    user: CurrentUser,
    query: web::Query<QuotaQuery>,
) -> Result<HttpResponse, AppError> {
    let feature = feature.parse::<Feature>().map_err(AppError::BadRequest)?;
    let subject = query.user_id.unwrap_or(user.id);

    let decision = state
        .chat
        .quota_status(&user, subject, feature, query.plan)
        .await?;
    Ok(HttpResponse::Ok().json(QuotaStatusResponse::from_decision(feature, decision)))
}

#[derive(Debug, Serialize)]
pub struct BoostResponse {
    pub feature: Feature,
    pub remaining: Option<u32>,
}

/// POST /api/v1/boosts
#[post("/boosts")]
pub async fn consume_boost(
    state: web::Data<AppState>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let remaining = state.chat.consume_boost(&user).await?;
    Ok(HttpResponse::Ok().json(BoostResponse {
        feature: Feature::ProfileBoostUsed,
        remaining,
    }))
}
