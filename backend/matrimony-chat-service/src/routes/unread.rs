use crate::error::AppError;
use crate::models::CurrentUser;
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use uuid::Uuid;

/// GET /api/v1/users/{id}/unread-counts
#[get("/users/{id}/unread-counts")]
pub async fn unread_counts(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let counts = state
        .delivery
        .unread_counts(&user, user_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(counts))
}
