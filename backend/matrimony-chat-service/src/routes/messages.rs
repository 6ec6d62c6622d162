use crate::error::AppError;
use crate::models::{ConversationId, CurrentUser, MessageType};
use crate::services::{MessagePayload, SendMessageRequest};
use crate::state::AppState;
use actix_web::{post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub conversation_id: Option<String>,
    pub recipient_id: Uuid,
    #[serde(rename = "type", default = "default_type")]
    pub message_type: MessageType,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub client_message_id: Option<String>,
}

fn default_type() -> MessageType {
    MessageType::Text
}

/// POST /api/v1/messages
#[post("/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: CurrentUser,
    body: web::Json<SendMessageBody>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let conversation_id = body
        .conversation_id
        .as_deref()
        .map(|raw| {
            ConversationId::parse(raw)
                .ok_or_else(|| AppError::BadRequest("invalid conversation_id".into()))
        })
        .transpose()?;

    let request = SendMessageRequest {
        conversation_id,
        recipient_id: body.recipient_id,
        payload: MessagePayload {
            message_type: body.message_type,
            content: body.content,
            reply_to_id: body.reply_to_id,
            client_message_id: body.client_message_id,
        },
    };

    let message = state.chat.send_message(&user, request).await?;
    Ok(HttpResponse::Created().json(message))
}

/// POST /api/v1/messages/{id}/delivered
#[post("/messages/{id}/delivered")]
pub async fn mark_delivered(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let update = state
        .delivery
        .mark_delivered(message_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(update))
}

/// POST /api/v1/messages/{id}/read
#[post("/messages/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let update = state
        .delivery
        .mark_read(message_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(update))
}
