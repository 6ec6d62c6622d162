use crate::error::AppError;
use crate::models::{ConversationId, CurrentUser, PageCursor};
use crate::realtime::RealtimeEvent;
use crate::state::AppState;
use actix_web::http::header;
use actix_web::{get, post, web, HttpResponse};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

fn parse_id(raw: &str) -> Result<ConversationId, AppError> {
    ConversationId::parse(raw).ok_or_else(|| AppError::BadRequest("invalid conversation id".into()))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    pub peer_id: Uuid,
}

/// POST /api/v1/conversations
#[post("/conversations")]
pub async fn create_conversation(
    state: web::Data<AppState>,
    user: CurrentUser,
    body: web::Json<CreateConversationBody>,
) -> Result<HttpResponse, AppError> {
    let conversation = state
        .conversations
        .get_or_create(user.id, body.peer_id)
        .await?;
    Ok(HttpResponse::Ok().json(conversation))
}

/// POST /api/v1/conversations/{id}/read
#[post("/conversations/{id}/read")]
pub async fn mark_read_bulk(
    state: web::Data<AppState>,
    path: web::Path<String>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path)?;
    let result = state.delivery.mark_read_bulk(&id, &user).await?;
    Ok(HttpResponse::Ok().json(result))
}

#[derive(Debug, Deserialize)]
pub struct TypingBody {
    pub typing: bool,
}

/// POST /api/v1/conversations/{id}/typing
#[post("/conversations/{id}/typing")]
pub async fn typing(
    state: web::Data<AppState>,
    path: web::Path<String>,
    user: CurrentUser,
    body: web::Json<TypingBody>,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path)?;
    state.chat.set_typing(&user, &id, body.typing).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /api/v1/conversations/{id}/archive
#[post("/conversations/{id}/archive")]
pub async fn archive(
    state: web::Data<AppState>,
    path: web::Path<String>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path)?;
    state.conversations.archive(&user, &id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub limit: Option<usize>,
    pub before: Option<DateTime<Utc>>,
    pub before_id: Option<Uuid>,
}

/// GET /api/v1/conversations/{id}/messages?limit&before&before_id
#[get("/conversations/{id}/messages")]
pub async fn list_messages(
    state: web::Data<AppState>,
    path: web::Path<String>,
    user: CurrentUser,
    query: web::Query<ListMessagesQuery>,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path)?;
    let cursor = match (query.before, query.before_id) {
        (Some(before), before_id) => Some(PageCursor { before, before_id }),
        (None, Some(_)) => {
            return Err(AppError::BadRequest("before_id requires before".into()));
        }
        (None, None) => None,
    };

    let messages = state
        .conversations
        .list_messages(&user, &id, query.limit, cursor)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

fn sse_frame(event: &RealtimeEvent) -> Bytes {
    match serde_json::to_string(event) {
        Ok(data) => Bytes::from(format!("event: {}\ndata: {}\n\n", event.name(), data)),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode realtime event");
            Bytes::from_static(b": encode error\n\n")
        }
    }
}

/// GET /api/v1/conversations/{id}/events
///
/// Server-Sent Events. The subscription lives as long as the response body;
/// a client disconnect drops it and unregisters the subscriber.
#[get("/conversations/{id}/events")]
pub async fn events(
    state: web::Data<AppState>,
    path: web::Path<String>,
    user: CurrentUser,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path)?;
    let subscription = state.chat.subscribe(&user, &id).await?;
    tracing::debug!(conversation_id = %id, user_id = %user.id, "event stream opened");

    let body = stream::unfold(subscription, |mut subscription| async move {
        let frame = match tokio::time::timeout(SSE_KEEP_ALIVE, subscription.recv()).await {
            Ok(Some(event)) => sse_frame(&event),
            Ok(None) => return None,
            Err(_) => Bytes::from_static(b": keep-alive\n\n"),
        };
        Some((Ok::<_, actix_web::Error>(frame), subscription))
    });
    let hello = stream::once(async { Ok::<_, actix_web::Error>(Bytes::from_static(b": connected\n\n")) });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(hello.chain(body)))
}
