pub mod conversations;
pub mod messages;
pub mod quota;
pub mod unread;

use actix_web::{get, web, HttpResponse};

/// GET /health
#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(crate::metrics::metrics_handler)
        .service(
            web::scope("/api/v1")
                .service(messages::send_message)
                .service(messages::mark_delivered)
                .service(messages::mark_read)
                .service(conversations::create_conversation)
                .service(conversations::mark_read_bulk)
                .service(conversations::typing)
                .service(conversations::archive)
                .service(conversations::list_messages)
                .service(conversations::events)
                .service(unread::unread_counts)
                .service(quota::check_quota)
                .service(quota::consume_boost),
        );
}
