use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use matrimony_chat_service::{
    config::{self, PubSubBackend, StoreBackend},
    db, error, logging,
    middleware::MetricsMiddleware,
    realtime::{InMemoryPubSub, PubSub, RedisPubSub},
    routes,
    state::{AppState, Collaborators},
    store::{MemoryStore, PgStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pubsub: Arc<dyn PubSub> = match cfg.pubsub_backend {
        PubSubBackend::Memory => Arc::new(InMemoryPubSub::new()),
        PubSubBackend::Redis => {
            let bus = RedisPubSub::connect(&cfg.redis_url, Duration::from_secs(cfg.presence_ttl_secs))
                .await
                .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;
            Arc::new(bus)
        }
    };

    let collaborators = Collaborators::from_config(&cfg)?;

    let state = match cfg.store_backend {
        StoreBackend::Postgres => {
            let url = cfg
                .database_url
                .as_deref()
                .ok_or_else(|| error::AppError::Config("DATABASE_URL missing".into()))?;
            let pool = db::init_pool(url, &cfg).await?;

            // Schema must be in place before the first request
            db::run_migrations(&pool).await?;
            AppState::build(cfg.clone(), Arc::new(PgStore::new(pool)), pubsub, collaborators)
        }
        StoreBackend::Memory => {
            tracing::warn!("STORE_BACKEND=memory; data is lost on restart");
            AppState::build(cfg.clone(), Arc::new(MemoryStore::new()), pubsub, collaborators)
        }
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, store = ?cfg.store_backend, pubsub = ?cfg.pubsub_backend, "starting matrimony-chat-service");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure_routes)
            .wrap(MetricsMiddleware)
            .wrap(TracingLogger::default())
            .wrap(cors)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(e.to_string()))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(e.to_string()))?;

    Ok(())
}
