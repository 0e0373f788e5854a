use actix_web::{middleware, web, App, HttpServer};
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use sqlx::PgPool;
use std::io;
use std::sync::Arc;
use task_core::SqlxTaskStore;
use taskdisp_api::{
    handlers::{register_health, register_tasks},
    AppState, Config,
};
use taskdisp_broker::BrokerPublisher;
use transactional_outbox::SqlxOutboxRepository;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting task dispatch API");

    let config = Config::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let mut pool_cfg = DbPoolConfig::for_service("api");
    pool_cfg.database_url = config.database.url.clone();
    if pool_cfg.max_connections < config.database.max_connections {
        pool_cfg.max_connections = config.database.max_connections;
    }

    let pool: PgPool = create_pg_pool(pool_cfg).await.map_err(|e| {
        tracing::error!("Failed to connect to database: {}", e);
        io::Error::other("database connection failed")
    })?;
    tracing::info!("Connected to database");

    let broker = if config.broker.enabled {
        let publisher = Arc::new(BrokerPublisher::new(
            config.broker.url.clone(),
            config.broker.queue_names(),
            config.broker.retry_delays_seconds.clone(),
            config.broker.connect_attempts,
        ));
        tracing::info!(url = %config.broker.url, "broker publish path enabled");
        Some(publisher)
    } else {
        tracing::warn!("RABBITMQ_ENABLED=false - tasks will be dispatched via outbox polling only");
        None
    };

    let state = web::Data::new(AppState {
        tasks: SqlxTaskStore::new(pool.clone()),
        outbox: SqlxOutboxRepository::new(pool.clone()),
        pool,
        broker,
    });

    let bind_addr = format!("0.0.0.0:{}", config.app.port);
    tracing::info!("Listening on {}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(register_tasks)
            .configure(register_health)
    })
    .bind(&bind_addr)?
    .run()
    .await
}
