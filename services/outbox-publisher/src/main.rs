mod admin;
mod config;

use config::Config;
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use taskdisp_broker::BrokerPublisher;
use tokio::sync::broadcast;
use transactional_outbox::{metrics::OutboxMetrics, OutboxProcessor, SqlxOutboxRepository};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting outbox publisher");

    let config = Config::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let mut pool_cfg = DbPoolConfig::for_service("outbox-publisher");
    pool_cfg.database_url = config.database.url.clone();
    if pool_cfg.max_connections < config.database.max_connections {
        pool_cfg.max_connections = config.database.max_connections;
    }

    let pool = create_pg_pool(pool_cfg).await.map_err(|e| {
        tracing::error!("Failed to connect to database: {}", e);
        io::Error::other("database connection failed")
    })?;
    tracing::info!("Connected to database");

    let repository = Arc::new(SqlxOutboxRepository::new(pool));
    let publisher = Arc::new(BrokerPublisher::new(
        config.broker.url.clone(),
        config.broker.queue_names(),
        config.broker.retry_delays_seconds.clone(),
        config.broker.connect_attempts,
    ));
    let metrics = OutboxMetrics::new("outbox-publisher");

    let processor = OutboxProcessor::new_with_metrics(
        repository,
        publisher,
        metrics,
        config.outbox.batch_size,
        Duration::from_secs_f64(config.outbox.poll_interval_secs),
        config.outbox.max_attempts,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let admin_port = config.app.port;

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_port).await {
            tracing::error!(error = %e, "admin server exited");
        }
    });

    let processor_shutdown = shutdown_tx.subscribe();
    let processor_handle = tokio::spawn(async move {
        if let Err(e) = processor.run(Some(processor_shutdown)).await {
            tracing::error!(error = ?e, "outbox processor exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    let _ = processor_handle.await;
    admin_handle.abort();

    Ok(())
}
