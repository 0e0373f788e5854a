mod admin;
mod config;
mod consumer;
mod metrics;

use config::Config;
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use std::io;
use std::sync::Arc;
use task_core::{SqlxTaskStore, TaskStore};
use taskdisp_broker::BrokerPublisher;
use tokio::sync::broadcast;
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

    tracing::info!("Starting task worker");

    let config = Config::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;
    let config = Arc::new(config);

    let mut pool_cfg = DbPoolConfig::for_service("worker");
    pool_cfg.database_url = config.database.url.clone();
    if pool_cfg.max_connections < config.database.max_connections {
        pool_cfg.max_connections = config.database.max_connections;
    }

    let pool = create_pg_pool(pool_cfg).await.map_err(|e| {
        tracing::error!("Failed to connect to database: {}", e);
        io::Error::other("database connection failed")
    })?;
    tracing::info!("Connected to database");

    let tasks: Arc<dyn TaskStore> = Arc::new(SqlxTaskStore::new(pool));
    let broker = Arc::new(BrokerPublisher::new(
        config.broker.url.clone(),
        config.worker.queues.clone(),
        config.broker.retry_delays_seconds.clone(),
        config.broker.connect_attempts,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let admin_port = config.app.port;

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_port).await {
            tracing::error!(error = %e, "admin server exited");
        }
    });

    let mut consumer_handles = Vec::new();
    for queue in &config.worker.queues {
        let queue = queue.clone();
        let config = config.clone();
        let tasks = tasks.clone();
        let broker = broker.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        consumer_handles.push(tokio::spawn(async move {
            consumer::run(queue, config, tasks, broker, shutdown_rx).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    for handle in consumer_handles {
        let _ = handle.await;
    }
    admin_handle.abort();

    Ok(())
}
