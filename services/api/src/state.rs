use std::sync::Arc;

use sqlx::PgPool;
use task_core::SqlxTaskStore;
use taskdisp_broker::BrokerPublisher;
use transactional_outbox::SqlxOutboxRepository;

/// Shared application state handed to every handler via `web::Data`.
pub struct AppState {
    pub pool: PgPool,
    pub tasks: SqlxTaskStore,
    pub outbox: SqlxOutboxRepository,
    /// `None` when `RABBITMQ_ENABLED=false` — the outbox remains the durable
    /// dispatch path either way, this is only the best-effort fast path.
    pub broker: Option<Arc<BrokerPublisher>>,
}
