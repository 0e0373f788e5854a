use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
}

/// GET /api/v1/health
///
/// Reports `degraded` rather than failing the request outright if the
/// database is unreachable — the process itself is still alive and the
/// caller (a load balancer health check) can decide what to do with that.
pub async fn health(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    let database = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "ok",
        Err(_) => "unreachable",
    };

    let status = if database == "ok" { "ok" } else { "degraded" };

    Ok(HttpResponse::Ok().json(HealthResponse { status, database }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/health", web::get().to(health));
}
