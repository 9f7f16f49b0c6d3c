use crate::{automation::Automation, store::Store};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn Store>,
    pub automation: Arc<dyn Automation>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub redis_ok: bool,
    pub selenium_ok: bool,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Liveness of both external dependencies.
///
/// - Method: `GET`
/// - Path: `/healthz`
///
/// 200 when Redis and the automation endpoint both answer, 503 otherwise.
async fn healthz(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let (redis, selenium) = tokio::join!(state.store.ping(), state.automation.status());
    let report = HealthReport {
        ok: redis.is_ok() && selenium,
        redis_ok: redis.is_ok(),
        selenium_ok: selenium,
    };
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
