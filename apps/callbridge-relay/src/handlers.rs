use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use callbridge::relay::{CallSummary, RelayHub};
use callbridge::{metrics, CallId};

#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHub,
}

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
    relay_instance: String,
    connections: usize,
    calls: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let stats = state.hub.stats();
    Json(HealthStatus {
        status: "ok",
        relay_instance: stats.relay_instance,
        connections: stats.connections,
        calls: stats.calls,
    })
}

pub async fn get_call_status(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<Json<CallSummary>, StatusCode> {
    state
        .hub
        .call_summary(&CallId::from(call_id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
        .into_response()
}
