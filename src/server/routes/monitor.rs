//! Runtime state reports pushed by clients

use axum::{Json, extract::State, http::StatusCode};
use tracing::trace;

use crate::protocol::RuntimeReport;
use crate::server::state::ServerState;

/// POST /v1/cs/monitor
pub async fn report(State(state): State<ServerState>, Json(report): Json<RuntimeReport>) -> StatusCode {
    trace!(pool = %report.group_key, active = report.sample.active_count, "runtime report");
    state.reports.insert(report.group_key.clone(), report);
    StatusCode::NO_CONTENT
}

/// GET /v1/cs/monitor
///
/// Latest report of every pool.
pub async fn list_reports(State(state): State<ServerState>) -> Json<Vec<RuntimeReport>> {
    Json(state.reports())
}
