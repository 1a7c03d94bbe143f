use axum::Json;
use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;
use tikv_jemalloc_ctl::{epoch, stats};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub version: &'static str,
    pub watcher: String,
    pub allocated_bytes: Option<u64>,
    pub resident_bytes: Option<u64>,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<AgentStatus> {
    let (allocated_bytes, resident_bytes) = memory_stats();
    Json(AgentStatus {
        version: env!("CARGO_PKG_VERSION"),
        watcher: state.watcher.state().as_ref().to_string(),
        allocated_bytes,
        resident_bytes,
    })
}

/// Bounce the event watcher. The restart happens asynchronously; progress
/// is observable through `GET /v1/status`.
pub async fn restart_watcher(State(state): State<Arc<AppState>>) -> http::StatusCode {
    log::info!("Watcher restart requested over the API");
    state.watcher.restart().await;
    http::StatusCode::ACCEPTED
}

/// Allocator statistics are cached snapshots; advancing the epoch refreshes
/// them before reading.
fn memory_stats() -> (Option<u64>, Option<u64>) {
    if epoch::advance().is_err() {
        return (None, None);
    }
    (
        stats::allocated::read().ok().map(|v| v as u64),
        stats::resident::read().ok().map(|v| v as u64),
    )
}
