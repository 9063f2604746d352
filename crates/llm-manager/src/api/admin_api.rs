//! Liveness and status endpoints

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};
use sysinfo::System;

use crate::metrics;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub worker_state: &'static str,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_closed: bool,
    pub models_loaded: usize,
    pub conversations: usize,
    pub messages_processed: usize,
    pub memory_usage: Option<String>,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (models_loaded, conversations) = state.store.counts();

    let memory_usage = {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        (total > 0).then(|| format!("{}/{} MB", sys.used_memory() / 1024 / 1024, total / 1024 / 1024))
    };

    metrics::inc_request("status", "ok");
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        worker_state: state.dispatch.state().as_str(),
        queue_depth: state.dispatch.depth(),
        queue_capacity: state.config.queue_size,
        queue_closed: state.dispatch.is_closed(),
        models_loaded,
        conversations,
        messages_processed: state
            .store
            .counters
            .processed_messages
            .load(std::sync::atomic::Ordering::Relaxed),
        memory_usage,
    })
}
