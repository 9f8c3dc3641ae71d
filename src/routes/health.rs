//! Health check

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_jobs: usize,
    pub available_slots: usize,
    pub operations: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let dispatcher = state.dispatcher();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        active_jobs: dispatcher.active_jobs(),
        available_slots: dispatcher.available_slots(),
        operations: state.registry().len(),
    })
}
