//! Operation catalog route

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::operations::OperationInfo;
use crate::state::AppState;

#[derive(Serialize)]
pub struct OperationListResponse {
    pub operations: Vec<OperationInfo>,
    pub total: usize,
}

/// Create the operations router
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_operations))
}

/// List every supported operation
async fn list_operations(State(state): State<AppState>) -> Json<OperationListResponse> {
    let operations = state.registry().list();
    let total = operations.len();

    Json(OperationListResponse { operations, total })
}
