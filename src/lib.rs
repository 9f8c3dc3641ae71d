//! PDF Toolkit Server
//!
//! Job orchestration around external document tools: uploads are validated
//! and stored in a per-job workspace, handed to `soffice`, `qpdf`, `gs`,
//! `ocrmypdf` or poppler, and the result is streamed back before the
//! workspace is removed.
//!
//! # Modules
//!
//! - `intake`: upload validation and workspace creation
//! - `dispatcher`: concurrency slots, planning and tool execution
//! - `delivery`: output streaming and cleanup
//! - `operations`: the operation catalog and registry
//! - `executor`: the subprocess seam

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod intake;
pub mod job;
pub mod operations;
pub mod routes;
pub mod state;
pub mod workspace;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_upload_bytes = state.config().limits.max_upload_bytes;

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/health", get(routes::health::health_check))
        .nest("/api/v1/jobs", routes::jobs::router(max_upload_bytes))
        .nest("/api/v1/operations", routes::operations::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
