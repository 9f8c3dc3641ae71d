//! PDF Toolkit Server
//!
//! Wraps LibreOffice, qpdf, Ghostscript, ocrmypdf and poppler-utils behind
//! an HTTP job API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pdf_toolkit_server::{
    build_router,
    config::Config,
    executor::ProcessExecutor,
    operations::OperationRegistry,
    state::AppState,
    workspace::WorkspaceManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "pdf_toolkit_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Invalid configuration")?;

    tracing::info!("Starting PDF Toolkit Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Workspace root: {}", config.workspace.root.display());
    tracing::info!(
        "Concurrency: {} jobs, queue timeout {}ms",
        config.limits.max_concurrent_jobs,
        config.limits.queue_timeout_ms
    );

    let registry = Arc::new(OperationRegistry::builtin(
        config.tools.clone(),
        &config.timeouts,
    ));
    tracing::info!("Registered {} operations", registry.len());

    check_tools(&config).await;

    let workspaces = WorkspaceManager::new(&config.workspace.root)
        .await
        .with_context(|| format!("Failed to create workspace root {}", config.workspace.root.display()))?;

    let grace = config.orphan_grace(registry.max_timeout());
    tracing::info!("Orphan grace period: {}s", grace.as_secs());

    match workspaces.sweep_orphans(grace).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Startup sweep removed {} orphaned workspaces", n),
        Err(e) => tracing::warn!("Startup sweep failed: {}", e),
    }

    let sweeper = workspaces.clone().start_sweep_task(
        Duration::from_secs(config.workspace.sweep_interval_secs.max(1)),
        grace,
    );

    let app_state = AppState::new(
        config.clone(),
        registry,
        workspaces,
        Arc::new(ProcessExecutor::new()),
    );

    let app = build_router(app_state);

    // Start server with graceful shutdown
    let ip = config
        .server
        .host
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("Invalid SERVER_HOST '{}'", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    tracing::info!("PDF Toolkit Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Warn about external tools that cannot be started
async fn check_tools(config: &Config) {
    let tools = &config.tools;
    for (name, program) in [
        ("soffice", &tools.soffice),
        ("qpdf", &tools.qpdf),
        ("gs", &tools.gs),
        ("ocrmypdf", &tools.ocrmypdf),
        ("pdftotext", &tools.pdftotext),
        ("pdftoppm", &tools.pdftoppm),
    ] {
        if ProcessExecutor::is_available(program).await {
            tracing::debug!(tool = name, program = %program, "Tool available");
        } else {
            tracing::warn!(
                tool = name,
                program = %program,
                "Tool not found; operations using it will fail"
            );
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
