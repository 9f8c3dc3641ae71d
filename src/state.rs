//! Application state management

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::executor::ExternalExecutor;
use crate::intake::Intake;
use crate::operations::OperationRegistry;
use crate::workspace::WorkspaceManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    registry: Arc<OperationRegistry>,
    workspaces: WorkspaceManager,
    intake: Intake,
    dispatcher: Dispatcher,
}

impl AppState {
    /// Wire intake and the dispatcher around one registry and executor
    pub fn new(
        config: Config,
        registry: Arc<OperationRegistry>,
        workspaces: WorkspaceManager,
        executor: Arc<dyn ExternalExecutor>,
    ) -> Self {
        let intake = Intake::new(
            registry.clone(),
            workspaces.clone(),
            config.limits.max_upload_bytes,
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            executor,
            config.limits.max_concurrent_jobs,
            Duration::from_millis(config.limits.queue_timeout_ms),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                workspaces,
                intake,
                dispatcher,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the operation registry
    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    pub fn intake(&self) -> &Intake {
        &self.inner.intake
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}
