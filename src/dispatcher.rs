//! Operation Dispatcher
//!
//! Runs a pending [`Job`] to a terminal or `succeeded` state: waits for a
//! concurrency slot, plans the command lines, executes them one after another
//! under a single per-operation deadline and verifies that every expected
//! output exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::JobError;
use crate::executor::{ExecError, ExternalExecutor};
use crate::job::{Job, JobStatus};
use crate::operations::{
    output_path, ExpectedOutputs, OperationRegistry, OperationSpec, PlanContext, OUTPUT_DIR,
};

/// Dispatches jobs to external tools
pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    executor: Arc<dyn ExternalExecutor>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    queue_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<OperationRegistry>,
        executor: Arc<dyn ExternalExecutor>,
        max_concurrent: usize,
        queue_timeout: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            executor,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queue_timeout,
        }
    }

    /// Free dispatch slots
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Jobs currently holding a slot
    pub fn active_jobs(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available_slots())
    }

    /// Run a pending job
    ///
    /// On return the job is either `succeeded` with `outputs` filled in, or
    /// `failed` with the returned error recorded.
    pub async fn run(&self, job: &mut Job) -> Result<(), JobError> {
        let result = self.run_inner(job).await;
        if let Err(e) = &result {
            tracing::warn!(job_id = %job.id, operation = %job.selector, error = %e, "Job failed");
            job.fail(e);
        }
        result
    }

    async fn run_inner(&self, job: &mut Job) -> Result<(), JobError> {
        let spec = self.registry.get(&job.selector.name).ok_or_else(|| {
            JobError::InvalidInput(format!("unknown operation '{}'", job.selector.name))
        })?;

        let _permit = self.acquire_slot().await?;

        job.transition(JobStatus::Running)
            .map_err(|e| JobError::InvalidInput(e.to_string()))?;

        let start = Instant::now();
        let outputs = self.execute(spec, job).await?;

        tracing::info!(
            job_id = %job.id,
            operation = %job.selector,
            outputs = outputs.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Job succeeded"
        );

        job.outputs = outputs;
        job.transition(JobStatus::Succeeded)
            .map_err(|e| JobError::InvalidInput(e.to_string()))?;
        Ok(())
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, JobError> {
        let busy = || JobError::ServerBusy(self.max_concurrent);

        if self.queue_timeout.is_zero() {
            return self.slots.clone().try_acquire_owned().map_err(|_| busy());
        }

        match tokio::time::timeout(self.queue_timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(busy()),
        }
    }

    /// Plan and run every step, then verify the outputs
    async fn execute(&self, spec: &OperationSpec, job: &Job) -> Result<Vec<PathBuf>, JobError> {
        let workdir = job.workspace().path();
        let ctx = PlanContext {
            argument: job.selector.argument.as_deref(),
            params: &job.params,
            inputs: &job.inputs,
            workspace: workdir,
            tools: self.registry.tools(),
        };
        let plan = spec.plan(&ctx)?;

        let deadline = Instant::now() + spec.timeout;

        for step in &plan.steps {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(JobError::Timeout(spec.timeout.as_secs()));
            }

            tracing::debug!(job_id = %job.id, tool = step.tool, command = %step, "Running step");

            let outcome = match self.executor.run(step, workdir, remaining).await {
                Ok(outcome) => outcome,
                Err(ExecError::Timeout(_)) => {
                    return Err(JobError::Timeout(spec.timeout.as_secs()));
                }
                Err(ExecError::Spawn(e)) => {
                    return Err(JobError::ExternalToolFailure {
                        tool: step.tool.to_string(),
                        exit_code: None,
                        stderr: format!("failed to start {}: {}", step.program, e),
                    });
                }
                Err(ExecError::Io(e)) => return Err(JobError::Io(e)),
            };

            tracing::info!(
                job_id = %job.id,
                tool = step.tool,
                exit_code = ?outcome.exit_code,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Step finished"
            );

            if !outcome.success() {
                return Err(JobError::ExternalToolFailure {
                    tool: step.tool.to_string(),
                    exit_code: outcome.exit_code,
                    stderr: outcome.stderr,
                });
            }
        }

        collect_outputs(workdir, &plan.outputs).await
    }
}

/// Check that the expected outputs exist and are non-empty
async fn collect_outputs(workdir: &Path, expected: &ExpectedOutputs) -> Result<Vec<PathBuf>, JobError> {
    match expected {
        ExpectedOutputs::Files(files) => {
            for file in files {
                if !is_non_empty_file(&workdir.join(file)).await {
                    return Err(JobError::OutputMissing(file.display().to_string()));
                }
            }
            Ok(files.clone())
        }
        ExpectedOutputs::Matching { prefix, extension } => {
            let mut found = Vec::new();
            let mut entries = tokio::fs::read_dir(workdir.join(OUTPUT_DIR)).await?;

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let matches = name.starts_with(prefix.as_str())
                    && Path::new(name).extension().and_then(|e| e.to_str()) == Some(extension.as_str());

                if matches && is_non_empty_file(&entry.path()).await {
                    found.push(output_path(name));
                }
            }

            if found.is_empty() {
                return Err(JobError::OutputMissing(format!(
                    "{}/{}*.{}",
                    OUTPUT_DIR, prefix, extension
                )));
            }

            found.sort();
            Ok(found)
        }
    }
}

async fn is_non_empty_file(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.is_file() && m.len() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolPaths;
    use crate::executor::ExecOutcome;
    use crate::operations::{CommandLine, OperationSelector};
    use crate::workspace::WorkspaceManager;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Scripted stand-in for real tools
    enum FakeExecutor {
        /// Exit 0 and write every `out/` argument
        Succeed,
        /// Exit 0 without writing anything
        SucceedEmpty,
        Fail(i32, &'static str),
        /// Never finish before the timeout
        Hang,
    }

    #[async_trait]
    impl ExternalExecutor for FakeExecutor {
        async fn run(
            &self,
            command: &CommandLine,
            workdir: &Path,
            timeout: Duration,
        ) -> Result<ExecOutcome, ExecError> {
            match self {
                FakeExecutor::Succeed => {
                    for arg in &command.args {
                        let target = arg.rsplit('=').next().unwrap_or(arg);
                        if target.starts_with("out/") && target.contains('.') {
                            tokio::fs::write(workdir.join(target), b"%PDF-1.4 fake")
                                .await
                                .unwrap();
                        }
                    }
                    Ok(outcome(Some(0), ""))
                }
                FakeExecutor::SucceedEmpty => Ok(outcome(Some(0), "")),
                FakeExecutor::Fail(code, stderr) => Ok(outcome(Some(*code), stderr)),
                FakeExecutor::Hang => {
                    tokio::time::sleep(timeout).await;
                    Err(ExecError::Timeout(timeout))
                }
            }
        }
    }

    fn outcome(exit_code: Option<i32>, stderr: &str) -> ExecOutcome {
        ExecOutcome {
            exit_code,
            stderr: stderr.to_string(),
            elapsed: Duration::from_millis(1),
        }
    }

    fn dispatcher(executor: FakeExecutor, timeouts: &[(&str, u64)]) -> Dispatcher {
        let timeouts: HashMap<String, u64> =
            timeouts.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let registry = OperationRegistry::builtin(ToolPaths::default(), &timeouts);
        Dispatcher::new(Arc::new(registry), Arc::new(executor), 1, Duration::ZERO)
    }

    fn queued_dispatcher(queue_timeout: Duration) -> Dispatcher {
        let registry = OperationRegistry::builtin(ToolPaths::default(), &HashMap::new());
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(FakeExecutor::Succeed),
            1,
            queue_timeout,
        )
    }

    async fn pending_job(manager: &WorkspaceManager, selector: &str) -> Job {
        let workspace = manager.create(Uuid::new_v4()).await.unwrap();
        let input = workspace
            .write_input("input-1.pdf", b"%PDF-1.4 test")
            .await
            .unwrap();
        Job::new(
            OperationSelector::parse(selector).unwrap(),
            BTreeMap::new(),
            vec!["test.pdf".to_string()],
            vec![input],
            workspace,
        )
    }

    #[tokio::test]
    async fn test_rotate_succeeds() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = dispatcher(FakeExecutor::Succeed, &[]);

        let mut job = pending_job(&manager, "rotate:90").await;
        dispatcher.run(&mut job).await.unwrap();

        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.outputs, vec![PathBuf::from("out/rotated.pdf")]);
        assert_ne!(job.outputs[0], job.inputs[0]);
        assert_eq!(dispatcher.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = dispatcher(FakeExecutor::Fail(2, "qpdf: bad file"), &[]);

        let mut job = pending_job(&manager, "rotate").await;
        let err = dispatcher.run(&mut job).await.unwrap_err();

        match err {
            JobError::ExternalToolFailure {
                tool,
                exit_code,
                stderr,
            } => {
                assert_eq!(tool, "qpdf");
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "qpdf: bad file");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().is_some());
    }

    #[tokio::test]
    async fn test_missing_output() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = dispatcher(FakeExecutor::SucceedEmpty, &[]);

        let mut job = pending_job(&manager, "rotate").await;
        let err = dispatcher.run(&mut job).await.unwrap_err();

        assert!(matches!(err, JobError::OutputMissing(_)));
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_hanging_tool_times_out_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = dispatcher(FakeExecutor::Hang, &[("rotate", 1)]);

        let mut job = pending_job(&manager, "rotate").await;
        let path = job.workspace().path().to_path_buf();

        let start = Instant::now();
        let err = dispatcher.run(&mut job).await.unwrap_err();
        assert!(matches!(err, JobError::Timeout(1)));
        assert!(start.elapsed() < Duration::from_secs(3));

        job.discard().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_busy_when_no_slot() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = dispatcher(FakeExecutor::Succeed, &[]);

        let _held = dispatcher.slots.clone().try_acquire_owned().unwrap();
        assert_eq!(dispatcher.active_jobs(), 1);

        let mut job = pending_job(&manager, "rotate").await;
        let err = dispatcher.run(&mut job).await.unwrap_err();

        assert!(matches!(err, JobError::ServerBusy(1)));
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_queued_job_gives_up_after_queue_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = queued_dispatcher(Duration::from_millis(200));

        let _held = dispatcher.slots.clone().try_acquire_owned().unwrap();

        let mut job = pending_job(&manager, "rotate").await;
        let start = Instant::now();
        let err = dispatcher.run(&mut job).await.unwrap_err();

        assert!(matches!(err, JobError::ServerBusy(1)));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_queued_job_runs_once_slot_frees() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let dispatcher = queued_dispatcher(Duration::from_secs(5));

        let held = dispatcher.slots.clone().try_acquire_owned().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(held);
        });

        let mut job = pending_job(&manager, "rotate").await;
        dispatcher.run(&mut job).await.unwrap();

        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(dispatcher.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_matching_outputs_are_sorted() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("out")).unwrap();
        for name in ["page-2.png", "page-1.png", "other.txt"] {
            std::fs::write(temp_dir.path().join("out").join(name), b"x").unwrap();
        }
        std::fs::write(temp_dir.path().join("out/page-3.png"), b"").unwrap();

        let outputs = collect_outputs(
            temp_dir.path(),
            &ExpectedOutputs::Matching {
                prefix: "page".into(),
                extension: "png".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            outputs,
            vec![PathBuf::from("out/page-1.png"), PathBuf::from("out/page-2.png")]
        );
    }
}
