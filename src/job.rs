//! Job model
//!
//! A [`Job`] is one request's lifecycle:
//! `pending -> running -> {succeeded, failed}`, then `succeeded -> delivered`.
//! `failed` and `delivered` are terminal and both end with the workspace
//! being removed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::JobError;
use crate::operations::OperationSelector;
use crate::workspace::Workspace;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Inputs stored, waiting for a dispatch slot
    Pending,
    /// External tool running
    Running,
    /// All outputs present
    Succeeded,
    /// Tool failed, timed out or produced nothing
    Failed,
    /// Output streamed to the caller
    Delivered,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Delivered)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Succeeded, Self::Delivered)
        )
    }
}

/// Illegal status change
#[derive(Debug, thiserror::Error)]
#[error("Illegal job transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One request's end-to-end processing unit
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub selector: OperationSelector,
    /// Extra form fields passed to the planner
    pub params: BTreeMap<String, String>,
    /// Original upload names, in upload order
    pub file_names: Vec<String>,
    /// Stored inputs relative to the workspace
    pub inputs: Vec<PathBuf>,
    /// Produced outputs relative to the workspace
    pub outputs: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    status: JobStatus,
    error: Option<String>,
    workspace: Workspace,
}

impl Job {
    pub fn new(
        selector: OperationSelector,
        params: BTreeMap<String, String>,
        file_names: Vec<String>,
        inputs: Vec<PathBuf>,
        workspace: Workspace,
    ) -> Self {
        Self {
            id: workspace.job_id(),
            selector,
            params,
            file_names,
            inputs,
            outputs: Vec::new(),
            created_at: Utc::now(),
            status: JobStatus::Pending,
            error: None,
            workspace,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Failure detail, if the job failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }

        tracing::debug!(job_id = %self.id, from = ?self.status, to = ?next, "Job transition");
        self.status = next;
        Ok(())
    }

    /// Record a failure
    pub fn fail(&mut self, error: &JobError) {
        if let Err(e) = self.transition(JobStatus::Failed) {
            tracing::error!(job_id = %self.id, "{}", e);
            return;
        }
        self.error = Some(error.to_string());
    }

    /// Tear the job apart for delivery
    pub fn into_parts(self) -> (JobStatus, Vec<PathBuf>, Workspace) {
        (self.status, self.outputs, self.workspace)
    }

    /// Release the workspace of a job that will not be delivered
    pub async fn discard(self) {
        let job_id = self.id;
        let status = self.status;
        if let Err(e) = self.workspace.release().await {
            tracing::error!(job_id = %job_id, status = ?status, error = %e, "Failed to discard job workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use tempfile::TempDir;

    async fn create_test_job(temp_dir: &TempDir) -> Job {
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        let workspace = manager.create(Uuid::new_v4()).await.unwrap();
        Job::new(
            OperationSelector::parse("rotate:90").unwrap(),
            BTreeMap::new(),
            vec!["scan.pdf".to_string()],
            vec![PathBuf::from("in/input-1.pdf")],
            workspace,
        )
    }

    #[test]
    fn test_transitions() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Succeeded.can_transition_to(Delivered));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Failed));

        assert!(Failed.is_terminal());
        assert!(Delivered.is_terminal());
        assert!(!Succeeded.is_terminal());
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut job = create_test_job(&temp_dir).await;

        job.transition(JobStatus::Running).unwrap();
        job.fail(&JobError::Timeout(1));

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some("Operation timed out after 1 seconds"));
        assert!(job.transition(JobStatus::Running).is_err());
    }

    #[tokio::test]
    async fn test_discard_removes_workspace() {
        let temp_dir = TempDir::new().unwrap();
        let job = create_test_job(&temp_dir).await;
        let path = job.workspace().path().to_path_buf();
        assert!(path.exists());

        job.discard().await;
        assert!(!path.exists());
    }
}
