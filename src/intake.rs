//! Upload Intake
//!
//! Validates an upload against the operation registry and, only once every
//! check has passed, stores it in a fresh workspace. Rejected uploads never
//! touch the disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::Job;
use crate::operations::{
    InputKind, OperationRegistry, OperationSelector, OperationSpec, PlanContext,
    DOCUMENT_EXTENSIONS, INPUT_DIR,
};
use crate::workspace::WorkspaceManager;

/// How far into a file the `%PDF-` signature may appear
const PDF_SIGNATURE_WINDOW: usize = 1024;

const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// One uploaded file
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// A parsed upload request
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Raw `name[:argument]` selector
    pub operation: String,
    pub files: Vec<UploadedFile>,
    pub params: BTreeMap<String, String>,
}

/// Turns upload requests into pending jobs
pub struct Intake {
    registry: Arc<OperationRegistry>,
    workspaces: WorkspaceManager,
    max_upload_bytes: u64,
}

impl Intake {
    pub fn new(
        registry: Arc<OperationRegistry>,
        workspaces: WorkspaceManager,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            registry,
            workspaces,
            max_upload_bytes,
        }
    }

    /// Validate an upload and store it in a new workspace
    pub async fn accept(&self, request: UploadRequest) -> Result<Job> {
        let selector = OperationSelector::parse(&request.operation)?;
        let spec = self.registry.get(&selector.name).ok_or_else(|| {
            JobError::InvalidInput(format!("unknown operation '{}'", selector.name))
        })?;

        self.check_count(spec, request.files.len())?;
        self.check_sizes(spec, &request.files)?;
        let extensions = check_types(spec, &request.files)?;

        let inputs: Vec<PathBuf> = extensions
            .iter()
            .enumerate()
            .map(|(i, ext)| Path::new(INPUT_DIR).join(input_name(i, ext)))
            .collect();

        // Reject bad arguments before anything is written
        let job_id = Uuid::new_v4();
        let prospective = self.workspaces.path_for(job_id);
        spec.plan(&PlanContext {
            argument: selector.argument.as_deref(),
            params: &request.params,
            inputs: &inputs,
            workspace: &prospective,
            tools: self.registry.tools(),
        })?;

        let workspace = self.workspaces.create(job_id).await?;

        let mut stored = Vec::with_capacity(request.files.len());
        for (i, (file, ext)) in request.files.iter().zip(&extensions).enumerate() {
            match workspace.write_input(&input_name(i, ext), &file.data).await {
                Ok(path) => stored.push(path),
                Err(e) => {
                    tracing::error!(job_id = %job_id, file = %file.file_name, error = %e, "Failed to store upload");
                    if let Err(release_err) = workspace.release().await {
                        tracing::warn!(job_id = %job_id, error = %release_err, "Failed to release workspace");
                    }
                    return Err(JobError::Io(e));
                }
            }
        }

        let total: u64 = request.files.iter().map(|f| f.data.len() as u64).sum();
        tracing::info!(
            job_id = %job_id,
            operation = %selector,
            files = stored.len(),
            bytes = total,
            "Upload accepted"
        );

        let file_names = request.files.into_iter().map(|f| f.file_name).collect();
        Ok(Job::new(selector, request.params, file_names, stored, workspace))
    }

    fn check_count(&self, spec: &OperationSpec, count: usize) -> Result<()> {
        if count < spec.min_inputs || count > spec.max_inputs {
            let expected = if spec.min_inputs == spec.max_inputs {
                spec.min_inputs.to_string()
            } else {
                format!("{} to {}", spec.min_inputs, spec.max_inputs)
            };
            return Err(JobError::InvalidInput(format!(
                "operation '{}' takes {} file(s), got {}",
                spec.name, expected, count
            )));
        }
        Ok(())
    }

    fn check_sizes(&self, spec: &OperationSpec, files: &[UploadedFile]) -> Result<()> {
        if let Some(empty) = files.iter().find(|f| f.data.is_empty()) {
            return Err(JobError::InvalidInput(format!(
                "file '{}' is empty",
                empty.file_name
            )));
        }

        let max = self.max_upload_bytes.min(spec.max_input_bytes);
        let size: u64 = files.iter().map(|f| f.data.len() as u64).sum();
        if size > max {
            return Err(JobError::PayloadTooLarge { size, max });
        }
        Ok(())
    }
}

/// Check every file against the operation's input kind
///
/// Returns the extension each file will be stored under.
fn check_types(spec: &OperationSpec, files: &[UploadedFile]) -> Result<Vec<String>> {
    files
        .iter()
        .map(|file| match spec.input_kind {
            InputKind::Pdf => {
                if is_pdf(&file.data) {
                    Ok("pdf".to_string())
                } else {
                    Err(JobError::UnsupportedType(format!(
                        "'{}' is not a PDF ({})",
                        file.file_name,
                        guessed_type(file)
                    )))
                }
            }
            InputKind::Document => document_extension(&file.file_name).ok_or_else(|| {
                JobError::UnsupportedType(format!(
                    "'{}' is not a convertible document ({})",
                    file.file_name,
                    guessed_type(file)
                ))
            }),
        })
        .collect()
}

fn is_pdf(data: &[u8]) -> bool {
    let window = &data[..data.len().min(PDF_SIGNATURE_WINDOW)];
    window
        .windows(PDF_SIGNATURE.len())
        .any(|w| w == PDF_SIGNATURE)
}

fn document_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    DOCUMENT_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn guessed_type(file: &UploadedFile) -> String {
    file.content_type.clone().unwrap_or_else(|| {
        mime_guess::from_path(&file.file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    })
}

fn input_name(index: usize, extension: &str) -> String {
    format!("input-{}.{}", index + 1, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolPaths;
    use crate::job::JobStatus;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const TINY_PDF: &[u8] = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n";

    async fn create_test_intake(temp_dir: &TempDir, max_upload_bytes: u64) -> Intake {
        let registry = OperationRegistry::builtin(ToolPaths::default(), &HashMap::new());
        let workspaces = WorkspaceManager::new(temp_dir.path()).await.unwrap();
        Intake::new(Arc::new(registry), workspaces, max_upload_bytes)
    }

    fn file(name: &str, data: &'static [u8]) -> UploadedFile {
        UploadedFile {
            file_name: name.to_string(),
            content_type: None,
            data: Bytes::from_static(data),
        }
    }

    fn request(operation: &str, files: Vec<UploadedFile>) -> UploadRequest {
        UploadRequest {
            operation: operation.to_string(),
            files,
            params: BTreeMap::new(),
        }
    }

    fn workspace_count(temp_dir: &TempDir) -> usize {
        std::fs::read_dir(temp_dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_accepts_pdf() {
        let temp_dir = TempDir::new().unwrap();
        let intake = create_test_intake(&temp_dir, 1024 * 1024).await;

        let job = intake
            .accept(request("rotate:90", vec![file("scan.pdf", TINY_PDF)]))
            .await
            .unwrap();

        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.inputs, vec![PathBuf::from("in/input-1.pdf")]);
        assert_eq!(job.file_names, vec!["scan.pdf".to_string()]);
        assert!(job.workspace().resolve(&job.inputs[0]).is_file());
        assert_eq!(workspace_count(&temp_dir), 1);

        job.discard().await;
        assert_eq!(workspace_count(&temp_dir), 0);
    }

    #[tokio::test]
    async fn test_non_pdf_rejected_without_workspace() {
        let temp_dir = TempDir::new().unwrap();
        let intake = create_test_intake(&temp_dir, 1024 * 1024).await;

        let err = intake
            .accept(request("rotate", vec![file("notes.pdf", b"0123456789")]))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::UnsupportedType(_)));
        assert_eq!(workspace_count(&temp_dir), 0);
    }

    #[tokio::test]
    async fn test_signature_may_follow_junk() {
        let temp_dir = TempDir::new().unwrap();
        let intake = create_test_intake(&temp_dir, 1024 * 1024).await;

        let job = intake
            .accept(request("to-text", vec![file("a.pdf", b"\xef\xbb\xbf  %PDF-1.7 body")]))
            .await
            .unwrap();
        job.discard().await;
    }

    #[tokio::test]
    async fn test_rejections() {
        let temp_dir = TempDir::new().unwrap();
        let intake = create_test_intake(&temp_dir, 16).await;

        let cases = vec![
            request("frobnicate", vec![file("a.pdf", TINY_PDF)]),
            request("merge", vec![file("a.pdf", TINY_PDF)]),
            request("rotate:45", vec![file("a.pdf", b"%PDF-1.4")]),
            request("rotate", vec![file("a.pdf", b"")]),
            request("rotate", vec![]),
        ];
        for case in cases {
            let err = intake.accept(case).await.unwrap_err();
            assert!(matches!(err, JobError::InvalidInput(_)), "{err:?}");
        }

        let err = intake
            .accept(request("rotate", vec![file("a.pdf", TINY_PDF)]))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::PayloadTooLarge { max: 16, .. }));

        assert_eq!(workspace_count(&temp_dir), 0);
    }

    #[tokio::test]
    async fn test_documents_checked_by_extension() {
        let temp_dir = TempDir::new().unwrap();
        let intake = create_test_intake(&temp_dir, 1024 * 1024).await;

        let job = intake
            .accept(request("to-pdf", vec![file("Report.DOCX", b"PK\x03\x04 fake docx")]))
            .await
            .unwrap();
        assert_eq!(job.inputs, vec![PathBuf::from("in/input-1.docx")]);
        job.discard().await;

        let err = intake
            .accept(request("to-pdf", vec![file("tool.exe", b"MZ")]))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn test_identical_uploads_get_distinct_workspaces() {
        let temp_dir = TempDir::new().unwrap();
        let intake = Arc::new(create_test_intake(&temp_dir, 1024 * 1024).await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let intake = intake.clone();
                tokio::spawn(async move {
                    intake
                        .accept(request("rotate", vec![file("same.pdf", TINY_PDF)]))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut jobs = Vec::new();
        for handle in handles {
            jobs.push(handle.await.unwrap());
        }

        let mut paths: Vec<_> = jobs.iter().map(|j| j.workspace().path().to_path_buf()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);

        for job in jobs {
            job.discard().await;
        }
    }
}
