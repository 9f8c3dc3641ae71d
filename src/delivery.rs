//! Result Delivery
//!
//! Hands a succeeded job's output to the caller as a byte stream. The stream
//! owns the workspace: it is released once the last byte has been read, on a
//! read error, or when the stream is dropped early (client disconnect).

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures::Stream;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::{Job, JobStatus};
use crate::operations::{output_path, OperationSpec};
use crate::workspace::Workspace;

/// A ready-to-send output
pub struct Delivery {
    /// Suggested download name
    pub file_name: String,
    pub content_type: String,
    pub content_length: u64,
    pub body: DeliveryStream,
}

/// Start delivering a succeeded job
///
/// Several outputs, or any output of a bundling operation, are packed into
/// a single zip archive first. On error the workspace has already been
/// released.
pub async fn deliver(mut job: Job, spec: &OperationSpec) -> Result<Delivery> {
    if job.status() != JobStatus::Succeeded || job.outputs.is_empty() {
        let err = JobError::OutputMissing(format!("job {} has nothing to deliver", job.id));
        job.discard().await;
        return Err(err);
    }

    if let Err(e) = job.transition(JobStatus::Delivered) {
        tracing::error!(job_id = %job.id, "{}", e);
    }

    let job_id = job.id;
    let (_, outputs, workspace) = job.into_parts();

    match open_output(&workspace, spec, &outputs).await {
        Ok((file_name, content_type, file, content_length)) => {
            tracing::info!(
                job_id = %job_id,
                file_name = %file_name,
                bytes = content_length,
                "Delivering output"
            );

            Ok(Delivery {
                file_name,
                content_type,
                content_length,
                body: DeliveryStream {
                    job_id,
                    inner: ReaderStream::new(file),
                    workspace: Some(workspace),
                    sent: 0,
                    total: content_length,
                },
            })
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to open output");
            if let Err(release_err) = workspace.release().await {
                tracing::warn!(job_id = %job_id, error = %release_err, "Failed to release workspace");
            }
            Err(JobError::Io(e))
        }
    }
}

async fn open_output(
    workspace: &Workspace,
    spec: &OperationSpec,
    outputs: &[PathBuf],
) -> io::Result<(String, String, tokio::fs::File, u64)> {
    let (relative, extension) = match outputs {
        [single] if !spec.bundle => {
            let extension = single
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or(spec.output_extension)
                .to_string();
            (single.clone(), extension)
        }
        many => {
            let archive = output_path(&format!("{}.zip", spec.download_stem));
            bundle(workspace, many, &archive).await?;
            (archive, "zip".to_string())
        }
    };

    let file = tokio::fs::File::open(workspace.resolve(&relative)).await?;
    let length = file.metadata().await?.len();

    Ok((
        format!("{}.{}", spec.download_stem, extension),
        spec.content_type(&extension),
        file,
        length,
    ))
}

/// Zip `files` into `archive`, all paths relative to the workspace
async fn bundle(workspace: &Workspace, files: &[PathBuf], archive: &Path) -> io::Result<()> {
    let sources: Vec<PathBuf> = files.iter().map(|f| workspace.resolve(f)).collect();
    let target = workspace.resolve(archive);

    tokio::task::spawn_blocking(move || write_zip(&sources, &target))
        .await
        .map_err(io::Error::other)?
}

fn write_zip(sources: &[PathBuf], target: &Path) -> io::Result<()> {
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    let mut zip = ZipWriter::new(std::fs::File::create(target)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for source in sources {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "output name is not UTF-8"))?;

        zip.start_file(name, options).map_err(io::Error::other)?;
        io::copy(&mut std::fs::File::open(source)?, &mut zip)?;
    }

    zip.finish().map_err(io::Error::other)?;
    Ok(())
}

// ============================================================================
// Body stream
// ============================================================================

/// Output bytes plus the workspace they live in
pub struct DeliveryStream {
    job_id: Uuid,
    inner: ReaderStream<tokio::fs::File>,
    workspace: Option<Workspace>,
    sent: u64,
    total: u64,
}

impl DeliveryStream {
    /// Bytes handed out so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn release(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            let job_id = self.job_id;
            tokio::spawn(async move {
                if let Err(e) = workspace.release().await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to release delivered workspace");
                }
            });
        }
    }
}

impl Stream for DeliveryStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::error!(job_id = %this.job_id, sent = this.sent, error = %e, "Output read failed");
                this.release();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                tracing::debug!(job_id = %this.job_id, bytes = this.sent, "Delivery complete");
                this.release();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        // Still holding the workspace means the stream never finished
        if self.workspace.is_none() {
            return;
        }

        let aborted = JobError::DeliveryAborted {
            sent: self.sent,
            total: self.total,
        };
        tracing::warn!(job_id = %self.job_id, code = aborted.code(), "{}", aborted);

        if tokio::runtime::Handle::try_current().is_ok() {
            self.release();
        }
        // Otherwise the workspace guard removes the directory synchronously
    }
}
