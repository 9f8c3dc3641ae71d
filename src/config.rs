//! Configuration management for the PDF toolkit server

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub limits: LimitsConfig,
    pub tools: ToolPaths,
    /// Per-operation timeout overrides in seconds, keyed by operation name
    pub timeouts: HashMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding one subdirectory per in-flight job
    pub root: PathBuf,
    /// Age after which a leftover workspace is considered orphaned
    pub orphan_grace_secs: u64,
    /// How often the orphan sweep runs
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum total size of all uploaded files in one request
    pub max_upload_bytes: u64,
    /// Maximum jobs running external tools at once
    pub max_concurrent_jobs: usize,
    /// How long a job may wait for a free slot (0 = reject immediately)
    pub queue_timeout_ms: u64,
}

/// Locations of the external binaries
#[derive(Debug, Clone, Deserialize)]
pub struct ToolPaths {
    pub soffice: String,
    pub qpdf: String,
    pub gs: String,
    pub ocrmypdf: String,
    pub pdftotext: String,
    pub pdftoppm: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            soffice: "soffice".to_string(),
            qpdf: "qpdf".to_string(),
            gs: "gs".to_string(),
            ocrmypdf: "ocrmypdf".to_string(),
            pdftotext: "pdftotext".to_string(),
            pdftoppm: "pdftoppm".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            workspace: WorkspaceConfig {
                root: env::temp_dir().join("pdf-toolkit"),
                orphan_grace_secs: 3600,
                sweep_interval_secs: 300,
            },
            limits: LimitsConfig {
                max_upload_bytes: 100 * 1024 * 1024,
                max_concurrent_jobs: 4,
                queue_timeout_ms: 30_000,
            },
            tools: ToolPaths::default(),
            timeouts: HashMap::new(),
        }
    }
}

/// Extra age a workspace must reach beyond the longest possible job before
/// the sweep may treat it as orphaned
const SWEEP_MARGIN: Duration = Duration::from_secs(300);

impl Config {
    /// Age after which a workspace counts as orphaned
    ///
    /// Never shorter than a queued job's wait plus the longest operation
    /// timeout, so a live job is never swept.
    pub fn orphan_grace(&self, longest_operation: Duration) -> Duration {
        let longest_job = Duration::from_millis(self.limits.queue_timeout_ms)
            .saturating_add(longest_operation)
            .saturating_add(SWEEP_MARGIN);
        Duration::from_secs(self.workspace.orphan_grace_secs).max(longest_job)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            workspace: WorkspaceConfig {
                root: env::var("WORKSPACE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.workspace.root),
                orphan_grace_secs: parse_var(
                    "ORPHAN_GRACE_SECS",
                    defaults.workspace.orphan_grace_secs,
                )?,
                sweep_interval_secs: parse_var(
                    "SWEEP_INTERVAL_SECS",
                    defaults.workspace.sweep_interval_secs,
                )?,
            },
            limits: LimitsConfig {
                max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", defaults.limits.max_upload_bytes)?,
                max_concurrent_jobs: parse_var(
                    "MAX_CONCURRENT_JOBS",
                    defaults.limits.max_concurrent_jobs,
                )?,
                queue_timeout_ms: parse_var("QUEUE_TIMEOUT_MS", defaults.limits.queue_timeout_ms)?,
            },
            tools: ToolPaths {
                soffice: env::var("SOFFICE_BIN").unwrap_or(defaults.tools.soffice),
                qpdf: env::var("QPDF_BIN").unwrap_or(defaults.tools.qpdf),
                gs: env::var("GS_BIN").unwrap_or(defaults.tools.gs),
                ocrmypdf: env::var("OCRMYPDF_BIN").unwrap_or(defaults.tools.ocrmypdf),
                pdftotext: env::var("PDFTOTEXT_BIN").unwrap_or(defaults.tools.pdftotext),
                pdftoppm: env::var("PDFTOPPM_BIN").unwrap_or(defaults.tools.pdftoppm),
            },
            timeouts: match env::var("OPERATION_TIMEOUTS") {
                Ok(raw) => parse_timeouts(&raw)?,
                Err(_) => defaults.timeouts,
            },
        })
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `ocr=600,to-pdf=180` into a timeout map
fn parse_timeouts(raw: &str) -> Result<HashMap<String, u64>, ConfigError> {
    let mut timeouts = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || ConfigError::InvalidValue {
            key: "OPERATION_TIMEOUTS".to_string(),
            value: entry.to_string(),
        };

        let (name, secs) = entry.split_once('=').ok_or_else(invalid)?;
        let secs: u64 = secs.trim().parse().map_err(|_| invalid())?;
        if secs == 0 {
            return Err(invalid());
        }
        timeouts.insert(name.trim().to_string(), secs);
    }

    Ok(timeouts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeouts() {
        let parsed = parse_timeouts("ocr=600, to-pdf=180").unwrap();
        assert_eq!(parsed.get("ocr"), Some(&600));
        assert_eq!(parsed.get("to-pdf"), Some(&180));
        assert!(parse_timeouts("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_timeouts_rejects_garbage() {
        assert!(parse_timeouts("ocr").is_err());
        assert!(parse_timeouts("ocr=soon").is_err());
        assert!(parse_timeouts("ocr=0").is_err());
    }

    #[test]
    fn test_orphan_grace_covers_queue_and_timeout() {
        let mut config = Config::default();
        config.workspace.orphan_grace_secs = 60;
        config.limits.queue_timeout_ms = 900_000;

        // 900s queue + 600s ocr + 300s margin
        assert_eq!(
            config.orphan_grace(Duration::from_secs(600)),
            Duration::from_secs(1800)
        );

        config.workspace.orphan_grace_secs = 7200;
        assert_eq!(
            config.orphan_grace(Duration::from_secs(600)),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert!(config.limits.max_concurrent_jobs > 0);
        assert_eq!(config.tools.qpdf, "qpdf");
    }
}
