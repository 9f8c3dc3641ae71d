//! Operation types
//!
//! An [`OperationSpec`] binds an operation name to an external tool. The
//! planner turns a job's argument and parameters into the command lines to
//! run and the files they are expected to leave behind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::ToolPaths;
use crate::error::JobError;

/// Directory (relative to the workspace) holding uploaded inputs
pub const INPUT_DIR: &str = "in";

/// Directory (relative to the workspace) tools write results into
pub const OUTPUT_DIR: &str = "out";

/// File extensions LibreOffice is asked to convert
pub const DOCUMENT_EXTENSIONS: &[&str] = &[
    "doc", "docx", "odt", "rtf", "txt", "html", "htm", "xls", "xlsx", "ods", "csv", "ppt",
    "pptx", "odp", "png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp",
];

/// What kind of upload an operation accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// PDF files, recognized by their `%PDF-` signature
    Pdf,
    /// Office documents, text and images, recognized by extension
    Document,
}

/// Parsed `name[:argument]` operation selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSelector {
    pub name: String,
    pub argument: Option<String>,
}

impl OperationSelector {
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let raw = raw.trim();
        let (name, argument) = match raw.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (raw, None),
        };

        if name.is_empty() {
            return Err(JobError::InvalidInput("operation name is empty".to_string()));
        }
        if argument == Some("") {
            return Err(JobError::InvalidInput(format!(
                "operation '{}' has an empty argument",
                name
            )));
        }

        Ok(Self {
            name: name.to_ascii_lowercase(),
            argument: argument.map(str::to_string),
        })
    }
}

impl fmt::Display for OperationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.argument {
            Some(arg) => write!(f, "{}:{}", self.name, arg),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One external process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Short tool name used in logs and errors
    pub tool: &'static str,
    /// Binary to execute
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(tool: &'static str, program: &str) -> Self {
        Self {
            tool,
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Files an operation is expected to produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutputs {
    /// Exactly these files, relative to the workspace
    Files(Vec<PathBuf>),
    /// Every file in `out/` named `<prefix>*.<extension>` (at least one)
    Matching { prefix: String, extension: String },
}

/// Commands and expected results for one job
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<CommandLine>,
    pub outputs: ExpectedOutputs,
}

/// Everything a planner may look at
pub struct PlanContext<'a> {
    pub argument: Option<&'a str>,
    pub params: &'a BTreeMap<String, String>,
    /// Input files relative to the workspace, in upload order
    pub inputs: &'a [PathBuf],
    /// Absolute workspace directory
    pub workspace: &'a Path,
    pub tools: &'a ToolPaths,
}

impl PlanContext<'_> {
    /// Look up a non-empty parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Look up a required parameter
    pub fn require(&self, key: &str) -> Result<&str, JobError> {
        self.param(key)
            .ok_or_else(|| JobError::InvalidInput(format!("missing required parameter '{}'", key)))
    }

    /// Interpret a parameter as a boolean flag
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, JobError> {
        match self.param(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(JobError::InvalidInput(format!(
                    "parameter '{}' must be a boolean, got '{}'",
                    key, v
                ))),
            },
        }
    }

    pub fn input(&self, index: usize) -> String {
        path_arg(&self.inputs[index])
    }
}

/// Builds a [`Plan`] for a job
pub type Planner = fn(&PlanContext<'_>) -> Result<Plan, JobError>;

/// Static descriptor of one supported operation
#[derive(Clone)]
pub struct OperationSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_kind: InputKind,
    pub min_inputs: usize,
    pub max_inputs: usize,
    /// Extension of the delivered file
    pub output_extension: &'static str,
    /// Base name of the delivered file
    pub download_stem: &'static str,
    pub timeout: Duration,
    pub max_input_bytes: u64,
    /// Always deliver a zip, even for a single output
    pub bundle: bool,
    pub planner: Planner,
}

impl OperationSpec {
    pub fn plan(&self, ctx: &PlanContext<'_>) -> Result<Plan, JobError> {
        (self.planner)(ctx)
    }

    /// Content type of the delivered file
    pub fn content_type(&self, extension: &str) -> String {
        mime_guess::from_ext(extension)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

impl fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("name", &self.name)
            .field("input_kind", &self.input_kind)
            .field("inputs", &(self.min_inputs..=self.max_inputs))
            .field("output_extension", &self.output_extension)
            .field("bundle", &self.bundle)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Catalog entry returned by `GET /api/v1/operations`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub input_kind: InputKind,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub output_extension: &'static str,
    pub timeout_secs: u64,
    pub max_input_bytes: u64,
}

impl From<&OperationSpec> for OperationInfo {
    fn from(spec: &OperationSpec) -> Self {
        Self {
            name: spec.name,
            description: spec.description,
            input_kind: spec.input_kind,
            min_inputs: spec.min_inputs,
            max_inputs: spec.max_inputs,
            output_extension: spec.output_extension,
            timeout_secs: spec.timeout.as_secs(),
            max_input_bytes: spec.max_input_bytes,
        }
    }
}

/// Render a workspace-relative path as a command argument
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Workspace-relative path of an output file
pub fn output_path(name: &str) -> PathBuf {
    Path::new(OUTPUT_DIR).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        let sel = OperationSelector::parse("rotate:90").unwrap();
        assert_eq!(sel.name, "rotate");
        assert_eq!(sel.argument.as_deref(), Some("90"));

        let sel = OperationSelector::parse(" Merge ").unwrap();
        assert_eq!(sel.name, "merge");
        assert_eq!(sel.argument, None);
        assert_eq!(sel.to_string(), "merge");
    }

    #[test]
    fn test_parse_selector_rejects_empty() {
        assert!(matches!(
            OperationSelector::parse(""),
            Err(JobError::InvalidInput(_))
        ));
        assert!(matches!(
            OperationSelector::parse(":90"),
            Err(JobError::InvalidInput(_))
        ));
        assert!(matches!(
            OperationSelector::parse("rotate:"),
            Err(JobError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::new("qpdf", "/usr/bin/qpdf")
            .arg("in/input-1.pdf")
            .args(["out/rotated.pdf", "--rotate=+90"]);
        assert_eq!(
            cmd.to_string(),
            "/usr/bin/qpdf in/input-1.pdf out/rotated.pdf --rotate=+90"
        );
    }
}
