//! Bridge Types
//!
//! Value types handed from the bridge to the front-end.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::backend::BackendKind;
use crate::classifier::{Classification, TestSummary};

/// Outcome of one `Bridge::execute` call. Failures are values, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    /// Set when the backend could not produce any output
    pub error: Option<String>,
    pub files_changed: Vec<String>,
    pub tests: TestSummary,
    pub working_dir: PathBuf,
    pub timestamp: DateTime<Utc>,
    /// Backend that produced the output; None on invocation failure
    pub method: Option<BackendKind>,
}

impl ExecutionResult {
    /// Backend output plus what the classifier made of it.
    /// Output flagged as an error is reported as unsuccessful.
    pub fn from_output(
        output: String,
        classification: Classification,
        working_dir: &Path,
        method: BackendKind,
    ) -> Self {
        Self {
            success: !classification.is_error,
            output,
            error: None,
            files_changed: classification.files_changed,
            tests: classification.tests,
            working_dir: working_dir.to_path_buf(),
            timestamp: Utc::now(),
            method: Some(method),
        }
    }

    /// Invocation failure
    pub fn failure(message: &str, working_dir: &Path) -> Self {
        Self {
            success: false,
            output: format!("Error: {}", message),
            error: Some(message.to_string()),
            files_changed: Vec::new(),
            tests: TestSummary::default(),
            working_dir: working_dir.to_path_buf(),
            timestamp: Utc::now(),
            method: None,
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.files_changed.is_empty()
    }
}
