//! Error handling module for nemostage
//!
//! Every failure mode of staging, patching and script generation is fatal.
//! Nothing here is retried; the variants exist so the operator is told exactly
//! which precondition or artifact failed.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for the staging engine
#[derive(Error, Debug)]
pub enum StageError {
    /// A required input artifact is missing (raised before any mutation)
    #[error("Precondition failed: {what} not found at {}", path.display())]
    Precondition { what: String, path: PathBuf },

    /// The target run directory already exists
    #[error("Run directory already exists, refusing to touch it: {}", path.display())]
    DirectoryConflict { path: PathBuf },

    /// A namelist that should be patched does not exist
    #[error("Namelist to patch does not exist: {}", path.display())]
    MissingDocument { path: PathBuf },

    /// An artifact that an external step should have produced is absent
    #[error("Expected artifact was not produced: {} ({context})", path.display())]
    PatchVerification { path: PathBuf, context: String },

    /// Unknown run-type selector
    #[error("Unrecognized run type '{selector}' (known: {known})")]
    UnrecognizedConfiguration { selector: String, known: String },

    /// A loop or state check ended with an unexpected value
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Namelist text could not be parsed
    #[error("Namelist parse error in {} line {line}: {reason}", path.display())]
    Namelist {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Stage configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// An external tool (ncks, ncrename, sbatch) failed
    #[error("Tool {tool} failed: {reason}")]
    Tool { tool: String, reason: String },

    /// IO errors with the path that was being touched
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for staging operations
pub type Result<T> = std::result::Result<T, StageError>;

impl StageError {
    pub fn precondition(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Precondition {
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn conflict(path: impl Into<PathBuf>) -> Self {
        Self::DirectoryConflict { path: path.into() }
    }

    pub fn missing_document(path: impl Into<PathBuf>) -> Self {
        Self::MissingDocument { path: path.into() }
    }

    pub fn verification(path: impl Into<PathBuf>, context: impl Into<String>) -> Self {
        Self::PatchVerification {
            path: path.into(),
            context: context.into(),
        }
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Short label printed in front of fatal diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition { .. } => "PreconditionError",
            Self::DirectoryConflict { .. } => "DirectoryConflictError",
            Self::MissingDocument { .. } => "MissingDocumentError",
            Self::PatchVerification { .. } => "PatchVerificationError",
            Self::UnrecognizedConfiguration { .. } => "UnrecognizedConfigurationError",
            Self::Consistency(_) => "ConsistencyError",
            Self::Namelist { .. } => "NamelistError",
            Self::Config(_) => "ConfigurationError",
            Self::Tool { .. } => "ToolError",
            Self::Io { .. } => "IoError",
            Self::Json(_) => "JsonError",
        }
    }
}

/// Attach a path to an IO error.
///
/// `fs::copy(&a, &b).at(&b)?` reads better than a `map_err` closure at every call site.
pub trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| StageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
