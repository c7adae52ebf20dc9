//! Runner error types

use dagforge_catalog::AdapterError;
use dagforge_core::{Diagnostic, DiagnosticCode};
use dagforge_engine::{CompileError, MacroError};

/// Per-node and run-level failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Materialization(#[from] MacroError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The statement outlived the adapter timeout
    #[error("timeout")]
    Timeout { node: String, seconds: f64 },

    #[error("{0}")]
    Cancelled(String),

    #[error("Failed to write {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to serialize run results: {0}")]
    Serialize(String),
}

impl RunnerError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            RunnerError::Compile(err) => err.to_diagnostic(),
            RunnerError::Materialization(err) => err.to_diagnostic(),
            RunnerError::Adapter(err) => err.to_diagnostic(),
            RunnerError::Timeout { node, .. } => {
                Diagnostic::error(DiagnosticCode::ExecutionTimeout, self.to_string()).with_nodes([node.clone()])
            }
            RunnerError::Cancelled(_) => Diagnostic::error(DiagnosticCode::ExecutionFailed, self.to_string()),
            RunnerError::Io { .. } | RunnerError::Serialize(_) => {
                Diagnostic::error(DiagnosticCode::InternalError, self.to_string())
            }
        }
    }
}
