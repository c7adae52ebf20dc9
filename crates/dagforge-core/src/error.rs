//! User-visible error kinds and process exit codes

use serde::{Deserialize, Serialize};

/// The distinct error kinds surfaced to users.
///
/// Every [`DiagnosticCode`](crate::DiagnosticCode) belongs to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// YAML invalid, block delimiters mismatched, duplicate key
    #[serde(rename = "ParseError")]
    Parse,

    /// Schema contract violated, unknown config key, type mismatch
    #[serde(rename = "ValidationError")]
    Validation,

    /// Target not found, ambiguous, disabled, access denied
    #[serde(rename = "ReferenceError")]
    Reference,

    /// Macro not found, duplicate macro or materialization, bad dispatch
    #[serde(rename = "MacroError")]
    Macro,

    /// Render failure, undefined variable, ephemeral recursion
    #[serde(rename = "CompileError")]
    Compile,

    /// Adapter reported a failure during execution
    #[serde(rename = "RuntimeError")]
    Runtime,

    /// Adapter connection failed
    #[serde(rename = "DatabaseError")]
    Database,

    /// Package missing or version conflict
    #[serde(rename = "DependencyError")]
    Dependency,

    /// Declared contract diverges from observed columns
    #[serde(rename = "ContractError")]
    Contract,

    /// Indicates a bug
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "ParseError",
            Self::Validation => "ValidationError",
            Self::Reference => "ReferenceError",
            Self::Macro => "MacroError",
            Self::Compile => "CompileError",
            Self::Runtime => "RuntimeError",
            Self::Database => "DatabaseError",
            Self::Dependency => "DependencyError",
            Self::Contract => "ContractError",
            Self::Internal => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Success, possibly with warnings
    Success = 0,

    /// Handled failure: compile error, test failure, runtime error
    Failure = 1,

    /// Internal error
    Internal = 2,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_with_error_suffix() {
        let json = serde_json::to_string(&ErrorKind::Dependency).unwrap();
        assert_eq!(json, "\"DependencyError\"");
        assert_eq!(ErrorKind::Macro.to_string(), "MacroError");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Failure.code(), 1);
        assert_eq!(ExitCode::Internal.code(), 2);
    }
}
