//! Template errors and source spans

use dagforge_core::{Diagnostic, DiagnosticCode, Location, Severity};
use serde::{Deserialize, Serialize};

/// Byte range in a template source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    /// 1-indexed line and column of the span start
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let upto = &source[..self.start.min(source.len())];
        let line = upto.matches('\n').count() + 1;
        let column = upto.rfind('\n').map(|nl| upto.len() - nl).unwrap_or(upto.len() + 1);
        (line, column)
    }

    /// Slice of `source` covered by this span
    pub fn slice<'s>(&self, source: &'s str) -> &'s str {
        let end = self.end.min(source.len());
        let start = self.start.min(end);
        &source[start..end]
    }
}

/// Errors raised while parsing, inspecting or rendering templates
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JinjaError {
    #[error("Template syntax error: {message}")]
    Syntax {
        message: String,
        span: Span,
        file_path: Option<String>,
        line: Option<usize>,
        column: Option<usize>,
    },

    #[error("Block mismatch: {message}")]
    BlockMismatch {
        message: String,
        span: Span,
        file_path: Option<String>,
        line: Option<usize>,
        column: Option<usize>,
    },

    #[error("Invalid jinja expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid ref expression: {0}")]
    InvalidRef(String),

    #[error("Invalid source expression: {0}")]
    InvalidSource(String),

    #[error("The macro_name parameter to adapter.dispatch is not a string literal: {0}")]
    MacroNameNotString(String),

    #[error("The macro_namespace parameter to adapter.dispatch is a {0}, not a string literal")]
    MacroNamespaceNotString(String),

    #[error("Render error: {message}")]
    Render {
        message: String,
        file_path: Option<String>,
    },

    #[error("Undefined variable: {name}")]
    UndefinedVariable {
        name: String,
        file_path: Option<String>,
    },

    #[error("Env var required but not provided: '{0}'")]
    EnvVarMissing(String),
}

impl JinjaError {
    pub(crate) fn syntax(message: impl Into<String>, span: Span) -> Self {
        JinjaError::Syntax {
            message: message.into(),
            span,
            file_path: None,
            line: None,
            column: None,
        }
    }

    pub(crate) fn block_mismatch(message: impl Into<String>, span: Span) -> Self {
        JinjaError::BlockMismatch {
            message: message.into(),
            span,
            file_path: None,
            line: None,
            column: None,
        }
    }

    /// Attach a file path and resolve the span to line and column
    pub fn with_source(self, file_path: &str, source: &str) -> Self {
        match self {
            JinjaError::Syntax { message, span, .. } => {
                let (line, column) = span.line_col(source);
                JinjaError::Syntax {
                    message,
                    span,
                    file_path: Some(file_path.to_string()),
                    line: Some(line),
                    column: Some(column),
                }
            }
            JinjaError::BlockMismatch { message, span, .. } => {
                let (line, column) = span.line_col(source);
                JinjaError::BlockMismatch {
                    message,
                    span,
                    file_path: Some(file_path.to_string()),
                    line: Some(line),
                    column: Some(column),
                }
            }
            JinjaError::Render { message, .. } => JinjaError::Render {
                message,
                file_path: Some(file_path.to_string()),
            },
            JinjaError::UndefinedVariable { name, .. } => JinjaError::UndefinedVariable {
                name,
                file_path: Some(file_path.to_string()),
            },
            other => other,
        }
    }

    /// Stable diagnostic code for this error
    pub fn code(&self) -> DiagnosticCode {
        match self {
            JinjaError::Syntax { .. }
            | JinjaError::InvalidExpression(_)
            | JinjaError::InvalidRef(_)
            | JinjaError::InvalidSource(_) => DiagnosticCode::TemplateSyntaxError,
            JinjaError::BlockMismatch { .. } => DiagnosticCode::BlockMismatch,
            JinjaError::MacroNameNotString(_) | JinjaError::MacroNamespaceNotString(_) => {
                DiagnosticCode::InvalidDispatchArguments
            }
            JinjaError::Render { .. } => DiagnosticCode::RenderError,
            JinjaError::UndefinedVariable { .. } => DiagnosticCode::UndefinedVariable,
            JinjaError::EnvVarMissing(_) => DiagnosticCode::EnvVarMissing,
        }
    }

    /// Convert to a dagforge diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::new(self.code(), Severity::Error, self.to_string());
        match self {
            JinjaError::Syntax { file_path: Some(path), line, column, .. }
            | JinjaError::BlockMismatch { file_path: Some(path), line, column, .. } => {
                let location = Location {
                    file: path.clone(),
                    line: *line,
                    column: *column,
                };
                diag.with_location(location)
            }
            JinjaError::Render { file_path: Some(path), .. }
            | JinjaError::UndefinedVariable { file_path: Some(path), .. } => {
                diag.with_location(Location::new(path.clone()))
            }
            _ => diag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_and_column() {
        let src = "select 1\nfrom {{ x";
        let span = Span::new(14, 16);
        assert_eq!(span.line_col(src), (2, 6));
        assert_eq!(Span::new(0, 1).line_col(src), (1, 1));
    }

    #[test]
    fn syntax_error_diagnostic_has_location() {
        let err = JinjaError::syntax("boom", Span::new(9, 10)).with_source("models/a.sql", "select 1\n{{");
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, DiagnosticCode::TemplateSyntaxError);
        let location = diag.location.unwrap();
        assert_eq!(location.file, "models/a.sql");
        assert_eq!(location.line, Some(2));
        assert_eq!(location.column, Some(1));
    }
}
