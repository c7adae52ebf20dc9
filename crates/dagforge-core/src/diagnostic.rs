//! Diagnostic codes and error reporting
//!
//! IMPORTANT: Diagnostic codes are versioned and stable.
//! NEVER rename or remove codes - they are part of the public API.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};
use crate::error::ErrorKind;

/// Diagnostic code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Parse errors (1xxx)
    /// Template source could not be parsed
    TemplateSyntaxError,

    /// Block delimiters such as `{% macro %}` / `{% endmacro %}` do not match
    BlockMismatch,

    /// YAML document is not well-formed
    YamlSyntaxError,

    /// The same key appears twice at one level of a YAML mapping
    DuplicateYamlKey,

    /// A data test repeats a key both at top level and inside `config:`
    TestConfigConflict,

    /// Python model does not follow the `def model(dbt, session)` contract
    PythonModelInvalid,

    /// `env_var()` was called for an unset variable without a default
    EnvVarMissing,

    // Validation errors (2xxx)
    /// A YAML record does not match its declared schema
    YamlValidation,

    /// A config value has the wrong type or an unknown strict key
    ConfigInvalid,

    /// A stored manifest uses a schema version outside the compatibility window
    IncompatibleManifest,

    /// A versioned model declaration is inconsistent
    VersionedModelInvalid,

    /// A private model has no group, or names a group that does not exist
    AccessWithoutGroup,

    // Reference errors (3xxx)
    /// `ref()` target does not exist
    RefNotFound,

    /// `source()` target does not exist
    SourceNotFound,

    /// An unqualified reference matches nodes in more than one package
    RefAmbiguous,

    /// A reference targets a disabled node
    RefDisabled,

    /// Access modifier forbids the reference
    AccessDenied,

    /// Two enabled resources share a unique id or an unqualified name
    DuplicateResourceName,

    /// An unpinned reference targets a model that has a newer version
    UnpinnedRefNewVersion,

    // Macro errors (4xxx)
    /// A called macro cannot be found
    MacroNotFound,

    /// The same macro name is defined twice in one package
    DuplicateMacro,

    /// Two materialization candidates tie on specificity and locality
    DuplicateMaterialization,

    /// `adapter.dispatch` was called with non-literal arguments
    InvalidDispatchArguments,

    /// An imported package overrides a built-in materialization
    PackageMaterializationOverride,

    // Compile errors (5xxx)
    /// Rendering a template failed
    RenderError,

    /// An undefined variable was used while rendering
    UndefinedVariable,

    /// Ephemeral models reference each other in a cycle
    EphemeralRecursion,

    /// The dependency graph contains a cycle
    GraphCycle,

    // Execution errors (6xxx)
    /// The adapter reported a failure while running a node
    ExecutionFailed,

    /// A task exceeded its timeout
    ExecutionTimeout,

    /// A test returned failing rows
    TestFailed,

    /// The adapter could not connect
    ConnectionFailed,

    // Dependency errors (7xxx)
    /// A declared package is not installed
    PackageNotInstalled,

    /// `require-dbt-version` or a package version is not satisfied
    VersionConflict,

    // Contract errors (8xxx)
    /// The compiled query's columns diverge from the declared contract
    ContractMismatch,

    /// Compiled SQL could not be parsed for a contract check
    SqlParseError,

    // General (9xxx)
    /// Unexpected internal failure
    InternalError,

    /// Static extractor disagreed with the template inspector
    SamplingMismatch,

    /// General informational message
    Info,

    /// General warning message
    Warning,
}

impl DiagnosticCode {
    /// Get the diagnostic code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TemplateSyntaxError => "TEMPLATE_SYNTAX_ERROR",
            Self::BlockMismatch => "BLOCK_MISMATCH",
            Self::YamlSyntaxError => "YAML_SYNTAX_ERROR",
            Self::DuplicateYamlKey => "DUPLICATE_YAML_KEY",
            Self::TestConfigConflict => "TEST_CONFIG_CONFLICT",
            Self::PythonModelInvalid => "PYTHON_MODEL_INVALID",
            Self::EnvVarMissing => "ENV_VAR_MISSING",
            Self::YamlValidation => "YAML_VALIDATION",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::IncompatibleManifest => "INCOMPATIBLE_MANIFEST",
            Self::VersionedModelInvalid => "VERSIONED_MODEL_INVALID",
            Self::AccessWithoutGroup => "ACCESS_WITHOUT_GROUP",
            Self::RefNotFound => "REF_NOT_FOUND",
            Self::SourceNotFound => "SOURCE_NOT_FOUND",
            Self::RefAmbiguous => "REF_AMBIGUOUS",
            Self::RefDisabled => "REF_DISABLED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::DuplicateResourceName => "DUPLICATE_RESOURCE_NAME",
            Self::UnpinnedRefNewVersion => "UNPINNED_REF_NEW_VERSION",
            Self::MacroNotFound => "MACRO_NOT_FOUND",
            Self::DuplicateMacro => "DUPLICATE_MACRO",
            Self::DuplicateMaterialization => "DUPLICATE_MATERIALIZATION",
            Self::InvalidDispatchArguments => "INVALID_DISPATCH_ARGUMENTS",
            Self::PackageMaterializationOverride => "PACKAGE_MATERIALIZATION_OVERRIDE",
            Self::RenderError => "RENDER_ERROR",
            Self::UndefinedVariable => "UNDEFINED_VARIABLE",
            Self::EphemeralRecursion => "EPHEMERAL_RECURSION",
            Self::GraphCycle => "GRAPH_CYCLE",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::TestFailed => "TEST_FAILED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::PackageNotInstalled => "PACKAGE_NOT_INSTALLED",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::ContractMismatch => "CONTRACT_MISMATCH",
            Self::SqlParseError => "SQL_PARSE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::SamplingMismatch => "SAMPLING_MISMATCH",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }

    /// The user-visible error kind this code belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TemplateSyntaxError
            | Self::BlockMismatch
            | Self::YamlSyntaxError
            | Self::DuplicateYamlKey
            | Self::TestConfigConflict
            | Self::PythonModelInvalid
            | Self::EnvVarMissing => ErrorKind::Parse,
            Self::YamlValidation
            | Self::ConfigInvalid
            | Self::IncompatibleManifest
            | Self::VersionedModelInvalid
            | Self::AccessWithoutGroup => ErrorKind::Validation,
            Self::RefNotFound
            | Self::SourceNotFound
            | Self::RefAmbiguous
            | Self::RefDisabled
            | Self::AccessDenied
            | Self::DuplicateResourceName
            | Self::UnpinnedRefNewVersion => ErrorKind::Reference,
            Self::MacroNotFound
            | Self::DuplicateMacro
            | Self::DuplicateMaterialization
            | Self::InvalidDispatchArguments
            | Self::PackageMaterializationOverride => ErrorKind::Macro,
            Self::RenderError
            | Self::UndefinedVariable
            | Self::EphemeralRecursion
            | Self::GraphCycle => ErrorKind::Compile,
            Self::ExecutionFailed | Self::ExecutionTimeout | Self::TestFailed => ErrorKind::Runtime,
            Self::ConnectionFailed => ErrorKind::Database,
            Self::PackageNotInstalled | Self::VersionConflict => ErrorKind::Dependency,
            Self::ContractMismatch | Self::SqlParseError => ErrorKind::Contract,
            Self::InternalError | Self::SamplingMismatch | Self::Info | Self::Warning => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,

    /// Warning - reported but does not fail the invocation
    Warn,

    /// Error - fails the invocation
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Source location in a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path relative to project root
    pub file: String,

    /// Optional line number (1-indexed)
    pub line: Option<usize>,

    /// Optional column number (1-indexed)
    pub column: Option<usize>,
}

impl Location {
    /// Create a new location with just a file path
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
        }
    }

    /// Create a location with file and line number
    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            column: None,
        }
    }

    /// Create a location with file, line, and column
    pub fn with_position(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{}:{}:{}", self.file, line, column),
            (Some(line), None) => write!(f, "{}:{}", self.file, line),
            _ => write!(f, "{}", self.file),
        }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: DiagnosticCode,

    /// Error kind derived from the code
    pub kind: ErrorKind,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Source location (best-effort)
    pub location: Option<Location>,

    /// Unique ids of the nodes involved (referrer first)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with minimal fields
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: code.kind(),
            severity,
            message: message.into(),
            location: None,
            nodes: Vec::new(),
        }
    }

    /// Shorthand for an error-severity diagnostic
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    /// Shorthand for a warning-severity diagnostic
    pub fn warn(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warn, message)
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach the ids of the nodes involved
    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this diagnostic fails the invocation
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({})", location)?;
        }
        Ok(())
    }
}
