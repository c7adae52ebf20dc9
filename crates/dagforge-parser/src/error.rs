//! Parser errors

use dagforge_core::{Diagnostic, DiagnosticCode, Location, Severity};
use dagforge_jinja::JinjaError;
use dagforge_manifest::ManifestError;
use thiserror::Error;

/// Errors raised while reading and parsing project files
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid YAML in {path}: {message}")]
    Yaml {
        path: String,
        message: String,
        line: Option<usize>,
        column: Option<usize>,
    },

    #[error("duplicate YAML key in {path}: {message}")]
    DuplicateYamlKey {
        path: String,
        message: String,
        line: Option<usize>,
    },

    #[error("Invalid entry '{entry}' under '{section}' in {path}: {message}")]
    Validation {
        path: String,
        section: String,
        entry: String,
        message: String,
    },

    #[error("{source}")]
    Template {
        path: String,
        #[source]
        source: JinjaError,
    },

    #[error("Test '{test}' in {path} sets '{key}' both at the top level and under config")]
    TestConfigConflict { path: String, test: String, key: String },

    #[error("Invalid Python model {path}: {message}")]
    PythonModel { path: String, message: String },

    #[error("Invalid config in {path}: {message}")]
    Config { path: String, message: String },

    #[error("Versioned model '{model}' in {path}: {message}")]
    VersionedModel { path: String, model: String, message: String },

    #[error("{node} has access 'private' but is not in a group")]
    AccessWithoutGroup { node: String, path: String },

    #[error("Package '{name}' is declared but not installed at {path}; run a package install first")]
    PackageNotInstalled { name: String, path: String },

    #[error("{0}")]
    Manifest(#[from] ManifestError),
}

impl ParseError {
    pub(crate) fn io(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ParseError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Map a serde_yaml error; duplicate keys get their own code
    pub(crate) fn from_yaml(path: impl Into<String>, err: &serde_yaml::Error) -> Self {
        let path = path.into();
        let message = err.to_string();
        let location = err.location();
        if message.contains("duplicate entry") || message.contains("duplicate key") {
            ParseError::DuplicateYamlKey {
                path,
                message,
                line: location.map(|l| l.line()),
            }
        } else {
            ParseError::Yaml {
                path,
                message,
                line: location.as_ref().map(|l| l.line()),
                column: location.map(|l| l.column()),
            }
        }
    }

    pub(crate) fn template(path: impl Into<String>, source: JinjaError) -> Self {
        ParseError::Template {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> DiagnosticCode {
        match self {
            ParseError::Io { .. } => DiagnosticCode::InternalError,
            ParseError::Yaml { .. } => DiagnosticCode::YamlSyntaxError,
            ParseError::DuplicateYamlKey { .. } => DiagnosticCode::DuplicateYamlKey,
            ParseError::Validation { .. } => DiagnosticCode::YamlValidation,
            ParseError::Template { source, .. } => source.code(),
            ParseError::TestConfigConflict { .. } => DiagnosticCode::TestConfigConflict,
            ParseError::PythonModel { .. } => DiagnosticCode::PythonModelInvalid,
            ParseError::Config { .. } => DiagnosticCode::ConfigInvalid,
            ParseError::VersionedModel { .. } => DiagnosticCode::VersionedModelInvalid,
            ParseError::AccessWithoutGroup { .. } => DiagnosticCode::AccessWithoutGroup,
            ParseError::PackageNotInstalled { .. } => DiagnosticCode::PackageNotInstalled,
            ParseError::Manifest(err) => err.code(),
        }
    }

    /// Convert to a diagnostic, keeping the file path and position
    pub fn to_diagnostic(&self) -> Diagnostic {
        if let ParseError::Template { path, source } = self {
            let diag = source.to_diagnostic();
            return match diag.location {
                Some(_) => diag,
                None => diag.with_location(Location::new(path.clone())),
            };
        }
        if let ParseError::Manifest(err) = self {
            return err.to_diagnostic();
        }

        let diag = Diagnostic::new(self.code(), Severity::Error, self.to_string());
        let location = match self {
            ParseError::Yaml {
                path,
                line: Some(line),
                column: Some(column),
                ..
            } => Location::with_position(path.clone(), *line, *column),
            ParseError::DuplicateYamlKey { path, line: Some(line), .. } => Location::with_line(path.clone(), *line),
            ParseError::Io { path, .. }
            | ParseError::Yaml { path, .. }
            | ParseError::DuplicateYamlKey { path, .. }
            | ParseError::Validation { path, .. }
            | ParseError::TestConfigConflict { path, .. }
            | ParseError::PythonModel { path, .. }
            | ParseError::Config { path, .. }
            | ParseError::VersionedModel { path, .. }
            | ParseError::AccessWithoutGroup { path, .. }
            | ParseError::PackageNotInstalled { path, .. } => Location::new(path.clone()),
            ParseError::Template { .. } | ParseError::Manifest(_) => return diag,
        };
        let diag = diag.with_location(location);
        match self {
            ParseError::AccessWithoutGroup { node, .. } => diag.with_nodes([node.clone()]),
            _ => diag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keys_have_their_own_code() {
        let err = serde_yaml::from_str::<serde_yaml::Value>("a: 1\na: 2\n").unwrap_err();
        let parsed = ParseError::from_yaml("models/schema.yml", &err);
        assert_eq!(parsed.code(), DiagnosticCode::DuplicateYamlKey);
        assert!(parsed.to_string().starts_with("duplicate YAML key"));

        let err = serde_yaml::from_str::<serde_yaml::Value>("a: [1\n").unwrap_err();
        assert_eq!(
            ParseError::from_yaml("models/schema.yml", &err).code(),
            DiagnosticCode::YamlSyntaxError
        );
    }

    #[test]
    fn diagnostics_carry_paths() {
        let err = ParseError::Validation {
            path: "models/schema.yml".to_string(),
            section: "models".to_string(),
            entry: "orders".to_string(),
            message: "unknown field `colums`".to_string(),
        };
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, DiagnosticCode::YamlValidation);
        assert_eq!(diag.location.unwrap().file, "models/schema.yml");
    }
}
