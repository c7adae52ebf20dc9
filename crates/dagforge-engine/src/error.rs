//! Resolution, macro and compile errors

use dagforge_core::{Diagnostic, DiagnosticCode, Location};
use dagforge_jinja::JinjaError;
use dagforge_sql::ContractError;

/// Reference resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("{node} depends on a node named '{target}' which was not found")]
    NotFound {
        node: String,
        target: String,
        path: Option<String>,
    },

    #[error("{node} depends on a source named '{source_name}.{table_name}' which was not found")]
    SourceNotFound {
        node: String,
        source_name: String,
        table_name: String,
        path: Option<String>,
    },

    #[error("{node} depends on '{target}' which is disabled")]
    Disabled { node: String, target: String },

    #[error("{node} references '{target}', which matches more than one node: {}", candidates.join(", "))]
    Ambiguous {
        node: String,
        target: String,
        candidates: Vec<String>,
    },

    #[error("Node {node} attempted to reference node {target}, which is not allowed because the referenced node is {access}")]
    AccessDenied {
        node: String,
        target: String,
        access: String,
    },

    #[error("Found resources with the same name '{name}' in multiple packages: {}", ids.join(", "))]
    DuplicateName { name: String, ids: Vec<String> },
}

impl ReferenceError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            ReferenceError::NotFound { .. } => DiagnosticCode::RefNotFound,
            ReferenceError::SourceNotFound { .. } => DiagnosticCode::SourceNotFound,
            ReferenceError::Disabled { .. } => DiagnosticCode::RefDisabled,
            ReferenceError::Ambiguous { .. } => DiagnosticCode::RefAmbiguous,
            ReferenceError::AccessDenied { .. } => DiagnosticCode::AccessDenied,
            ReferenceError::DuplicateName { .. } => DiagnosticCode::DuplicateResourceName,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::error(self.code(), self.to_string());
        match self {
            ReferenceError::NotFound { node, path, .. } | ReferenceError::SourceNotFound { node, path, .. } => {
                let diagnostic = diagnostic.with_nodes([node.clone()]);
                match path {
                    Some(path) => diagnostic.with_location(Location::new(path.clone())),
                    None => diagnostic,
                }
            }
            ReferenceError::Ambiguous { node, candidates, .. } => {
                diagnostic.with_nodes(std::iter::once(node.clone()).chain(candidates.iter().cloned()))
            }
            ReferenceError::AccessDenied { node, target, .. } | ReferenceError::Disabled { node, target } => {
                diagnostic.with_nodes([node.clone(), target.clone()])
            }
            ReferenceError::DuplicateName { ids, .. } => diagnostic.with_nodes(ids.clone()),
        }
    }
}

/// Macro lookup and dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacroError {
    #[error("{node} calls macro '{name}' which was not found")]
    NotFound { node: String, name: String },

    #[error("No materialization '{materialization}' was found for adapter {adapter}")]
    MaterializationNotFound { materialization: String, adapter: String },

    #[error("Found two materializations with the name {name} (packages {}). The ambiguity cannot be resolved", packages.join(", "))]
    DuplicateMaterialization { name: String, packages: Vec<String> },
}

impl MacroError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            MacroError::NotFound { .. } | MacroError::MaterializationNotFound { .. } => DiagnosticCode::MacroNotFound,
            MacroError::DuplicateMaterialization { .. } => DiagnosticCode::DuplicateMaterialization,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::error(self.code(), self.to_string());
        match self {
            MacroError::NotFound { node, .. } => diagnostic.with_nodes([node.clone()]),
            _ => diagnostic,
        }
    }
}

/// Compilation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("Compilation error in {node}: {source}")]
    Render {
        node: String,
        #[source]
        source: JinjaError,
    },

    #[error("Ephemeral models reference each other in a cycle: {}", chain.join(" -> "))]
    EphemeralRecursion { chain: Vec<String> },

    #[error("Node {0} is not in the manifest")]
    UnknownNode(String),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("Failed to write compiled SQL to {path}: {message}")]
    Io { path: String, message: String },
}

impl CompileError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            CompileError::Render { node, source } => {
                let mut diagnostic = source.to_diagnostic().with_nodes([node.clone()]);
                diagnostic.message = self.to_string();
                diagnostic
            }
            CompileError::EphemeralRecursion { chain } => {
                Diagnostic::error(DiagnosticCode::EphemeralRecursion, self.to_string()).with_nodes(chain.clone())
            }
            CompileError::UnknownNode(id) => {
                Diagnostic::error(DiagnosticCode::InternalError, self.to_string()).with_nodes([id.clone()])
            }
            CompileError::Contract(err) => err.to_diagnostic(),
            CompileError::Io { .. } => Diagnostic::error(DiagnosticCode::InternalError, self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_lists_every_candidate() {
        let err = ReferenceError::Ambiguous {
            node: "model.root.a".to_string(),
            target: "shared".to_string(),
            candidates: vec!["model.pkg_a.shared".to_string(), "model.pkg_b.shared".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("model.pkg_a.shared"));
        assert!(message.contains("model.pkg_b.shared"));
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, DiagnosticCode::RefAmbiguous);
        assert_eq!(diag.nodes.len(), 3);
    }

    #[test]
    fn access_denied_names_both_nodes() {
        let err = ReferenceError::AccessDenied {
            node: "model.p.b".to_string(),
            target: "model.p.a".to_string(),
            access: "private".to_string(),
        };
        assert_eq!(err.to_diagnostic().nodes, vec!["model.p.b", "model.p.a"]);
        assert!(err.to_string().contains("private"));
    }
}
