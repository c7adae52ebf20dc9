//! Contract preflight
//!
//! Compares the column names projected by a compiled query with the columns
//! a model declares under an enforced contract.

use crate::parser::SqlParser;
use dagforge_core::{Diagnostic, DiagnosticCode};
use dagforge_manifest::DeclaredContract;
use sqlparser::ast::{Expr, Query, SelectItem, SetExpr};

/// Result of a successful preflight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractOutcome {
    /// Projected columns match the declaration
    Verified,
    /// The projection cannot be determined statically (e.g. `select *`)
    Skipped(String),
}

/// Contract check failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error(
        "Contract for '{unique_id}' does not match the compiled query: missing columns [{}], unexpected columns [{}]",
        missing.join(", "),
        extra.join(", ")
    )]
    Mismatch {
        unique_id: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("Could not parse compiled SQL of '{unique_id}': {message}")]
    Unparseable { unique_id: String, message: String },
}

impl ContractError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ContractError::Mismatch { unique_id, .. } => {
                Diagnostic::error(DiagnosticCode::ContractMismatch, self.to_string()).with_nodes([unique_id.clone()])
            }
            ContractError::Unparseable { unique_id, .. } => {
                Diagnostic::error(DiagnosticCode::SqlParseError, self.to_string()).with_nodes([unique_id.clone()])
            }
        }
    }
}

/// Output column names of a query, lowercased
///
/// Returns `None` when a wildcard or an unnamed expression makes the list
/// unknowable without a catalog.
pub fn projected_columns(query: &Query) -> Option<Vec<String>> {
    let mut body = query.body.as_ref();
    loop {
        match body {
            SetExpr::Select(select) => {
                return select.projection.iter().map(select_item_name).collect();
            }
            SetExpr::Query(inner) => body = inner.body.as_ref(),
            SetExpr::SetOperation { left, .. } => body = left.as_ref(),
            _ => return None,
        }
    }
}

fn select_item_name(item: &SelectItem) -> Option<String> {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.to_lowercase()),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => parts.last().map(|p| p.value.to_lowercase()),
        _ => None,
    }
}

/// Check compiled SQL against a declared contract
pub fn check_contract(
    parser: &SqlParser,
    contract: &DeclaredContract,
    compiled_sql: &str,
) -> Result<ContractOutcome, ContractError> {
    let parsed = parser
        .parse(compiled_sql, None)
        .map_err(|e| ContractError::Unparseable {
            unique_id: contract.unique_id.clone(),
            message: e.error.to_string(),
        })?;

    let Some(query) = parsed.as_query() else {
        return Ok(ContractOutcome::Skipped("compiled SQL is not a query".to_string()));
    };
    let Some(projected) = projected_columns(query) else {
        return Ok(ContractOutcome::Skipped("projection includes wildcards or unnamed expressions".to_string()));
    };

    let declared = contract.column_names();
    let missing: Vec<String> = declared.iter().filter(|c| !projected.contains(c)).cloned().collect();
    let extra: Vec<String> = projected.iter().filter(|c| !declared.contains(c)).cloned().collect();

    if missing.is_empty() && extra.is_empty() {
        Ok(ContractOutcome::Verified)
    } else {
        Err(ContractError::Mismatch {
            unique_id: contract.unique_id.clone(),
            missing,
            extra,
        })
    }
}
