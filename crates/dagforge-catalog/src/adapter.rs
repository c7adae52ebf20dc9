//! Adapter trait for running rendered SQL and reading catalogs

use dagforge_core::{Diagnostic, DiagnosticCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies a relation in the warehouse
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableIdentifier {
    /// Database name; some adapters have none
    pub database: Option<String>,

    pub schema: String,

    pub table: String,
}

impl TableIdentifier {
    pub fn new(database: Option<&str>, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.map(str::to_string),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `database.schema.table`, or `schema.table` without a database
    pub fn fqn(&self) -> String {
        match &self.database {
            Some(database) => format!("{}.{}.{}", database, self.schema, self.table),
            None => format!("{}.{}", self.schema, self.table),
        }
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// What the warehouse said about a statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    /// Status line, e.g. `CREATE VIEW` or `SELECT 3`
    #[serde(rename = "_message")]
    pub message: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub rows_affected: Option<u64>,

    #[serde(default)]
    pub query_id: Option<String>,
}

impl AdapterResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// A response plus any fetched rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub response: AdapterResponse,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// A column as the warehouse reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    pub index: usize,
}

/// Errors raised by adapters
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("Could not connect: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Execution(String),

    #[error("Relation {0} not found")]
    RelationNotFound(String),

    #[error("Query was cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            AdapterError::Connection(_) => DiagnosticCode::ConnectionFailed,
            AdapterError::Execution(_) | AdapterError::RelationNotFound(_) | AdapterError::Cancelled => {
                DiagnosticCode::ExecutionFailed
            }
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.code(), self.to_string())
    }
}

/// A warehouse connection as the runner sees it
///
/// Implementations must be safe to share between worker tasks. A statement
/// whose future is dropped is abandoned; [`cancel_open_connections`] is then
/// used to stop it server-side.
///
/// [`cancel_open_connections`]: Adapter::cancel_open_connections
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter type, e.g. `postgres`; selects materialization macros
    fn adapter_type(&self) -> &str;

    /// Per-statement timeout, if the profile sets one
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run one statement; `fetch` asks for the result rows
    async fn execute(&self, sql: &str, fetch: bool) -> Result<ExecutionResult, AdapterError>;

    /// Cancel statements still running; returns the connections it touched
    async fn cancel_open_connections(&self) -> Vec<String>;

    /// Columns of an existing relation
    async fn get_columns(&self, relation: &TableIdentifier) -> Result<Vec<CatalogColumn>, AdapterError>;

    async fn test_connection(&self) -> Result<(), AdapterError> {
        self.execute("select 1", false).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_identifier() {
        let table = TableIdentifier::new(Some("warehouse"), "analytics", "orders");
        assert_eq!(table.fqn(), "warehouse.analytics.orders");
        assert_eq!(table.to_string(), "warehouse.analytics.orders");
        assert_eq!(TableIdentifier::new(None, "analytics", "orders").fqn(), "analytics.orders");
    }

    #[test]
    fn test_response_serializes_message_key() {
        let json = serde_json::to_value(AdapterResponse::new("CREATE VIEW")).unwrap();
        assert_eq!(json["_message"], "CREATE VIEW");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AdapterError::Connection("refused".into()).code(),
            DiagnosticCode::ConnectionFailed
        );
        assert_eq!(AdapterError::Cancelled.to_diagnostic().code, DiagnosticCode::ExecutionFailed);
    }
}
