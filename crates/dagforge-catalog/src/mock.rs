//! In-memory adapter for tests
//!
//! Statements are matched against scripted patterns (substring match, first
//! match wins). Unmatched statements succeed with an `OK` response and no
//! rows. Every statement is recorded so tests can assert on order.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dagforge_catalog::{Adapter, MockAdapter, AdapterError};
//!
//! let adapter = MockAdapter::new()
//!     .with_latency(10)
//!     .with_error("broken_model", AdapterError::Execution("relation missing".into()));
//!
//! adapter.execute("create view x as select 1", false).await?;
//! assert_eq!(adapter.executed().await.len(), 1);
//! ```

use crate::adapter::{Adapter, AdapterError, AdapterResponse, CatalogColumn, ExecutionResult, TableIdentifier};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Mock warehouse adapter for testing
///
/// Cloning shares the scripted state and the statement log.
#[derive(Clone)]
pub struct MockAdapter {
    results: Arc<RwLock<Vec<(String, ExecutionResult)>>>,
    errors: Arc<RwLock<Vec<(String, AdapterError)>>>,
    delays: Arc<RwLock<Vec<(String, u64)>>>,
    tables: Arc<RwLock<HashMap<String, Vec<CatalogColumn>>>>,
    executed: Arc<RwLock<Vec<String>>>,
    cancelled: Arc<RwLock<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    fail_connection: bool,
    latency_ms: u64,
    timeout: Option<Duration>,
    adapter_type: String,
}

/// Decrements the in-flight count when a statement ends or is dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            results: Arc::new(RwLock::new(Vec::new())),
            errors: Arc::new(RwLock::new(Vec::new())),
            delays: Arc::new(RwLock::new(Vec::new())),
            tables: Arc::new(RwLock::new(HashMap::new())),
            executed: Arc::new(RwLock::new(Vec::new())),
            cancelled: Arc::new(RwLock::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            fail_connection: false,
            latency_ms: 0,
            timeout: None,
            adapter_type: "postgres".to_string(),
        }
    }

    /// Report a different adapter type (drives materialization dispatch)
    pub fn with_adapter_type(mut self, adapter_type: impl Into<String>) -> Self {
        self.adapter_type = adapter_type.into();
        self
    }

    /// Delay every statement
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail every statement with a connection error
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Fail statements containing `pattern`
    pub fn with_error(self, pattern: impl Into<String>, error: AdapterError) -> Self {
        if let Ok(mut errors) = self.errors.try_write() {
            errors.push((pattern.into(), error));
        }
        self
    }

    /// Answer statements containing `pattern` with `rows`
    pub fn with_rows(self, pattern: impl Into<String>, rows: Vec<serde_json::Map<String, serde_json::Value>>) -> Self {
        let result = ExecutionResult {
            response: AdapterResponse {
                message: format!("SELECT {}", rows.len()),
                code: Some("SELECT".to_string()),
                rows_affected: Some(rows.len() as u64),
                query_id: None,
            },
            rows,
        };
        if let Ok(mut results) = self.results.try_write() {
            results.push((pattern.into(), result));
        }
        self
    }

    /// Delay statements containing `pattern` by `delay_ms`
    pub fn with_delay(self, pattern: impl Into<String>, delay_ms: u64) -> Self {
        if let Ok(mut delays) = self.delays.try_write() {
            delays.push((pattern.into(), delay_ms));
        }
        self
    }

    pub async fn add_table(&self, relation: &TableIdentifier, columns: &[(&str, &str)]) {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(index, (name, data_type))| CatalogColumn {
                name: name.to_string(),
                data_type: data_type.to_string(),
                index,
            })
            .collect();
        self.tables.write().await.insert(relation.fqn(), columns);
    }

    /// Statements executed so far, in start order
    pub async fn executed(&self) -> Vec<String> {
        self.executed.read().await.clone()
    }

    /// Connections named by `cancel_open_connections` so far
    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.read().await.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn delay_for(&self, sql: &str) -> u64 {
        let scripted = self
            .delays
            .read()
            .await
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, ms)| *ms)
            .unwrap_or(0);
        self.latency_ms + scripted
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Adapter for MockAdapter {
    fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, sql: &str, fetch: bool) -> Result<ExecutionResult, AdapterError> {
        if self.fail_connection {
            return Err(AdapterError::Connection("Simulated connection failure".to_string()));
        }
        let _guard = InFlight::start(&self.in_flight);
        self.executed.write().await.push(sql.to_string());

        let delay = self.delay_for(sql).await;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some((_, error)) = self.errors.read().await.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Err(error.clone());
        }
        let scripted = self
            .results
            .read()
            .await
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, result)| result.clone());
        let mut result = scripted.unwrap_or_else(|| ExecutionResult {
            response: AdapterResponse::new("OK"),
            rows: Vec::new(),
        });
        if !fetch {
            result.rows.clear();
        }
        Ok(result)
    }

    async fn cancel_open_connections(&self) -> Vec<String> {
        let open = self.in_flight();
        let names: Vec<String> = (0..open).map(|i| format!("mock-connection-{}", i)).collect();
        if !names.is_empty() {
            tracing::debug!(connections = names.len(), "Cancelling mock connections");
        }
        self.cancelled.write().await.extend(names.iter().cloned());
        names
    }

    async fn get_columns(&self, relation: &TableIdentifier) -> Result<Vec<CatalogColumn>, AdapterError> {
        self.tables
            .read()
            .await
            .get(&relation.fqn())
            .cloned()
            .ok_or_else(|| AdapterError::RelationNotFound(relation.fqn()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unmatched_statements_succeed() {
        let adapter = MockAdapter::new();
        let result = adapter.execute("create view a as select 1", false).await.unwrap();
        assert_eq!(result.response.message, "OK");
        assert_eq!(adapter.executed().await, vec!["create view a as select 1".to_string()]);
        assert_eq!(adapter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_scripted_errors_win_over_rows() {
        let adapter = MockAdapter::new()
            .with_rows("orders", vec![serde_json::Map::new()])
            .with_error("orders", AdapterError::Execution("boom".into()));
        let err = adapter.execute("select * from orders", true).await.unwrap_err();
        assert!(matches!(err, AdapterError::Execution(message) if message == "boom"));
    }

    #[tokio::test]
    async fn test_rows_only_when_fetching() {
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), serde_json::json!(1));
        let adapter = MockAdapter::new().with_rows("failures", vec![row]);
        assert_eq!(adapter.execute("select failures", true).await.unwrap().rows.len(), 1);
        assert!(adapter.execute("select failures", false).await.unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let adapter = MockAdapter::new().with_connection_failure();
        assert!(matches!(
            adapter.test_connection().await,
            Err(AdapterError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let adapter = MockAdapter::new();
        let relation = TableIdentifier::new(None, "analytics", "orders");
        adapter.add_table(&relation, &[("id", "integer"), ("amount", "numeric")]).await;
        let columns = adapter.get_columns(&relation).await.unwrap();
        assert_eq!(columns[1].name, "amount");
        assert_eq!(columns[1].index, 1);

        let missing = TableIdentifier::new(None, "analytics", "missing");
        assert!(matches!(
            adapter.get_columns(&missing).await,
            Err(AdapterError::RelationNotFound(_))
        ));
    }
}
