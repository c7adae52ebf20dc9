//! Warehouse adapter interface
//!
//! The runner hands rendered SQL to an [`Adapter`] and never talks to a
//! warehouse directly. Real connections live outside this workspace;
//! [`MockAdapter`] is an in-memory implementation for tests and dry runs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dagforge_catalog::{Adapter, MockAdapter};
//!
//! let adapter = MockAdapter::new().with_latency(5);
//! let result = adapter.execute("create view analytics.orders as select 1", false).await?;
//! println!("{}", result.response.message);
//! ```

pub mod adapter;
pub mod mock;

pub use adapter::{Adapter, AdapterError, AdapterResponse, CatalogColumn, ExecutionResult, TableIdentifier};
pub use mock::MockAdapter;
