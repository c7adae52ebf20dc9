//! Salsa database for in-process re-parsing
//!
//! Holds one input per discovered file plus the parse context; parsed files
//! are memoized per input and reused until the input changes.

/// Database trait for incremental parsing
///
/// Tracked functions take `&dyn salsa::Database`, so any database works.
pub trait Db: salsa::Database {}

/// Main Salsa database implementation
#[salsa::db]
#[derive(Default, Clone)]
pub struct DagforgeDatabase {
    storage: salsa::Storage<Self>,
}

#[salsa::db]
impl salsa::Database for DagforgeDatabase {}

impl Db for DagforgeDatabase {}
