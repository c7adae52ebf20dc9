//! dagforge runner - executes a compiled project graph
//!
//! Nodes are rendered into statements (compiled SQL wrapped in the
//! materialization chosen for the adapter) and executed on a bounded pool
//! of tokio tasks in dependency order. Results are collected per node and
//! written to `run_results.json`.

pub mod error;
pub mod queue;
pub mod results;
pub mod runner;

pub use error::RunnerError;
pub use queue::GraphQueue;
pub use results::{
    NodeResult, NodeStatus, RunResults, RunResultsMetadata, TimingInfo, RUN_RESULTS_FILE, RUN_RESULTS_SCHEMA,
};
pub use runner::{Canceller, RunOptions, RunOutcome, Runner};
