//! dagforge core
//!
//! Core domain types shared by every dagforge crate: diagnostics and their
//! stable codes, the error-kind taxonomy, reports, tool configuration,
//! content hashing and secret scrubbing.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod error;
pub mod report;
pub mod config;
pub mod hashing;
pub mod secrets;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use error::{ErrorKind, ExitCode};
pub use report::{Report, ReportVersion, ReportSummary};
pub use config::{Config, ConfigError, TargetConfig, FlagsConfig, QuotingPolicy};
pub use hashing::{FileHash, sha256_hex};
pub use secrets::SecretScrubber;
