//! SQL-side analysis
//!
//! This crate handles:
//! - Parsing compiled SQL using datafusion-sqlparser-rs
//! - A fast static extractor for `ref()`, `source()` and `config()` calls
//! - Sampling agreement between that extractor and the template inspector
//! - Contract preflight against declared columns

pub mod parser;
pub mod extractor;
pub mod sampling;
pub mod contract;

pub use parser::{SqlParser, ParsedSql, ParseError};
pub use extractor::{StaticExtractor, ExtractedFacts, Unsupported};
pub use sampling::{compare, SamplingResult, SamplingStats};
pub use contract::{check_contract, projected_columns, ContractError, ContractOutcome};
