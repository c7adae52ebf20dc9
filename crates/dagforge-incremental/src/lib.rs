//! Incremental parsing using Salsa
//!
//! Two layers avoid re-parsing unchanged files:
//!
//! - **In process**: a salsa database memoizes [`queries::parse_source_file`]
//!   per file input, so repeated parses only redo edited files.
//! - **Across invocations**: `target/partial_parse.json` stores every parsed
//!   file with its checksum and the project's global hashes. Any global hash
//!   mismatch forces a full reparse.
//!
//! Files that read environment variables are always re-parsed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dagforge_incremental::IncrementalParser;
//!
//! let mut session = IncrementalParser::for_config(&config)?;
//! let output = session.parse()?;
//! session.save()?;
//! ```

pub mod db;
pub mod queries;
pub mod partial_parse;
pub mod session;

pub use db::{DagforgeDatabase, Db};
pub use partial_parse::{PartialParseError, SavedParse, PARTIAL_PARSE_FILE};
pub use session::IncrementalParser;
