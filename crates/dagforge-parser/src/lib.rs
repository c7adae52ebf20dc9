//! dagforge parser - project files to a manifest
//!
//! Reads `dbt_project.yml` and installed packages, discovers and parses
//! every model, seed, snapshot, test, analysis, macro, doc and property
//! file, layers configuration, and assembles a resolved manifest.

pub mod error;
pub mod project;
pub mod ingest;
pub mod blocks;
pub mod yaml;
pub mod config_layering;
pub mod python;
pub mod generic_tests;
pub mod node_parser;
pub mod core_macros;
pub mod raw;
pub mod loader;

pub use error::ParseError;
pub use project::{PackageSpec, PackagesFile, Project, ProjectFile, ProjectTree, PROJECT_FILE};
pub use ingest::{classify, discover, read_source_file, SourceFile};
pub use blocks::{extract_blocks, Block, BlockKind};
pub use yaml::{parse_properties, ConfigMap, NodePatchEntry, PropertiesFile};
pub use config_layering::{build_node_config, merge_into, LayeredConfig};
pub use python::{inspect_python, PythonFacts};
pub use generic_tests::{build_generic_test, GenericTest, TestEntry, TestTarget};
pub use node_parser::{generate_names, UnpatchedNode};
pub use core_macros::{core_macro_files, CORE_PACKAGE};
pub use raw::{parse_file, ParseContext, ParsedFile};
pub use loader::{ParseOutput, ParseStats, ProjectParser};
