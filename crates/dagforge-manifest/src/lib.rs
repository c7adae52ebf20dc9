//! Manifest model and DAG construction
//!
//! This crate handles:
//! - The node, source, macro and auxiliary resource types
//! - The manifest, its disabled multimap and per-file records
//! - Versioned manifest.json serialization
//! - Building dependency graphs (DAG) and the derived maps
//! - Extracting declared contracts

pub mod node;
pub mod resources;
pub mod files;
pub mod manifest;
pub mod dag;
pub mod contract;

pub use node::{
    unique_id, Access, ColumnInfo, ContractConfig, DeferRelation, DependsOn, DispatchRef, DocsConfig, Hook,
    InjectedCte, Language, Node, NodeConfig, RefArgs, ResourceType, TestMetadata,
};
pub use resources::{
    Doc, Exposure, FreshnessPeriod, FreshnessThreshold, Group, Macro, MacroArgument, MacroDependsOn, Metric,
    Owner, SavedQuery, SemanticModel, SourceConfig, SourceDefinition, UnitTestDefinition, UnitTestInput,
};
pub use files::{file_id, FileRecord, ManifestStateCheck, ParseFileType};
pub use manifest::{
    schema_url, DisabledEntry, Manifest, ManifestError, ManifestMetadata, COMPATIBILITY_WINDOW,
    MANIFEST_SCHEMA_VERSION,
};
pub use dag::{DependencyGraph, NodeId};
pub use contract::{ContractExtractor, DeclaredColumn, DeclaredContract};
