//! dagforge engine - resolution, linking and compilation
//!
//! This crate turns a parsed manifest into a compiled one:
//! - Lookup indices and package search order
//! - Reference, source and macro resolution with access rules
//! - Materialization dispatch
//! - Linking (relation names, topological order)
//! - Rendering with ephemeral CTE injection
//! - Node selection, state comparison and deferral

pub mod error;
pub mod lookups;
pub mod macros;
pub mod resolver;
pub mod relation;
pub mod linker;
pub mod compiler;
pub mod selection;
pub mod state_comparison;
pub mod defer;

pub use error::{CompileError, MacroError, ReferenceError};
pub use lookups::{search_order, Ambiguity, DisabledIndex, Lookups, PackageIndex, SearchStep};
pub use macros::{Locality, MacroResolver, MaterializationMatch};
pub use resolver::{
    check_access, check_unambiguous_names, check_unpinned_version, resolve_manifest, resolve_ref, RefResolution,
    Referrer, ResolveContext,
};
pub use relation::{quote_char_for, Relation};
pub use linker::{ephemeral_ids, link, LinkedGraph};
pub use compiler::{
    compile_manifest, cte_name, inject_ctes, write_compiled, CompileOptions, CompiledNode, Compiler, CTE_PREFIX,
};
pub use selection::{select_nodes, SelectionError, SelectionSpec, Selector};
pub use state_comparison::{ModificationReason, ModifiedNode, StateComparison, StateComparisonResult};
pub use defer::merge_from_artifact;
