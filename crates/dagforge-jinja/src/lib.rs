//! Template handling for dagforge projects
//!
//! This crate handles:
//! - Lexing and parsing templates into an AST without rendering them
//! - Static inspection of refs, sources, configs and macro calls
//! - Rendering templates to plain SQL with minijinja
//! - Error handling with detailed diagnostics

pub mod ast;
pub mod context;
pub mod error;
pub mod functions;
pub mod header;
pub mod inspector;
pub mod lexer;
pub mod parser;
pub mod renderer;
pub mod static_parse;

pub use ast::{Expr, Param, ResourceBlockKind, Stmt, Template};
pub use context::{RenderContext, RenderContextBuilder, TargetContext};
pub use error::{JinjaError, Span};
pub use functions::EnvVarRecorder;
pub use header::{extract_sql_header, SqlHeader};
pub use inspector::{
    default_scope, inspect, inspect_template, ConfigValue, DispatchCall, RefCall, SourceCall,
    TemplateFacts, BUILTIN_NAMES,
};
pub use parser::{parse, parse_expression};
pub use renderer::Renderer;
pub use static_parse::{statically_parse_ref, statically_parse_source};
