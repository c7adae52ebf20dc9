//! Per-file parsing
//!
//! Each file is parsed on its own into a [`ParsedFile`]: nodes before config
//! layering, macros, docs and decoded properties. Nothing here looks at other
//! files, so results can be cached by checksum and reused.

use crate::blocks::{extract_blocks, BlockKind};
use crate::error::ParseError;
use crate::ingest::SourceFile;
use crate::node_parser::{parse_python_node, parse_seed, parse_sql_node, UnpatchedNode};
use crate::yaml::{parse_properties, PropertiesFile};
use dagforge_core::{Diagnostic, FlagsConfig, TargetConfig};
use dagforge_jinja::{default_scope, inspect, RenderContext, Renderer};
use dagforge_manifest::{Doc, FileRecord, Macro, ParseFileType, ResourceType};
use dagforge_sql::{compare, SamplingResult, StaticExtractor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Inputs shared by every file of a parse
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub root_project: String,
    pub target: TargetConfig,
    pub flags: FlagsConfig,
    /// Variables visible to each package
    pub package_vars: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ParseContext {
    pub fn new(root_project: impl Into<String>, target: TargetConfig, flags: FlagsConfig) -> Self {
        Self {
            root_project: root_project.into(),
            target,
            flags,
            package_vars: BTreeMap::new(),
        }
    }

    pub fn with_package_vars(mut self, package: impl Into<String>, vars: BTreeMap<String, Value>) -> Self {
        self.package_vars.insert(package.into(), vars);
        self
    }

    /// Parse-time renderer for files of `package`
    pub fn renderer_for(&self, package: &str) -> Renderer {
        let context = RenderContext::for_target(&self.target);
        match self.package_vars.get(package) {
            Some(vars) => Renderer::new(context.with_vars(vars)),
            None => Renderer::new(context),
        }
    }
}

/// Everything one file contributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub record: FileRecord,
    /// Directories between the search root and the file
    #[serde(default)]
    pub subdirectories: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<UnpatchedNode>,
    #[serde(default)]
    pub macros: Vec<Macro>,
    #[serde(default)]
    pub docs: Vec<Doc>,
    #[serde(default)]
    pub properties: Option<PropertiesFile>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub sampling: Vec<SamplingResult>,
}

impl ParsedFile {
    fn new(file: &SourceFile) -> Self {
        Self {
            record: FileRecord::new(&file.package_name, &file.path, file.parse_file_type, file.checksum.clone()),
            subdirectories: file.subdirectories(),
            nodes: Vec::new(),
            macros: Vec::new(),
            docs: Vec::new(),
            properties: None,
            diagnostics: Vec::new(),
            sampling: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Whether the file read environment variables while parsing
    pub fn reads_env_vars(&self) -> bool {
        !self.record.env_vars.is_empty()
    }
}

/// Parse one file; failures become diagnostics on the result
pub fn parse_file(ctx: &ParseContext, file: &SourceFile) -> ParsedFile {
    let mut parsed = ParsedFile::new(file);
    let renderer = ctx.renderer_for(&file.package_name);

    if let Err(err) = parse_into(ctx, &renderer, file, &mut parsed) {
        tracing::debug!(path = %file.path, error = %err, "File failed to parse");
        parsed.diagnostics.push(err.to_diagnostic());
    }

    for node in &parsed.nodes {
        parsed.record.add_contributed(&node.node.unique_id);
    }
    for mac in &parsed.macros {
        parsed.record.add_contributed(&mac.unique_id);
    }
    for doc in &parsed.docs {
        parsed.record.add_contributed(&doc.unique_id);
    }
    parsed.record.env_vars = renderer.env_vars_used().into_keys().collect();
    parsed
}

fn parse_into(
    ctx: &ParseContext,
    renderer: &Renderer,
    file: &SourceFile,
    parsed: &mut ParsedFile,
) -> Result<(), ParseError> {
    match file.parse_file_type {
        ParseFileType::Model if file.extension() == "py" => {
            parsed.nodes.push(parse_python_node(file, file.stem())?);
        }
        ParseFileType::Model => {
            let (node, facts) = parse_sql_node(renderer, file, ResourceType::Model, file.stem(), &file.contents)?;
            if ctx.flags.sample_static_parser {
                let result = compare(&StaticExtractor::extract(&file.contents), &facts);
                if result.is_mismatch() {
                    tracing::debug!(path = %file.path, result = result.code(), "Static extractor disagrees");
                }
                parsed.sampling.push(result);
            }
            parsed.nodes.push(node);
        }
        ParseFileType::Analysis => {
            let (node, _) = parse_sql_node(renderer, file, ResourceType::Analysis, file.stem(), &file.contents)?;
            parsed.nodes.push(node);
        }
        ParseFileType::SingularTest => {
            let (node, _) = parse_sql_node(renderer, file, ResourceType::Test, file.stem(), &file.contents)?;
            parsed.nodes.push(node);
        }
        ParseFileType::Seed => parsed.nodes.push(parse_seed(file)),
        ParseFileType::Snapshot => {
            let blocks = extract_blocks(&file.contents, &[BlockKind::Snapshot])
                .map_err(|e| ParseError::template(&file.path, e.with_source(&file.path, &file.contents)))?;
            for block in blocks {
                let (node, _) = parse_sql_node(renderer, file, ResourceType::Snapshot, &block.name, &block.body)?;
                parsed.nodes.push(node);
            }
        }
        ParseFileType::Macro | ParseFileType::GenericTest => {
            let allowed: &[BlockKind] = match file.parse_file_type {
                ParseFileType::GenericTest => &[BlockKind::Macro, BlockKind::Test],
                _ => &[BlockKind::Macro, BlockKind::Test, BlockKind::Materialization],
            };
            let blocks = extract_blocks(&file.contents, allowed)
                .map_err(|e| ParseError::template(&file.path, e.with_source(&file.path, &file.contents)))?;
            for block in blocks.into_iter().filter(|b| b.kind.is_macro_like()) {
                parsed.macros.push(build_macro(file, block.name, block.full, block.supported_languages)?);
            }
        }
        ParseFileType::Documentation => {
            let blocks = extract_blocks(&file.contents, &[BlockKind::Docs])
                .map_err(|e| ParseError::template(&file.path, e.with_source(&file.path, &file.contents)))?;
            for block in blocks {
                parsed.docs.push(Doc {
                    unique_id: format!("doc.{}.{}", file.package_name, block.name),
                    name: block.name,
                    package_name: file.package_name.clone(),
                    original_file_path: file.path.clone(),
                    block_contents: block.body.trim().to_string(),
                });
            }
        }
        ParseFileType::Schema => {
            let (properties, errors) = parse_properties(&file.path, &file.contents, renderer)?;
            parsed.diagnostics.extend(errors.iter().map(ParseError::to_diagnostic));
            parsed.properties = Some(properties);
        }
        ParseFileType::Fixture => {}
    }
    Ok(())
}

fn build_macro(
    file: &SourceFile,
    name: String,
    source: String,
    supported_languages: Option<Vec<String>>,
) -> Result<Macro, ParseError> {
    let facts = inspect(&source, &default_scope()).map_err(|e| ParseError::template(&file.path, e))?;
    let mut mac = Macro::new(&file.package_name, &name, &file.path, source);
    mac.macro_calls = facts.macro_calls.into_iter().filter(|call| *call != name).collect();
    mac.supported_languages = supported_languages;
    Ok(mac)
}

/// Diagnostic for a file that could not be read at all
pub fn unreadable(path: &str, err: impl std::fmt::Display) -> Diagnostic {
    ParseError::io(path, err).to_diagnostic()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::DiagnosticCode;
    use pretty_assertions::assert_eq;

    fn ctx() -> ParseContext {
        ParseContext::new("shop", TargetConfig::default(), FlagsConfig::default())
    }

    #[test]
    fn model_file_contributes_a_node() {
        let file = SourceFile::new(
            "shop",
            "models/orders.sql",
            "models",
            ParseFileType::Model,
            "select * from {{ ref('stg_orders') }}",
        );
        let parsed = parse_file(&ctx(), &file);
        assert!(!parsed.has_errors());
        assert_eq!(parsed.record.contributed, vec!["model.shop.orders"]);
        assert!(parsed.sampling.is_empty());
    }

    #[test]
    fn sampling_runs_when_enabled() {
        let mut ctx = ctx();
        ctx.flags.sample_static_parser = true;
        let file = SourceFile::new(
            "shop",
            "models/orders.sql",
            "models",
            ParseFileType::Model,
            "select * from {{ ref('stg_orders') }}",
        );
        let parsed = parse_file(&ctx, &file);
        assert_eq!(parsed.sampling, vec![SamplingResult::ExactMatch]);
    }

    #[test]
    fn macro_files_collect_calls_and_rewritten_tests() {
        let file = SourceFile::new(
            "shop",
            "macros/money.sql",
            "macros",
            ParseFileType::Macro,
            "{% macro cents(col) %}{{ round_it(col) }} / 100{% endmacro %}\n\
             {% test positive(model, column_name) %}select 1{% endtest %}",
        );
        let parsed = parse_file(&ctx(), &file);
        assert_eq!(parsed.macros.len(), 2);
        assert_eq!(parsed.macros[0].macro_calls, vec!["round_it"]);
        assert_eq!(parsed.macros[1].unique_id, "macro.shop.test_positive");
    }

    #[test]
    fn snapshots_and_docs_come_from_blocks() {
        let snapshot = SourceFile::new(
            "shop",
            "snapshots/orders.sql",
            "snapshots",
            ParseFileType::Snapshot,
            "{% snapshot orders_snapshot %}{{ config(unique_key='id') }} select * from {{ source('raw', 'orders') }}{% endsnapshot %}",
        );
        let parsed = parse_file(&ctx(), &snapshot);
        assert_eq!(parsed.nodes[0].node.unique_id, "snapshot.shop.orders_snapshot");
        assert_eq!(parsed.nodes[0].inline_config["unique_key"], serde_json::json!("id"));

        let docs = SourceFile::new(
            "shop",
            "models/docs.md",
            "models",
            ParseFileType::Documentation,
            "{% docs orders %}\nOne row per order.\n{% enddocs %}",
        );
        let parsed = parse_file(&ctx(), &docs);
        assert_eq!(parsed.docs[0].unique_id, "doc.shop.orders");
        assert_eq!(parsed.docs[0].block_contents, "One row per order.");
    }

    #[test]
    fn failures_become_diagnostics() {
        let file = SourceFile::new("shop", "models/broken.sql", "models", ParseFileType::Model, "{{ ref('a' }}");
        let parsed = parse_file(&ctx(), &file);
        assert!(parsed.has_errors());
        assert!(parsed.nodes.is_empty());

        let yaml = SourceFile::new(
            "shop",
            "models/schema.yml",
            "models",
            ParseFileType::Schema,
            "models:\n  - name: a\n  - name: a\n    description: x\n    description: y\n",
        );
        let parsed = parse_file(&ctx(), &yaml);
        assert_eq!(parsed.diagnostics[0].code, DiagnosticCode::DuplicateYamlKey);
    }

    #[test]
    fn env_var_reads_are_recorded() {
        std::env::set_var("DAGFORGE_RAW_TEST_SCHEMA", "finance");
        let file = SourceFile::new(
            "shop",
            "models/schema.yml",
            "models",
            ParseFileType::Schema,
            "models:\n  - name: a\n    config:\n      schema: \"{{ env_var('DAGFORGE_RAW_TEST_SCHEMA') }}\"\n",
        );
        let parsed = parse_file(&ctx(), &file);
        assert!(parsed.reads_env_vars());
        let props = parsed.properties.unwrap();
        assert_eq!(props.models[0].config["schema"], serde_json::json!("finance"));
    }
}
