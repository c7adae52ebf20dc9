//! Node compilation
//!
//! Each node is rendered in its own environment: `ref()`, `source()`,
//! `config`, `this`, `adapter` and every macro in the manifest. Ephemeral
//! dependencies come back as CTE names and are spliced in front of the
//! rendered query afterwards.

use crate::error::CompileError;
use crate::lookups::{search_order, Ambiguity, Lookups};
use crate::relation::{quote_char_for, Relation};
use crate::resolver::{check_unpinned_version, resolve_ref, RefResolution, ResolveContext};
use dagforge_core::{Config, Diagnostic, Report, TargetConfig};
use dagforge_jinja::{RenderContext, Renderer};
use dagforge_manifest::{ContractExtractor, InjectedCte, Language, Manifest, Node, NodeId, RefArgs};
use dagforge_sql::{check_contract, ContractOutcome, SqlParser};
use minijinja::value::{from_args, Kwargs, Object, Value};
use minijinja::{Error, ErrorKind, State};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

/// Prefix of injected CTE names
pub const CTE_PREFIX: &str = "__dbt__CTE__";

/// CTE name for an ephemeral model
pub fn cte_name(model_name: &str) -> String {
    format!("{}{}", CTE_PREFIX, model_name)
}

/// Options shared by every node compiled in one invocation
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: TargetConfig,
    pub vars: BTreeMap<String, serde_json::Value>,
    pub resolve: ResolveContext,
    /// Use deferred relations for unselected nodes
    pub defer: bool,
    pub selected: Option<BTreeSet<NodeId>>,
    pub contract_preflight: bool,
}

impl CompileOptions {
    pub fn new(target: TargetConfig, resolve: ResolveContext) -> Self {
        Self {
            target,
            vars: BTreeMap::new(),
            resolve,
            defer: false,
            selected: None,
            contract_preflight: true,
        }
    }

    pub fn from_config(config: &Config, resolve: ResolveContext) -> Self {
        let mut options = Self::new(config.target.clone(), resolve);
        options.vars = config.vars.clone();
        options
    }

    pub fn with_defer(mut self, selected: BTreeSet<NodeId>) -> Self {
        self.defer = true;
        self.selected = Some(selected);
        self
    }
}

/// Compiled output of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledNode {
    pub unique_id: String,
    pub compiled_code: String,
    pub extra_ctes: Vec<InjectedCte>,
    /// Rendered SQL before CTE injection
    pub rendered: String,
}

/// What `ref()` returns for a node
#[derive(Debug, Clone)]
enum RefTarget {
    Relation(Relation),
    Ephemeral(String),
}

/// Compiles nodes of a frozen manifest
pub struct Compiler {
    manifest: Arc<Manifest>,
    options: CompileOptions,
    lookups: Arc<Lookups>,
    targets: Arc<BTreeMap<String, RefTarget>>,
    preambles: BTreeMap<String, String>,
    compiled: BTreeMap<String, CompiledNode>,
    warnings: Vec<Diagnostic>,
}

impl Compiler {
    pub fn new(manifest: Arc<Manifest>, options: CompileOptions) -> Self {
        let lookups = Arc::new(Lookups::build(&manifest));
        let quote_char = quote_char_for(&options.target.adapter_type);
        let policy = options.target.quoting;

        let mut targets = BTreeMap::new();
        for node in manifest.nodes.values().filter(|n| n.is_refable()) {
            let target = if node.is_ephemeral() {
                RefTarget::Ephemeral(cte_name(&node.name))
            } else {
                let deferred = options.defer
                    && options
                        .selected
                        .as_ref()
                        .map_or(false, |selected| !selected.contains(&node.unique_id));
                RefTarget::Relation(Relation::for_node(node, deferred).with_quoting(quote_char, policy))
            };
            targets.insert(node.unique_id.clone(), target);
        }
        for source in manifest.sources.values() {
            targets.insert(
                source.unique_id.clone(),
                RefTarget::Relation(Relation::for_source(source).with_quoting(quote_char, policy)),
            );
        }

        Self {
            manifest,
            options,
            lookups,
            targets: Arc::new(targets),
            preambles: BTreeMap::new(),
            compiled: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Warnings raised while rendering, deduplicated
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    /// Compile one node, compiling its ephemeral dependencies first
    pub fn compile_node(&mut self, unique_id: &str) -> Result<CompiledNode, CompileError> {
        let mut stack = Vec::new();
        self.compile_inner(unique_id, &mut stack)
    }

    fn compile_inner(&mut self, unique_id: &str, stack: &mut Vec<String>) -> Result<CompiledNode, CompileError> {
        if let Some(done) = self.compiled.get(unique_id) {
            return Ok(done.clone());
        }
        if stack.iter().any(|id| id == unique_id) {
            let mut chain = stack.clone();
            chain.push(unique_id.to_string());
            return Err(CompileError::EphemeralRecursion { chain });
        }

        let manifest = Arc::clone(&self.manifest);
        let node = manifest
            .get_node(unique_id)
            .ok_or_else(|| CompileError::UnknownNode(unique_id.to_string()))?;

        stack.push(unique_id.to_string());
        let (rendered, ephemerals) = self.render_node(node)?;

        let mut extra_ctes: Vec<InjectedCte> = Vec::new();
        for dep_id in ephemerals {
            let dep = self.compile_inner(&dep_id, stack)?;
            let dep_name = manifest.get_node(&dep_id).map(|n| n.name.clone()).unwrap_or_default();
            for cte in dep.extra_ctes {
                push_cte(&mut extra_ctes, cte);
            }
            push_cte(
                &mut extra_ctes,
                InjectedCte {
                    id: dep_id.clone(),
                    sql: format!("{} as ({})", cte_name(&dep_name), dep.rendered.trim()),
                },
            );
        }
        stack.pop();

        let compiled_code = inject_ctes(&rendered, &extra_ctes);

        if self.options.contract_preflight {
            if let Some(contract) = ContractExtractor::extract_from_node(node) {
                let parser = SqlParser::for_adapter(&self.options.target.adapter_type);
                match check_contract(&parser, &contract, &compiled_code)? {
                    ContractOutcome::Verified => tracing::debug!(node = unique_id, "Contract verified"),
                    ContractOutcome::Skipped(reason) => {
                        tracing::debug!(node = unique_id, reason = %reason, "Contract preflight skipped")
                    }
                }
            }
        }

        let result = CompiledNode {
            unique_id: unique_id.to_string(),
            compiled_code,
            extra_ctes,
            rendered,
        };
        self.compiled.insert(unique_id.to_string(), result.clone());
        Ok(result)
    }

    /// Render the node's template; returns the SQL and ephemeral ids it referenced
    fn render_node(&mut self, node: &Node) -> Result<(String, Vec<String>), CompileError> {
        if node.language == Language::Python {
            return Ok((node.raw_code.clone(), Vec::new()));
        }
        if !Renderer::has_jinja(&node.raw_code) {
            return Ok((node.raw_code.clone(), Vec::new()));
        }

        let scope = self.environment_for(node);
        let template = format!("{}{}", self.preamble(&node.package_name), node.raw_code);
        let rendered = scope
            .renderer
            .render_with(&template, self.this_for(node), Some(&node.original_file_path))
            .map_err(|source| CompileError::Render {
                node: node.unique_id.clone(),
                source,
            });
        self.collect_warnings(&scope);
        let rendered = rendered?;

        let ephemerals = scope.ephemerals.lock().map(|e| e.clone()).unwrap_or_default();
        let mut unique = Vec::new();
        for id in ephemerals {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        Ok((rendered, unique))
    }

    /// Call a macro for a node with extra top-level values, e.g. a
    /// materialization with `sql`. `args` name values in `extra` that are
    /// passed positionally.
    pub fn render_macro(
        &mut self,
        node_id: &str,
        macro_id: &str,
        args: &[&str],
        extra: BTreeMap<String, Value>,
    ) -> Result<String, CompileError> {
        let manifest = Arc::clone(&self.manifest);
        let node = manifest
            .get_node(node_id)
            .ok_or_else(|| CompileError::UnknownNode(node_id.to_string()))?;
        let mac = manifest
            .macros
            .get(macro_id)
            .ok_or_else(|| CompileError::UnknownNode(macro_id.to_string()))?;

        let scope = self.environment_for(node);
        let template = format!(
            "{}{{{{ {}({}) }}}}",
            self.preamble(&node.package_name),
            mangled_name(&mac.package_name, &mac.name),
            args.join(", ")
        );
        let mut values = self.this_for(node);
        values.extend(extra);
        let rendered = scope
            .renderer
            .render_with(&template, values, Some(&mac.original_file_path))
            .map_err(|source| CompileError::Render {
                node: node.unique_id.clone(),
                source,
            });
        self.collect_warnings(&scope);
        rendered
    }

    fn this_for(&self, node: &Node) -> BTreeMap<String, Value> {
        let relation = match self.targets.get(&node.unique_id) {
            Some(RefTarget::Relation(rel)) => rel.clone(),
            _ => Relation::new(node.database.clone(), &node.schema, &node.alias).with_quoting(
                quote_char_for(&self.options.target.adapter_type),
                self.options.target.quoting,
            ),
        };
        let mut values = BTreeMap::new();
        values.insert("this".to_string(), Value::from_object(relation));
        values
    }

    fn collect_warnings(&mut self, scope: &NodeScope) {
        let warnings = scope.warnings.lock().map(|w| w.clone()).unwrap_or_default();
        for warning in warnings {
            if !self.warnings.iter().any(|w| w.message == warning.message) {
                self.warnings.push(warning);
            }
        }
    }

    /// Node-scoped environment
    fn environment_for(&self, node: &Node) -> NodeScope {
        let context = RenderContext::for_target(&self.options.target).with_vars(&self.options.vars);
        let mut renderer = Renderer::new(context);
        let ephemerals: Arc<Mutex<Vec<String>>> = Arc::default();
        let warnings: Arc<Mutex<Vec<Diagnostic>>> = Arc::default();

        let env = renderer.env_mut();

        {
            let manifest = Arc::clone(&self.manifest);
            let lookups = Arc::clone(&self.lookups);
            let targets = Arc::clone(&self.targets);
            let root = self.options.resolve.root_project.clone();
            let node_id = node.unique_id.clone();
            let package = node.package_name.clone();
            let ephemerals = Arc::clone(&ephemerals);
            let warnings = Arc::clone(&warnings);
            env.add_function(
                "ref",
                move |first: String, second: Option<String>, kwargs: Kwargs| -> Result<Value, Error> {
                    let version = match kwargs.get::<Option<Value>>("version")? {
                        Some(v) => Some(v),
                        None => kwargs.get::<Option<Value>>("v")?,
                    };
                    kwargs.assert_all_used()?;

                    let mut target = match second {
                        Some(name) => RefArgs::new(name).with_package(first),
                        None => RefArgs::new(first),
                    };
                    if let Some(v) = version {
                        target = target.with_version(v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()));
                    }

                    let id = match resolve_ref(&lookups, &root, &package, &target) {
                        Ok(RefResolution::Resolved(id)) => id,
                        Ok(RefResolution::Disabled(id)) => {
                            return Err(Error::new(
                                ErrorKind::InvalidOperation,
                                format!("{} depends on disabled node {}", node_id, id),
                            ))
                        }
                        Ok(RefResolution::NotFound) => {
                            return Err(Error::new(
                                ErrorKind::InvalidOperation,
                                format!("{} depends on a node named '{}' which was not found", node_id, target.search_name()),
                            ))
                        }
                        Err(Ambiguity(ids)) => {
                            return Err(Error::new(
                                ErrorKind::InvalidOperation,
                                format!("{} matches more than one node: {}", target, ids.join(", ")),
                            ))
                        }
                    };

                    if let Some(resolved) = manifest.get_node(&id) {
                        if let Some(warning) = check_unpinned_version(&manifest, &node_id, &target, resolved) {
                            tracing::warn!(node = %node_id, target = %id, "{}", warning.message);
                            if let Ok(mut w) = warnings.lock() {
                                w.push(warning);
                            }
                        }
                    }

                    match targets.get(&id) {
                        Some(RefTarget::Ephemeral(cte)) => {
                            if let Ok(mut e) = ephemerals.lock() {
                                e.push(id.clone());
                            }
                            Ok(Value::from(cte.clone()))
                        }
                        Some(RefTarget::Relation(rel)) => Ok(Value::from_object(rel.clone())),
                        None => Err(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("{} has no relation", id),
                        )),
                    }
                },
            );
        }

        {
            let lookups = Arc::clone(&self.lookups);
            let targets = Arc::clone(&self.targets);
            let root = self.options.resolve.root_project.clone();
            let package = node.package_name.clone();
            let node_id = node.unique_id.clone();
            env.add_function(
                "source",
                move |source_name: String, table_name: String| -> Result<Value, Error> {
                    let order = search_order(None, &root, &package);
                    let search_name = format!("{}.{}", source_name, table_name);
                    let found = lookups.sources.find(&search_name, &order).map_err(|Ambiguity(ids)| {
                        Error::new(
                            ErrorKind::InvalidOperation,
                            format!("source '{}' matches more than one source: {}", search_name, ids.join(", ")),
                        )
                    })?;
                    match found.and_then(|id| targets.get(id)) {
                        Some(RefTarget::Relation(rel)) => Ok(Value::from_object(rel.clone())),
                        _ => Err(Error::new(
                            ErrorKind::InvalidOperation,
                            format!(
                                "{} depends on a source named '{}' which was not found",
                                node_id, search_name
                            ),
                        )),
                    }
                },
            );
        }

        let config = serde_json::to_value(&node.config).unwrap_or(serde_json::Value::Null);
        env.add_global("config", Value::from_object(ConfigObject { values: config }));

        let dispatcher: DispatchFn = {
            let manifest = Arc::clone(&self.manifest);
            let ctx = self.options.resolve.clone();
            let package = node.package_name.clone();
            Arc::new(move |macro_name: &str, namespace: Option<&str>| {
                ctx.macro_resolver(&manifest)
                    .resolve_dispatch(macro_name, namespace, &ctx.adapter_chain, &package)
                    .map(|m| mangled_name(&m.package_name, &m.name))
            })
        };
        env.add_global(
            "adapter",
            Value::from_object(AdapterObject {
                dispatcher,
                quote_char: quote_char_for(&self.options.target.adapter_type),
                adapter_type: self.options.target.adapter_type.clone(),
            }),
        );
        env.add_global("exceptions", Value::from_object(ExceptionsObject));
        env.add_global("execute", Value::from(true));
        env.add_function("is_incremental", || false);

        NodeScope {
            renderer,
            ephemerals,
            warnings,
        }
    }

    /// Every macro under a mangled name, the winning definition per name and
    /// one namespace per package
    fn preamble(&mut self, package: &str) -> String {
        if let Some(done) = self.preambles.get(package) {
            return done.clone();
        }

        let mut out = String::new();
        {
            let resolver = self.options.resolve.macro_resolver(&self.manifest);
            let mut names: BTreeSet<&str> = BTreeSet::new();
            let mut by_package: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

            for mac in self.manifest.macros.values() {
                out.push_str(&rename_macro(&mac.macro_sql, &mangled_name(&mac.package_name, &mac.name)));
                names.insert(&mac.name);
                by_package.entry(&mac.package_name).or_default().push(&mac.name);
            }
            for name in &names {
                if let Some(winner) = resolver.resolve_call(name, package) {
                    out.push_str(&format!(
                        "{{% set {} = {} %}}",
                        name,
                        mangled_name(&winner.package_name, &winner.name)
                    ));
                }
            }
            for (pkg, members) in by_package {
                if names.contains(pkg) {
                    continue;
                }
                let fields: Vec<String> = members
                    .iter()
                    .map(|name| format!("{}={}", name, mangled_name(pkg, name)))
                    .collect();
                out.push_str(&format!("{{% set {} = namespace({}) %}}", pkg, fields.join(", ")));
            }
        }

        self.preambles.insert(package.to_string(), out.clone());
        out
    }

    /// Compiled nodes so far
    pub fn compiled(&self) -> &BTreeMap<String, CompiledNode> {
        &self.compiled
    }
}

struct NodeScope {
    renderer: Renderer,
    ephemerals: Arc<Mutex<Vec<String>>>,
    warnings: Arc<Mutex<Vec<Diagnostic>>>,
}

/// Name a macro is defined under inside a node environment
pub fn mangled_name(package: &str, name: &str) -> String {
    format!("__dagforge_m_{}__{}", package, name)
}

static MACRO_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{%(-?)\s*macro\s+(\w+)").expect("valid macro tag regex"));

/// Rename the first macro definition in a block
fn rename_macro(macro_sql: &str, new_name: &str) -> String {
    MACRO_TAG
        .replacen(macro_sql, 1, |caps: &regex::Captures<'_>| format!("{{%{} macro {}", &caps[1], new_name))
        .into_owned()
}

fn push_cte(ctes: &mut Vec<InjectedCte>, cte: InjectedCte) {
    if !ctes.iter().any(|c| c.id == cte.id) {
        ctes.push(cte);
    }
}

/// Prepend CTEs to a query, merging with an existing `with`
pub fn inject_ctes(sql: &str, ctes: &[InjectedCte]) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }
    let joined = ctes.iter().map(|c| c.sql.as_str()).collect::<Vec<_>>().join(", ");
    let trimmed = sql.trim();
    let starts_with_with = trimmed.len() > 4
        && trimmed[..4].eq_ignore_ascii_case("with")
        && trimmed[4..].starts_with(|c: char| c.is_whitespace());
    if starts_with_with {
        format!("with {}, {}", joined, trimmed[4..].trim_start())
    } else {
        format!("with {} {}", joined, trimmed)
    }
}

/// `config` inside templates: callable as a no-op, with `get`/`require`
#[derive(Debug)]
struct ConfigObject {
    values: serde_json::Value,
}

impl Object for ConfigObject {
    fn call(self: &Arc<Self>, _state: &State<'_, '_>, _args: &[Value]) -> Result<Value, Error> {
        Ok(Value::from(""))
    }

    fn call_method(self: &Arc<Self>, _state: &State<'_, '_>, method: &str, args: &[Value]) -> Result<Value, Error> {
        match method {
            "get" => {
                let (key, default): (String, Option<Value>) = from_args(args)?;
                Ok(self
                    .values
                    .get(&key)
                    .filter(|v| !v.is_null())
                    .map(Value::from_serialize)
                    .or(default)
                    .unwrap_or(Value::from(())))
            }
            "require" => {
                let (key,): (String,) = from_args(args)?;
                self.values
                    .get(&key)
                    .filter(|v| !v.is_null())
                    .map(Value::from_serialize)
                    .ok_or_else(|| {
                        Error::new(ErrorKind::InvalidOperation, format!("required config '{}' was not provided", key))
                    })
            }
            _ => Err(Error::from(ErrorKind::UnknownMethod)),
        }
    }
}

type DispatchFn = Arc<dyn Fn(&str, Option<&str>) -> Option<String> + Send + Sync>;

/// `adapter` inside templates
struct AdapterObject {
    dispatcher: DispatchFn,
    quote_char: char,
    adapter_type: String,
}

impl fmt::Debug for AdapterObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterObject")
            .field("adapter_type", &self.adapter_type)
            .finish()
    }
}

impl Object for AdapterObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "type" => Some(Value::from(self.adapter_type.clone())),
            _ => None,
        }
    }

    fn call_method(self: &Arc<Self>, state: &State<'_, '_>, method: &str, args: &[Value]) -> Result<Value, Error> {
        match method {
            "dispatch" => {
                let (macro_name, namespace, kwargs): (String, Option<String>, Kwargs) = from_args(args)?;
                let namespace = match namespace {
                    Some(ns) => Some(ns),
                    None => kwargs.get::<Option<String>>("macro_namespace")?,
                };
                let mangled = (self.dispatcher)(&macro_name, namespace.as_deref()).ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidOperation,
                        format!("No implementation of macro '{}' for adapter {}", macro_name, self.adapter_type),
                    )
                })?;
                state.lookup(&mangled).ok_or_else(|| {
                    Error::new(ErrorKind::UndefinedError, format!("macro '{}' is not defined", mangled))
                })
            }
            "quote" => {
                let (identifier,): (String,) = from_args(args)?;
                Ok(Value::from(format!("{q}{}{q}", identifier, q = self.quote_char)))
            }
            _ => Err(Error::from(ErrorKind::UnknownMethod)),
        }
    }
}

/// `exceptions` inside templates
#[derive(Debug)]
struct ExceptionsObject;

impl Object for ExceptionsObject {
    fn call_method(self: &Arc<Self>, _state: &State<'_, '_>, method: &str, args: &[Value]) -> Result<Value, Error> {
        let (message,): (String,) = from_args(args)?;
        match method {
            "raise_compiler_error" => Err(Error::new(ErrorKind::InvalidOperation, message)),
            "warn" => {
                tracing::warn!(target: "dagforge::template", "{}", message);
                Ok(Value::from(""))
            }
            _ => Err(Error::from(ErrorKind::UnknownMethod)),
        }
    }
}

/// Compile every listed node and store the results in the manifest
///
/// `order` is a topological order; ids that are not nodes (sources) are
/// skipped. Per-node failures are collected and compilation continues.
pub fn compile_manifest(manifest: &mut Manifest, order: &[NodeId], options: CompileOptions) -> Report {
    let mut report = Report::new();
    let mut compiler = Compiler::new(Arc::new(manifest.clone()), options);

    for id in order {
        if !manifest.nodes.contains_key(id) {
            continue;
        }
        if let Err(err) = compiler.compile_node(id) {
            tracing::debug!(node = %id, error = %err, "Compilation failed");
            report.add_diagnostic(err.to_diagnostic());
        }
    }
    for warning in compiler.warnings() {
        report.add_diagnostic(warning.clone());
    }

    for (id, compiled) in compiler.compiled() {
        if let Some(node) = manifest.nodes.get_mut(id) {
            node.compiled_code = Some(compiled.compiled_code.clone());
            node.compiled = true;
            node.extra_ctes = compiled.extra_ctes.clone();
            node.extra_ctes_injected = true;
        }
    }
    tracing::info!(compiled = compiler.compiled().len(), errors = report.summary.errors, "Compiled nodes");
    report
}

/// Write compiled SQL to `<target_dir>/compiled/<package>/<original_file_path>`
pub fn write_compiled(manifest: &Manifest, target_dir: &Path) -> Result<Vec<PathBuf>, CompileError> {
    let mut written = Vec::new();
    for node in manifest.nodes.values() {
        let Some(code) = &node.compiled_code else { continue };
        let mut path = target_dir
            .join("compiled")
            .join(&node.package_name)
            .join(&node.original_file_path);
        // tests declared in a property file land below it, one file per test
        if node.is_generic_test() {
            path = path.join(&node.path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CompileError::Io {
                path: parent.display().to_string(),
                message: e.to_string(),
            })?;
        }
        std::fs::write(&path, code).map_err(|e| CompileError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_manifest::{Macro, NodeConfig, ResourceType, SourceDefinition};
    use pretty_assertions::assert_eq;

    fn model(name: &str, sql: &str) -> Node {
        let mut node = Node::new(ResourceType::Model, "p", name, format!("models/{}.sql", name)).with_raw_code(sql);
        node.schema = "analytics".to_string();
        node
    }

    fn ephemeral(name: &str, sql: &str) -> Node {
        model(name, sql).with_config(NodeConfig::default().with_materialized("ephemeral"))
    }

    fn compiler(manifest: Manifest) -> Compiler {
        Compiler::new(
            Arc::new(manifest),
            CompileOptions::new(TargetConfig::default(), ResolveContext::new("p")),
        )
    }

    #[test]
    fn ephemeral_ref_becomes_cte() {
        let mut manifest = Manifest::default();
        manifest.add_node(ephemeral("ephemeral", "select * from source_table")).unwrap();
        manifest
            .add_node(model("a", "select * from {{ ref('ephemeral') }}"))
            .unwrap();
        let compiled = compiler(manifest).compile_node("model.p.a").unwrap();
        assert_eq!(
            compiled.compiled_code,
            "with __dbt__CTE__ephemeral as (select * from source_table) select * from __dbt__CTE__ephemeral"
        );
    }

    #[test]
    fn nested_ephemerals_hoist_inner_ctes_first() {
        let mut manifest = Manifest::default();
        manifest
            .add_node(ephemeral("ephemeral_level_two", "select * from source_table"))
            .unwrap();
        manifest
            .add_node(ephemeral("ephemeral", "select * from {{ ref('ephemeral_level_two') }}"))
            .unwrap();
        manifest
            .add_node(model("a", "select * from {{ ref('ephemeral') }}"))
            .unwrap();
        let compiled = compiler(manifest).compile_node("model.p.a").unwrap();
        assert_eq!(
            compiled.compiled_code,
            "with __dbt__CTE__ephemeral_level_two as (select * from source_table), \
             __dbt__CTE__ephemeral as (select * from __dbt__CTE__ephemeral_level_two) \
             select * from __dbt__CTE__ephemeral"
        );
        assert_eq!(compiled.extra_ctes.len(), 2);
    }

    #[test]
    fn ephemeral_cycle_is_detected() {
        let mut manifest = Manifest::default();
        manifest.add_node(ephemeral("x", "select * from {{ ref('y') }}")).unwrap();
        manifest.add_node(ephemeral("y", "select * from {{ ref('x') }}")).unwrap();
        let err = compiler(manifest).compile_node("model.p.x").unwrap_err();
        assert!(matches!(err, CompileError::EphemeralRecursion { .. }));
    }

    #[test]
    fn existing_with_clause_is_merged() {
        let ctes = vec![InjectedCte {
            id: "model.p.e".to_string(),
            sql: "__dbt__CTE__e as (select 1)".to_string(),
        }];
        assert_eq!(
            inject_ctes("with base as (select * from __dbt__CTE__e) select * from base", &ctes),
            "with __dbt__CTE__e as (select 1), base as (select * from __dbt__CTE__e) select * from base"
        );
        assert_eq!(inject_ctes("select 1", &[]), "select 1");
    }

    #[test]
    fn refs_sources_and_this_render_relations() {
        let mut manifest = Manifest::default();
        manifest
            .add_source(SourceDefinition::new("p", "raw", "orders", "models/sources.yml"))
            .unwrap();
        manifest.add_node(model("stg", "select 1 as id")).unwrap();
        manifest
            .add_node(model(
                "a",
                "select * from {{ ref('stg') }} join {{ source('raw', 'orders') }} -- {{ this }}",
            ))
            .unwrap();
        let compiled = compiler(manifest).compile_node("model.p.a").unwrap();
        assert_eq!(
            compiled.compiled_code,
            "select * from \"analytics\".\"stg\" join \"raw\".\"orders\" -- \"analytics\".\"a\""
        );
        assert!(!compiled.compiled_code.contains("{{"));
    }

    #[test]
    fn macros_are_callable_by_name_and_namespace() {
        let mut manifest = Manifest::default();
        manifest
            .add_macro(Macro::new(
                "utils",
                "cents",
                "macros/cents.sql",
                "{% macro cents(col) %}({{ col }} / 100){% endmacro %}",
            ))
            .unwrap();
        manifest
            .add_node(model("a", "select {{ cents('amount') }}, {{ utils.cents('tax') }} from t"))
            .unwrap();
        let compiled = compiler(manifest).compile_node("model.p.a").unwrap();
        assert_eq!(compiled.compiled_code, "select (amount / 100), (tax / 100) from t");
    }

    #[test]
    fn unpinned_versioned_ref_warns() {
        let mut manifest = Manifest::default();
        for v in ["1", "2"] {
            let mut node = model("dim", "select 1").with_version(v);
            node.latest_version = Some("1".to_string());
            node.alias = format!("dim_v{}", v);
            manifest.add_node(node).unwrap();
        }
        manifest.add_node(model("a", "select * from {{ ref('dim') }}")).unwrap();
        let mut compiler = compiler(manifest);
        let compiled = compiler.compile_node("model.p.a").unwrap();
        assert_eq!(compiled.compiled_code, "select * from \"analytics\".\"dim_v1\"");
        assert_eq!(compiler.warnings().len(), 1);
        assert!(compiler.warnings()[0].message.contains("newer version v2 available"));
    }

    #[test]
    fn config_get_reads_node_config() {
        let mut manifest = Manifest::default();
        let node = model("a", "{{ config(materialized='table') }}select '{{ config.get('materialized') }}'")
            .with_config(NodeConfig::default().with_materialized("table"));
        manifest.add_node(node).unwrap();
        let compiled = compiler(manifest).compile_node("model.p.a").unwrap();
        assert_eq!(compiled.compiled_code, "select 'table'");
    }

    #[test]
    fn compile_manifest_stores_results() {
        let mut manifest = Manifest::default();
        manifest.add_node(ephemeral("e", "select 1 as id")).unwrap();
        manifest.add_node(model("a", "select * from {{ ref('e') }}")).unwrap();
        manifest.add_node(model("broken", "select * from {{ ref('missing') }}")).unwrap();
        let order: Vec<NodeId> = vec!["model.p.e".into(), "model.p.a".into(), "model.p.broken".into()];
        let report = compile_manifest(
            &mut manifest,
            &order,
            CompileOptions::new(TargetConfig::default(), ResolveContext::new("p")),
        );
        assert_eq!(report.summary.errors, 1);
        let a = &manifest.nodes["model.p.a"];
        assert!(a.compiled && a.extra_ctes_injected);
        assert_eq!(a.extra_ctes.len(), 1);
        assert!(!manifest.nodes["model.p.broken"].compiled);
    }
}
