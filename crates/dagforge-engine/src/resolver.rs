//! Reference resolution
//!
//! Turns the `ref()`, `source()` and macro calls recorded at parse time into
//! `depends_on` edges, and collects every failure into one [`Report`].

use crate::error::{MacroError, ReferenceError};
use crate::lookups::{search_order, Ambiguity, Lookups};
use crate::macros::MacroResolver;
use dagforge_core::{Diagnostic, DiagnosticCode, Report, Severity};
use dagforge_manifest::{Access, DependsOn, Manifest, Node, RefArgs, ResourceType};
use std::collections::{BTreeMap, BTreeSet};

/// Project-wide inputs to resolution
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Name of the root project
    pub root_project: String,

    /// Built-in packages (the core package and adapter packages)
    pub core_packages: BTreeSet<String>,

    /// Installed packages declared with `restrict-access: true`
    pub restrict_access: BTreeSet<String>,

    /// Adapter type, its parents, then `default`
    pub adapter_chain: Vec<String>,

    pub require_unambiguous_ref: bool,
}

impl ResolveContext {
    pub fn new(root_project: impl Into<String>) -> Self {
        Self {
            root_project: root_project.into(),
            core_packages: ["dagforge".to_string(), "dbt".to_string()].into_iter().collect(),
            restrict_access: BTreeSet::new(),
            adapter_chain: vec!["default".to_string()],
            require_unambiguous_ref: false,
        }
    }

    pub fn with_adapter_chain(mut self, chain: Vec<String>) -> Self {
        for adapter in &chain {
            if adapter != "default" {
                self.core_packages.insert(format!("dagforge_{}", adapter));
            }
        }
        self.adapter_chain = chain;
        self
    }

    pub fn with_restricted_package(mut self, package: impl Into<String>) -> Self {
        self.restrict_access.insert(package.into());
        self
    }

    pub fn macro_resolver<'a>(&self, manifest: &'a Manifest) -> MacroResolver<'a> {
        MacroResolver::new(manifest, self.root_project.clone(), self.core_packages.iter().cloned())
    }
}

/// Outcome of a single `ref()` lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefResolution {
    Resolved(String),
    Disabled(String),
    NotFound,
}

/// Look up one `ref()` made from `node_package`
pub fn resolve_ref(
    lookups: &Lookups,
    root_project: &str,
    node_package: &str,
    target: &RefArgs,
) -> Result<RefResolution, Ambiguity> {
    let order = search_order(target.package.as_deref(), root_project, node_package);
    let search_name = target.search_name();
    if let Some(id) = lookups.refable.find(&search_name, &order)? {
        return Ok(RefResolution::Resolved(id.to_string()));
    }
    match lookups.disabled.find(&search_name, &order) {
        Some(ids) => Ok(ids
            .into_iter()
            .next()
            .map(RefResolution::Disabled)
            .unwrap_or(RefResolution::NotFound)),
        None => Ok(RefResolution::NotFound),
    }
}

/// The node making a reference
#[derive(Debug, Clone, Copy)]
pub struct Referrer<'a> {
    pub unique_id: &'a str,
    pub package_name: &'a str,
    pub group: Option<&'a str>,
}

impl<'a> Referrer<'a> {
    pub fn from_node(node: &'a Node) -> Self {
        Self {
            unique_id: &node.unique_id,
            package_name: &node.package_name,
            group: node.group(),
        }
    }
}

/// Access rules for a resolved ref; only models carry access
pub fn check_access(
    referrer: Referrer<'_>,
    target: &Node,
    restrict_access: &BTreeSet<String>,
) -> Result<(), ReferenceError> {
    if target.resource_type != ResourceType::Model {
        return Ok(());
    }
    let restricted = restrict_access.contains(&target.package_name);
    let same_package = referrer.package_name == target.package_name;

    let allowed = match target.access() {
        Access::Public => true,
        Access::Protected => same_package || !restricted,
        Access::Private => {
            let same_group = matches!((referrer.group, target.group()), (Some(a), Some(b)) if a == b);
            same_group && !restricted
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(ReferenceError::AccessDenied {
            node: referrer.unique_id.to_string(),
            target: target.unique_id.clone(),
            access: target.access().as_str().to_string(),
        })
    }
}

/// Warn when a versioned family has a version newer than `latest_version`
///
/// Returns `None` for pinned refs and for unversioned targets.
pub fn check_unpinned_version(manifest: &Manifest, referrer_id: &str, target: &RefArgs, resolved: &Node) -> Option<Diagnostic> {
    if target.version.is_some() {
        return None;
    }
    let latest = resolved.latest_version.as_deref()?;

    let newest = manifest
        .nodes
        .values()
        .filter(|n| n.package_name == resolved.package_name && n.name == resolved.name)
        .filter_map(|n| n.version.as_deref())
        .max_by(|a, b| compare_versions(a, b))?;

    if compare_versions(newest, latest) != std::cmp::Ordering::Greater {
        return None;
    }

    let message = format!(
        "While compiling '{}': found an unpinned reference to versioned model '{}' in project '{}'. \
         Resolving to latest version: {}.v{}. A prerelease version {} is available. \
         It has not yet been marked 'latest' by its maintainer. When that happens, this reference \
         will resolve to {}.v{} instead. newer version v{} available",
        referrer_id, resolved.name, resolved.package_name, resolved.name, latest, newest, resolved.name, newest, newest
    );
    Some(Diagnostic::warn(DiagnosticCode::UnpinnedRefNewVersion, message).with_nodes([
        referrer_id.to_string(),
        resolved.unique_id.clone(),
    ]))
}

/// Numeric comparison when both versions are numbers, lexical otherwise
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Enabled refable nodes sharing a kind and search name across packages
pub fn check_unambiguous_names(manifest: &Manifest) -> Vec<ReferenceError> {
    let mut by_name: BTreeMap<(ResourceType, String), Vec<String>> = BTreeMap::new();
    for node in manifest.nodes.values().filter(|n| n.is_refable()) {
        by_name
            .entry((node.resource_type, node.search_name()))
            .or_default()
            .push(node.unique_id.clone());
    }
    by_name
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|((_, name), mut ids)| {
            ids.sort();
            ReferenceError::DuplicateName { name, ids }
        })
        .collect()
}

/// Dependencies computed for one graph member
#[derive(Debug, Default)]
struct Resolved {
    depends_on: DependsOn,
    disabled: Vec<String>,
}

/// Resolve every reference in the manifest
///
/// Rewrites `depends_on` for nodes, exposures, metrics, semantic models,
/// saved queries and unit tests, and records disabled refs. Resolution
/// continues past failures; all of them end up in the returned report.
pub fn resolve_manifest(manifest: &mut Manifest, ctx: &ResolveContext) -> Report {
    let lookups = Lookups::build(manifest);
    let mut report = Report::new();

    for (name, ids) in lookups.refable.collisions() {
        let err = ReferenceError::DuplicateName {
            name: name.to_string(),
            ids: ids.into_iter().map(str::to_string).collect(),
        };
        report.add_diagnostic(err.to_diagnostic());
    }

    if ctx.require_unambiguous_ref {
        for err in check_unambiguous_names(manifest) {
            report.add_diagnostic(err.to_diagnostic());
        }
    }

    let (node_results, macro_results) = {
        let macros = ctx.macro_resolver(manifest);
        let mut node_results: BTreeMap<String, Resolved> = BTreeMap::new();

        for node in manifest.nodes.values() {
            let mut resolved = Resolved::default();
            let referrer = Referrer::from_node(node);

            for target in &node.refs {
                resolve_one_ref(manifest, &lookups, ctx, referrer, target, &node.original_file_path, &mut resolved, &mut report);
            }

            for (source_name, table_name) in &node.sources {
                resolve_one_source(
                    &lookups,
                    ctx,
                    referrer,
                    (source_name, table_name),
                    &node.original_file_path,
                    &mut resolved,
                    &mut report,
                );
            }

            // Names reached only through dispatch are resolved per adapter
            let mut soft: BTreeSet<String> = BTreeSet::new();
            for call in &node.dispatch_calls {
                soft.insert(call.macro_name.clone());
                if let Some(ns) = &call.namespace {
                    soft.insert(format!("{}.{}", ns, call.macro_name));
                }
                if let Some(found) =
                    macros.resolve_dispatch(&call.macro_name, call.namespace.as_deref(), &ctx.adapter_chain, &node.package_name)
                {
                    resolved.depends_on.add_macro(&found.unique_id);
                }
            }

            for call in &node.macro_calls {
                match resolve_macro_call(&macros, call, &node.package_name) {
                    MacroCall::Found(id) => resolved.depends_on.add_macro(id),
                    MacroCall::Skip => {}
                    MacroCall::Missing if soft.contains(call) => {}
                    MacroCall::Missing => report.add_diagnostic(
                        MacroError::NotFound {
                            node: node.unique_id.clone(),
                            name: call.clone(),
                        }
                        .to_diagnostic(),
                    ),
                }
            }

            resolved.depends_on.normalize();
            node_results.insert(node.unique_id.clone(), resolved);
        }

        let mut macro_results: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for mac in manifest.macros.values() {
            let mut ids = Vec::new();
            for call in &mac.macro_calls {
                match resolve_macro_call(&macros, call, &mac.package_name) {
                    MacroCall::Found(id) => ids.push(id),
                    MacroCall::Skip => {}
                    MacroCall::Missing => {
                        let mut diagnostic = MacroError::NotFound {
                            node: mac.unique_id.clone(),
                            name: call.clone(),
                        }
                        .to_diagnostic();
                        diagnostic.severity = Severity::Warn;
                        report.add_diagnostic(diagnostic);
                    }
                }
            }
            ids.sort();
            ids.dedup();
            macro_results.insert(mac.unique_id.clone(), ids);
        }

        (node_results, macro_results)
    };

    for (id, resolved) in node_results {
        for disabled in &resolved.disabled {
            manifest.add_disabled_ref(&id, disabled);
        }
        if let Some(node) = manifest.nodes.get_mut(&id) {
            node.depends_on = resolved.depends_on;
        }
    }
    for (id, macros) in macro_results {
        if let Some(mac) = manifest.macros.get_mut(&id) {
            mac.depends_on.macros = macros;
        }
    }

    resolve_aux_resources(manifest, &lookups, ctx, &mut report);

    tracing::debug!(
        nodes = manifest.nodes.len(),
        errors = report.summary.errors,
        warnings = report.summary.warnings,
        "Resolved references"
    );
    report
}

#[allow(clippy::too_many_arguments)]
fn resolve_one_ref(
    manifest: &Manifest,
    lookups: &Lookups,
    ctx: &ResolveContext,
    referrer: Referrer<'_>,
    target: &RefArgs,
    path: &str,
    resolved: &mut Resolved,
    report: &mut Report,
) {
    match resolve_ref(lookups, &ctx.root_project, referrer.package_name, target) {
        Ok(RefResolution::Resolved(id)) => {
            let access = manifest
                .get_node(&id)
                .map(|t| check_access(referrer, t, &ctx.restrict_access))
                .unwrap_or(Ok(()));
            match access {
                Ok(()) => resolved.depends_on.add_node(id),
                Err(err) => report.add_diagnostic(err.to_diagnostic()),
            }
        }
        Ok(RefResolution::Disabled(id)) => resolved.disabled.push(id),
        Ok(RefResolution::NotFound) => report.add_diagnostic(
            ReferenceError::NotFound {
                node: referrer.unique_id.to_string(),
                target: target.search_name(),
                path: Some(path.to_string()),
            }
            .to_diagnostic(),
        ),
        Err(Ambiguity(candidates)) => report.add_diagnostic(
            ReferenceError::Ambiguous {
                node: referrer.unique_id.to_string(),
                target: target.search_name(),
                candidates,
            }
            .to_diagnostic(),
        ),
    }
}

fn resolve_one_source(
    lookups: &Lookups,
    ctx: &ResolveContext,
    referrer: Referrer<'_>,
    (source_name, table_name): (&String, &String),
    path: &str,
    resolved: &mut Resolved,
    report: &mut Report,
) {
    let order = search_order(None, &ctx.root_project, referrer.package_name);
    let search_name = format!("{}.{}", source_name, table_name);
    match lookups.sources.find(&search_name, &order) {
        Ok(Some(id)) => resolved.depends_on.add_node(id),
        Ok(None) => match lookups.disabled.find(&search_name, &order) {
            Some(ids) => resolved.disabled.extend(ids),
            None => report.add_diagnostic(
                ReferenceError::SourceNotFound {
                    node: referrer.unique_id.to_string(),
                    source_name: source_name.clone(),
                    table_name: table_name.clone(),
                    path: Some(path.to_string()),
                }
                .to_diagnostic(),
            ),
        },
        Err(Ambiguity(candidates)) => report.add_diagnostic(
            ReferenceError::Ambiguous {
                node: referrer.unique_id.to_string(),
                target: search_name,
                candidates,
            }
            .to_diagnostic(),
        ),
    }
}

/// Resources that never run cannot be skipped, so a disabled target is an error
fn report_disabled(referrer: Referrer<'_>, resolved: &Resolved, report: &mut Report) {
    for target in &resolved.disabled {
        report.add_diagnostic(
            ReferenceError::Disabled {
                node: referrer.unique_id.to_string(),
                target: target.clone(),
            }
            .to_diagnostic(),
        );
    }
}

enum MacroCall {
    Found(String),
    /// `pkg.name` where `pkg` is not a package (e.g. a method call on a variable)
    Skip,
    Missing,
}

fn resolve_macro_call(macros: &MacroResolver<'_>, call: &str, package: &str) -> MacroCall {
    if let Some((pkg, _)) = call.split_once('.') {
        if !macros.is_known_package(pkg) {
            return MacroCall::Skip;
        }
    }
    match macros.resolve_call(call, package) {
        Some(found) => MacroCall::Found(found.unique_id.clone()),
        None => MacroCall::Missing,
    }
}

/// Exposures, metrics, semantic models, saved queries and unit tests
fn resolve_aux_resources(manifest: &mut Manifest, lookups: &Lookups, ctx: &ResolveContext, report: &mut Report) {
    let mut updates: Vec<(&'static str, String, DependsOn)> = Vec::new();

    for exposure in manifest.exposures.values() {
        let mut resolved = Resolved::default();
        let referrer = Referrer {
            unique_id: &exposure.unique_id,
            package_name: &exposure.package_name,
            group: None,
        };
        for target in &exposure.refs {
            resolve_one_ref(manifest, lookups, ctx, referrer, target, &exposure.original_file_path, &mut resolved, report);
        }
        for (source_name, table_name) in &exposure.sources {
            resolve_one_source(
                lookups,
                ctx,
                referrer,
                (source_name, table_name),
                &exposure.original_file_path,
                &mut resolved,
                report,
            );
        }
        report_disabled(referrer, &resolved, report);
        updates.push(("exposure", exposure.unique_id.clone(), resolved.depends_on));
    }

    for metric in manifest.metrics.values() {
        let mut depends_on = DependsOn::default();
        let order = search_order(None, &ctx.root_project, &metric.package_name);
        for name in &metric.metrics {
            match lookups.metrics.find(name, &order) {
                Ok(Some(id)) => depends_on.add_node(id),
                _ => report.add_diagnostic(
                    ReferenceError::NotFound {
                        node: metric.unique_id.clone(),
                        target: name.clone(),
                        path: Some(metric.original_file_path.clone()),
                    }
                    .to_diagnostic(),
                ),
            }
        }
        for measure in measure_names(&metric.type_params) {
            if let Ok(Some(id)) = lookups.semantic_models_by_measure.find(&measure, &order) {
                depends_on.add_node(id);
            }
        }
        updates.push(("metric", metric.unique_id.clone(), depends_on));
    }

    for model in manifest.semantic_models.values() {
        let mut resolved = Resolved::default();
        let referrer = Referrer {
            unique_id: &model.unique_id,
            package_name: &model.package_name,
            group: None,
        };
        for target in &model.refs {
            resolve_one_ref(manifest, lookups, ctx, referrer, target, &model.original_file_path, &mut resolved, report);
        }
        report_disabled(referrer, &resolved, report);
        updates.push(("semantic_model", model.unique_id.clone(), resolved.depends_on));
    }

    for query in manifest.saved_queries.values() {
        let mut depends_on = DependsOn::default();
        let order = search_order(None, &ctx.root_project, &query.package_name);
        let names = query
            .query_params
            .get("metrics")
            .and_then(|m| m.as_array())
            .map(|m| m.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>())
            .unwrap_or_default();
        for name in names {
            match lookups.metrics.find(&name, &order) {
                Ok(Some(id)) => depends_on.add_node(id),
                _ => report.add_diagnostic(
                    ReferenceError::NotFound {
                        node: query.unique_id.clone(),
                        target: name,
                        path: Some(query.original_file_path.clone()),
                    }
                    .to_diagnostic(),
                ),
            }
        }
        updates.push(("saved_query", query.unique_id.clone(), depends_on));
    }

    for test in manifest.unit_tests.values() {
        let mut resolved = Resolved::default();
        let mut target = RefArgs::new(&test.model);
        if let Some(v) = &test.version {
            target = target.with_version(v);
        }
        let referrer = Referrer {
            unique_id: &test.unique_id,
            package_name: &test.package_name,
            group: None,
        };
        resolve_one_ref(manifest, lookups, ctx, referrer, &target, &test.original_file_path, &mut resolved, report);
        updates.push(("unit_test", test.unique_id.clone(), resolved.depends_on));
    }

    for (kind, id, mut depends_on) in updates {
        depends_on.normalize();
        let slot = match kind {
            "exposure" => manifest.exposures.get_mut(&id).map(|r| &mut r.depends_on),
            "metric" => manifest.metrics.get_mut(&id).map(|r| &mut r.depends_on),
            "semantic_model" => manifest.semantic_models.get_mut(&id).map(|r| &mut r.depends_on),
            "saved_query" => manifest.saved_queries.get_mut(&id).map(|r| &mut r.depends_on),
            _ => manifest.unit_tests.get_mut(&id).map(|r| &mut r.depends_on),
        };
        if let Some(slot) = slot {
            *slot = depends_on;
        }
    }
}

/// Measure names in metric `type_params` (`measure`, `numerator`, `denominator`)
fn measure_names(type_params: &serde_json::Value) -> Vec<String> {
    ["measure", "numerator", "denominator"]
        .iter()
        .filter_map(|key| type_params.get(key))
        .filter_map(|value| match value {
            serde_json::Value::String(name) => Some(name.clone()),
            other => other.get("name").and_then(|n| n.as_str()).map(str::to_string),
        })
        .collect()
}
