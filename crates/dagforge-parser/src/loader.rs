//! Project loading
//!
//! [`ProjectParser`] discovers the files of the root project and its
//! packages, parses each one, and assembles the results into a resolved,
//! linked [`Manifest`].

use crate::config_layering::{build_node_config, merge_into, LayeredConfig};
use crate::core_macros::{core_macro_files, CORE_PACKAGE};
use crate::error::ParseError;
use crate::generic_tests::{build_generic_test, TestTarget};
use crate::ingest::{discover, SourceFile};
use crate::node_parser::{
    apply_patch, bind_version, column_map, generate_names, latest_version, match_version, patch_config_layers,
    ref_args, seed_column_types, version_columns, UnpatchedNode,
};
use crate::project::{ProjectTree, PROJECT_FILE};
use crate::raw::{parse_file, ParseContext, ParsedFile};
use crate::yaml::{
    version_string, ColumnEntry, ConfigMap, ExposureEntry, MetricEntry, NodePatchEntry, PropertiesFile,
    SemanticModelEntry, SourceEntry, SourceTableEntry, UnitTestEntry, UnitTestInputEntry, VersionEntry,
};
use dagforge_core::{Config, Diagnostic, DiagnosticCode, FileHash, Location, Report};
use dagforge_engine::{link, resolve_manifest, LinkedGraph, ResolveContext};
use dagforge_jinja::{default_scope, inspect, statically_parse_ref, statically_parse_source};
use dagforge_manifest::{
    unique_id, Access, DisabledEntry, Exposure, Group, Language, Manifest, ManifestError, ManifestMetadata,
    ManifestStateCheck, Metric, Node, ResourceType, SavedQuery, SemanticModel, SourceConfig, SourceDefinition, UnitTestDefinition, UnitTestInput,
};
use dagforge_sql::SamplingStats;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Counters reported after a parse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseStats {
    pub files: usize,
    /// Files whose previous result was reused
    pub reused: usize,
    pub sampling: SamplingStats,
}

/// Result of parsing a project
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub manifest: Manifest,
    pub report: Report,
    /// `None` when the graph has a cycle
    pub linked: Option<LinkedGraph>,
    pub stats: ParseStats,
}

/// Parses a project tree into a manifest
#[derive(Debug, Clone)]
pub struct ProjectParser {
    config: Config,
    projects: ProjectTree,
    ctx: ParseContext,
}

impl ProjectParser {
    /// Load the project files; no model or YAML file is read yet
    pub fn new(config: &Config) -> Result<Self, ParseError> {
        let projects = ProjectTree::load(config)?;
        let mut ctx = ParseContext::new(projects.root_name(), config.target.clone(), config.flags.clone());
        for project in projects.all() {
            ctx = ctx.with_package_vars(project.name(), projects.vars_for(project.name(), &config.vars));
        }
        ctx = ctx.with_package_vars(CORE_PACKAGE, projects.vars_for(CORE_PACKAGE, &config.vars));
        Ok(Self {
            config: config.clone(),
            projects,
            ctx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn projects(&self) -> &ProjectTree {
        &self.projects
    }

    pub fn context(&self) -> &ParseContext {
        &self.ctx
    }

    /// Built-in macro files, then every file of every package
    pub fn discover(&self) -> Result<Vec<SourceFile>, ParseError> {
        let mut files = core_macro_files();
        for project in self.projects.all() {
            files.extend(discover(project)?);
        }
        tracing::debug!(files = files.len(), "Discovered project files");
        Ok(files)
    }

    pub fn parse_file(&self, file: &SourceFile) -> ParsedFile {
        parse_file(&self.ctx, file)
    }

    pub fn state_check(&self) -> ManifestStateCheck {
        self.projects.state_check(&self.config)
    }

    pub fn resolve_context(&self) -> ResolveContext {
        let mut ctx = ResolveContext::new(self.projects.root_name()).with_adapter_chain(self.config.target.adapter_chain());
        for package in self.projects.restricted_packages() {
            ctx = ctx.with_restricted_package(package);
        }
        ctx.require_unambiguous_ref = self.config.flags.require_unambiguous_ref;
        ctx
    }

    /// Discover, parse and assemble the whole project
    pub fn parse(&self) -> Result<ParseOutput, ParseError> {
        let files = self.discover()?;
        let parsed: Vec<ParsedFile> = files.iter().map(|file| self.parse_file(file)).collect();
        Ok(self.assemble(parsed))
    }

    /// Assemble parsed files into a resolved, linked manifest
    pub fn assemble(&self, mut files: Vec<ParsedFile>) -> ParseOutput {
        files.sort_by_key(|f| f.record.file_id());

        let mut stats = ParseStats {
            files: files.len(),
            ..ParseStats::default()
        };
        for result in files.iter().flat_map(|f| f.sampling.iter()) {
            stats.sampling.record(*result);
        }
        if stats.sampling.mismatches() > 0 {
            tracing::warn!(
                sampled = stats.sampling.total(),
                mismatches = stats.sampling.mismatches(),
                "Static extractor disagreed with the inspector"
            );
        }

        let metadata = ManifestMetadata::new(self.projects.root_name(), &self.config.target.adapter_type);
        let mut assembler = Assembler::new(self, &files, Manifest::new(metadata));
        for diagnostic in &self.projects.diagnostics {
            assembler.report.add_diagnostic(diagnostic.clone());
        }
        assembler.run();
        let Assembler {
            mut manifest,
            mut report,
            patched,
            contributed,
            ..
        } = assembler;

        for file in &files {
            let mut record = file.record.clone();
            let file_id = record.file_id();
            for id in contributed.get(&file_id).into_iter().flatten() {
                record.add_contributed(id);
            }
            record.patches = patched.get(&file_id).cloned().unwrap_or_default();
            manifest.add_file(record);
        }
        manifest.state_check = self.state_check();

        let resolve = self.resolve_context();
        for diagnostic in generate_names(&mut manifest, &self.config.target, &resolve) {
            report.add_diagnostic(diagnostic);
        }
        report.merge(resolve_manifest(&mut manifest, &resolve));

        let linked = match link(&mut manifest, &self.config.target) {
            Ok(linked) => Some(linked),
            Err(err) => {
                report.add_diagnostic(err.to_diagnostic());
                None
            }
        };

        tracing::info!(
            nodes = manifest.nodes.len(),
            sources = manifest.sources.len(),
            macros = manifest.macros.len(),
            errors = report.summary.errors,
            warnings = report.summary.warnings,
            "Parsed project"
        );
        ParseOutput {
            manifest,
            report,
            linked,
            stats,
        }
    }
}

/// A node patch and the file it came from
#[derive(Clone, Copy)]
struct PatchRef<'a> {
    entry: &'a NodePatchEntry,
    file: &'a ParsedFile,
    resource_type: ResourceType,
}

impl PatchRef<'_> {
    fn file_id(&self) -> String {
        self.file.record.file_id()
    }
}

type PatchKey = (String, ResourceType, String);

struct Assembler<'a> {
    parser: &'a ProjectParser,
    files: &'a [ParsedFile],
    manifest: Manifest,
    report: Report,
    patches: BTreeMap<PatchKey, PatchRef<'a>>,
    /// `(package, model, version)` triples that found a file
    bound_versions: BTreeSet<(String, String, String)>,
    /// File id -> ids patched by that file
    patched: BTreeMap<String, Vec<String>>,
    /// File id -> ids created from that file during assembly
    contributed: BTreeMap<String, Vec<String>>,
}

impl<'a> Assembler<'a> {
    fn new(parser: &'a ProjectParser, files: &'a [ParsedFile], manifest: Manifest) -> Self {
        Self {
            parser,
            files,
            manifest,
            report: Report::new(),
            patches: BTreeMap::new(),
            bound_versions: BTreeSet::new(),
            patched: BTreeMap::new(),
            contributed: BTreeMap::new(),
        }
    }

    fn run(&mut self) {
        for file in self.files {
            for diagnostic in &file.diagnostics {
                self.report.add_diagnostic(diagnostic.clone());
            }
        }
        self.add_macros_and_docs();
        self.add_groups();
        self.index_patches();
        self.add_nodes();
        self.check_versions();
        self.add_sources();
        self.add_generic_tests();
        self.add_properties_resources();
        self.add_hooks();
    }

    fn fail(&mut self, err: ParseError) {
        tracing::debug!(error = %err, "Assembly error");
        self.report.add_diagnostic(err.to_diagnostic());
    }

    fn contribute(&mut self, file: &ParsedFile, id: &str) {
        self.contributed
            .entry(file.record.file_id())
            .or_default()
            .push(id.to_string());
    }

    fn properties(&self) -> impl Iterator<Item = (&'a ParsedFile, &'a PropertiesFile)> + 'a {
        self.files
            .iter()
            .filter_map(|file| file.properties.as_ref().map(|props| (file, props)))
    }

    fn add_macros_and_docs(&mut self) {
        for file in self.files {
            for mac in &file.macros {
                if let Err(err) = self.manifest.add_macro(mac.clone()) {
                    self.fail(err.into());
                }
            }
            for doc in &file.docs {
                if let Err(err) = self.manifest.add_doc(doc.clone()) {
                    self.fail(err.into());
                }
            }
        }

        for (file, props) in self.properties() {
            for patch in &props.macros {
                let id = format!("macro.{}.{}", file.record.package_name, patch.name);
                match self.manifest.macros.get_mut(&id) {
                    Some(mac) => {
                        mac.description = patch.description.clone();
                        mac.arguments = patch.arguments.clone();
                        mac.meta = patch.meta.clone();
                        mac.patch_path = Some(file.record.file_id());
                        self.patched.entry(file.record.file_id()).or_default().push(id);
                    }
                    None => self.report.add_diagnostic(
                        Diagnostic::warn(
                            DiagnosticCode::Warning,
                            format!("macro patch for '{}' does not match any macro", patch.name),
                        )
                        .with_location(Location::new(&file.record.path)),
                    ),
                }
            }
        }
    }

    fn add_groups(&mut self) {
        for (file, props) in self.properties() {
            for entry in &props.groups {
                let mut group = Group::new(&file.record.package_name, &entry.name, &file.record.path);
                group.owner = entry.owner.clone();
                let id = group.unique_id.clone();
                match self.manifest.add_group(group) {
                    Ok(()) => self.contribute(file, &id),
                    Err(err) => self.fail(err.into()),
                }
            }
        }
    }

    fn index_patches(&mut self) {
        for (file, props) in self.properties() {
            let sections = [
                (ResourceType::Model, &props.models),
                (ResourceType::Seed, &props.seeds),
                (ResourceType::Snapshot, &props.snapshots),
                (ResourceType::Analysis, &props.analyses),
            ];
            for (resource_type, entries) in sections {
                for entry in entries {
                    let key = (file.record.package_name.clone(), resource_type, entry.name.clone());
                    if let Some(existing) = self.patches.get(&key) {
                        let err = ParseError::Validation {
                            path: file.record.path.clone(),
                            section: format!("{}s", resource_type.as_str()),
                            entry: entry.name.clone(),
                            message: format!("already patched in {}", existing.file.record.path),
                        };
                        self.fail(err);
                        continue;
                    }
                    self.patches.insert(
                        key,
                        PatchRef {
                            entry,
                            file,
                            resource_type,
                        },
                    );
                }
            }
        }
    }

    fn versioned_patch_for(&self, package: &str, file_stem: &str) -> Option<PatchRef<'a>> {
        self.patches
            .iter()
            .filter(|((pkg, rt, _), _)| pkg == package && *rt == ResourceType::Model)
            .map(|(_, patch)| *patch)
            .find(|patch| match_version(patch.entry, file_stem).is_some())
    }

    fn add_nodes(&mut self) {
        for file in self.files {
            for unpatched in &file.nodes {
                if let Err(err) = self.add_node(file, unpatched) {
                    self.fail(err);
                }
            }
        }
    }

    fn add_node(&mut self, file: &ParsedFile, unpatched: &UnpatchedNode) -> Result<(), ParseError> {
        let mut node = unpatched.node.clone();
        let path = file.record.path.clone();
        let key = (node.package_name.clone(), node.resource_type, node.name.clone());
        let mut patch = self.patches.get(&key).copied();
        let mut version: Option<&VersionEntry> = None;

        if node.resource_type == ResourceType::Model {
            match patch {
                Some(p) if !p.entry.versions.is_empty() => {
                    version = Some(match_version(p.entry, &node.name).ok_or_else(|| ParseError::VersionedModel {
                        path: path.clone(),
                        model: p.entry.name.clone(),
                        message: "the model is versioned but this file does not define any of its versions"
                            .to_string(),
                    })?);
                }
                Some(_) => {}
                None => {
                    patch = self.versioned_patch_for(&node.package_name, &node.name);
                    version = patch.and_then(|p| match_version(p.entry, &node.name));
                }
            }
            if let (Some(p), Some(v)) = (patch, version) {
                let latest = latest_version(p.entry, &p.file.record.path)?;
                bind_version(&mut node, &p.entry.name, &v.version(), &latest);
                self.bound_versions
                    .insert((node.package_name.clone(), p.entry.name.clone(), v.version()));
            }
        }

        let mut layered = LayeredConfig::default();
        merge_into(&mut layered.rendered, &base_defaults(&node));
        let projects = LayeredConfig::from_projects(
            &self.parser.projects,
            &node.package_name,
            node.resource_type,
            &node.fqn,
        );
        layered.apply(&projects.rendered, &projects.unrendered);
        if let Some(p) = patch {
            let (rendered, unrendered) = patch_config_layers(p.entry);
            layered.apply(&rendered, &unrendered);
            if node.resource_type == ResourceType::Seed {
                layered.apply_literal(&seed_column_types(p.entry));
            }
            if let Some(v) = version {
                let unrendered = if v.unrendered_config.is_empty() {
                    &v.config
                } else {
                    &v.unrendered_config
                };
                layered.apply(&v.config, unrendered);
            }
        }
        layered.apply(&unpatched.inline_config, &unpatched.unrendered_inline);

        node.config = build_node_config(&layered.rendered, &path)?;
        node.unrendered_config = layered.unrendered;
        if let Some(p) = patch {
            apply_patch(&mut node, p.entry, version, &p.file_id());
            self.patched.entry(p.file_id()).or_default().push(node.unique_id.clone());
        }
        self.check_group(&node, &path)?;
        self.insert_node(node);
        Ok(())
    }

    fn check_group(&self, node: &Node, path: &str) -> Result<(), ParseError> {
        if node.config.access == Access::Private && node.config.group.is_none() {
            return Err(ParseError::AccessWithoutGroup {
                node: node.unique_id.clone(),
                path: path.to_string(),
            });
        }
        if let Some(group) = &node.config.group {
            if !self.manifest.groups.values().any(|g| &g.name == group) {
                return Err(ParseError::Config {
                    path: path.to_string(),
                    message: format!("Invalid group '{}' on {}: no group with that name", group, node.unique_id),
                });
            }
        }
        Ok(())
    }

    fn insert_node(&mut self, node: Node) {
        if node.config.enabled {
            if let Err(err) = self.manifest.add_node(node) {
                self.fail(err.into());
            }
        } else {
            tracing::debug!(node = %node.unique_id, "Node is disabled");
            self.manifest.add_disabled(DisabledEntry::Node(node));
        }
    }

    /// Every declared version of a versioned model needs a file
    fn check_versions(&mut self) {
        let mut missing = Vec::new();
        for ((package, rt, name), patch) in &self.patches {
            if *rt != ResourceType::Model {
                continue;
            }
            for version in &patch.entry.versions {
                let key = (package.clone(), name.clone(), version.version());
                if !self.bound_versions.contains(&key) {
                    missing.push(ParseError::VersionedModel {
                        path: patch.file.record.path.clone(),
                        model: name.clone(),
                        message: format!("no model file found for version {}", version.version()),
                    });
                }
            }
        }
        for err in missing {
            self.fail(err);
        }
    }

    fn add_sources(&mut self) {
        let mut overrides: Vec<(&'a ParsedFile, &'a SourceEntry)> = Vec::new();
        for (file, props) in self.properties() {
            for source in &props.sources {
                if source.overrides.is_some() {
                    overrides.push((file, source));
                    continue;
                }
                for table in &source.tables {
                    match self.build_source(file, source, table) {
                        Ok(definition) => self.insert_source(file, definition),
                        Err(err) => self.fail(err),
                    }
                }
            }
        }
        for (file, source) in overrides {
            self.apply_source_override(file, source);
        }
    }

    fn build_source(
        &self,
        file: &ParsedFile,
        source: &SourceEntry,
        table: &SourceTableEntry,
    ) -> Result<SourceDefinition, ParseError> {
        let package = &file.record.package_name;
        let mut definition = SourceDefinition::new(package, &source.name, &table.name, &file.record.path);

        let mut layered =
            LayeredConfig::from_projects(&self.parser.projects, package, ResourceType::Source, &definition.fqn);
        layered.apply(&source.config, unrendered_or(&source.unrendered_config, &source.config));
        layered.apply(&table.config, unrendered_or(&table.unrendered_config, &table.config));

        definition.database = source
            .database
            .clone()
            .or_else(|| self.parser.config.target.database.clone());
        definition.schema = source.schema.clone().unwrap_or_else(|| source.name.clone());
        definition.identifier = table.identifier.clone().unwrap_or_else(|| table.name.clone());
        definition.loader = source.loader.clone();
        definition.loaded_at_field = table.loaded_at_field.clone().or_else(|| source.loaded_at_field.clone());
        definition.freshness = match &table.freshness {
            Some(explicit) => explicit.clone(),
            None => source.freshness.clone(),
        };
        definition.quoting = source.quoting.clone();
        definition.quoting.extend(table.quoting.clone());
        definition.description = table.description.clone();
        definition.columns = column_map(table.columns.clone());
        definition.meta = source.meta.clone();
        definition.meta.extend(table.meta.clone());
        definition.tags = source.tags.clone();
        for tag in &table.tags {
            if !definition.tags.contains(tag) {
                definition.tags.push(tag.clone());
            }
        }
        definition.config = serde_json::from_value(Value::Object(layered.rendered.clone().into_iter().collect()))
            .map_err(|e| ParseError::Config {
                path: file.record.path.clone(),
                message: format!("source {}: {}", definition.unique_id, e),
            })?;
        definition.unrendered_config = layered.unrendered;
        Ok(definition)
    }

    fn insert_source(&mut self, file: &ParsedFile, definition: SourceDefinition) {
        let id = definition.unique_id.clone();
        self.contribute(file, &id);
        if definition.config.enabled {
            if let Err(err) = self.manifest.add_source(definition) {
                self.fail(err.into());
            }
        } else {
            self.manifest.add_disabled(DisabledEntry::Source(definition));
        }
    }

    /// `overrides: <package>` replaces fields of another package's tables
    fn apply_source_override(&mut self, file: &ParsedFile, source: &SourceEntry) {
        let Some(package) = &source.overrides else { return };
        for table in &source.tables {
            let id = format!("source.{}.{}.{}", package, source.name, table.name);
            let Some(mut definition) = self.manifest.sources.remove(&id) else {
                self.report.add_diagnostic(
                    Diagnostic::warn(
                        DiagnosticCode::Warning,
                        format!("source override for '{}' does not match any source", id),
                    )
                    .with_location(Location::new(&file.record.path)),
                );
                continue;
            };
            if !table.description.is_empty() {
                definition.description = table.description.clone();
            }
            if !table.columns.is_empty() {
                definition.columns = column_map(table.columns.clone());
            }
            if let Some(identifier) = &table.identifier {
                definition.identifier = identifier.clone();
            }
            if let Some(field) = table.loaded_at_field.clone().or_else(|| source.loaded_at_field.clone()) {
                definition.loaded_at_field = Some(field);
            }
            match &table.freshness {
                Some(explicit) => definition.freshness = explicit.clone(),
                None if source.freshness.is_some() => definition.freshness = source.freshness.clone(),
                None => {}
            }
            definition.meta.extend(source.meta.clone());
            definition.meta.extend(table.meta.clone());
            let mut config: ConfigMap = serde_json::to_value(&definition.config)
                .ok()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            merge_into(&mut config, &source.config);
            merge_into(&mut config, &table.config);
            match serde_json::from_value::<SourceConfig>(Value::Object(config.into_iter().collect())) {
                Ok(config) => definition.config = config,
                Err(e) => self.fail(ParseError::Config {
                    path: file.record.path.clone(),
                    message: format!("source {}: {}", id, e),
                }),
            }
            self.patched.entry(file.record.file_id()).or_default().push(id.clone());
            if definition.config.enabled {
                self.manifest.sources.insert(id, definition);
            } else {
                self.manifest.add_disabled(DisabledEntry::Source(definition));
            }
        }
    }

    fn add_generic_tests(&mut self) {
        for (file, props) in self.properties() {
            let sections = [
                (ResourceType::Model, &props.models),
                (ResourceType::Seed, &props.seeds),
                (ResourceType::Snapshot, &props.snapshots),
            ];
            for (resource_type, entries) in sections {
                for entry in entries {
                    if entry.versions.is_empty() {
                        let target = TestTarget::Model {
                            name: entry.name.clone(),
                            version: None,
                            resource_type,
                        };
                        self.add_tests_for(file, &target, &entry.data_tests, &entry.columns);
                        continue;
                    }
                    for version in &entry.versions {
                        let target = TestTarget::Model {
                            name: entry.name.clone(),
                            version: Some(version.version()),
                            resource_type,
                        };
                        let tests: Vec<Value> = entry.data_tests.iter().chain(&version.data_tests).cloned().collect();
                        let columns = version_columns(&entry.columns, &version.columns);
                        self.add_tests_for(file, &target, &tests, &columns);
                    }
                }
            }

            for source in props.sources.iter().filter(|s| s.overrides.is_none()) {
                for table in &source.tables {
                    let target = TestTarget::Source {
                        source_name: source.name.clone(),
                        table: table.name.clone(),
                    };
                    self.add_tests_for(file, &target, &table.data_tests, &table.columns);
                }
            }
        }
    }

    fn add_tests_for(
        &mut self,
        file: &ParsedFile,
        target: &TestTarget,
        tests: &[Value],
        columns: &[ColumnEntry],
    ) {
        for test in tests {
            self.add_generic_test(file, target, None, test);
        }
        for column in columns {
            for test in &column.data_tests {
                self.add_generic_test(file, target, Some(&column.name), test);
            }
        }
    }

    fn add_generic_test(&mut self, file: &ParsedFile, target: &TestTarget, column: Option<&str>, entry: &Value) {
        let package = &file.record.package_name;
        let built = match build_generic_test(package, &file.record.path, &file.subdirectories, target, column, entry) {
            Ok(built) => built,
            Err(err) => return self.fail(err),
        };
        let mut node = built.node;

        let attached = match target {
            TestTarget::Model {
                name,
                version,
                resource_type,
            } => unique_id(*resource_type, package, name, version.as_deref()),
            TestTarget::Source { source_name, table } => format!("source.{}.{}.{}", package, source_name, table),
        };
        let target_disabled = self.manifest.disabled.contains_key(&attached);
        node.attached_node = Some(attached);

        let mut layered = LayeredConfig::default();
        merge_into(&mut layered.rendered, &base_defaults(&node));
        let projects = LayeredConfig::from_projects(&self.parser.projects, package, ResourceType::Test, &node.fqn);
        layered.apply(&projects.rendered, &projects.unrendered);
        layered.apply_literal(&built.config);
        match build_node_config(&layered.rendered, &file.record.path) {
            Ok(config) => node.config = config,
            Err(err) => return self.fail(err),
        }
        node.unrendered_config = layered.unrendered;
        if node.config.group.is_none() {
            node.config.group = node
                .attached_node
                .as_deref()
                .and_then(|id| self.manifest.nodes.get(id))
                .and_then(|target| target.config.group.clone());
        }
        if target_disabled {
            node.config.enabled = false;
        }

        let id = node.unique_id.clone();
        self.contribute(file, &id);
        self.insert_node(node);
    }

    fn add_properties_resources(&mut self) {
        for (file, props) in self.properties() {
            for entry in &props.exposures {
                self.add_exposure(file, entry);
            }
            for entry in &props.metrics {
                self.add_metric(file, entry);
            }
            for entry in &props.semantic_models {
                self.add_semantic_model(file, entry);
            }
            for entry in &props.saved_queries {
                if !enabled(&entry.config) {
                    continue;
                }
                let package = &file.record.package_name;
                let query = SavedQuery {
                    unique_id: format!("saved_query.{}.{}", package, entry.name),
                    name: entry.name.clone(),
                    package_name: package.clone(),
                    original_file_path: file.record.path.clone(),
                    fqn: fqn_for(file, &entry.name),
                    description: entry.description.clone(),
                    query_params: entry.query_params.clone(),
                    depends_on: Default::default(),
                };
                self.insert_with(file, query.unique_id.clone(), |m| m.add_saved_query(query));
            }
            for entry in &props.unit_tests {
                self.add_unit_tests(file, entry);
            }
        }
    }

    fn insert_with(
        &mut self,
        file: &ParsedFile,
        id: String,
        insert: impl FnOnce(&mut Manifest) -> Result<(), ManifestError>,
    ) {
        match insert(&mut self.manifest) {
            Ok(()) => self.contribute(file, &id),
            Err(err) => self.fail(err.into()),
        }
    }

    fn add_exposure(&mut self, file: &ParsedFile, entry: &ExposureEntry) {
        if !enabled(&entry.config) {
            return;
        }
        let package = &file.record.package_name;
        let mut exposure = Exposure {
            unique_id: format!("exposure.{}.{}", package, entry.name),
            name: entry.name.clone(),
            package_name: package.clone(),
            original_file_path: file.record.path.clone(),
            fqn: fqn_for(file, &entry.name),
            exposure_type: entry.exposure_type.clone(),
            owner: entry.owner.clone(),
            description: entry.description.clone(),
            url: entry.url.clone(),
            refs: Vec::new(),
            sources: Vec::new(),
            depends_on: Default::default(),
            meta: entry.meta.clone(),
            tags: entry.tags.clone(),
        };
        for dependency in &entry.depends_on {
            let text = dependency.trim();
            if text.starts_with("ref(") {
                match statically_parse_ref(text) {
                    Ok(call) => exposure.refs.push(ref_args(&call)),
                    Err(e) => return self.fail(invalid_entry(file, "exposures", &entry.name, e)),
                }
            } else if text.starts_with("source(") {
                match statically_parse_source(text) {
                    Ok(pair) => exposure.sources.push(pair),
                    Err(e) => return self.fail(invalid_entry(file, "exposures", &entry.name, e)),
                }
            } else {
                let message = format!("depends_on entry '{}' must be a ref() or source() call", text);
                return self.fail(invalid_entry(file, "exposures", &entry.name, message));
            }
        }
        self.insert_with(file, exposure.unique_id.clone(), |m| m.add_exposure(exposure));
    }

    fn add_metric(&mut self, file: &ParsedFile, entry: &MetricEntry) {
        if !enabled(&entry.config) {
            return;
        }
        let package = &file.record.package_name;
        let mut metrics: Vec<String> = Vec::new();
        if let Some(Value::Array(inputs)) = entry.type_params.get("metrics") {
            metrics.extend(inputs.iter().filter_map(input_name));
        }
        if entry.metric_type == "ratio" {
            for side in ["numerator", "denominator"] {
                if let Some(name) = entry.type_params.get(side).and_then(input_name) {
                    metrics.push(name);
                }
            }
        }
        metrics.sort();
        metrics.dedup();

        let metric = Metric {
            unique_id: format!("metric.{}.{}", package, entry.name),
            name: entry.name.clone(),
            package_name: package.clone(),
            original_file_path: file.record.path.clone(),
            fqn: fqn_for(file, &entry.name),
            label: entry.label.clone(),
            metric_type: entry.metric_type.clone(),
            type_params: entry.type_params.clone(),
            description: entry.description.clone(),
            metrics,
            depends_on: Default::default(),
            group: entry.config.get("group").and_then(Value::as_str).map(str::to_string),
        };
        self.insert_with(file, metric.unique_id.clone(), |m| m.add_metric(metric));
    }

    fn add_semantic_model(&mut self, file: &ParsedFile, entry: &SemanticModelEntry) {
        if !enabled(&entry.config) {
            return;
        }
        let call = match statically_parse_ref(&entry.model) {
            Ok(call) => call,
            Err(e) => return self.fail(invalid_entry(file, "semantic_models", &entry.name, e)),
        };
        let package = &file.record.package_name;
        let model = SemanticModel {
            unique_id: format!("semantic_model.{}.{}", package, entry.name),
            name: entry.name.clone(),
            package_name: package.clone(),
            original_file_path: file.record.path.clone(),
            fqn: fqn_for(file, &entry.name),
            model: entry.model.clone(),
            refs: vec![ref_args(&call)],
            description: entry.description.clone(),
            entities: entry.entities.clone(),
            dimensions: entry.dimensions.clone(),
            measures: entry.measures.clone(),
            depends_on: Default::default(),
        };
        self.insert_with(file, model.unique_id.clone(), |m| m.add_semantic_model(model));
    }

    /// One unit test per tested version; a single one for unversioned models
    fn add_unit_tests(&mut self, file: &ParsedFile, entry: &UnitTestEntry) {
        if !enabled(&entry.config) {
            return;
        }
        let package = file.record.package_name.clone();

        let mut given = Vec::new();
        for input in &entry.given {
            match unit_test_input(input) {
                Ok(input) => given.push(input),
                Err(message) => return self.fail(invalid_entry(file, "unit_tests", &entry.name, message)),
            }
        }
        if entry.expect.input.is_some() {
            let message = "expect must not name an input".to_string();
            return self.fail(invalid_entry(file, "unit_tests", &entry.name, message));
        }
        let expect = UnitTestInput {
            input: String::new(),
            format: entry.expect.format.clone().unwrap_or_else(|| "dict".to_string()),
            rows: entry.expect.rows.clone().unwrap_or(Value::Null),
            fixture: entry.expect.fixture.clone(),
        };

        let versions: Vec<Option<String>> = match self
            .patches
            .get(&(package.clone(), ResourceType::Model, entry.model.clone()))
            .filter(|p| !p.entry.versions.is_empty())
        {
            Some(patch) => patch
                .entry
                .versions
                .iter()
                .map(VersionEntry::version)
                .filter(|v| version_selected(entry.versions.as_ref(), v))
                .map(Some)
                .collect(),
            None => vec![None],
        };

        let checksum = FileHash::from_contents(serde_json::to_string(entry).unwrap_or_default());
        for version in versions {
            let name = match &version {
                Some(v) => format!("{}_v{}", entry.name, v),
                None => entry.name.clone(),
            };
            let mut fqn = vec![package.clone()];
            fqn.extend(file.subdirectories.iter().cloned());
            fqn.push(entry.model.clone());
            fqn.push(name.clone());
            let test = UnitTestDefinition {
                unique_id: format!("unit_test.{}.{}.{}", package, entry.model, name),
                name,
                package_name: package.clone(),
                original_file_path: file.record.path.clone(),
                fqn,
                model: entry.model.clone(),
                version,
                given: given.clone(),
                expect: expect.clone(),
                overrides: entry.overrides.clone(),
                description: entry.description.clone(),
                depends_on: Default::default(),
                checksum: checksum.clone(),
            };
            self.insert_with(file, test.unique_id.clone(), |m| m.add_unit_test(test));
        }
    }

    /// `on-run-start`/`on-run-end` hooks as operation nodes
    fn add_hooks(&mut self) {
        let projects: Vec<_> = self.parser.projects.all().collect();
        for project in projects {
            for (tag, on_run_start) in [("on-run-start", true), ("on-run-end", false)] {
                for (index, sql) in project.hooks(on_run_start).into_iter().enumerate() {
                    let name = format!("{}-{}-{}", project.name(), tag, index);
                    let mut node = Node::new(ResourceType::Operation, project.name(), &name, PROJECT_FILE)
                        .with_raw_code(&sql);
                    node.checksum = FileHash::from_contents(&sql);
                    node.config.materialized = "hook".to_string();
                    node.config.tags = vec![tag.to_string()];
                    node.fqn = vec![project.name().to_string(), "hooks".to_string(), name];
                    match inspect(&sql, &default_scope()) {
                        Ok(facts) => {
                            node.refs = facts.refs.iter().map(ref_args).collect();
                            node.macro_calls = facts.macro_calls;
                        }
                        Err(e) => {
                            self.fail(ParseError::template(PROJECT_FILE, e));
                            continue;
                        }
                    }
                    self.insert_node(node);
                }
            }
        }
    }
}

/// Defaults below every config layer
fn base_defaults(node: &Node) -> ConfigMap {
    let mut defaults = ConfigMap::new();
    match node.resource_type {
        ResourceType::Test => {
            defaults.insert("materialized".to_string(), Value::from("test"));
            defaults.insert("severity".to_string(), Value::from("ERROR"));
        }
        ResourceType::Snapshot => {
            defaults.insert("materialized".to_string(), Value::from("snapshot"));
        }
        ResourceType::Model if node.language == Language::Python => {
            defaults.insert("materialized".to_string(), Value::from("table"));
        }
        _ => {}
    }
    defaults
}

fn unrendered_or<'m>(unrendered: &'m ConfigMap, rendered: &'m ConfigMap) -> &'m ConfigMap {
    if unrendered.is_empty() {
        rendered
    } else {
        unrendered
    }
}

fn enabled(config: &ConfigMap) -> bool {
    config.get("enabled").and_then(Value::as_bool).unwrap_or(true)
}

fn fqn_for(file: &ParsedFile, name: &str) -> Vec<String> {
    std::iter::once(file.record.package_name.clone())
        .chain(file.subdirectories.iter().cloned())
        .chain(std::iter::once(name.to_string()))
        .collect()
}

/// A metric input written as a name or `{name: ...}`
fn input_name(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        other => other.get("name").and_then(Value::as_str).map(str::to_string),
    }
}

fn invalid_entry(file: &ParsedFile, section: &str, entry: &str, message: impl ToString) -> ParseError {
    ParseError::Validation {
        path: file.record.path.clone(),
        section: section.to_string(),
        entry: entry.to_string(),
        message: message.to_string(),
    }
}

fn unit_test_input(input: &UnitTestInputEntry) -> Result<UnitTestInput, String> {
    let expression = input
        .input
        .as_deref()
        .map(str::trim)
        .ok_or_else(|| "every given entry needs an input".to_string())?;
    let valid = if expression.starts_with("source(") {
        statically_parse_source(expression).is_ok()
    } else {
        statically_parse_ref(expression).is_ok()
    };
    if !valid {
        return Err(format!("input '{}' must be a ref() or source() call", expression));
    }
    Ok(UnitTestInput {
        input: expression.to_string(),
        format: input.format.clone().unwrap_or_else(|| "dict".to_string()),
        rows: input.rows.clone().unwrap_or(Value::Null),
        fixture: input.fixture.clone(),
    })
}

/// Whether a unit test's `versions: {include, exclude}` selects `version`
fn version_selected(selector: Option<&Value>, version: &str) -> bool {
    let Some(selector) = selector else { return true };
    let listed = |key: &str| {
        selector.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .any(|item| version_string(item) == version)
        })
    };
    match (listed("include"), listed("exclude")) {
        (Some(included), _) => included,
        (None, Some(excluded)) => !excluded,
        (None, None) => true,
    }
}
