//! Project and package loading
//!
//! Reads `dbt_project.yml` for the root project and every installed package,
//! renders templated values with CLI vars, and computes the hashes that
//! decide whether a saved parse can be reused.

use crate::error::ParseError;
use crate::yaml::{load_yaml, render_strings};
use dagforge_core::{sha256_hex, Config, Diagnostic, DiagnosticCode, FileHash, Location, TargetConfig};
use dagforge_jinja::{RenderContext, Renderer};
use dagforge_manifest::{ManifestStateCheck, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "dbt_project.yml";
pub const PACKAGES_FILE: &str = "packages.yml";
pub const DEPENDENCIES_FILE: &str = "dependencies.yml";
pub const LOCK_FILE: &str = "package-lock.yml";
pub const PROFILES_FILE: &str = "profiles.yml";

/// Decoded `dbt_project.yml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectFile {
    pub name: String,
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub config_version: Option<u32>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default = "default_model_paths")]
    pub model_paths: Vec<String>,
    #[serde(default = "default_seed_paths")]
    pub seed_paths: Vec<String>,
    #[serde(default = "default_snapshot_paths")]
    pub snapshot_paths: Vec<String>,
    #[serde(default = "default_macro_paths")]
    pub macro_paths: Vec<String>,
    #[serde(default = "default_test_paths")]
    pub test_paths: Vec<String>,
    #[serde(default = "default_analysis_paths")]
    pub analysis_paths: Vec<String>,
    #[serde(default)]
    pub docs_paths: Option<Vec<String>>,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default = "default_install_path")]
    pub packages_install_path: String,
    #[serde(default)]
    pub models: Value,
    #[serde(default)]
    pub seeds: Value,
    #[serde(default)]
    pub snapshots: Value,
    #[serde(default)]
    pub tests: Value,
    #[serde(default, rename = "data_tests")]
    pub data_tests: Value,
    #[serde(default)]
    pub sources: Value,
    #[serde(default)]
    pub analyses: Value,
    #[serde(default, rename = "unit_tests")]
    pub unit_tests: Value,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub on_run_start: Value,
    #[serde(default)]
    pub on_run_end: Value,
    /// Recorded but not enforced
    #[serde(default)]
    pub require_dbt_version: Option<Value>,
    #[serde(default)]
    pub restrict_access: bool,
    #[serde(default)]
    pub quoting: BTreeMap<String, Value>,
}

fn default_model_paths() -> Vec<String> {
    vec!["models".to_string()]
}
fn default_seed_paths() -> Vec<String> {
    vec!["seeds".to_string()]
}
fn default_snapshot_paths() -> Vec<String> {
    vec!["snapshots".to_string()]
}
fn default_macro_paths() -> Vec<String> {
    vec!["macros".to_string()]
}
fn default_test_paths() -> Vec<String> {
    vec!["tests".to_string()]
}
fn default_analysis_paths() -> Vec<String> {
    vec!["analyses".to_string()]
}
fn default_install_path() -> String {
    "dbt_packages".to_string()
}

/// A string or list of strings, as hooks are written
pub fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

/// A loaded project or package
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    /// Values rendered with CLI vars
    pub file: ProjectFile,
    /// Values as written
    pub unrendered: ProjectFile,
    pub checksum: FileHash,
    pub env_vars: BTreeMap<String, String>,
}

impl Project {
    /// Load `dbt_project.yml` from `root`
    pub fn load(root: &Path, target: &TargetConfig, cli_vars: &BTreeMap<String, Value>) -> Result<Self, ParseError> {
        let path = root.join(PROJECT_FILE);
        let display = path.display().to_string();
        let text = std::fs::read_to_string(&path).map_err(|e| ParseError::io(&display, e))?;
        let raw = load_yaml(&display, &text)?;

        let renderer = Renderer::new(RenderContext::for_target(target).with_vars(cli_vars));
        let mut rendered = raw.clone();
        render_strings(&mut rendered, &renderer, &display)?;

        let file: ProjectFile = serde_json::from_value(rendered).map_err(|e| ParseError::Validation {
            path: display.clone(),
            section: "project".to_string(),
            entry: PROJECT_FILE.to_string(),
            message: e.to_string(),
        })?;
        if file.name.is_empty() {
            return Err(ParseError::Validation {
                path: display,
                section: "project".to_string(),
                entry: PROJECT_FILE.to_string(),
                message: "project name must not be empty".to_string(),
            });
        }
        let unrendered = serde_json::from_value(raw).unwrap_or_else(|_| file.clone());

        tracing::debug!(project = %file.name, root = %root.display(), "Loaded project file");
        Ok(Self {
            root: root.to_path_buf(),
            file,
            unrendered,
            checksum: FileHash::from_contents(&text),
            env_vars: renderer.env_vars_used(),
        })
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }

    /// Config tree for a resource type, rendered or as written
    pub fn config_tree(&self, resource_type: ResourceType, rendered: bool) -> &Value {
        let file = if rendered { &self.file } else { &self.unrendered };
        match resource_type {
            ResourceType::Model => &file.models,
            ResourceType::Seed => &file.seeds,
            ResourceType::Snapshot => &file.snapshots,
            ResourceType::Analysis => &file.analyses,
            ResourceType::Source => &file.sources,
            ResourceType::UnitTest => &file.unit_tests,
            ResourceType::Test if !file.data_tests.is_null() => &file.data_tests,
            ResourceType::Test => &file.tests,
            _ => &Value::Null,
        }
    }

    pub fn install_path(&self) -> PathBuf {
        self.root.join(&self.file.packages_install_path)
    }

    pub fn target_path(&self) -> Option<&str> {
        self.file.target_path.as_deref()
    }

    /// Hook SQL in declaration order
    pub fn hooks(&self, on_run_start: bool) -> Vec<String> {
        string_list(if on_run_start { &self.file.on_run_start } else { &self.file.on_run_end })
    }
}

/// One entry of `packages.yml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageSpec {
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub git: Option<String>,
    #[serde(default)]
    pub local: Option<String>,
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub subdirectory: Option<String>,
    #[serde(default)]
    pub exclude_env_vars_from_hash: bool,
}

impl PackageSpec {
    /// Directory name the package installs under
    pub fn install_name(&self) -> Option<String> {
        if let Some(package) = &self.package {
            return package.rsplit('/').next().map(str::to_string);
        }
        if let Some(git) = &self.git {
            return git
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(|s| s.trim_end_matches(".git").to_string());
        }
        self.local
            .as_ref()
            .and_then(|l| Path::new(l).file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Decoded `packages.yml` or `dependencies.yml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagesFile {
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    /// Entries as written, before env var rendering
    #[serde(skip)]
    pub raw: Vec<Value>,
}

impl PackagesFile {
    /// Hash compared against the lock file's `sha1_hash`. Entries marked
    /// `exclude-env-vars-from-hash` contribute their unrendered form.
    pub fn lock_hash(&self) -> String {
        let entries: Vec<Value> = self
            .packages
            .iter()
            .enumerate()
            .map(|(i, spec)| match (spec.exclude_env_vars_from_hash, self.raw.get(i)) {
                (true, Some(raw)) => raw.clone(),
                _ => serde_json::to_value(spec).unwrap_or(Value::Null),
            })
            .collect();
        sha256_hex(Value::Array(entries).to_string())
    }
}

/// Root project plus its installed dependencies
#[derive(Debug, Clone)]
pub struct ProjectTree {
    pub root: Project,
    pub dependencies: BTreeMap<String, Project>,
    pub packages: PackagesFile,
    /// Non-fatal findings, e.g. a stale lock file
    pub diagnostics: Vec<Diagnostic>,
}

impl ProjectTree {
    /// Load the root project at `config.project_root` and every package under
    /// its install path
    pub fn load(config: &Config) -> Result<Self, ParseError> {
        let root = Project::load(&config.project_root, &config.target, &config.vars)?;
        let packages = load_packages(&root, &config.target, &config.vars)?;
        let mut diagnostics = Vec::new();
        check_lock_file(&root, &packages, &mut diagnostics);

        let mut dependencies = BTreeMap::new();
        let install = root.install_path();
        if install.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&install)
                .map_err(|e| ParseError::io(install.display().to_string(), e))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.join(PROJECT_FILE).is_file())
                .collect();
            entries.sort();
            for dir in entries {
                let project = Project::load(&dir, &config.target, &config.vars)?;
                insert_dependency(&mut dependencies, &root, project);
            }
        }
        for spec in &packages.packages {
            if let Some(local) = &spec.local {
                let dir = root.root.join(local);
                if dir.join(PROJECT_FILE).is_file() {
                    let project = Project::load(&dir, &config.target, &config.vars)?;
                    insert_dependency(&mut dependencies, &root, project);
                }
            }
        }

        for spec in &packages.packages {
            let Some(name) = spec.install_name() else { continue };
            let installed = dependencies.contains_key(&name)
                || dependencies.values().any(|p| p.root.file_name().is_some_and(|n| n.to_string_lossy() == name));
            if !installed {
                return Err(ParseError::PackageNotInstalled {
                    name,
                    path: install.display().to_string(),
                });
            }
        }

        tracing::info!(
            project = %root.name(),
            dependencies = dependencies.len(),
            "Loaded project tree"
        );
        Ok(Self {
            root,
            dependencies,
            packages,
            diagnostics,
        })
    }

    pub fn root_name(&self) -> &str {
        self.root.name()
    }

    /// Look up a project by package name
    pub fn get(&self, package: &str) -> Option<&Project> {
        if package == self.root.name() {
            Some(&self.root)
        } else {
            self.dependencies.get(package)
        }
    }

    /// Root first, then dependencies by name
    pub fn all(&self) -> impl Iterator<Item = &Project> {
        std::iter::once(&self.root).chain(self.dependencies.values())
    }

    /// Packages that declared `restrict-access: true`
    pub fn restricted_packages(&self) -> Vec<String> {
        self.all()
            .filter(|p| p.file.restrict_access)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Variables visible to `package`: root vars, then root vars scoped to
    /// that package, then CLI vars
    pub fn vars_for(&self, package: &str, cli_vars: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        if let Some(project) = self.dependencies.get(package) {
            vars.extend(global_vars(&project.file.vars, &self.package_names()));
        }
        vars.extend(global_vars(&self.root.file.vars, &self.package_names()));
        if let Some(Value::Object(scoped)) = self.root.file.vars.get(package) {
            vars.extend(scoped.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        vars.extend(cli_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn package_names(&self) -> Vec<String> {
        self.all().map(|p| p.name().to_string()).collect()
    }

    /// Hashes that gate reuse of a saved parse
    pub fn state_check(&self, config: &Config) -> ManifestStateCheck {
        let mut vars = self.root.file.vars.clone();
        vars.extend(config.vars.clone());
        let vars_hash = FileHash::from_contents(serde_json::to_string(&vars).unwrap_or_default());

        let target = &config.target;
        let mut profile = format!(
            "{}|{}|{}|{}",
            target.name,
            target.adapter_type,
            target.database.as_deref().unwrap_or(""),
            target.schema
        );
        if let Ok(text) = std::fs::read_to_string(self.root.root.join(PROFILES_FILE)) {
            profile.push('|');
            profile.push_str(&text);
        }

        let env_vars: BTreeMap<&String, &String> = self.all().flat_map(|p| p.env_vars.iter()).collect();
        let project_env_vars_hash = FileHash::from_contents(serde_json::to_string(&env_vars).unwrap_or_default());

        ManifestStateCheck {
            vars_hash,
            profile_hash: FileHash::from_contents(profile),
            project_env_vars_hash,
            project_hashes: self
                .all()
                .map(|p| (p.name().to_string(), p.checksum.clone()))
                .collect(),
        }
    }
}

fn insert_dependency(dependencies: &mut BTreeMap<String, Project>, root: &Project, project: Project) {
    if project.name() == root.name() {
        tracing::warn!(path = %project.root.display(), "Skipping package with the root project's name");
        return;
    }
    dependencies.entry(project.name().to_string()).or_insert(project);
}

/// Vars not keyed by a package name
fn global_vars(vars: &BTreeMap<String, Value>, packages: &[String]) -> BTreeMap<String, Value> {
    vars.iter()
        .filter(|(k, v)| !(v.is_object() && packages.contains(k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn load_packages(
    root: &Project,
    target: &TargetConfig,
    cli_vars: &BTreeMap<String, Value>,
) -> Result<PackagesFile, ParseError> {
    let path = [PACKAGES_FILE, DEPENDENCIES_FILE]
        .iter()
        .map(|f| root.root.join(f))
        .find(|p| p.is_file());
    let Some(path) = path else {
        return Ok(PackagesFile::default());
    };
    let display = path.display().to_string();
    let text = std::fs::read_to_string(&path).map_err(|e| ParseError::io(&display, e))?;
    let raw = load_yaml(&display, &text)?;
    let raw_entries = raw
        .get("packages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let renderer = Renderer::new(RenderContext::for_target(target).with_vars(cli_vars));
    let mut rendered = raw;
    render_strings(&mut rendered, &renderer, &display)?;
    let mut file: PackagesFile = serde_json::from_value(rendered).map_err(|e| ParseError::Validation {
        path: display,
        section: "packages".to_string(),
        entry: "packages".to_string(),
        message: e.to_string(),
    })?;
    file.raw = raw_entries;
    Ok(file)
}

fn check_lock_file(root: &Project, packages: &PackagesFile, diagnostics: &mut Vec<Diagnostic>) {
    let path = root.root.join(LOCK_FILE);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return;
    };
    let locked = serde_yaml::from_str::<serde_yaml::Value>(&text)
        .ok()
        .and_then(|v| v.get("sha1_hash").and_then(|h| h.as_str().map(str::to_string)));
    if let Some(locked) = locked {
        if locked != packages.lock_hash() {
            tracing::warn!(path = %path.display(), "Package lock file is out of date");
            diagnostics.push(
                Diagnostic::warn(
                    DiagnosticCode::Warning,
                    "package-lock.yml does not match packages.yml; reinstall packages",
                )
                .with_location(Location::new(path.display().to_string())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn config(root: &Path) -> Config {
        Config {
            project_root: root.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn loads_project_with_defaults_and_rendering() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            PROJECT_FILE,
            r#"
name: shop
profile: "{{ var('profile_name', 'default') }}"
models:
  shop:
    +materialized: table
on-run-start:
  - "create schema if not exists {{ target.schema }}"
vars:
  region: eu
"#,
        );
        let mut cfg = config(dir.path());
        cfg.vars.insert("profile_name".to_string(), Value::from("warehouse"));

        let project = Project::load(dir.path(), &cfg.target, &cfg.vars).unwrap();
        assert_eq!(project.name(), "shop");
        assert_eq!(project.file.profile.as_deref(), Some("warehouse"));
        assert_eq!(project.unrendered.profile.as_deref(), Some("{{ var('profile_name', 'default') }}"));
        assert_eq!(project.file.model_paths, vec!["models"]);
        assert_eq!(project.hooks(true), vec!["create schema if not exists {{ target.schema }}"]);
        assert_eq!(project.config_tree(ResourceType::Model, true)["shop"]["+materialized"], "table");
    }

    #[test]
    fn loads_installed_packages_and_scopes_vars() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            PROJECT_FILE,
            "name: shop\nvars:\n  region: eu\n  utils:\n    region: us\n",
        );
        write(dir.path(), PACKAGES_FILE, "packages:\n  - package: acme/utils\n    version: 1.0.0\n");
        write(dir.path(), "dbt_packages/utils/dbt_project.yml", "name: utils\nrestrict-access: true\n");

        let cfg = config(dir.path());
        let tree = ProjectTree::load(&cfg).unwrap();
        assert_eq!(tree.dependencies.keys().collect::<Vec<_>>(), vec!["utils"]);
        assert_eq!(tree.restricted_packages(), vec!["utils"]);
        assert_eq!(tree.vars_for("utils", &cfg.vars)["region"], "us");
        assert_eq!(tree.vars_for("shop", &cfg.vars)["region"], "eu");
        assert!(!tree.vars_for("shop", &cfg.vars).contains_key("utils"));
    }

    #[test]
    fn declared_package_must_be_installed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), PROJECT_FILE, "name: shop\n");
        write(dir.path(), PACKAGES_FILE, "packages:\n  - git: https://example.com/acme/metrics.git\n");

        let err = ProjectTree::load(&config(dir.path())).unwrap_err();
        assert!(matches!(err, ParseError::PackageNotInstalled { ref name, .. } if name == "metrics"));
        assert_eq!(err.code(), DiagnosticCode::PackageNotInstalled);
    }

    #[test]
    fn stale_lock_file_warns() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), PROJECT_FILE, "name: shop\n");
        write(dir.path(), PACKAGES_FILE, "packages: []\n");
        write(dir.path(), LOCK_FILE, "packages: []\nsha1_hash: abc\n");

        let tree = ProjectTree::load(&config(dir.path())).unwrap();
        assert_eq!(tree.diagnostics.len(), 1);
        assert!(!tree.diagnostics[0].is_error());
    }

    #[test]
    fn state_check_tracks_vars() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), PROJECT_FILE, "name: shop\n");
        let mut cfg = config(dir.path());
        let tree = ProjectTree::load(&cfg).unwrap();
        let before = tree.state_check(&cfg);
        cfg.vars.insert("x".to_string(), Value::from(1));
        let after = tree.state_check(&cfg);
        assert_eq!(after.mismatch(&before), Some("vars changed"));
    }
}
