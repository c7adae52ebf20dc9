//! File discovery
//!
//! Walks the configured directories of each package and classifies every
//! file by how it is parsed.

use crate::error::ParseError;
use crate::project::Project;
use dagforge_core::FileHash;
use dagforge_manifest::{file_id, ParseFileType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// A project file ready to be parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub package_name: String,
    /// Path relative to the package root, `/`-separated
    pub path: String,
    /// Configured directory the file was found under, e.g. `models`
    pub search_root: String,
    pub parse_file_type: ParseFileType,
    pub contents: String,
    pub checksum: FileHash,
}

impl SourceFile {
    pub fn new(
        package_name: impl Into<String>,
        path: impl Into<String>,
        search_root: impl Into<String>,
        parse_file_type: ParseFileType,
        contents: impl Into<String>,
    ) -> Self {
        let contents = contents.into();
        Self {
            package_name: package_name.into(),
            path: path.into(),
            search_root: search_root.into(),
            parse_file_type,
            checksum: FileHash::from_contents(&contents),
            contents,
        }
    }

    /// `package://path`
    pub fn file_id(&self) -> String {
        file_id(&self.package_name, &self.path)
    }

    /// Path below the search root: `staging/orders.sql`
    pub fn relative_path(&self) -> &str {
        self.path
            .strip_prefix(&self.search_root)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(&self.path)
    }

    /// Directories between the search root and the file
    pub fn subdirectories(&self) -> Vec<String> {
        let rel = self.relative_path();
        let mut parts: Vec<String> = rel.split('/').map(str::to_string).collect();
        parts.pop();
        parts
    }

    /// File name without extension
    pub fn stem(&self) -> &str {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
    }

    pub fn extension(&self) -> &str {
        self.path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }
}

/// Read one file of a package
pub fn read_source_file(
    package_root: &Path,
    package_name: &str,
    path: &str,
    search_root: &str,
    parse_file_type: ParseFileType,
) -> Result<SourceFile, ParseError> {
    let full = package_root.join(path);
    let bytes = std::fs::read(&full).map_err(|e| ParseError::io(full.display().to_string(), e))?;
    let mut file = SourceFile::new(
        package_name,
        path,
        search_root,
        parse_file_type,
        String::from_utf8_lossy(&bytes).into_owned(),
    );
    file.checksum = FileHash::from_contents(&bytes);
    Ok(file)
}

/// Classify a path found under one of the project's configured directories
pub fn classify(project: &Project, search_root: &str, relative: &str) -> Option<ParseFileType> {
    let file = &project.file;
    let ext = relative.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase())?;
    let is = |dirs: &[String]| dirs.iter().any(|d| d == search_root);

    if matches!(ext.as_str(), "yml" | "yaml") {
        let property_dirs = [
            &file.model_paths,
            &file.seed_paths,
            &file.snapshot_paths,
            &file.macro_paths,
            &file.test_paths,
            &file.analysis_paths,
        ];
        return property_dirs.iter().any(|d| is(d)).then_some(ParseFileType::Schema);
    }
    if ext == "md" {
        let docs_dirs = file.docs_paths.clone().unwrap_or_else(|| {
            [&file.model_paths, &file.seed_paths, &file.snapshot_paths, &file.macro_paths, &file.test_paths, &file.analysis_paths]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        });
        return is(&docs_dirs).then_some(ParseFileType::Documentation);
    }

    if is(&file.model_paths) && matches!(ext.as_str(), "sql" | "py") {
        return Some(ParseFileType::Model);
    }
    if is(&file.seed_paths) && ext == "csv" {
        return Some(ParseFileType::Seed);
    }
    if is(&file.snapshot_paths) && ext == "sql" {
        return Some(ParseFileType::Snapshot);
    }
    if is(&file.macro_paths) && ext == "sql" {
        return Some(ParseFileType::Macro);
    }
    if is(&file.test_paths) {
        if relative.starts_with("generic/") && ext == "sql" {
            return Some(ParseFileType::GenericTest);
        }
        if relative.starts_with("fixtures/") && matches!(ext.as_str(), "csv" | "sql") {
            return Some(ParseFileType::Fixture);
        }
        if ext == "sql" {
            return Some(ParseFileType::SingularTest);
        }
    }
    if is(&file.analysis_paths) && ext == "sql" {
        return Some(ParseFileType::Analysis);
    }
    None
}

/// Every parseable file of a package, sorted by path
pub fn discover(project: &Project) -> Result<Vec<SourceFile>, ParseError> {
    let file = &project.file;
    let mut roots: Vec<&String> = [
        &file.model_paths,
        &file.seed_paths,
        &file.snapshot_paths,
        &file.macro_paths,
        &file.test_paths,
        &file.analysis_paths,
    ]
    .into_iter()
    .flatten()
    .chain(file.docs_paths.iter().flatten())
    .collect();
    roots.sort();
    roots.dedup();

    let mut found: BTreeMap<String, SourceFile> = BTreeMap::new();
    for search_root in roots {
        let dir = project.root.join(search_root);
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            let Some(parse_file_type) = classify(project, search_root, &relative) else {
                continue;
            };
            let path = format!("{}/{}", search_root.trim_end_matches('/'), relative);
            if found.contains_key(&path) {
                continue;
            }
            let source = read_source_file(&project.root, project.name(), &path, search_root, parse_file_type)?;
            found.insert(path, source);
        }
    }

    tracing::debug!(package = %project.name(), files = found.len(), "Discovered project files");
    Ok(found.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::TargetConfig;
    use std::fs;

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, text) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        let project = Project::load(dir.path(), &TargetConfig::default(), &BTreeMap::new()).unwrap();
        (dir, project)
    }

    #[test]
    fn classifies_by_directory_and_extension() {
        let (_dir, project) = project(&[
            ("dbt_project.yml", "name: shop\n"),
            ("models/staging/stg_orders.sql", "select 1"),
            ("models/staging/schema.yml", "version: 2"),
            ("models/forecast.py", "def model(dbt, session):\n    return 1\n"),
            ("models/overview.md", "{% docs overview %}x{% enddocs %}"),
            ("models/.hidden/skip.sql", "select 1"),
            ("seeds/countries.csv", "code\nNZ\n"),
            ("macros/cents.sql", "{% macro cents(x) %}{{ x }}{% endmacro %}"),
            ("tests/generic/positive.sql", "{% test positive(model) %}{% endtest %}"),
            ("tests/assert_total.sql", "select 1"),
            ("tests/fixtures/orders.csv", "id\n1\n"),
            ("snapshots/orders_snapshot.sql", "{% snapshot s %}{% endsnapshot %}"),
            ("analyses/adhoc.sql", "select 1"),
            ("models/notes.txt", "ignored"),
        ]);

        let files = discover(&project).unwrap();
        let kinds: Vec<(&str, ParseFileType)> = files.iter().map(|f| (f.path.as_str(), f.parse_file_type)).collect();
        assert_eq!(
            kinds,
            vec![
                ("analyses/adhoc.sql", ParseFileType::Analysis),
                ("macros/cents.sql", ParseFileType::Macro),
                ("models/forecast.py", ParseFileType::Model),
                ("models/overview.md", ParseFileType::Documentation),
                ("models/staging/schema.yml", ParseFileType::Schema),
                ("models/staging/stg_orders.sql", ParseFileType::Model),
                ("seeds/countries.csv", ParseFileType::Seed),
                ("snapshots/orders_snapshot.sql", ParseFileType::Snapshot),
                ("tests/assert_total.sql", ParseFileType::SingularTest),
                ("tests/fixtures/orders.csv", ParseFileType::Fixture),
                ("tests/generic/positive.sql", ParseFileType::GenericTest),
            ]
        );
    }

    #[test]
    fn path_helpers() {
        let file = SourceFile::new("shop", "models/staging/stg_orders.sql", "models", ParseFileType::Model, "select 1");
        assert_eq!(file.relative_path(), "staging/stg_orders.sql");
        assert_eq!(file.subdirectories(), vec!["staging"]);
        assert_eq!(file.stem(), "stg_orders");
        assert_eq!(file.file_id(), "shop://models/staging/stg_orders.sql");
        assert_eq!(file.checksum, FileHash::from_contents("select 1"));
    }
}
