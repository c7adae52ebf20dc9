//! Per-file records and the global state check

use dagforge_core::FileHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a file is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFileType {
    Model,
    Seed,
    Snapshot,
    Analysis,
    SingularTest,
    GenericTest,
    Macro,
    Documentation,
    Schema,
    Fixture,
}

impl ParseFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseFileType::Model => "model",
            ParseFileType::Seed => "seed",
            ParseFileType::Snapshot => "snapshot",
            ParseFileType::Analysis => "analysis",
            ParseFileType::SingularTest => "singular_test",
            ParseFileType::GenericTest => "generic_test",
            ParseFileType::Macro => "macro",
            ParseFileType::Documentation => "documentation",
            ParseFileType::Schema => "schema",
            ParseFileType::Fixture => "fixture",
        }
    }

    /// Files whose records are macros; these are parsed before everything else
    pub fn defines_macros(&self) -> bool {
        matches!(self, ParseFileType::Macro | ParseFileType::GenericTest)
    }
}

/// One parsed file and the ids it contributed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub package_name: String,

    /// Path relative to the package root
    pub path: String,

    pub parse_file_type: ParseFileType,

    pub checksum: FileHash,

    /// Unique ids of every resource defined in this file
    #[serde(default)]
    pub contributed: Vec<String>,

    /// Unique ids of nodes patched by this (YAML) file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,

    /// Environment variables read while parsing the file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<String>,
}

impl FileRecord {
    pub fn new(
        package_name: impl Into<String>,
        path: impl Into<String>,
        parse_file_type: ParseFileType,
        checksum: FileHash,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            path: path.into(),
            parse_file_type,
            checksum,
            contributed: Vec::new(),
            patches: Vec::new(),
            env_vars: Vec::new(),
        }
    }

    /// Key under which the record is stored: `<package>://<path>`
    pub fn file_id(&self) -> String {
        file_id(&self.package_name, &self.path)
    }

    pub fn add_contributed(&mut self, unique_id: impl Into<String>) {
        let id = unique_id.into();
        if !self.contributed.contains(&id) {
            self.contributed.push(id);
        }
    }
}

pub fn file_id(package_name: &str, path: &str) -> String {
    format!("{}://{}", package_name, path)
}

/// Global hashes that decide whether a partial parse is allowed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStateCheck {
    /// Canonical JSON of CLI and project vars
    pub vars_hash: FileHash,

    /// Target identity
    pub profile_hash: FileHash,

    /// Sorted env vars read while rendering project and YAML files
    pub project_env_vars_hash: FileHash,

    /// Project file of each package, keyed by package name
    #[serde(default)]
    pub project_hashes: BTreeMap<String, FileHash>,
}

impl ManifestStateCheck {
    /// First global hash that differs from `previous`, if any
    pub fn mismatch(&self, previous: &ManifestStateCheck) -> Option<&'static str> {
        if self.vars_hash != previous.vars_hash {
            return Some("vars changed");
        }
        if self.profile_hash != previous.profile_hash {
            return Some("profile changed");
        }
        if self.project_env_vars_hash != previous.project_env_vars_hash {
            return Some("env vars used in project files changed");
        }
        if self.project_hashes.len() != previous.project_hashes.len()
            || self
                .project_hashes
                .iter()
                .any(|(pkg, hash)| previous.project_hashes.get(pkg) != Some(hash))
        {
            return Some("project files changed");
        }
        None
    }
}
