//! Saved parse results (`target/partial_parse.json`)

use dagforge_core::{Diagnostic, DiagnosticCode};
use dagforge_manifest::ManifestStateCheck;
use dagforge_parser::ParsedFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name under the target directory
pub const PARTIAL_PARSE_FILE: &str = "partial_parse.json";

/// Bumped whenever [`SavedParse`] changes shape
pub const PARTIAL_PARSE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PartialParseError {
    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("Saved parse at {path} is unreadable: {message}")]
    Corrupt { path: String, message: String },
}

impl PartialParseError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(DiagnosticCode::InternalError, self.to_string())
    }
}

/// Everything needed to reuse unchanged files in a later invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedParse {
    pub version: u32,
    pub state_check: ManifestStateCheck,
    /// Parsed files keyed by file id; each carries its own checksum
    pub files: BTreeMap<String, ParsedFile>,
}

impl SavedParse {
    pub fn new(state_check: ManifestStateCheck, files: impl IntoIterator<Item = ParsedFile>) -> Self {
        Self {
            version: PARTIAL_PARSE_VERSION,
            state_check,
            files: files.into_iter().map(|f| (f.record.file_id(), f)).collect(),
        }
    }

    pub fn path_in(target_dir: &Path) -> PathBuf {
        target_dir.join(PARTIAL_PARSE_FILE)
    }

    /// Load a saved parse; `Ok(None)` when there is none yet
    pub fn load(path: &Path) -> Result<Option<Self>, PartialParseError> {
        let display = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PartialParseError::Read {
                    path: display,
                    message: e.to_string(),
                })
            }
        };
        let saved: SavedParse = serde_json::from_str(&text).map_err(|e| PartialParseError::Corrupt {
            path: display.clone(),
            message: e.to_string(),
        })?;
        if saved.version != PARTIAL_PARSE_VERSION {
            return Err(PartialParseError::Corrupt {
                path: display,
                message: format!("version {} is not {}", saved.version, PARTIAL_PARSE_VERSION),
            });
        }
        Ok(Some(saved))
    }

    pub fn write(&self, path: &Path) -> Result<(), PartialParseError> {
        let path_str = path.display().to_string();
        let write_err = |e: &dyn std::fmt::Display| PartialParseError::Write {
            path: path_str.clone(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(&e))?;
        }
        let json = serde_json::to_string(self).map_err(|e| write_err(&e))?;
        std::fs::write(path, json).map_err(|e| write_err(&e))?;
        tracing::debug!(path = %path_str, files = self.files.len(), "Saved parse results");
        Ok(())
    }

    /// Why this saved parse cannot be used under `current`, if it cannot
    pub fn rejection(&self, current: &ManifestStateCheck) -> Option<&'static str> {
        self.state_check.mismatch(current)
    }

    /// A saved result for `file_id` whose checksum matches, unless the file
    /// read environment variables (those are always re-parsed)
    pub fn reusable(&self, file_id: &str, checksum: &dagforge_core::FileHash) -> Option<&ParsedFile> {
        self.files
            .get(file_id)
            .filter(|saved| &saved.record.checksum == checksum && !saved.reads_env_vars())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::FileHash;
    use dagforge_manifest::{FileRecord, ParseFileType};

    fn parsed(path: &str, contents: &str) -> ParsedFile {
        let record = FileRecord::new("shop", path, ParseFileType::Model, FileHash::from_contents(contents));
        ParsedFile {
            record,
            subdirectories: Vec::new(),
            nodes: Vec::new(),
            macros: Vec::new(),
            docs: Vec::new(),
            properties: None,
            diagnostics: Vec::new(),
            sampling: Vec::new(),
        }
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SavedParse::load(&SavedParse::path_in(dir.path())).unwrap().is_none());
    }

    #[test]
    fn written_parse_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = SavedParse::path_in(&dir.path().join("target"));
        let saved = SavedParse::new(ManifestStateCheck::default(), [parsed("models/a.sql", "select 1")]);
        saved.write(&path).unwrap();

        let loaded = SavedParse::load(&path).unwrap().unwrap();
        assert_eq!(loaded.files.len(), 1);
        assert!(loaded
            .reusable("shop://models/a.sql", &FileHash::from_contents("select 1"))
            .is_some());
        assert!(loaded
            .reusable("shop://models/a.sql", &FileHash::from_contents("select 2"))
            .is_none());
    }

    #[test]
    fn env_var_readers_are_never_reused() {
        let mut file = parsed("models/a.sql", "select 1");
        file.record.env_vars.push("WAREHOUSE".to_string());
        let saved = SavedParse::new(ManifestStateCheck::default(), [file]);
        assert!(saved
            .reusable("shop://models/a.sql", &FileHash::from_contents("select 1"))
            .is_none());
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = SavedParse::path_in(dir.path());
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SavedParse::load(&path),
            Err(PartialParseError::Corrupt { .. })
        ));
    }
}
