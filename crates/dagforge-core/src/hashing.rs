//! Content hashing
//!
//! Every parsed file and node carries a [`FileHash`]. Hashes drive
//! incremental re-parse and state comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded sha256 of `bytes`
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// A named content hash
///
/// A hash named `none` never compares equal to anything, itself included,
/// so resources without real content are always treated as changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHash {
    /// Algorithm name: `sha256`, or `none`
    pub name: String,

    /// Hex digest
    pub checksum: String,
}

impl FileHash {
    /// A hash that matches nothing
    pub fn empty() -> Self {
        Self {
            name: "none".to_string(),
            checksum: String::new(),
        }
    }

    /// sha256 of file contents
    pub fn from_contents(contents: impl AsRef<[u8]>) -> Self {
        Self {
            name: "sha256".to_string(),
            checksum: sha256_hex(contents),
        }
    }

    /// Read and hash a file
    pub fn from_path(path: &std::path::Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_contents(bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.name == "none"
    }
}

impl PartialEq for FileHash {
    fn eq(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.name == other.name && self.checksum == other.checksum
    }
}

impl Default for FileHash {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn equal_contents_hash_equal() {
        assert_eq!(FileHash::from_contents("select 1"), FileHash::from_contents("select 1"));
        assert_ne!(FileHash::from_contents("select 1"), FileHash::from_contents("select 2"));
    }

    #[test]
    fn none_never_equal() {
        let empty = FileHash::empty();
        assert_ne!(empty, empty.clone());
        assert_ne!(empty, FileHash::from_contents(""));
    }
}
