//! Configuration schema (dagforge.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quoting policy applied when rendering relation names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotingPolicy {
    #[serde(default = "default_true")]
    pub database: bool,

    #[serde(default = "default_true")]
    pub schema: bool,

    #[serde(default = "default_true")]
    pub identifier: bool,
}

impl Default for QuotingPolicy {
    fn default() -> Self {
        Self {
            database: true,
            schema: true,
            identifier: true,
        }
    }
}

/// Active adapter profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name (dev, prod, ...)
    #[serde(default = "default_target_name")]
    pub name: String,

    /// Adapter type, e.g. `postgres`
    #[serde(rename = "type", default = "default_adapter_type")]
    pub adapter_type: String,

    /// Adapter inheritance chain after `adapter_type`, before `default`
    #[serde(default)]
    pub parent_adapters: Vec<String>,

    /// Default database
    #[serde(default)]
    pub database: Option<String>,

    /// Default schema
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Quoting policy for relation names
    #[serde(default)]
    pub quoting: QuotingPolicy,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: default_target_name(),
            adapter_type: default_adapter_type(),
            parent_adapters: Vec::new(),
            database: None,
            schema: default_schema(),
            quoting: QuotingPolicy::default(),
        }
    }
}

impl TargetConfig {
    /// Adapter chain used for materialization dispatch: the adapter, its
    /// parents, then `default`.
    pub fn adapter_chain(&self) -> Vec<String> {
        let mut chain = vec![self.adapter_type.clone()];
        for parent in &self.parent_adapters {
            if !chain.contains(parent) {
                chain.push(parent.clone());
            }
        }
        if !chain.iter().any(|a| a == "default") {
            chain.push("default".to_string());
        }
        chain
    }
}

/// Behaviour flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsConfig {
    /// Refuse imported-package overrides of built-in materializations
    #[serde(default)]
    pub require_explicit_package_overrides_for_builtin_materializations: bool,

    /// Treat duplicate unversioned names across packages as errors
    #[serde(default)]
    pub require_unambiguous_ref: bool,

    /// Run the fast static extractor beside the inspector and log agreement
    #[serde(default)]
    pub sample_static_parser: bool,

    /// Reuse unchanged files from `partial_parse.json`
    #[serde(default = "default_true")]
    pub partial_parse: bool,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            require_explicit_package_overrides_for_builtin_materializations: false,
            require_unambiguous_ref: false,
            sample_static_parser: false,
            partial_parse: true,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool size
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Stop scheduling new work after the first failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Per-task timeout in seconds
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    /// Active adapter profile
    #[serde(default)]
    pub target: TargetConfig,

    /// Behaviour flags
    #[serde(default)]
    pub flags: FlagsConfig,

    /// Environment variables with this prefix are scrubbed from output
    #[serde(default = "default_secret_prefix")]
    pub secret_env_prefix: String,

    /// Output directory, relative to the project root
    #[serde(default = "default_target_path")]
    pub target_path: String,

    /// Variables that override project `vars:`
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            fail_fast: false,
            task_timeout_secs: None,
            target: TargetConfig::default(),
            flags: FlagsConfig::default(),
            secret_env_prefix: default_secret_prefix(),
            target_path: default_target_path(),
            vars: BTreeMap::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Absolute target directory
    pub fn target_dir(&self) -> std::path::PathBuf {
        self.project_root.join(&self.target_path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be at least 1".to_string()));
        }
        if self.target.adapter_type.is_empty() {
            return Err(ConfigError::InvalidValue("target.type must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_threads() -> usize {
    4
}

fn default_target_name() -> String {
    "dev".to_string()
}

fn default_adapter_type() -> String {
    "postgres".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_secret_prefix() -> String {
    "DBT_ENV_SECRET_".to_string()
}

fn default_target_path() -> String {
    "target".to_string()
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.threads, 4);
        assert_eq!(config.target.adapter_type, "postgres");
        assert_eq!(config.secret_env_prefix, "DBT_ENV_SECRET_");
        assert!(config.flags.partial_parse);
    }

    #[test]
    fn parse_toml() {
        let config = Config::from_toml(
            r#"
            threads = 8
            fail_fast = true

            [target]
            type = "redshift"
            parent_adapters = ["postgres"]
            schema = "analytics"

            [flags]
            require_unambiguous_ref = true
            "#,
        )
        .unwrap();

        assert_eq!(config.threads, 8);
        assert!(config.fail_fast);
        assert!(config.flags.require_unambiguous_ref);
        assert_eq!(config.target.adapter_chain(), vec!["redshift", "postgres", "default"]);
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(Config::from_toml("threads = 0").is_err());
    }

    #[test]
    fn config_toml_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config.target, parsed.target);
        assert_eq!(config.flags, parsed.flags);
    }
}
