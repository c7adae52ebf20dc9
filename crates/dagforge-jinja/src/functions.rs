//! Built-in template functions
//!
//! `var()`, `env_var()`, `log()` and the no-op `config()`. Functions that
//! need state are built by factories that capture it.

use minijinja::value::Rest;
use minijinja::{Error, ErrorKind, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Message prefix used when `env_var()` has no value and no default
pub const ENV_VAR_MISSING: &str = "Env var required but not provided";

/// Records every environment variable read through `env_var()`
#[derive(Debug, Clone, Default)]
pub struct EnvVarRecorder {
    seen: Arc<Mutex<BTreeMap<String, String>>>,
}

impl EnvVarRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str, value: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(name.to_string(), value.to_string());
        }
    }

    /// Snapshot of the variables read so far, sorted by name
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

/// var() function factory
///
/// Usage in templates: `{{ var('name') }}` or `{{ var('name', 'default') }}`
pub fn var_function(
    vars: Arc<BTreeMap<String, serde_json::Value>>,
) -> impl Fn(String, Option<Value>) -> Result<Value, Error> + Send + Sync + 'static {
    move |name: String, default: Option<Value>| match vars.get(&name) {
        Some(value) => Ok(Value::from_serialize(value)),
        None => default.ok_or_else(|| {
            Error::new(
                ErrorKind::UndefinedError,
                format!("Required var '{}' not found in config", name),
            )
        }),
    }
}

/// env_var() function factory
///
/// Usage in templates: `{{ env_var('NAME') }}` or `{{ env_var('NAME', 'default') }}`
pub fn env_var_function(
    recorder: EnvVarRecorder,
) -> impl Fn(String, Option<String>) -> Result<Value, Error> + Send + Sync + 'static {
    move |name: String, default: Option<String>| match std::env::var(&name) {
        Ok(value) => {
            recorder.record(&name, &value);
            Ok(Value::from(value))
        }
        Err(_) => match default {
            Some(default) => {
                recorder.record(&name, &default);
                Ok(Value::from(default))
            }
            None => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("{}: '{}'", ENV_VAR_MISSING, name),
            )),
        },
    }
}

/// log() function - writes to the tracing log, renders as nothing
pub fn log_function(message: Value, info: Option<bool>) -> Result<Value, Error> {
    if info.unwrap_or(false) {
        tracing::info!(target: "dagforge::template", "{}", message);
    } else {
        tracing::debug!(target: "dagforge::template", "{}", message);
    }
    Ok(Value::from(""))
}

/// config() function - configuration is read statically, so rendering it
/// produces an empty string
pub fn config_function(_args: Rest<Value>) -> Result<Value, Error> {
    Ok(Value::from(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_lookup_and_default() {
        let mut vars = BTreeMap::new();
        vars.insert("start".to_string(), serde_json::json!("2020-01-01"));
        let var = var_function(Arc::new(vars));

        let found = var("start".to_string(), None).unwrap();
        assert_eq!(found.as_str(), Some("2020-01-01"));

        let defaulted = var("missing".to_string(), Some(Value::from("d"))).unwrap();
        assert_eq!(defaulted.as_str(), Some("d"));

        let err = var("missing".to_string(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedError);
    }

    #[test]
    fn env_var_records_reads() {
        let recorder = EnvVarRecorder::new();
        let env_var = env_var_function(recorder.clone());

        let value = env_var("DAGFORGE_TEST_SURELY_UNSET_VAR".to_string(), Some("fallback".to_string())).unwrap();
        assert_eq!(value.as_str(), Some("fallback"));
        assert_eq!(
            recorder.snapshot().get("DAGFORGE_TEST_SURELY_UNSET_VAR").map(String::as_str),
            Some("fallback")
        );

        let err = env_var("DAGFORGE_TEST_SURELY_UNSET_VAR".to_string(), None).unwrap_err();
        assert!(err.to_string().contains(ENV_VAR_MISSING));
    }

    #[test]
    fn log_renders_empty() {
        assert_eq!(log_function(Value::from("hi"), Some(true)).unwrap().as_str(), Some(""));
    }
}
