//! Secret scrubbing
//!
//! Values of environment variables whose names start with the configured
//! secret prefix must never reach the manifest or an error message.

use regex::Regex;

/// Replacement written in place of a secret value
pub const SCRUBBED: &str = "*****";

/// Replaces known secret values in strings
#[derive(Debug, Clone, Default)]
pub struct SecretScrubber {
    pattern: Option<Regex>,
}

impl SecretScrubber {
    /// Build from the current process environment
    pub fn from_env(prefix: &str) -> Self {
        Self::from_pairs(std::env::vars(), prefix)
    }

    /// Build from explicit `(name, value)` pairs
    pub fn from_pairs<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut secrets: Vec<String> = vars
            .into_iter()
            .filter(|(name, value)| !prefix.is_empty() && name.starts_with(prefix) && !value.is_empty())
            .map(|(_, value)| value)
            .collect();

        if secrets.is_empty() {
            return Self { pattern: None };
        }

        // Longest first so overlapping secrets scrub completely
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();

        let alternation = secrets
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");

        Self {
            pattern: Regex::new(&alternation).ok(),
        }
    }

    /// Whether any secret is registered
    pub fn is_active(&self) -> bool {
        self.pattern.is_some()
    }

    /// Scrub a string
    pub fn scrub(&self, text: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern.replace_all(text, SCRUBBED).into_owned(),
            None => text.to_string(),
        }
    }

    /// Scrub every string inside a JSON value, in place
    pub fn scrub_json(&self, value: &mut serde_json::Value) {
        if !self.is_active() {
            return;
        }
        match value {
            serde_json::Value::String(s) => {
                let scrubbed = self.scrub(s);
                *s = scrubbed;
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.scrub_json(item);
                }
            }
            serde_json::Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.scrub_json(item);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrubber() -> SecretScrubber {
        SecretScrubber::from_pairs(
            vec![
                ("DBT_ENV_SECRET_PASSWORD".to_string(), "hunter2".to_string()),
                ("DBT_USER".to_string(), "alice".to_string()),
            ],
            "DBT_ENV_SECRET_",
        )
    }

    #[test]
    fn scrubs_prefixed_values_only() {
        let s = scrubber();
        assert_eq!(s.scrub("password=hunter2 user=alice"), "password=***** user=alice");
    }

    #[test]
    fn scrubs_nested_json() {
        let s = scrubber();
        let mut value = serde_json::json!({"a": ["x hunter2 y"], "b": {"c": "hunter2"}});
        s.scrub_json(&mut value);
        assert_eq!(value, serde_json::json!({"a": ["x ***** y"], "b": {"c": "*****"}}));
    }

    #[test]
    fn inactive_without_secrets() {
        let s = SecretScrubber::from_pairs(Vec::new(), "DBT_ENV_SECRET_");
        assert!(!s.is_active());
        assert_eq!(s.scrub("hunter2"), "hunter2");
    }
}
