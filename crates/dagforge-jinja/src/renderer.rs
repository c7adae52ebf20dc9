//! Template rendering
//!
//! Renders templates to plain SQL with minijinja. The environment carries
//! `var()`, `env_var()`, `log()` and `config()`; callers add node-scoped
//! functions such as `ref()` through [`Renderer::env_mut`].

use crate::context::RenderContext;
use crate::error::JinjaError;
use crate::functions::{self, EnvVarRecorder, ENV_VAR_MISSING};
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Template renderer
pub struct Renderer {
    env: Environment<'static>,
    context: RenderContext,
    env_vars: EnvVarRecorder,
}

impl Renderer {
    /// Create a renderer for the given context
    pub fn new(context: RenderContext) -> Self {
        let env_vars = EnvVarRecorder::new();
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_function("var", functions::var_function(Arc::new(context.vars.clone())));
        env.add_function("env_var", functions::env_var_function(env_vars.clone()));
        env.add_function("log", functions::log_function);
        env.add_function("config", functions::config_function);

        env.add_filter("as_bool", |value: Value| -> bool {
            match value.as_str() {
                Some(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
                None => value.is_true(),
            }
        });
        env.add_filter("as_number", |value: Value| -> Value {
            match value.as_str().and_then(|s| s.trim().parse::<f64>().ok()) {
                Some(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::from(n as i64),
                Some(n) => Value::from(n),
                None => value,
            }
        });

        Self { env, context, env_vars }
    }

    /// Renderer with a default context
    pub fn with_defaults() -> Self {
        Self::new(RenderContext::default())
    }

    /// Check if text contains template markup
    pub fn has_jinja(sql: &str) -> bool {
        sql.contains("{{") || sql.contains("{%") || sql.contains("{#")
    }

    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// Environment access for registering node-scoped functions and globals
    pub fn env_mut(&mut self) -> &mut Environment<'static> {
        &mut self.env
    }

    /// Environment variables read so far
    pub fn env_vars_used(&self) -> BTreeMap<String, String> {
        self.env_vars.snapshot()
    }

    /// Render a template with the base context
    pub fn render(&self, sql: &str, file_path: Option<&str>) -> Result<String, JinjaError> {
        self.render_with(sql, BTreeMap::new(), file_path)
    }

    /// Render a template with extra top-level values layered over the base context
    pub fn render_with(
        &self,
        sql: &str,
        extra: BTreeMap<String, Value>,
        file_path: Option<&str>,
    ) -> Result<String, JinjaError> {
        if !Self::has_jinja(sql) {
            return Ok(sql.to_string());
        }
        let ctx = self.build_context(extra);
        self.env
            .render_str(sql, ctx)
            .map_err(|e| convert_error(e, file_path))
    }

    /// Evaluate a single expression, e.g. a non-literal `config()` argument
    pub fn eval_expression(&self, expression: &str) -> Result<serde_json::Value, JinjaError> {
        let compiled = self
            .env
            .compile_expression(expression)
            .map_err(|e| JinjaError::InvalidExpression(format!("{}: {}", expression, e)))?;
        let value = compiled
            .eval(self.build_context(BTreeMap::new()))
            .map_err(|e| convert_error(e, None))?;
        serde_json::to_value(&value).map_err(|e| JinjaError::Render {
            message: e.to_string(),
            file_path: None,
        })
    }

    fn build_context(&self, extra: BTreeMap<String, Value>) -> Value {
        let mut map: BTreeMap<String, Value> = BTreeMap::new();
        map.insert("target".to_string(), Value::from_serialize(&self.context.target));
        for (key, value) in &self.context.values {
            map.insert(key.clone(), Value::from_serialize(value));
        }
        map.extend(extra);
        Value::from(map)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Convert a MiniJinja error to a template error
fn convert_error(error: minijinja::Error, file_path: Option<&str>) -> JinjaError {
    let mut message = error.to_string();
    if let Some(line) = error.line() {
        message = format!("{} (line {})", message, line);
    }
    let file_path = file_path.map(str::to_string);

    if let Some(pos) = message.find(ENV_VAR_MISSING) {
        let name = extract_quoted(&message[pos..]).unwrap_or_default();
        return JinjaError::EnvVarMissing(name);
    }

    if error.kind() == ErrorKind::UndefinedError {
        let name = extract_quoted(&message).unwrap_or_else(|| message.clone());
        return JinjaError::UndefinedVariable { name, file_path };
    }

    JinjaError::Render { message, file_path }
}

/// First single-quoted word in a message
fn extract_quoted(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let end = message[start + 1..].find('\'')?;
    Some(message[start + 1..start + 1 + end].to_string())
}
