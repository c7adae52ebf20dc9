//! Static template inspection
//!
//! Walks a parsed template without rendering it and collects the facts the
//! node parser needs: `ref()` and `source()` targets, `config()` arguments,
//! possible macro calls, and whether `this` is used.

use crate::ast::{Expr, Stmt, Template};
use crate::error::JinjaError;
use crate::parser::parse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Context members and Jinja globals that are never macro calls
pub const BUILTIN_NAMES: &[&str] = &[
    "ref", "source", "config", "var", "env_var", "log", "return", "this", "target", "adapter",
    "modules", "exceptions", "fromjson", "tojson", "fromyaml", "toyaml", "zip", "set",
    "set_strict", "print", "run_query", "statement", "load_result", "store_result",
    "store_raw_result", "execute", "graph", "model", "caller", "varargs", "kwargs", "loop",
    "super", "self", "range", "dict", "lipsum", "cycler", "joiner", "namespace", "api",
    "invocation_id", "run_started_at", "flags", "local_md5", "diff_of_two_dicts", "is_incremental",
];

/// Default in-scope set: the builtin context names
pub fn default_scope() -> BTreeSet<String> {
    BUILTIN_NAMES.iter().map(|s| s.to_string()).collect()
}

/// A statically extracted `ref()` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RefCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            package: None,
            name: name.into(),
            version: None,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl std::fmt::Display for RefCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.package {
            Some(pkg) => write!(f, "ref('{}', '{}'", pkg, self.name)?,
            None => write!(f, "ref('{}'", self.name)?,
        }
        if let Some(v) = &self.version {
            write!(f, ", version={}", v)?;
        }
        f.write_str(")")
    }
}

/// A statically extracted `source()` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceCall {
    pub source_name: String,
    pub table_name: String,
}

/// An `adapter.dispatch(...)` call site
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchCall {
    pub macro_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A `config()` argument: either a literal or the source text of an expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    Literal(serde_json::Value),
    Expression(String),
}

impl ConfigValue {
    pub fn as_literal(&self) -> Option<&serde_json::Value> {
        match self {
            ConfigValue::Literal(v) => Some(v),
            ConfigValue::Expression(_) => None,
        }
    }
}

/// Everything the inspector learns about a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateFacts {
    pub refs: Vec<RefCall>,
    pub sources: Vec<SourceCall>,
    /// `config()` arguments in call order
    pub configs: Vec<(String, ConfigValue)>,
    /// Possible macro calls, deduplicated, first-seen order
    pub macro_calls: Vec<String>,
    /// Dispatch call sites; their names also appear in `macro_calls`
    pub dispatch_calls: Vec<DispatchCall>,
    pub references_this: bool,
    /// `ref()`/`source()` calls whose arguments are not literals
    pub dynamic_calls: Vec<String>,
}

impl TemplateFacts {
    /// Last literal or expression given for `key`
    pub fn config(&self, key: &str) -> Option<&ConfigValue> {
        self.configs.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn push_macro_call(&mut self, name: String) {
        if !self.macro_calls.contains(&name) {
            self.macro_calls.push(name);
        }
    }
}

/// Parse and inspect a template
pub fn inspect(source: &str, in_scope: &BTreeSet<String>) -> Result<TemplateFacts, JinjaError> {
    let template = parse(source)?;
    inspect_template(&template, source, in_scope)
}

/// Inspect an already parsed template. `source` must be the text it was
/// parsed from; expression fragments are sliced out of it.
pub fn inspect_template(
    template: &Template,
    source: &str,
    in_scope: &BTreeSet<String>,
) -> Result<TemplateFacts, JinjaError> {
    let mut locals = BTreeSet::new();
    collect_locals(&template.body, &mut locals);

    let mut inspector = Inspector {
        source,
        in_scope,
        locals: &locals,
        facts: TemplateFacts::default(),
        error: None,
    };
    template.walk_exprs(&mut |expr| inspector.visit(expr));

    if let Some(err) = inspector.error {
        return Err(err);
    }
    Ok(inspector.facts)
}

/// Names bound inside the template: set/for targets, macro names and params,
/// imports
fn collect_locals(body: &[Stmt], out: &mut BTreeSet<String>) {
    fn bind(target: &Expr, out: &mut BTreeSet<String>) {
        match target {
            Expr::Name(name, _) => {
                out.insert(name.clone());
            }
            Expr::Tuple(items, _) => items.iter().for_each(|item| bind(item, out)),
            _ => {}
        }
    }

    for stmt in body {
        match stmt {
            Stmt::Set { target, .. } | Stmt::SetBlock { target, .. } | Stmt::For { target, .. } => {
                bind(target, out)
            }
            Stmt::With { assignments, .. } => assignments.iter().for_each(|(t, _)| bind(t, out)),
            Stmt::Macro { name, params, .. } => {
                out.insert(name.clone());
                out.extend(params.iter().map(|p| p.name.clone()));
            }
            Stmt::CallBlock { params, .. } | Stmt::Resource { params, .. } => {
                out.extend(params.iter().map(|p| p.name.clone()));
            }
            Stmt::Import { alias, .. } => {
                out.insert(alias.clone());
            }
            Stmt::FromImport { names, .. } => {
                for (name, alias) in names {
                    out.insert(alias.clone().unwrap_or_else(|| name.clone()));
                }
            }
            _ => {}
        }
        for nested in stmt.bodies() {
            collect_locals(nested, out);
        }
    }
}

struct Inspector<'a> {
    source: &'a str,
    in_scope: &'a BTreeSet<String>,
    locals: &'a BTreeSet<String>,
    facts: TemplateFacts,
    error: Option<JinjaError>,
}

impl<'a> Inspector<'a> {
    fn is_scoped(&self, name: &str) -> bool {
        self.in_scope.contains(name) || self.locals.contains(name)
    }

    fn visit(&mut self, expr: &Expr) {
        if self.error.is_some() {
            return;
        }
        match expr {
            Expr::Name(name, _) if name == "this" => self.facts.references_this = true,
            Expr::Call { func, args, .. } => match func.as_ref() {
                Expr::Name(name, _) => match name.as_str() {
                    "ref" => self.visit_ref(expr, args),
                    "source" => self.visit_source(expr, args),
                    "config" => self.visit_config(args),
                    other if self.is_scoped(other) => {}
                    other => self.facts.push_macro_call(other.to_string()),
                },
                Expr::GetAttr { value, attr, .. } => {
                    let Expr::Name(owner, _) = value.as_ref() else {
                        return;
                    };
                    if owner == "adapter" {
                        if attr == "dispatch" {
                            if let Err(err) = self.visit_dispatch(args) {
                                self.error = Some(err);
                            }
                        }
                        return;
                    }
                    if self.is_scoped(owner) {
                        return;
                    }
                    self.facts.push_macro_call(format!("{}.{}", owner, attr));
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn visit_ref(&mut self, call: &Expr, args: &crate::ast::CallArgs) {
        let positional: Option<Vec<&str>> = args.args.iter().map(Expr::as_str_const).collect();
        let version = args.kwarg("version").or_else(|| args.kwarg("v"));
        let version = match version {
            None => Ok(None),
            Some(expr) => match expr.to_literal_json() {
                Some(serde_json::Value::String(s)) => Ok(Some(s)),
                Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
                _ => Err(()),
            },
        };
        let other_kwargs = args.kwargs.iter().any(|(k, _)| k != "version" && k != "v");

        let ref_call = match (positional.as_deref(), version) {
            _ if other_kwargs || args.dyn_args.is_some() || args.dyn_kwargs.is_some() => None,
            (Some([name]), Ok(version)) => Some(RefCall {
                package: None,
                name: name.to_string(),
                version,
            }),
            (Some([package, name]), Ok(version)) => Some(RefCall {
                package: Some(package.to_string()),
                name: name.to_string(),
                version,
            }),
            _ => None,
        };

        match ref_call {
            Some(r) => {
                if !self.facts.refs.contains(&r) {
                    self.facts.refs.push(r);
                }
            }
            None => self.facts.dynamic_calls.push(call.span().slice(self.source).to_string()),
        }
    }

    fn visit_source(&mut self, call: &Expr, args: &crate::ast::CallArgs) {
        let positional: Option<Vec<&str>> = args.args.iter().map(Expr::as_str_const).collect();
        match positional.as_deref() {
            Some([source_name, table_name]) if args.kwargs.is_empty() => {
                let s = SourceCall {
                    source_name: source_name.to_string(),
                    table_name: table_name.to_string(),
                };
                if !self.facts.sources.contains(&s) {
                    self.facts.sources.push(s);
                }
            }
            _ => self.facts.dynamic_calls.push(call.span().slice(self.source).to_string()),
        }
    }

    fn visit_config(&mut self, args: &crate::ast::CallArgs) {
        let push_pair = |facts: &mut TemplateFacts, key: String, value: &Expr, source: &str| {
            let value = match value.to_literal_json() {
                Some(literal) => ConfigValue::Literal(literal),
                None => ConfigValue::Expression(value.span().slice(source).to_string()),
            };
            facts.configs.push((key, value));
        };

        // config({'materialized': 'table'}) and config(**{...})
        let dict_args = args.args.iter().chain(args.dyn_kwargs.as_deref());
        for arg in dict_args {
            if let Expr::Dict(pairs, _) = arg {
                for (k, v) in pairs {
                    if let Some(key) = k.as_str_const() {
                        push_pair(&mut self.facts, key.to_string(), v, self.source);
                    }
                }
            }
        }
        for (key, value) in &args.kwargs {
            push_pair(&mut self.facts, key.clone(), value, self.source);
        }
    }

    fn visit_dispatch(&mut self, args: &crate::ast::CallArgs) -> Result<(), JinjaError> {
        let mut macro_name = match args.args.first() {
            Some(expr) => match expr.as_str_const() {
                Some(name) => Some(name.to_string()),
                None => return Err(JinjaError::MacroNameNotString(expr.to_string())),
            },
            None => None,
        };
        let mut namespace = None;

        for (key, value) in &args.kwargs {
            match key.as_str() {
                "macro_name" => match value.as_str_const() {
                    Some(name) => macro_name = Some(name.to_string()),
                    None => return Err(JinjaError::MacroNameNotString(value.to_string())),
                },
                "macro_namespace" => match value.as_str_const() {
                    Some(ns) => namespace = Some(ns.to_string()),
                    None => return Err(JinjaError::MacroNamespaceNotString(value.type_name().to_string())),
                },
                _ => {}
            }
        }

        let mut namespaces = Vec::new();
        match args.args.get(1) {
            Some(Expr::Const(c, _)) => {
                if let Some(ns) = c.as_str() {
                    namespace = Some(ns.to_string());
                }
            }
            Some(Expr::List(items, _)) => {
                namespaces.extend(items.iter().filter_map(Expr::as_str_const).map(str::to_string));
            }
            _ => {}
        }
        if let Some(ns) = &namespace {
            namespaces = vec![ns.clone()];
        }

        let Some(name) = macro_name else {
            return Ok(());
        };
        self.facts.push_macro_call(name.clone());
        for ns in &namespaces {
            self.facts.push_macro_call(format!("{}.{}", ns, name));
        }
        self.facts.dispatch_calls.push(DispatchCall {
            macro_name: name,
            namespace: namespaces.first().cloned(),
        });
        Ok(())
    }
}
