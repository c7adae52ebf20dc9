//! Template AST
//!
//! The node set covers the Jinja subset used by SQL projects plus the
//! project block tags (`snapshot`, `test`, `materialization`, `docs`).
//! Expressions can be turned back into source with `Display`.

use crate::error::Span;
use std::fmt;

/// A literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
}

impl Constant {
    /// JSON form used for literal config values
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Constant::Str(s) => serde_json::Value::String(s.clone()),
            Constant::Int(i) => serde_json::Value::from(*i),
            Constant::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Constant::Bool(b) => serde_json::Value::Bool(*b),
            Constant::None => serde_json::Value::Null,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// Call arguments shared by calls, filters and tests
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallArgs {
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    pub dyn_args: Option<Box<Expr>>,
    pub dyn_kwargs: Option<Box<Expr>>,
}

impl CallArgs {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty() && self.dyn_args.is_none() && self.dyn_kwargs.is_none()
    }

    pub fn kwarg(&self, key: &str) -> Option<&Expr> {
        self.kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Every expression held by the arguments
    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.args
            .iter()
            .chain(self.kwargs.iter().map(|(_, v)| v))
            .chain(self.dyn_args.as_deref())
            .chain(self.dyn_kwargs.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String, Span),
    Const(Constant, Span),
    List(Vec<Expr>, Span),
    Tuple(Vec<Expr>, Span),
    Dict(Vec<(Expr, Expr)>, Span),
    GetAttr {
        value: Box<Expr>,
        attr: String,
        span: Span,
    },
    GetItem {
        value: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
        span: Span,
    },
    Call {
        func: Box<Expr>,
        args: CallArgs,
        span: Span,
    },
    Filter {
        value: Box<Expr>,
        name: String,
        args: CallArgs,
        span: Span,
    },
    Test {
        value: Box<Expr>,
        name: String,
        args: CallArgs,
        negated: bool,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
        span: Span,
    },
    Concat(Vec<Expr>, Span),
    Cond {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Name(_, span)
            | Expr::Const(_, span)
            | Expr::List(_, span)
            | Expr::Tuple(_, span)
            | Expr::Dict(_, span)
            | Expr::Concat(_, span) => *span,
            Expr::GetAttr { span, .. }
            | Expr::GetItem { span, .. }
            | Expr::Slice { span, .. }
            | Expr::Call { span, .. }
            | Expr::Filter { span, .. }
            | Expr::Test { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Compare { span, .. }
            | Expr::Cond { span, .. } => *span,
        }
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Expr::Const(c, _) => Some(c),
            _ => None,
        }
    }

    pub fn as_str_const(&self) -> Option<&str> {
        self.as_const().and_then(Constant::as_str)
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Expr::Name(name, _) => Some(name),
            _ => None,
        }
    }

    /// Node type name, as used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Expr::Name(..) => "Name",
            Expr::Const(..) => "Const",
            Expr::List(..) => "List",
            Expr::Tuple(..) => "Tuple",
            Expr::Dict(..) => "Dict",
            Expr::GetAttr { .. } => "Getattr",
            Expr::GetItem { .. } => "Getitem",
            Expr::Slice { .. } => "Slice",
            Expr::Call { .. } => "Call",
            Expr::Filter { .. } => "Filter",
            Expr::Test { .. } => "Test",
            Expr::Unary { .. } => "UnaryExpr",
            Expr::Binary { .. } => "BinExpr",
            Expr::Compare { .. } => "Compare",
            Expr::Concat(..) => "Concat",
            Expr::Cond { .. } => "CondExpr",
        }
    }

    /// Convert a literal expression tree (constants, lists, tuples, dicts of
    /// literals) to JSON; `None` for anything dynamic
    pub fn to_literal_json(&self) -> Option<serde_json::Value> {
        match self {
            Expr::Const(c, _) => Some(c.to_json()),
            Expr::List(items, _) | Expr::Tuple(items, _) => items
                .iter()
                .map(Expr::to_literal_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Expr::Dict(pairs, _) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    let key = k.as_str_const()?.to_string();
                    map.insert(key, v.to_literal_json()?);
                }
                Some(serde_json::Value::Object(map))
            }
            Expr::Unary { op: UnaryOp::Neg, operand, .. } => match operand.as_const()? {
                Constant::Int(i) => Some(serde_json::Value::from(-i)),
                Constant::Float(f) => serde_json::Number::from_f64(-f).map(serde_json::Value::Number),
                _ => None,
            },
            _ => None,
        }
    }

    /// Visit this expression and every sub-expression, pre-order
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Name(..) | Expr::Const(..) => {}
            Expr::List(items, _) | Expr::Tuple(items, _) | Expr::Concat(items, _) => {
                for item in items {
                    item.walk(visit);
                }
            }
            Expr::Dict(pairs, _) => {
                for (k, v) in pairs {
                    k.walk(visit);
                    v.walk(visit);
                }
            }
            Expr::GetAttr { value, .. } => value.walk(visit),
            Expr::GetItem { value, index, .. } => {
                value.walk(visit);
                index.walk(visit);
            }
            Expr::Slice { start, stop, step, .. } => {
                for part in [start, stop, step].into_iter().flatten() {
                    part.walk(visit);
                }
            }
            Expr::Call { func, args, .. } => {
                func.walk(visit);
                for arg in args.exprs() {
                    arg.walk(visit);
                }
            }
            Expr::Filter { value, args, .. } | Expr::Test { value, args, .. } => {
                value.walk(visit);
                for arg in args.exprs() {
                    arg.walk(visit);
                }
            }
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Compare { left, ops, .. } => {
                left.walk(visit);
                for (_, operand) in ops {
                    operand.walk(visit);
                }
            }
            Expr::Cond { test, then, otherwise, .. } => {
                test.walk(visit);
                then.walk(visit);
                if let Some(otherwise) = otherwise {
                    otherwise.walk(visit);
                }
            }
        }
    }
}

fn write_str_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("'")?;
    for c in s.chars() {
        match c {
            '\'' => f.write_str("\\'")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("'")
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Str(s) => write_str_literal(f, s),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Bool(true) => f.write_str("true"),
            Constant::Bool(false) => f.write_str("false"),
            Constant::None => f.write_str("none"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            Ok(())
        };
        for arg in &self.args {
            sep(f)?;
            write!(f, "{}", arg)?;
        }
        for (key, value) in &self.kwargs {
            sep(f)?;
            write!(f, "{}={}", key, value)?;
        }
        if let Some(dyn_args) = &self.dyn_args {
            sep(f)?;
            write!(f, "*{}", dyn_args)?;
        }
        if let Some(dyn_kwargs) = &self.dyn_kwargs {
            sep(f)?;
            write!(f, "**{}", dyn_kwargs)?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Name(name, _) => f.write_str(name),
            Expr::Const(c, _) => write!(f, "{}", c),
            Expr::List(items, _) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Expr::Tuple(items, _) => {
                f.write_str("(")?;
                write_list(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Expr::Dict(pairs, _) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Expr::GetAttr { value, attr, .. } => write!(f, "{}.{}", value, attr),
            Expr::GetItem { value, index, .. } => write!(f, "{}[{}]", value, index),
            Expr::Slice { start, stop, step, .. } => {
                if let Some(start) = start {
                    write!(f, "{}", start)?;
                }
                f.write_str(":")?;
                if let Some(stop) = stop {
                    write!(f, "{}", stop)?;
                }
                if let Some(step) = step {
                    write!(f, ":{}", step)?;
                }
                Ok(())
            }
            Expr::Call { func, args, .. } => write!(f, "{}({})", func, args),
            Expr::Filter { value, name, args, .. } => {
                if args.is_empty() {
                    write!(f, "{}|{}", value, name)
                } else {
                    write!(f, "{}|{}({})", value, name, args)
                }
            }
            Expr::Test { value, name, args, negated, .. } => {
                let not = if *negated { "not " } else { "" };
                if args.is_empty() {
                    write!(f, "{} is {}{}", value, not, name)
                } else {
                    write!(f, "{} is {}{}({})", value, not, name, args)
                }
            }
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Neg => write!(f, "-{}", operand),
                UnaryOp::Pos => write!(f, "+{}", operand),
                UnaryOp::Not => write!(f, "not {}", operand),
            },
            Expr::Binary { op, left, right, .. } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Compare { left, ops, .. } => {
                write!(f, "{}", left)?;
                for (op, operand) in ops {
                    write!(f, " {} {}", op.symbol(), operand)?;
                }
                Ok(())
            }
            Expr::Concat(items, _) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ~ ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Expr::Cond { test, then, otherwise, .. } => {
                write!(f, "{} if {}", then, test)?;
                if let Some(otherwise) = otherwise {
                    write!(f, " else {}", otherwise)?;
                }
                Ok(())
            }
        }
    }
}

/// A macro, call-block or test parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// Project block tags that define resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceBlockKind {
    Snapshot,
    Test,
    Materialization,
    Docs,
}

impl ResourceBlockKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ResourceBlockKind::Snapshot => "snapshot",
            ResourceBlockKind::Test => "test",
            ResourceBlockKind::Materialization => "materialization",
            ResourceBlockKind::Docs => "docs",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "snapshot" => Some(ResourceBlockKind::Snapshot),
            "test" => Some(ResourceBlockKind::Test),
            "materialization" => Some(ResourceBlockKind::Materialization),
            "docs" => Some(ResourceBlockKind::Docs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Text {
        text: String,
        span: Span,
    },
    Output {
        expr: Expr,
        span: Span,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    For {
        target: Expr,
        iter: Expr,
        filter: Option<Expr>,
        recursive: bool,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    Set {
        target: Expr,
        value: Expr,
        span: Span,
    },
    SetBlock {
        target: Expr,
        filter: Option<Expr>,
        body: Vec<Stmt>,
        span: Span,
    },
    Macro {
        name: String,
        params: Vec<Param>,
        body: Vec<Stmt>,
        span: Span,
        body_span: Span,
    },
    CallBlock {
        call: Expr,
        params: Vec<Param>,
        body: Vec<Stmt>,
        span: Span,
        body_span: Span,
    },
    FilterBlock {
        filter: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    With {
        assignments: Vec<(Expr, Expr)>,
        body: Vec<Stmt>,
        span: Span,
    },
    Do {
        expr: Expr,
        span: Span,
    },
    Block {
        name: String,
        body: Vec<Stmt>,
        span: Span,
    },
    Extends {
        template: Expr,
        span: Span,
    },
    Include {
        template: Expr,
        span: Span,
    },
    Import {
        template: Expr,
        alias: String,
        span: Span,
    },
    FromImport {
        template: Expr,
        names: Vec<(String, Option<String>)>,
        span: Span,
    },
    Break(Span),
    Continue(Span),
    /// `{% snapshot %}`, `{% test %}`, `{% materialization %}`, `{% docs %}`
    Resource {
        kind: ResourceBlockKind,
        name: String,
        params: Vec<Param>,
        kwargs: Vec<(String, Expr)>,
        body: Vec<Stmt>,
        span: Span,
        body_span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Text { span, .. }
            | Stmt::Output { span, .. }
            | Stmt::If { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Set { span, .. }
            | Stmt::SetBlock { span, .. }
            | Stmt::Macro { span, .. }
            | Stmt::CallBlock { span, .. }
            | Stmt::FilterBlock { span, .. }
            | Stmt::With { span, .. }
            | Stmt::Do { span, .. }
            | Stmt::Block { span, .. }
            | Stmt::Extends { span, .. }
            | Stmt::Include { span, .. }
            | Stmt::Import { span, .. }
            | Stmt::FromImport { span, .. }
            | Stmt::Resource { span, .. } => *span,
            Stmt::Break(span) | Stmt::Continue(span) => *span,
        }
    }

    /// Expressions held directly by this statement (not by nested bodies)
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::Text { .. } | Stmt::Break(_) | Stmt::Continue(_) | Stmt::Block { .. } => Vec::new(),
            Stmt::Output { expr, .. } | Stmt::Do { expr, .. } => vec![expr],
            Stmt::If { branches, .. } => branches.iter().map(|(test, _)| test).collect(),
            Stmt::For { target, iter, filter, .. } => {
                let mut out = vec![target, iter];
                out.extend(filter.iter());
                out
            }
            Stmt::Set { target, value, .. } => vec![target, value],
            Stmt::SetBlock { target, filter, .. } => {
                let mut out = vec![target];
                out.extend(filter.iter());
                out
            }
            Stmt::Macro { params, .. } | Stmt::Resource { params, .. } if !params.is_empty() => {
                let mut out: Vec<&Expr> = params.iter().filter_map(|p| p.default.as_ref()).collect();
                if let Stmt::Resource { kwargs, .. } = self {
                    out.extend(kwargs.iter().map(|(_, v)| v));
                }
                out
            }
            Stmt::Macro { .. } => Vec::new(),
            Stmt::Resource { kwargs, .. } => kwargs.iter().map(|(_, v)| v).collect(),
            Stmt::CallBlock { call, params, .. } => {
                let mut out = vec![call];
                out.extend(params.iter().filter_map(|p| p.default.as_ref()));
                out
            }
            Stmt::FilterBlock { filter, .. } => vec![filter],
            Stmt::With { assignments, .. } => assignments.iter().flat_map(|(t, v)| [t, v]).collect(),
            Stmt::Extends { template, .. }
            | Stmt::Include { template, .. }
            | Stmt::Import { template, .. }
            | Stmt::FromImport { template, .. } => vec![template],
        }
    }

    /// Nested statement bodies
    pub fn bodies(&self) -> Vec<&[Stmt]> {
        match self {
            Stmt::If { branches, else_body, .. } => {
                let mut out: Vec<&[Stmt]> = branches.iter().map(|(_, body)| body.as_slice()).collect();
                out.push(else_body);
                out
            }
            Stmt::For { body, else_body, .. } => vec![body, else_body],
            Stmt::SetBlock { body, .. }
            | Stmt::Macro { body, .. }
            | Stmt::CallBlock { body, .. }
            | Stmt::FilterBlock { body, .. }
            | Stmt::With { body, .. }
            | Stmt::Block { body, .. }
            | Stmt::Resource { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }
}

/// A parsed template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub body: Vec<Stmt>,
}

impl Template {
    /// Visit every expression in the template, including nested bodies
    pub fn walk_exprs<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        walk_body(&self.body, visit);
    }
}

fn walk_body<'a>(body: &'a [Stmt], visit: &mut dyn FnMut(&'a Expr)) {
    for stmt in body {
        for expr in stmt.exprs() {
            expr.walk(visit);
        }
        for nested in stmt.bodies() {
            walk_body(nested, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s() -> Span {
        Span::default()
    }

    #[test]
    fn unparse_call() {
        let call = Expr::Call {
            func: Box::new(Expr::Name("ref".to_string(), s())),
            args: CallArgs {
                args: vec![Expr::Const(Constant::Str("orders".to_string()), s())],
                kwargs: vec![("version".to_string(), Expr::Const(Constant::Int(2), s()))],
                ..CallArgs::default()
            },
            span: s(),
        };
        assert_eq!(call.to_string(), "ref('orders', version=2)");
    }

    #[test]
    fn literal_json() {
        let list = Expr::List(
            vec![
                Expr::Const(Constant::Str("a".to_string()), s()),
                Expr::Const(Constant::Bool(true), s()),
            ],
            s(),
        );
        assert_eq!(list.to_literal_json(), Some(serde_json::json!(["a", true])));
        assert_eq!(Expr::Name("x".to_string(), s()).to_literal_json(), None);
    }
}
