//! `set_sql_header` extraction
//!
//! Reconstructs the body of `{% call set_sql_header(config) %}...{% endcall %}`
//! without rendering. Only a small node set is supported: text, names,
//! attribute access, simple calls and `if` chains over comparisons.

use crate::ast::{BinOp, Expr, Stmt, Template, UnaryOp};
use crate::error::JinjaError;
use crate::parser::parse;

/// Outcome of header extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlHeader {
    /// No `set_sql_header` call block
    Absent,
    /// Reconstructed header body
    Extracted(String),
    /// The block uses a construct outside the supported set
    Unsupported,
}

/// Extract the SQL header from a template source
pub fn extract_sql_header(source: &str) -> Result<SqlHeader, JinjaError> {
    let template = parse(source)?;
    Ok(extract_from_template(&template))
}

pub fn extract_from_template(template: &Template) -> SqlHeader {
    match find_header_block(&template.body) {
        None => SqlHeader::Absent,
        Some(body) => {
            let mut out = String::new();
            if write_body(body, &mut out) {
                SqlHeader::Extracted(out)
            } else {
                SqlHeader::Unsupported
            }
        }
    }
}

fn find_header_block(body: &[Stmt]) -> Option<&[Stmt]> {
    for stmt in body {
        if let Stmt::CallBlock { call: Expr::Call { func, .. }, body, .. } = stmt {
            if func.as_name() == Some("set_sql_header") {
                return Some(body);
            }
        }
        for nested in stmt.bodies() {
            if let Some(found) = find_header_block(nested) {
                return Some(found);
            }
        }
    }
    None
}

fn write_body(body: &[Stmt], out: &mut String) -> bool {
    for stmt in body {
        match stmt {
            Stmt::Text { text, .. } => out.push_str(text),
            Stmt::Output { expr, .. } if is_simple_expr(expr) => {
                out.push_str(&format!("{{{{ {} }}}}", expr));
            }
            Stmt::If { branches, else_body, .. } => {
                for (i, (test, branch)) in branches.iter().enumerate() {
                    if !is_simple_test(test) {
                        return false;
                    }
                    let tag = if i == 0 { "if" } else { "elif" };
                    out.push_str(&format!("{{% {} {} %}}", tag, test));
                    if !write_body(branch, out) {
                        return false;
                    }
                }
                if !else_body.is_empty() {
                    out.push_str("{% else %}");
                    if !write_body(else_body, out) {
                        return false;
                    }
                }
                out.push_str("{% endif %}");
            }
            _ => return false,
        }
    }
    true
}

fn is_simple_expr(expr: &Expr) -> bool {
    match expr {
        Expr::Name(..) | Expr::Const(..) => true,
        Expr::GetAttr { value, .. } => is_simple_expr(value),
        Expr::Call { func, args, .. } => {
            matches!(func.as_ref(), Expr::Name(..) | Expr::GetAttr { .. })
                && is_simple_expr(func)
                && args.dyn_args.is_none()
                && args.dyn_kwargs.is_none()
                && args
                    .args
                    .iter()
                    .chain(args.kwargs.iter().map(|(_, v)| v))
                    .all(|arg| matches!(arg, Expr::Const(..) | Expr::Name(..) | Expr::Call { .. }) && is_simple_expr(arg))
        }
        _ => false,
    }
}

fn is_simple_test(expr: &Expr) -> bool {
    match expr {
        Expr::Compare { left, ops, .. } => is_simple_expr(left) && ops.iter().all(|(_, e)| is_simple_expr(e)),
        Expr::Binary { op: BinOp::And | BinOp::Or, left, right, .. } => is_simple_test(left) && is_simple_test(right),
        Expr::Unary { op: UnaryOp::Not, operand, .. } => is_simple_test(operand),
        other => is_simple_expr(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_without_call_block() {
        assert_eq!(extract_sql_header("select 1").unwrap(), SqlHeader::Absent);
    }

    #[test]
    fn extracts_text_and_calls() {
        let src = "{% call set_sql_header(config) %}set search_path = {{ target.schema }};{% endcall %}select 1";
        assert_eq!(
            extract_sql_header(src).unwrap(),
            SqlHeader::Extracted("set search_path = {{ target.schema }};".to_string())
        );
    }

    #[test]
    fn extracts_if_chain() {
        let src = "{% call set_sql_header(config) %}{% if target.name == 'prod' %}set x = 1;{% else %}set x = 2;{% endif %}{% endcall %}";
        assert_eq!(
            extract_sql_header(src).unwrap(),
            SqlHeader::Extracted("{% if target.name == 'prod' %}set x = 1;{% else %}set x = 2;{% endif %}".to_string())
        );
    }

    #[test]
    fn unsupported_constructs() {
        let src = "{% call set_sql_header(config) %}{% for x in y %}{{ x }}{% endfor %}{% endcall %}";
        assert_eq!(extract_sql_header(src).unwrap(), SqlHeader::Unsupported);
        let src = "{% call set_sql_header(config) %}{{ a + b }}{% endcall %}";
        assert_eq!(extract_sql_header(src).unwrap(), SqlHeader::Unsupported);
    }
}
