//! Python model inspection
//!
//! Python models are never executed at parse time. A small tokenizer checks
//! the shape of the file (one top-level `def model(dbt, session)` that returns
//! a value) and reads the literal arguments of `dbt.ref`, `dbt.source` and
//! `dbt.config` calls.

use crate::error::ParseError;
use crate::yaml::ConfigMap;
use dagforge_manifest::RefArgs;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Str { value: String, formatted: bool },
    Num(String),
    Op(char),
}

/// One logical line: indentation and tokens, bracketed continuations joined
#[derive(Debug, Clone)]
struct Line {
    number: usize,
    indent: usize,
    tokens: Vec<Token>,
}

/// What a Python model declares
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PythonFacts {
    pub refs: Vec<RefArgs>,
    pub sources: Vec<(String, String)>,
    pub config: ConfigMap,
}

/// Validate a Python model and collect its dependencies and config
pub fn inspect_python(path: &str, source: &str) -> Result<PythonFacts, ParseError> {
    let fail = |message: String| ParseError::PythonModel {
        path: path.to_string(),
        message,
    };

    if source.contains("{{") || source.contains("{%") {
        return Err(fail("Python models cannot contain Jinja".to_string()));
    }

    let lines = tokenize(source).map_err(fail)?;
    check_model_function(&lines).map_err(fail)?;

    let tokens: Vec<&Token> = lines.iter().flat_map(|l| l.tokens.iter()).collect();
    let mut facts = PythonFacts::default();
    let mut i = 0;
    while i + 3 < tokens.len() {
        let is_dbt_call = matches!(tokens[i], Token::Name(n) if n == "dbt")
            && tokens[i + 1] == &Token::Op('.')
            && tokens[i + 3] == &Token::Op('(');
        let Token::Name(method) = tokens[i + 2] else {
            i += 1;
            continue;
        };
        if !is_dbt_call || !matches!(method.as_str(), "ref" | "source" | "config") {
            i += 1;
            continue;
        }

        let mut cursor = LiteralParser {
            tokens: &tokens,
            pos: i + 4,
        };
        let (args, kwargs) = cursor
            .call_args()
            .ok_or_else(|| fail(format!("arguments to dbt.{} must be literals", method)))?;
        match method.as_str() {
            "ref" => facts.refs.push(ref_args(&args, &kwargs).map_err(fail)?),
            "source" => facts.sources.push(source_args(&args).map_err(fail)?),
            _ => {
                if !args.is_empty() {
                    return Err(fail("dbt.config takes keyword arguments only".to_string()));
                }
                facts.config.extend(kwargs);
            }
        }
        i = cursor.pos;
    }
    Ok(facts)
}

fn ref_args(args: &[Value], kwargs: &ConfigMap) -> Result<RefArgs, String> {
    let strings: Vec<&str> = args.iter().filter_map(Value::as_str).collect();
    if strings.len() != args.len() {
        return Err("dbt.ref arguments must be strings".to_string());
    }
    let mut parsed = match strings.as_slice() {
        [name] => RefArgs::new(*name),
        [package, name] => RefArgs::new(*name).with_package(*package),
        _ => return Err(format!("dbt.ref takes 1 or 2 arguments, got {}", args.len())),
    };
    if let Some(version) = kwargs.get("version").or_else(|| kwargs.get("v")) {
        let version = match version {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parsed = parsed.with_version(version);
    }
    Ok(parsed)
}

fn source_args(args: &[Value]) -> Result<(String, String), String> {
    match args {
        [Value::String(source), Value::String(table)] => Ok((source.clone(), table.clone())),
        _ => Err(format!("dbt.source takes 2 string arguments, got {}", args.len())),
    }
}

/// Exactly one top-level `def model` with two parameters that returns a value
fn check_model_function(lines: &[Line]) -> Result<(), String> {
    let defs: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            line.indent == 0
                && matches!(line.tokens.first(), Some(Token::Name(d)) if d == "def")
                && matches!(line.tokens.get(1), Some(Token::Name(n)) if n == "model")
        })
        .map(|(i, _)| i)
        .collect();

    let start = match defs.as_slice() {
        [] => return Err("no top-level `def model(dbt, session)` found".to_string()),
        [one] => *one,
        [_, second, ..] => {
            return Err(format!(
                "`model` is defined more than once (again on line {})",
                lines[*second].number
            ))
        }
    };

    let params = count_params(&lines[start].tokens);
    if params != 2 {
        return Err(format!("`model` must take exactly 2 parameters (dbt, session), got {}", params));
    }

    let body = lines[start + 1..].iter().take_while(|l| l.indent > 0);
    let mut returns = 0;
    for line in body {
        if !matches!(line.tokens.first(), Some(Token::Name(r)) if r == "return") {
            continue;
        }
        returns += 1;
        match &line.tokens[1..] {
            [] => return Err(format!("bare `return` on line {}; `model` must return a DataFrame", line.number)),
            [Token::Name(n)] if n == "None" => {
                return Err(format!("`return None` on line {}; `model` must return a DataFrame", line.number))
            }
            _ => {}
        }
    }
    if returns == 0 {
        return Err("`model` has no return statement".to_string());
    }
    Ok(())
}

fn count_params(tokens: &[Token]) -> usize {
    let Some(open) = tokens.iter().position(|t| *t == Token::Op('(')) else {
        return 0;
    };
    let mut depth = 0;
    let mut count = 0;
    let mut pending = false;
    for token in &tokens[open..] {
        match token {
            Token::Op('(') | Token::Op('[') | Token::Op('{') => {
                depth += 1;
                continue;
            }
            Token::Op(')') | Token::Op(']') | Token::Op('}') => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                continue;
            }
            Token::Op(',') if depth == 1 => {
                if pending {
                    count += 1;
                }
                pending = false;
                continue;
            }
            _ => {}
        }
        if depth == 1 {
            pending = true;
        }
    }
    count + usize::from(pending)
}

struct LiteralParser<'a> {
    tokens: &'a [&'a Token],
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos).copied();
        self.pos += 1;
        token
    }

    fn eat(&mut self, op: char) -> bool {
        if self.peek() == Some(&Token::Op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Arguments after the opening `(`, through the closing `)`
    fn call_args(&mut self) -> Option<(Vec<Value>, ConfigMap)> {
        let mut args = Vec::new();
        let mut kwargs = ConfigMap::new();
        loop {
            if self.eat(')') {
                return Some((args, kwargs));
            }
            let is_kwarg = matches!(self.peek(), Some(Token::Name(_)))
                && self.tokens.get(self.pos + 1).copied() == Some(&Token::Op('='));
            if is_kwarg {
                let Some(Token::Name(key)) = self.next() else { return None };
                let key = key.clone();
                self.pos += 1;
                kwargs.insert(key, self.literal()?);
            } else {
                args.push(self.literal()?);
            }
            if !self.eat(',') && self.peek() != Some(&Token::Op(')')) {
                return None;
            }
        }
    }

    fn sequence(&mut self, close: char) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Some(items);
            }
            items.push(self.literal()?);
            if !self.eat(',') && self.peek() != Some(&Token::Op(close)) {
                return None;
            }
        }
    }

    fn literal(&mut self) -> Option<Value> {
        match self.next()?.clone() {
            Token::Str { value, formatted: false } => {
                let mut value = value;
                // implicit concatenation: 'a' 'b'
                while let Some(Token::Str { value: more, formatted: false }) = self.peek() {
                    value.push_str(more);
                    self.pos += 1;
                }
                Some(Value::String(value))
            }
            Token::Num(n) => number(&n),
            Token::Op('-') => match self.next()? {
                Token::Num(n) => number(&format!("-{}", n)),
                _ => None,
            },
            Token::Name(n) => match n.as_str() {
                "True" => Some(Value::Bool(true)),
                "False" => Some(Value::Bool(false)),
                "None" => Some(Value::Null),
                _ => None,
            },
            Token::Op('[') => self.sequence(']').map(Value::Array),
            Token::Op('(') => self.sequence(')').map(Value::Array),
            Token::Op('{') => {
                let mut map = serde_json::Map::new();
                loop {
                    if self.eat('}') {
                        return Some(Value::Object(map));
                    }
                    let key = match self.literal()? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    if !self.eat(':') {
                        return None;
                    }
                    map.insert(key, self.literal()?);
                    if !self.eat(',') && self.peek() != Some(&Token::Op('}')) {
                        return None;
                    }
                }
            }
            _ => None,
        }
    }
}

fn number(text: &str) -> Option<Value> {
    let cleaned = text.replace('_', "");
    if let Ok(i) = cleaned.parse::<i64>() {
        return Some(Value::from(i));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn tokenize(source: &str) -> Result<Vec<Line>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut lines = Vec::new();
    let mut tokens = Vec::new();
    let mut line_no = 1;
    let mut line_start = 1;
    let mut indent = 0;
    let mut at_line_start = true;
    let mut depth: usize = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if at_line_start {
            let mut width = 0;
            while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
                width += if chars[i] == '\t' { 8 } else { 1 };
                i += 1;
            }
            indent = width;
            line_start = line_no;
            at_line_start = false;
            continue;
        }

        match c {
            '\n' => {
                line_no += 1;
                i += 1;
                if depth == 0 {
                    if !tokens.is_empty() {
                        lines.push(Line {
                            number: line_start,
                            indent,
                            tokens: std::mem::take(&mut tokens),
                        });
                    }
                    at_line_start = true;
                }
            }
            '\\' if chars.get(i + 1) == Some(&'\n') => {
                line_no += 1;
                i += 2;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            c if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let (value, next, newlines) = read_string(&chars, i)?;
                tokens.push(Token::Str { value, formatted: false });
                line_no += newlines;
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let is_prefix = word.len() <= 2
                    && word.chars().all(|ch| matches!(ch.to_ascii_lowercase(), 'r' | 'b' | 'f' | 'u'));
                if is_prefix && matches!(chars.get(i), Some('\'') | Some('"')) {
                    let (value, next, newlines) = read_string(&chars, i)?;
                    let formatted = word.to_ascii_lowercase().contains('f');
                    tokens.push(Token::Str { value, formatted });
                    line_no += newlines;
                    i = next;
                } else {
                    tokens.push(Token::Name(word));
                }
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i];
                    let exponent_sign = (ch == '+' || ch == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            '(' | '[' | '{' => {
                depth += 1;
                tokens.push(Token::Op(c));
                i += 1;
            }
            ')' | ']' | '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced '{}' on line {}", c, line_no))?;
                tokens.push(Token::Op(c));
                i += 1;
            }
            c => {
                tokens.push(Token::Op(c));
                i += 1;
            }
        }
    }
    if depth != 0 {
        return Err("unclosed bracket at end of file".to_string());
    }
    if !tokens.is_empty() {
        lines.push(Line {
            number: line_start,
            indent,
            tokens,
        });
    }
    Ok(lines)
}

/// Read a string literal starting at the quote; returns the value, the index
/// after it, and how many newlines it spans
fn read_string(chars: &[char], start: usize) -> Result<(String, usize, usize), String> {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = start + if triple { 3 } else { 1 };
    let mut value = String::new();
    let mut newlines = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('\n') => newlines += 1,
                Some(other) => value.push(*other),
                None => break,
            }
            i += 2;
            continue;
        }
        if c == quote {
            if !triple {
                return Ok((value, i + 1, newlines));
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return Ok((value, i + 3, newlines));
            }
        }
        if c == '\n' {
            if !triple {
                return Err("unterminated string literal".to_string());
            }
            newlines += 1;
        }
        value.push(c);
        i += 1;
    }
    Err("unterminated string literal".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MODEL: &str = r#"
import pandas as pd

def helper(df):
    return df

def model(dbt, session):
    dbt.config(
        materialized="table",
        packages=["numpy==1.23.1", 'scikit-learn'],
        meta={"owner": "ml"},
    )
    orders = dbt.ref("stg_orders")
    customers = dbt.ref('crm', 'customers', v=2)
    raw = dbt.source("raw", "payments")
    if dbt.config.get("materialized") == "table":
        pass
    return helper(orders)
"#;

    #[test]
    fn collects_refs_sources_and_config() {
        let facts = inspect_python("models/forecast.py", MODEL).unwrap();
        assert_eq!(
            facts.refs,
            vec![
                RefArgs::new("stg_orders"),
                RefArgs::new("customers").with_package("crm").with_version("2"),
            ]
        );
        assert_eq!(facts.sources, vec![("raw".to_string(), "payments".to_string())]);
        assert_eq!(facts.config["materialized"], json!("table"));
        assert_eq!(facts.config["packages"], json!(["numpy==1.23.1", "scikit-learn"]));
        assert_eq!(facts.config["meta"], json!({"owner": "ml"}));
    }

    fn error(source: &str) -> String {
        match inspect_python("models/m.py", source) {
            Err(ParseError::PythonModel { message, .. }) => message,
            other => panic!("expected a Python model error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(error("def transform(dbt, session):\n    return 1\n").contains("no top-level"));
        assert!(error("def model(dbt):\n    return 1\n").contains("exactly 2 parameters"));
        assert!(error("def model(dbt, session):\n    x = 1\n").contains("no return"));
        assert!(error("def model(dbt, session):\n    return\n").contains("bare `return`"));
        assert!(error("def model(dbt, session):\n    return None\n").contains("return None"));
        assert!(error(
            "def model(dbt, session):\n    return 1\n\ndef model(dbt, session):\n    return 2\n"
        )
        .contains("more than once"));
    }

    #[test]
    fn rejects_non_literal_arguments_and_jinja() {
        assert!(error("def model(dbt, session):\n    name = 'a'\n    return dbt.ref(name)\n").contains("literals"));
        assert!(error("def model(dbt, session):\n    return dbt.ref(f'{x}')\n").contains("literals"));
        assert!(error("def model(dbt, session):\n    return dbt.ref(\"{{ var('m') }}\")\n").contains("Jinja"));
    }

    #[test]
    fn nested_functions_do_not_count_as_model() {
        let source = "def model(dbt, session):\n    def model(x):\n        return x\n    return model(1)\n";
        assert!(inspect_python("models/m.py", source).is_ok());
    }
}
