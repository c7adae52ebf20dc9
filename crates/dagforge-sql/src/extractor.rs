//! Fast static extraction of `ref()`, `source()` and `config()` calls
//!
//! Handles templates whose only template markup is `{{ ref(...) }}`,
//! `{{ source(...) }}`, `{{ config(...) }}` with literal arguments, and
//! comments. Anything else is reported as unsupported so the caller can
//! rely on the full template inspector instead.

use dagforge_jinja::{RefCall, SourceCall};
use std::collections::BTreeMap;

/// What the extractor found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFacts {
    pub refs: Vec<RefCall>,
    pub sources: Vec<SourceCall>,
    pub configs: BTreeMap<String, serde_json::Value>,
}

/// Why a template is outside the extractor's grammar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unsupported {
    #[error("statement blocks are not supported")]
    StatementBlock,

    #[error("unterminated expression at offset {0}")]
    Unterminated(usize),

    #[error("unsupported expression: {0}")]
    Expression(String),
}

/// Extracts template calls from SQL without a template parser
pub struct StaticExtractor;

impl StaticExtractor {
    /// Extract all calls from a template
    pub fn extract(sql: &str) -> Result<ExtractedFacts, Unsupported> {
        let mut facts = ExtractedFacts::default();
        let mut rest = sql;
        let mut offset = 0;

        loop {
            let next_expr = rest.find("{{");
            let next_stmt = rest.find("{%");
            let next_comment = rest.find("{#");

            let earliest = [next_expr, next_stmt, next_comment].into_iter().flatten().min();
            let Some(pos) = earliest else { break };

            if Some(pos) == next_stmt {
                return Err(Unsupported::StatementBlock);
            }

            if Some(pos) == next_comment {
                let close = rest[pos..]
                    .find("#}")
                    .ok_or(Unsupported::Unterminated(offset + pos))?;
                offset += pos + close + 2;
                rest = &rest[pos + close + 2..];
                continue;
            }

            let close = rest[pos..]
                .find("}}")
                .ok_or(Unsupported::Unterminated(offset + pos))?;
            let content = rest[pos + 2..pos + close].trim_matches(|c: char| c == '-' || c.is_whitespace());
            Self::extract_call(content, &mut facts)?;

            offset += pos + close + 2;
            rest = &rest[pos + close + 2..];
        }

        Ok(facts)
    }

    fn extract_call(content: &str, facts: &mut ExtractedFacts) -> Result<(), Unsupported> {
        let unsupported = || Unsupported::Expression(content.to_string());

        let open = content.find('(').ok_or_else(unsupported)?;
        let name = content[..open].trim();
        let inner = content[open + 1..].strip_suffix(')').ok_or_else(unsupported)?;
        let args = ArgScanner::new(inner).parse_args().ok_or_else(unsupported)?;

        match name {
            "ref" => {
                let positional: Option<Vec<&str>> = args.positional.iter().map(|v| v.as_str()).collect();
                let mut version = None;
                for (key, value) in &args.keyword {
                    match (key.as_str(), value) {
                        ("version" | "v", serde_json::Value::String(s)) => version = Some(s.clone()),
                        ("version" | "v", serde_json::Value::Number(n)) => version = Some(n.to_string()),
                        _ => return Err(unsupported()),
                    }
                }
                let call = match positional.as_deref() {
                    Some([name]) => RefCall::new(*name),
                    Some([package, name]) => RefCall::new(*name).with_package(*package),
                    _ => return Err(unsupported()),
                };
                let call = match version {
                    Some(v) => call.with_version(v),
                    None => call,
                };
                if !facts.refs.contains(&call) {
                    facts.refs.push(call);
                }
            }
            "source" => {
                let positional: Option<Vec<&str>> = args.positional.iter().map(|v| v.as_str()).collect();
                match positional.as_deref() {
                    Some([source_name, table_name]) if args.keyword.is_empty() => {
                        let call = SourceCall {
                            source_name: source_name.to_string(),
                            table_name: table_name.to_string(),
                        };
                        if !facts.sources.contains(&call) {
                            facts.sources.push(call);
                        }
                    }
                    _ => return Err(unsupported()),
                }
            }
            "config" => {
                if !args.positional.is_empty() {
                    return Err(unsupported());
                }
                for (key, value) in args.keyword {
                    facts.configs.insert(key, value);
                }
            }
            _ => return Err(unsupported()),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Args {
    positional: Vec<serde_json::Value>,
    keyword: Vec<(String, serde_json::Value)>,
}

/// Scanner over literal call arguments
struct ArgScanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> ArgScanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse_args(mut self) -> Option<Args> {
        let mut args = Args::default();
        loop {
            self.skip_ws();
            if self.at_end() {
                return Some(args);
            }
            let start = self.pos;
            if let Some(ident) = self.ident() {
                self.skip_ws();
                if self.eat('=') {
                    let value = self.value()?;
                    args.keyword.push((ident.to_string(), value));
                } else {
                    self.pos = start;
                    if !args.keyword.is_empty() {
                        return None;
                    }
                    args.positional.push(self.value()?);
                }
            } else {
                if !args.keyword.is_empty() {
                    return None;
                }
                args.positional.push(self.value()?);
            }
            self.skip_ws();
            if self.at_end() {
                return Some(args);
            }
            if !self.eat(',') {
                return None;
            }
        }
    }

    fn value(&mut self) -> Option<serde_json::Value> {
        self.skip_ws();
        let c = self.peek()?;
        match c {
            '\'' | '"' => self.string().map(serde_json::Value::String),
            '[' => {
                self.pos += 1;
                let items = self.sequence(']')?;
                Some(serde_json::Value::Array(items))
            }
            '{' => {
                self.pos += 1;
                let mut map = serde_json::Map::new();
                loop {
                    self.skip_ws();
                    if self.eat('}') {
                        return Some(serde_json::Value::Object(map));
                    }
                    let key = self.string()?;
                    self.skip_ws();
                    if !self.eat(':') {
                        return None;
                    }
                    let value = self.value()?;
                    map.insert(key, value);
                    self.skip_ws();
                    if !self.eat(',') {
                        self.skip_ws();
                        return self.eat('}').then_some(serde_json::Value::Object(map));
                    }
                }
            }
            '-' | '0'..='9' => self.number(),
            _ => match self.ident()? {
                "true" | "True" => Some(serde_json::Value::Bool(true)),
                "false" | "False" => Some(serde_json::Value::Bool(false)),
                "none" | "None" => Some(serde_json::Value::Null),
                _ => None,
            },
        }
    }

    fn sequence(&mut self, close: char) -> Option<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Some(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            if !self.eat(',') {
                self.skip_ws();
                return self.eat(close).then_some(items);
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.peek()?;
        if quote != '\'' && quote != '"' {
            return None;
        }
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.src[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    let (_, escaped) = chars.next()?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                c if c == quote => {
                    self.pos += i + 1;
                    return Some(out);
                }
                c => out.push(c),
            }
        }
        None
    }

    fn number(&mut self) -> Option<serde_json::Value> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some('0'..='9' | '.' | '_')) {
            self.pos += 1;
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        if text.contains('.') {
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
        } else {
            text.parse::<i64>().ok().map(serde_json::Value::from)
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        let src = self.src;
        let start = self.pos;
        let first = self.peek()?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        Some(&src[start..self.pos])
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += self.peek().map(char::len_utf8).unwrap_or(1);
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }
}
