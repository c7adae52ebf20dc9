//! Template lexer
//!
//! Splits a template into raw text and the tokens found inside `{{ }}` and
//! `{% %}` tags. Comments are dropped, whitespace control markers are applied
//! to neighbouring text, and `{% raw %}` sections are emitted as plain text.

use crate::error::{JinjaError, Span};

/// A lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Literal template text between tags
    Text(String),
    /// `{{`
    VariableStart,
    /// `}}`
    VariableEnd,
    /// `{%`
    BlockStart,
    /// `%}`
    BlockEnd,
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    /// Operator or punctuation
    Op(&'static str),
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Text(_) => "template data".to_string(),
            Token::VariableStart => "'{{'".to_string(),
            Token::VariableEnd => "'}}'".to_string(),
            Token::BlockStart => "'{%'".to_string(),
            Token::BlockEnd => "'%}'".to_string(),
            Token::Name(n) => format!("name '{}'", n),
            Token::Str(_) => "string".to_string(),
            Token::Int(_) => "integer".to_string(),
            Token::Float(_) => "float".to_string(),
            Token::Op(op) => format!("'{}'", op),
        }
    }
}

const OPERATORS: &[&str] = &[
    "//", "**", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "~", "<", ">", "=", ".", ",",
    ":", "|", "(", ")", "[", "]", "{", "}",
];

#[derive(Clone, Copy, PartialEq)]
enum TagKind {
    Variable,
    Block,
}

/// Tokenize a template source
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>, JinjaError> {
    Lexer::new(source).run()
}

struct Lexer<'s> {
    src: &'s str,
    pos: usize,
    tokens: Vec<(Token, Span)>,
    /// Strip leading whitespace of the next text run (set by `-%}` and friends)
    lstrip_next: bool,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str) -> Self {
        Self {
            src,
            pos: 0,
            tokens: Vec::new(),
            lstrip_next: false,
        }
    }

    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    fn run(mut self) -> Result<Vec<(Token, Span)>, JinjaError> {
        while self.pos < self.src.len() {
            let next_tag = find_tag_open(self.rest());
            let text_end = next_tag.map(|off| self.pos + off).unwrap_or(self.src.len());

            if text_end > self.pos {
                let strip_right = next_tag.is_some() && self.src[text_end + 2..].starts_with('-');
                self.push_text(self.pos, text_end, strip_right);
            }
            self.pos = text_end;

            if next_tag.is_none() {
                break;
            }

            let opener = &self.src[self.pos..self.pos + 2];
            match opener {
                "{#" => self.lex_comment()?,
                "{{" => self.lex_tag(TagKind::Variable)?,
                _ => {
                    if self.try_lex_raw()? {
                        continue;
                    }
                    self.lex_tag(TagKind::Block)?;
                }
            }
        }
        Ok(self.tokens)
    }

    fn push_text(&mut self, start: usize, end: usize, strip_right: bool) {
        let mut text = &self.src[start..end];
        if self.lstrip_next {
            text = text.trim_start();
            self.lstrip_next = false;
        }
        if strip_right {
            text = text.trim_end();
        }
        if !text.is_empty() {
            self.tokens.push((Token::Text(text.to_string()), Span::new(start, end)));
        }
    }

    fn lex_comment(&mut self) -> Result<(), JinjaError> {
        let start = self.pos;
        match self.rest().find("#}") {
            Some(off) => {
                let close = self.pos + off;
                self.lstrip_next = close > start + 2 && self.src[..close].ends_with('-');
                self.pos = close + 2;
                Ok(())
            }
            None => Err(JinjaError::syntax("Missing end of comment tag", Span::new(start, self.src.len()))),
        }
    }

    /// Handle `{% raw %}...{% endraw %}`; returns false when the tag is not `raw`
    fn try_lex_raw(&mut self) -> Result<bool, JinjaError> {
        let start = self.pos;
        let Some((after_open, _)) = match_tag_word(self.src, start, "raw") else {
            return Ok(false);
        };

        let mut search = after_open;
        while let Some(off) = self.src[search..].find("{%") {
            let candidate = search + off;
            if let Some((after_end, strip_before)) = match_tag_word(self.src, candidate, "endraw") {
                let body_start = after_open;
                let mut text = &self.src[body_start..candidate];
                if self.src[..after_open].ends_with("-%}") {
                    text = text.trim_start();
                }
                if strip_before {
                    text = text.trim_end();
                }
                if !text.is_empty() {
                    self.tokens.push((Token::Text(text.to_string()), Span::new(body_start, candidate)));
                }
                self.lstrip_next = self.src[..after_end].ends_with("-%}");
                self.pos = after_end;
                return Ok(true);
            }
            search = candidate + 2;
        }

        Err(JinjaError::syntax(
            "Unexpected end of template: missing {% endraw %}",
            Span::new(start, self.src.len()),
        ))
    }

    fn lex_tag(&mut self, kind: TagKind) -> Result<(), JinjaError> {
        let tag_start = self.pos;
        let (start_token, close) = match kind {
            TagKind::Variable => (Token::VariableStart, "}}"),
            TagKind::Block => (Token::BlockStart, "%}"),
        };
        self.tokens.push((start_token, Span::new(self.pos, self.pos + 2)));
        self.pos += 2;
        if self.rest().starts_with('-') || self.rest().starts_with('+') {
            self.pos += 1;
        }

        let mut depth: usize = 0;
        loop {
            self.skip_whitespace();
            if self.pos >= self.src.len() {
                return Err(JinjaError::syntax(
                    format!("Unexpected end of template: tag was never closed with '{}'", close),
                    Span::new(tag_start, self.src.len()),
                ));
            }

            if depth == 0 {
                let rest = self.rest();
                let (stripped, len) = if rest.starts_with('-') && rest[1..].starts_with(close) {
                    (true, 3)
                } else if rest.starts_with('+') && rest[1..].starts_with(close) {
                    (false, 3)
                } else if rest.starts_with(close) {
                    (false, 2)
                } else {
                    (false, 0)
                };
                if len > 0 {
                    let end_token = match kind {
                        TagKind::Variable => Token::VariableEnd,
                        TagKind::Block => Token::BlockEnd,
                    };
                    self.tokens.push((end_token, Span::new(self.pos, self.pos + len)));
                    self.pos += len;
                    self.lstrip_next = stripped;
                    return Ok(());
                }
            }

            let token_start = self.pos;
            let token = self.lex_expression_token()?;
            match &token {
                Token::Op("(") | Token::Op("[") | Token::Op("{") => depth += 1,
                Token::Op(")") | Token::Op("]") | Token::Op("}") => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        JinjaError::syntax("Unbalanced closing bracket", Span::new(token_start, self.pos))
                    })?;
                }
                _ => {}
            }
            self.tokens.push((token, Span::new(token_start, self.pos)));
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn lex_expression_token(&mut self) -> Result<Token, JinjaError> {
        let rest = self.rest();
        let Some(first) = rest.chars().next() else {
            return Err(JinjaError::syntax("Unexpected end of template", Span::new(self.pos, self.pos)));
        };

        if first == '\'' || first == '"' {
            return self.lex_string(first);
        }

        if first.is_ascii_digit() {
            return self.lex_number();
        }

        if first.is_alphabetic() || first == '_' {
            let len = rest
                .char_indices()
                .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let name = rest[..len].to_string();
            self.pos += len;
            return Ok(Token::Name(name));
        }

        for op in OPERATORS {
            if rest.starts_with(op) {
                self.pos += op.len();
                return Ok(Token::Op(op));
            }
        }

        Err(JinjaError::syntax(
            format!("Unexpected char '{}'", first),
            Span::new(self.pos, self.pos + first.len_utf8()),
        ))
    }

    fn lex_string(&mut self, quote: char) -> Result<Token, JinjaError> {
        let start = self.pos;
        let mut value = String::new();
        let mut chars = self.rest().char_indices().skip(1);
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '0' => '\0',
                            other => other,
                        });
                    }
                }
                c if c == quote => {
                    self.pos += i + 1;
                    return Ok(Token::Str(value));
                }
                c => value.push(c),
            }
        }
        Err(JinjaError::syntax("Unterminated string literal", Span::new(start, self.src.len())))
    }

    fn lex_number(&mut self) -> Result<Token, JinjaError> {
        let start = self.pos;
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut i = 0;
        let mut is_float = false;

        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            is_float = true;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
                i += 1;
            }
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                is_float = true;
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }

        let literal: String = rest[..i].chars().filter(|c| *c != '_').collect();
        self.pos += i;
        let span = Span::new(start, self.pos);
        if is_float {
            literal
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| JinjaError::syntax("Invalid float literal", span))
        } else {
            literal
                .parse::<i64>()
                .map(Token::Int)
                .map_err(|_| JinjaError::syntax("Integer literal out of range", span))
        }
    }
}

/// Offset of the next `{{`, `{%` or `{#`
fn find_tag_open(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && matches!(bytes[i + 1], b'{' | b'%' | b'#') {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Match `{%[-+]? word [-+]?%}` at `start`. Returns the offset after the tag
/// and whether the opening had a `-` marker.
fn match_tag_word(src: &str, start: usize, word: &str) -> Option<(usize, bool)> {
    let mut pos = start;
    if !src[pos..].starts_with("{%") {
        return None;
    }
    pos += 2;
    let strip_before = src[pos..].starts_with('-');
    if strip_before || src[pos..].starts_with('+') {
        pos += 1;
    }
    let trimmed = src[pos..].trim_start();
    pos = src.len() - trimmed.len();
    if !src[pos..].starts_with(word) {
        return None;
    }
    pos += word.len();
    let boundary = src[pos..].chars().next();
    if matches!(boundary, Some(c) if c.is_alphanumeric() || c == '_') {
        return None;
    }
    let trimmed = src[pos..].trim_start();
    pos = src.len() - trimmed.len();
    if src[pos..].starts_with('-') || src[pos..].starts_with('+') {
        pos += 1;
    }
    if src[pos..].starts_with("%}") {
        Some((pos + 2, strip_before))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn text_and_variable() {
        let tokens = kinds("select * from {{ ref('orders') }}");
        assert_eq!(
            tokens,
            vec![
                Token::Text("select * from ".to_string()),
                Token::VariableStart,
                Token::Name("ref".to_string()),
                Token::Op("("),
                Token::Str("orders".to_string()),
                Token::Op(")"),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn comments_are_dropped() {
        let tokens = kinds("a{# hidden #}b");
        assert_eq!(tokens, vec![Token::Text("a".to_string()), Token::Text("b".to_string())]);
    }

    #[test]
    fn whitespace_control() {
        let tokens = kinds("a   {%- if x -%}   b");
        assert_eq!(tokens.first(), Some(&Token::Text("a".to_string())));
        assert_eq!(tokens.last(), Some(&Token::Text("b".to_string())));
    }

    #[test]
    fn raw_block_is_text() {
        let tokens = kinds("{% raw %}{{ not_a_call() }}{% endraw %}");
        assert_eq!(tokens, vec![Token::Text("{{ not_a_call() }}".to_string())]);
    }

    #[test]
    fn nested_braces_inside_variable() {
        let tokens = kinds("{{ {'a': {'b': 1}} }}");
        assert_eq!(tokens.last(), Some(&Token::VariableEnd));
        assert_eq!(tokens.iter().filter(|t| **t == Token::Op("}")).count(), 2);
    }

    #[test]
    fn numbers_and_operators() {
        let tokens = kinds("{{ 1_000 // 3.5e1 ** 2 }}");
        assert!(tokens.contains(&Token::Int(1000)));
        assert!(tokens.contains(&Token::Op("//")));
        assert!(tokens.contains(&Token::Float(35.0)));
        assert!(tokens.contains(&Token::Op("**")));
    }

    #[test]
    fn unclosed_tag_is_error() {
        assert!(tokenize("{{ ref('x') ").is_err());
        assert!(tokenize("{# never closed").is_err());
        assert!(tokenize("{% raw %} no end").is_err());
    }
}
