//! Recursive-descent template parser
//!
//! Builds the [`Template`] AST from the lexer's token stream. Operator
//! precedence follows Jinja: conditional expressions bind loosest, then
//! `or`, `and`, `not`, comparisons, `+`/`-`, `~`, `*`/`/`/`//`/`%`, `**`,
//! unary operators, and finally postfix access, filters and tests.

use crate::ast::*;
use crate::error::{JinjaError, Span};
use crate::lexer::{tokenize, Token};

/// Parse a template source into an AST
pub fn parse(source: &str) -> Result<Template, JinjaError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens, source.len());
    let (body, _) = parser.subparse(&[])?;
    Ok(Template { body })
}

/// Parse a standalone expression (no surrounding `{{ }}`)
pub fn parse_expression(source: &str) -> Result<Expr, JinjaError> {
    let wrapped = format!("{{{{ {} }}}}", source);
    let tokens = tokenize(&wrapped)?;
    let mut parser = Parser::new(tokens, wrapped.len());
    parser.expect(&Token::VariableStart)?;
    let expr = parser.parse_tuple(false)?;
    parser.expect(&Token::VariableEnd)?;
    if let Some((token, span)) = parser.peek_full() {
        return Err(JinjaError::syntax(format!("unexpected {}", token.describe()), *span));
    }
    Ok(expr)
}

const BLOCK_TAGS: &[&str] = &[
    "if", "for", "set", "macro", "call", "filter", "do", "with", "block", "extends", "include",
    "import", "from", "break", "continue", "snapshot", "test", "materialization", "docs",
];

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    src_len: usize,
    /// Start offset of the `{%` that stopped the last `subparse`
    last_tag_start: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, Span)>, src_len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            src_len,
            last_tag_start: src_len,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_full(&self) -> Option<&(Token, Span)> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or(Span::new(self.src_len, self.src_len))
    }

    /// End offset of the previously consumed token
    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| s.end)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<(Token, Span)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn unexpected(&self, expected: &str) -> JinjaError {
        match self.peek() {
            Some(token) => JinjaError::syntax(
                format!("expected {}, got {}", expected, token.describe()),
                self.span(),
            ),
            None => JinjaError::syntax(
                format!("unexpected end of template, expected {}", expected),
                self.span(),
            ),
        }
    }

    fn expect(&mut self, token: &Token) -> Result<Span, JinjaError> {
        if self.peek() == Some(token) {
            let span = self.span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.unexpected(&token.describe()))
        }
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), JinjaError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", op)))
        }
    }

    fn is_name(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == name)
    }

    fn eat_name(&mut self, name: &str) -> bool {
        if self.is_name(name) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, name: &str) -> Result<(), JinjaError> {
        if self.eat_name(name) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", name)))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), JinjaError> {
        match self.peek_full() {
            Some((Token::Name(name), span)) => {
                let out = (name.clone(), *span);
                self.pos += 1;
                Ok(out)
            }
            _ => Err(self.unexpected("name")),
        }
    }

    fn expect_block_end(&mut self) -> Result<Span, JinjaError> {
        if self.peek() == Some(&Token::BlockEnd) {
            let span = self.span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.unexpected("end of statement block"))
        }
    }

    /// Parse statements until one of `end_tags` opens a block tag. On return
    /// the parser sits on the end tag's name.
    fn subparse(&mut self, end_tags: &[&str]) -> Result<(Vec<Stmt>, Option<String>), JinjaError> {
        let mut body = Vec::new();
        loop {
            let Some((token, span)) = self.peek_full().cloned() else {
                if end_tags.is_empty() {
                    return Ok((body, None));
                }
                return Err(JinjaError::block_mismatch(
                    format!(
                        "unexpected end of template, expected one of: {}",
                        end_tags.join(", ")
                    ),
                    Span::new(self.src_len, self.src_len),
                ));
            };

            match token {
                Token::Text(text) => {
                    self.pos += 1;
                    body.push(Stmt::Text { text, span });
                }
                Token::VariableStart => {
                    self.pos += 1;
                    let expr = self.parse_tuple(false)?;
                    let end = self.expect(&Token::VariableEnd)?;
                    body.push(Stmt::Output { expr, span: span.to(end) });
                }
                Token::BlockStart => {
                    self.pos += 1;
                    let (tag, _) = match self.peek_full() {
                        Some((Token::Name(name), tag_span)) => (name.clone(), *tag_span),
                        _ => return Err(self.unexpected("tag name")),
                    };
                    if end_tags.contains(&tag.as_str()) {
                        self.last_tag_start = span.start;
                        return Ok((body, Some(tag)));
                    }
                    if !BLOCK_TAGS.contains(&tag.as_str()) {
                        let message = if end_tags.is_empty() {
                            format!("encountered unknown tag '{}'", tag)
                        } else {
                            format!(
                                "encountered unknown tag '{}', expected one of: {}",
                                tag,
                                end_tags.join(", ")
                            )
                        };
                        let is_end = tag.starts_with("end") || tag == "elif" || tag == "else";
                        return Err(if is_end {
                            JinjaError::block_mismatch(message, self.span())
                        } else {
                            JinjaError::syntax(message, self.span())
                        });
                    }
                    let stmt = self.parse_statement(span.start)?;
                    body.push(stmt);
                }
                other => {
                    return Err(JinjaError::syntax(format!("unexpected {}", other.describe()), span));
                }
            }
        }
    }

    /// Consume `name %}` of an end tag and return the end of the tag
    fn finish_end_tag(&mut self) -> Result<usize, JinjaError> {
        self.advance();
        Ok(self.expect_block_end()?.end)
    }

    fn parse_statement(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let (tag, _) = self.expect_ident()?;
        match tag.as_str() {
            "if" => self.parse_if(start),
            "for" => self.parse_for(start),
            "set" => self.parse_set(start),
            "macro" => self.parse_macro(start),
            "call" => self.parse_call_block(start),
            "filter" => {
                let placeholder = Expr::Name(String::new(), self.span());
                let (name, _) = self.expect_ident()?;
                let args = if self.is_op("(") { self.parse_call_args()? } else { CallArgs::default() };
                let span = Span::new(placeholder.span().start, self.prev_end());
                let first = Expr::Filter { value: Box::new(placeholder), name, args, span };
                let filter = self.parse_filter_chain(first)?;
                self.expect_block_end()?;
                let (body, _) = self.subparse(&["endfilter"])?;
                let end = self.finish_end_tag()?;
                Ok(Stmt::FilterBlock { filter, body, span: Span::new(start, end) })
            }
            "do" => {
                let expr = self.parse_tuple(false)?;
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Do { expr, span: Span::new(start, end) })
            }
            "with" => self.parse_with(start),
            "block" => {
                let (name, _) = self.expect_ident()?;
                while self.eat_name("scoped") || self.eat_name("required") {}
                self.expect_block_end()?;
                let (body, _) = self.subparse(&["endblock"])?;
                self.advance();
                self.eat_name(&name);
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Block { name, body, span: Span::new(start, end) })
            }
            "extends" => {
                let template = self.parse_expression(true)?;
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Extends { template, span: Span::new(start, end) })
            }
            "include" => {
                let template = self.parse_expression(true)?;
                if self.eat_name("ignore") {
                    self.expect_keyword("missing")?;
                }
                self.skip_context_modifier();
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Include { template, span: Span::new(start, end) })
            }
            "import" => {
                let template = self.parse_expression(true)?;
                self.expect_keyword("as")?;
                let (alias, _) = self.expect_ident()?;
                self.skip_context_modifier();
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Import { template, alias, span: Span::new(start, end) })
            }
            "from" => self.parse_from_import(start),
            "break" => {
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Break(Span::new(start, end)))
            }
            "continue" => {
                let end = self.expect_block_end()?.end;
                Ok(Stmt::Continue(Span::new(start, end)))
            }
            "snapshot" => self.parse_resource(start, ResourceBlockKind::Snapshot),
            "test" => self.parse_resource(start, ResourceBlockKind::Test),
            "materialization" => self.parse_resource(start, ResourceBlockKind::Materialization),
            "docs" => self.parse_resource(start, ResourceBlockKind::Docs),
            other => Err(JinjaError::syntax(format!("encountered unknown tag '{}'", other), self.span())),
        }
    }

    fn skip_context_modifier(&mut self) {
        if (self.is_name("with") || self.is_name("without"))
            && matches!(self.peek_at(1), Some(Token::Name(n)) if n == "context")
        {
            self.pos += 2;
        }
    }

    fn parse_if(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let mut branches = Vec::new();
        let mut else_body = Vec::new();
        let mut test = self.parse_tuple(false)?;
        self.expect_block_end()?;
        loop {
            let (body, tag) = self.subparse(&["elif", "else", "endif"])?;
            branches.push((test, body));
            match tag.as_deref() {
                Some("elif") => {
                    self.advance();
                    test = self.parse_tuple(false)?;
                    self.expect_block_end()?;
                }
                Some("else") => {
                    self.advance();
                    self.expect_block_end()?;
                    let (body, _) = self.subparse(&["endif"])?;
                    else_body = body;
                    break;
                }
                _ => {
                    let end = self.finish_end_tag()?;
                    return Ok(Stmt::If { branches, else_body, span: Span::new(start, end) });
                }
            }
        }
        let end = self.finish_end_tag()?;
        Ok(Stmt::If { branches, else_body, span: Span::new(start, end) })
    }

    fn parse_for(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let target = self.parse_assign_target()?;
        self.expect_keyword("in")?;
        let iter = self.parse_tuple_no_cond()?;
        let filter = if self.eat_name("if") {
            Some(self.parse_expression(true)?)
        } else {
            None
        };
        let recursive = self.eat_name("recursive");
        self.expect_block_end()?;
        let (body, tag) = self.subparse(&["endfor", "else"])?;
        let else_body = if tag.as_deref() == Some("else") {
            self.advance();
            self.expect_block_end()?;
            self.subparse(&["endfor"])?.0
        } else {
            Vec::new()
        };
        let end = self.finish_end_tag()?;
        Ok(Stmt::For {
            target,
            iter,
            filter,
            recursive,
            body,
            else_body,
            span: Span::new(start, end),
        })
    }

    /// `for` iterables may be bare tuples but never conditional expressions
    fn parse_tuple_no_cond(&mut self) -> Result<Expr, JinjaError> {
        let first = self.parse_expression(false)?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let start = first.span();
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.peek() == Some(&Token::BlockEnd) || self.is_name("if") || self.is_name("recursive") {
                break;
            }
            items.push(self.parse_expression(false)?);
        }
        let span = Span::new(start.start, self.prev_end());
        Ok(Expr::Tuple(items, span))
    }

    fn parse_set(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let target = self.parse_assign_target()?;
        if self.eat_op("=") {
            let value = self.parse_tuple(false)?;
            let end = self.expect_block_end()?.end;
            return Ok(Stmt::Set { target, value, span: Span::new(start, end) });
        }
        let filter = if self.is_op("|") {
            Some(self.parse_filter_chain(Expr::Name(String::new(), self.span()))?)
        } else {
            None
        };
        self.expect_block_end()?;
        let (body, _) = self.subparse(&["endset"])?;
        let end = self.finish_end_tag()?;
        Ok(Stmt::SetBlock { target, filter, body, span: Span::new(start, end) })
    }

    fn parse_macro(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let (name, _) = self.expect_ident()?;
        let params = self.parse_signature()?;
        let body_start = self.expect_block_end()?.end;
        let (body, _) = self.subparse(&["endmacro"])?;
        let body_span = Span::new(body_start, self.last_tag_start);
        self.advance();
        self.eat_name(&name);
        let end = self.expect_block_end()?.end;
        Ok(Stmt::Macro { name, params, body, span: Span::new(start, end), body_span })
    }

    fn parse_call_block(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let params = if self.is_op("(") { self.parse_signature()? } else { Vec::new() };
        let call = self.parse_expression(true)?;
        if !matches!(call, Expr::Call { .. }) {
            return Err(JinjaError::syntax("expected call", call.span()));
        }
        let body_start = self.expect_block_end()?.end;
        let (body, _) = self.subparse(&["endcall"])?;
        let body_span = Span::new(body_start, self.last_tag_start);
        let end = self.finish_end_tag()?;
        Ok(Stmt::CallBlock { call, params, body, span: Span::new(start, end), body_span })
    }

    fn parse_with(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let mut assignments = Vec::new();
        while self.peek() != Some(&Token::BlockEnd) {
            if !assignments.is_empty() {
                self.expect_op(",")?;
            }
            let target = self.parse_assign_target()?;
            self.expect_op("=")?;
            let value = self.parse_expression(true)?;
            assignments.push((target, value));
        }
        self.expect_block_end()?;
        let (body, _) = self.subparse(&["endwith"])?;
        let end = self.finish_end_tag()?;
        Ok(Stmt::With { assignments, body, span: Span::new(start, end) })
    }

    fn parse_from_import(&mut self, start: usize) -> Result<Stmt, JinjaError> {
        let template = self.parse_expression(true)?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        loop {
            if (self.is_name("with") || self.is_name("without"))
                && matches!(self.peek_at(1), Some(Token::Name(n)) if n == "context")
            {
                self.pos += 2;
                break;
            }
            let (name, _) = self.expect_ident()?;
            let alias = if self.eat_name("as") { Some(self.expect_ident()?.0) } else { None };
            names.push((name, alias));
            if !self.eat_op(",") {
                self.skip_context_modifier();
                break;
            }
        }
        let end = self.expect_block_end()?.end;
        Ok(Stmt::FromImport { template, names, span: Span::new(start, end) })
    }

    fn parse_resource(&mut self, start: usize, kind: ResourceBlockKind) -> Result<Stmt, JinjaError> {
        let (name, _) = self.expect_ident()?;
        let mut params = Vec::new();
        let mut kwargs = Vec::new();
        match kind {
            ResourceBlockKind::Test if self.is_op("(") => params = self.parse_signature()?,
            ResourceBlockKind::Materialization => {
                while self.eat_op(",") {
                    if self.is_name("default") && !matches!(self.peek_at(1), Some(Token::Op("="))) {
                        let span = self.span();
                        self.pos += 1;
                        kwargs.push((
                            "adapter".to_string(),
                            Expr::Const(Constant::Str("default".to_string()), span),
                        ));
                        continue;
                    }
                    let (key, _) = self.expect_ident()?;
                    self.expect_op("=")?;
                    kwargs.push((key, self.parse_expression(true)?));
                }
            }
            _ => {}
        }
        let body_start = self.expect_block_end()?.end;
        let end_tag = format!("end{}", kind.tag());
        let (body, _) = self.subparse(&[end_tag.as_str()])?;
        let body_span = Span::new(body_start, self.last_tag_start);
        let end = self.finish_end_tag()?;
        Ok(Stmt::Resource {
            kind,
            name,
            params,
            kwargs,
            body,
            span: Span::new(start, end),
            body_span,
        })
    }

    /// `(a, b=1, ...)`
    fn parse_signature(&mut self) -> Result<Vec<Param>, JinjaError> {
        let mut params = Vec::new();
        self.expect_op("(")?;
        while !self.is_op(")") {
            if !params.is_empty() {
                self.expect_op(",")?;
                if self.is_op(")") {
                    break;
                }
            }
            let (name, _) = self.expect_ident()?;
            let default = if self.eat_op("=") { Some(self.parse_expression(true)?) } else { None };
            params.push(Param { name, default });
        }
        self.expect_op(")")?;
        Ok(params)
    }

    /// Assignment targets: a name, `ns.attr`, or a comma separated list of them
    fn parse_assign_target(&mut self) -> Result<Expr, JinjaError> {
        let parenthesized = self.eat_op("(");
        let mut items = vec![self.parse_target_primary()?];
        while self.eat_op(",") {
            if self.is_op(")") {
                break;
            }
            items.push(self.parse_target_primary()?);
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        if items.len() == 1 && !parenthesized {
            return Ok(items.remove(0));
        }
        let span = Span::new(items[0].span().start, self.prev_end());
        Ok(Expr::Tuple(items, span))
    }

    fn parse_target_primary(&mut self) -> Result<Expr, JinjaError> {
        let (name, span) = self.expect_ident()?;
        let mut target = Expr::Name(name, span);
        if self.eat_op(".") {
            let (attr, attr_span) = self.expect_ident()?;
            target = Expr::GetAttr { value: Box::new(target), attr, span: span.to(attr_span) };
        }
        Ok(target)
    }

    fn is_tuple_end(&self) -> bool {
        matches!(
            self.peek(),
            None | Some(Token::VariableEnd) | Some(Token::BlockEnd) | Some(Token::Op(")"))
        )
    }

    fn parse_tuple(&mut self, explicit_parens: bool) -> Result<Expr, JinjaError> {
        let start = self.span().start;
        let mut items = Vec::new();
        let mut is_tuple = false;
        loop {
            if self.is_tuple_end() {
                break;
            }
            items.push(self.parse_expression(true)?);
            if self.eat_op(",") {
                is_tuple = true;
            } else {
                break;
            }
        }
        if !is_tuple {
            if let Some(item) = items.pop() {
                return Ok(item);
            }
            if !explicit_parens {
                return Err(self.unexpected("expression"));
            }
        }
        Ok(Expr::Tuple(items, Span::new(start, self.prev_end())))
    }

    fn parse_expression(&mut self, with_cond: bool) -> Result<Expr, JinjaError> {
        if with_cond {
            self.parse_condexpr()
        } else {
            self.parse_or()
        }
    }

    fn parse_condexpr(&mut self) -> Result<Expr, JinjaError> {
        let mut expr = self.parse_or()?;
        while self.eat_name("if") {
            let test = self.parse_or()?;
            let otherwise = if self.eat_name("else") {
                Some(Box::new(self.parse_condexpr()?))
            } else {
                None
            };
            let span = Span::new(expr.span().start, self.prev_end());
            expr = Expr::Cond { test: Box::new(test), then: Box::new(expr), otherwise, span };
        }
        Ok(expr)
    }

    fn binary(&self, op: BinOp, left: Expr, right: Expr) -> Expr {
        let span = left.span().to(right.span());
        Expr::Binary { op, left: Box::new(left), right: Box::new(right), span }
    }

    fn parse_or(&mut self) -> Result<Expr, JinjaError> {
        let mut left = self.parse_and()?;
        while self.eat_name("or") {
            let right = self.parse_and()?;
            left = self.binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, JinjaError> {
        let mut left = self.parse_not()?;
        while self.eat_name("and") {
            let right = self.parse_not()?;
            left = self.binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, JinjaError> {
        if self.is_name("not") {
            let start = self.span();
            self.pos += 1;
            let operand = self.parse_not()?;
            let span = start.to(operand.span());
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand), span });
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, JinjaError> {
        let left = self.parse_math1()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Op("==")) => CmpOp::Eq,
                Some(Token::Op("!=")) => CmpOp::Ne,
                Some(Token::Op("<")) => CmpOp::Lt,
                Some(Token::Op("<=")) => CmpOp::Le,
                Some(Token::Op(">")) => CmpOp::Gt,
                Some(Token::Op(">=")) => CmpOp::Ge,
                Some(Token::Name(n)) if n == "in" => CmpOp::In,
                Some(Token::Name(n))
                    if n == "not" && matches!(self.peek_at(1), Some(Token::Name(m)) if m == "in") =>
                {
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.pos += if op == CmpOp::NotIn { 2 } else { 1 };
            ops.push((op, self.parse_math1()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let span = Span::new(left.span().start, self.prev_end());
        Ok(Expr::Compare { left: Box::new(left), ops, span })
    }

    fn parse_math1(&mut self) -> Result<Expr, JinjaError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.parse_concat()?;
            left = self.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, JinjaError> {
        let first = self.parse_math2()?;
        if !self.is_op("~") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op("~") {
            items.push(self.parse_math2()?);
        }
        let span = Span::new(items[0].span().start, self.prev_end());
        Ok(Expr::Concat(items, span))
    }

    fn parse_math2(&mut self) -> Result<Expr, JinjaError> {
        let mut left = self.parse_pow()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.parse_pow()?;
            left = self.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr, JinjaError> {
        let mut left = self.parse_unary(true)?;
        while self.eat_op("**") {
            let right = self.parse_unary(true)?;
            left = self.binary(BinOp::Pow, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self, with_filter: bool) -> Result<Expr, JinjaError> {
        let start = self.span();
        let expr = if self.eat_op("-") {
            let operand = self.parse_unary(false)?;
            let span = start.to(operand.span());
            Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand), span }
        } else if self.eat_op("+") {
            let operand = self.parse_unary(false)?;
            let span = start.to(operand.span());
            Expr::Unary { op: UnaryOp::Pos, operand: Box::new(operand), span }
        } else {
            self.parse_primary()?
        };
        let expr = self.parse_postfix(expr)?;
        if with_filter {
            self.parse_filter_expr(expr)
        } else {
            Ok(expr)
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, JinjaError> {
        let Some((token, span)) = self.advance() else {
            return Err(self.unexpected("expression"));
        };
        match token {
            Token::Name(name) => Ok(match name.as_str() {
                "true" | "True" => Expr::Const(Constant::Bool(true), span),
                "false" | "False" => Expr::Const(Constant::Bool(false), span),
                "none" | "None" => Expr::Const(Constant::None, span),
                _ => Expr::Name(name, span),
            }),
            Token::Str(mut value) => {
                let mut span = span;
                while let Some((Token::Str(next), next_span)) = self.peek_full().cloned() {
                    value.push_str(&next);
                    span = span.to(next_span);
                    self.pos += 1;
                }
                Ok(Expr::Const(Constant::Str(value), span))
            }
            Token::Int(i) => Ok(Expr::Const(Constant::Int(i), span)),
            Token::Float(f) => Ok(Expr::Const(Constant::Float(f), span)),
            Token::Op("(") => {
                let expr = self.parse_tuple(true)?;
                self.expect_op(")")?;
                Ok(expr)
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                while !self.is_op("]") {
                    if !items.is_empty() {
                        self.expect_op(",")?;
                        if self.is_op("]") {
                            break;
                        }
                    }
                    items.push(self.parse_expression(true)?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items, Span::new(span.start, self.prev_end())))
            }
            Token::Op("{") => {
                let mut pairs = Vec::new();
                while !self.is_op("}") {
                    if !pairs.is_empty() {
                        self.expect_op(",")?;
                        if self.is_op("}") {
                            break;
                        }
                    }
                    let key = self.parse_expression(true)?;
                    self.expect_op(":")?;
                    let value = self.parse_expression(true)?;
                    pairs.push((key, value));
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(pairs, Span::new(span.start, self.prev_end())))
            }
            other => Err(JinjaError::syntax(format!("unexpected {}", other.describe()), span)),
        }
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, JinjaError> {
        loop {
            if self.eat_op(".") {
                let start = expr.span().start;
                match self.advance() {
                    Some((Token::Name(attr), span)) => {
                        expr = Expr::GetAttr { value: Box::new(expr), attr, span: Span::new(start, span.end) };
                    }
                    Some((Token::Int(i), span)) => {
                        let index = Expr::Const(Constant::Int(i), span);
                        expr = Expr::GetItem {
                            value: Box::new(expr),
                            index: Box::new(index),
                            span: Span::new(start, span.end),
                        };
                    }
                    _ => return Err(JinjaError::syntax("expected attribute name", self.span())),
                }
            } else if self.eat_op("[") {
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                let span = Span::new(expr.span().start, self.prev_end());
                expr = Expr::GetItem { value: Box::new(expr), index: Box::new(index), span };
            } else if self.is_op("(") {
                expr = self.parse_call(expr)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_subscript(&mut self) -> Result<Expr, JinjaError> {
        let start = self.span();
        let first = if self.is_op(":") { None } else { Some(self.parse_expression(true)?) };
        if !self.eat_op(":") {
            return first.ok_or_else(|| self.unexpected("expression"));
        }
        let stop = if self.is_op("]") || self.is_op(":") {
            None
        } else {
            Some(Box::new(self.parse_expression(true)?))
        };
        let step = if self.eat_op(":") && !self.is_op("]") {
            Some(Box::new(self.parse_expression(true)?))
        } else {
            None
        };
        Ok(Expr::Slice {
            start: first.map(Box::new),
            stop,
            step,
            span: Span::new(start.start, self.prev_end()),
        })
    }

    fn parse_call_args(&mut self) -> Result<CallArgs, JinjaError> {
        self.expect_op("(")?;
        let mut args = CallArgs::default();
        let mut first = true;
        while !self.is_op(")") {
            if !first {
                self.expect_op(",")?;
                if self.is_op(")") {
                    break;
                }
            }
            first = false;
            if self.eat_op("**") {
                args.dyn_kwargs = Some(Box::new(self.parse_expression(true)?));
            } else if self.eat_op("*") {
                args.dyn_args = Some(Box::new(self.parse_expression(true)?));
            } else if matches!(self.peek(), Some(Token::Name(_))) && matches!(self.peek_at(1), Some(Token::Op("="))) {
                let (key, _) = self.expect_ident()?;
                self.pos += 1;
                let value = self.parse_expression(true)?;
                args.kwargs.push((key, value));
            } else {
                if !args.kwargs.is_empty() || args.dyn_args.is_some() || args.dyn_kwargs.is_some() {
                    return Err(JinjaError::syntax("invalid syntax for function call expression", self.span()));
                }
                args.args.push(self.parse_expression(true)?);
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn parse_call(&mut self, func: Expr) -> Result<Expr, JinjaError> {
        let args = self.parse_call_args()?;
        let span = Span::new(func.span().start, self.prev_end());
        Ok(Expr::Call { func: Box::new(func), args, span })
    }

    /// Filters (`| name(args)`) and tests (`is [not] name args`)
    fn parse_filter_expr(&mut self, mut expr: Expr) -> Result<Expr, JinjaError> {
        loop {
            if self.is_op("|") {
                expr = self.parse_filter_chain(expr)?;
            } else if self.is_name("is") {
                expr = self.parse_test(expr)?;
            } else if self.is_op("(") {
                expr = self.parse_call(expr)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_filter_chain(&mut self, mut expr: Expr) -> Result<Expr, JinjaError> {
        while self.eat_op("|") {
            let (mut name, _) = self.expect_ident()?;
            while self.eat_op(".") {
                name.push('.');
                name.push_str(&self.expect_ident()?.0);
            }
            let args = if self.is_op("(") { self.parse_call_args()? } else { CallArgs::default() };
            let span = Span::new(expr.span().start, self.prev_end());
            expr = Expr::Filter { value: Box::new(expr), name, args, span };
        }
        Ok(expr)
    }

    fn parse_test(&mut self, expr: Expr) -> Result<Expr, JinjaError> {
        self.expect_keyword("is")?;
        let negated = self.eat_name("not");
        let (mut name, _) = self.expect_ident()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_ident()?.0);
        }
        let mut args = CallArgs::default();
        if self.is_op("(") {
            args = self.parse_call_args()?;
        } else {
            let starts_arg = match self.peek() {
                Some(Token::Name(n)) => !matches!(n.as_str(), "else" | "or" | "and" | "if" | "is" | "in" | "not"),
                Some(Token::Str(_)) | Some(Token::Int(_)) | Some(Token::Float(_)) => true,
                Some(Token::Op("[")) | Some(Token::Op("{")) => true,
                _ => false,
            };
            if starts_arg {
                let arg = self.parse_primary()?;
                args.args.push(self.parse_postfix(arg)?);
            }
        }
        let span = Span::new(expr.span().start, self.prev_end());
        Ok(Expr::Test { value: Box::new(expr), name, args, negated, span })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_expr(src: &str) -> Expr {
        let template = parse(src).unwrap();
        match template.body.into_iter().next() {
            Some(Stmt::Output { expr, .. }) => expr,
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[test]
    fn parses_ref_call() {
        let expr = output_expr("{{ ref('pkg', 'orders', version=2) }}");
        let Expr::Call { func, args, .. } = expr else { panic!("not a call") };
        assert_eq!(func.as_name(), Some("ref"));
        assert_eq!(args.args.len(), 2);
        assert_eq!(args.kwarg("version").and_then(|e| e.as_const()), Some(&Constant::Int(2)));
    }

    #[test]
    fn precedence() {
        let expr = output_expr("{{ 1 + 2 * 3 }}");
        assert_eq!(expr.to_string(), "(1 + (2 * 3))");
        let expr = output_expr("{{ a ~ b | upper }}");
        assert_eq!(expr.to_string(), "a ~ b|upper");
        let expr = output_expr("{{ x if y else z }}");
        assert_eq!(expr.to_string(), "x if y else z");
        let expr = output_expr("{{ a not in b and not c }}");
        assert_eq!(expr.to_string(), "(a not in b and not c)");
    }

    #[test]
    fn tests_and_filters() {
        let expr = output_expr("{{ x is not defined }}");
        assert!(matches!(expr, Expr::Test { negated: true, .. }));
        let expr = output_expr("{{ cols | join(', ') }}");
        assert!(matches!(expr, Expr::Filter { ref name, .. } if name == "join"));
    }

    #[test]
    fn macro_block_spans() {
        let src = "{% macro hello(name, greeting='hi') %}select '{{ greeting }}'{% endmacro %}";
        let template = parse(src).unwrap();
        let Stmt::Macro { name, params, body_span, span, .. } = &template.body[0] else {
            panic!("expected macro");
        };
        assert_eq!(name, "hello");
        assert_eq!(params.len(), 2);
        assert_eq!(body_span.slice(src), "select '{{ greeting }}'");
        assert_eq!(span.slice(src), src);
    }

    #[test]
    fn control_flow() {
        let src = "{% for a, b in items if a %}{{ a }}{% else %}none{% endfor %}\
                   {% if x %}1{% elif y %}2{% else %}3{% endif %}\
                   {% set ns = namespace(v=1) %}{% set ns.v = 2 %}\
                   {% set block_var %}text{% endset %}";
        let template = parse(src).unwrap();
        assert_eq!(template.body.len(), 5);
        let Stmt::If { branches, else_body, .. } = &template.body[1] else { panic!() };
        assert_eq!(branches.len(), 2);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn materialization_block() {
        let src = "{% materialization table, adapter='postgres', supported_languages=['sql'] %}x{% endmaterialization %}\
                   {% materialization view, default %}y{% endmaterialization %}";
        let template = parse(src).unwrap();
        let Stmt::Resource { kind, name, kwargs, .. } = &template.body[1] else { panic!() };
        assert_eq!(*kind, ResourceBlockKind::Materialization);
        assert_eq!(name, "view");
        assert_eq!(kwargs[0].1.as_str_const(), Some("default"));
        let Stmt::Resource { kwargs, .. } = &template.body[0] else { panic!() };
        assert_eq!(kwargs.len(), 2);
    }

    #[test]
    fn unmatched_end_tag_is_block_mismatch() {
        let err = parse("{% if x %}a{% endfor %}").unwrap_err();
        assert!(matches!(err, JinjaError::BlockMismatch { .. }));
        let err = parse("{% macro m() %}never closed").unwrap_err();
        assert!(matches!(err, JinjaError::BlockMismatch { .. }));
    }

    #[test]
    fn unknown_tag_is_syntax_error() {
        let err = parse("{% frobnicate %}").unwrap_err();
        assert!(matches!(err, JinjaError::Syntax { .. }));
    }

    #[test]
    fn standalone_expression() {
        let expr = parse_expression("var('x', 3) + 1").unwrap();
        assert_eq!(expr.to_string(), "(var('x', 3) + 1)");
        assert!(parse_expression("ref('a') ref('b')").is_err());
    }
}
