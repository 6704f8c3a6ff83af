//! Statement parser.
//!
//! Statements are recognised by their leading keyword. Every expression is
//! delimited first (up to the `;`, `:` or closing parenthesis that ends it at
//! nesting depth zero) and then handed to the expression builder as a
//! complete token slice.

use crate::ast::{Expr, FunctionDecl, Param, Program, Span, StaticVar, Stmt, StmtKind, SwitchCase};
use crate::lexer::{Lexeme, Token, TokenClass};
use crate::value::CastKind;

mod expr;
mod template;

pub use expr::{build_expr, check_balanced, infix_info, Assoc, Nesting, OpInfo, OpKind, MAX_CHAIN, MAX_NESTING};

use expr::{build_list, build_nested, find_case_colon, matching_close, split_top_level};

#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub line: u32,
    pub span: Span,
    pub message: String,
}

impl ParseError {
    pub(crate) fn at(code: &'static str, lexeme: &Lexeme, message: String) -> Self {
        ParseError { code, line: lexeme.line, span: lexeme.span, message }
    }
}

type Result<T> = std::result::Result<T, ParseError>;

/// Error count at which parsing gives up when the caller does not say.
pub const DEFAULT_MAX_ERRORS: usize = 15;

pub struct Parser<'t> {
    tokens: &'t [Lexeme],
    pos: usize,
    errors: Vec<ParseError>,
    max_errors: usize,
    /// Synthetic token used to locate errors at end of input.
    eof: Lexeme,
    /// Statement nesting, plus the links already spent by an enclosing
    /// expression when parsing a function body inside one.
    depth: usize,
    links: usize,
}

/// Parses a whole token stream, collecting up to `max_errors` errors.
pub fn parse(tokens: &[Lexeme], max_errors: usize) -> (Program, Vec<ParseError>) {
    let mut parser = Parser::new(tokens, max_errors);
    let program = parser.parse_program();
    (program, parser.errors)
}

impl<'t> Parser<'t> {
    pub fn new(tokens: &'t [Lexeme], max_errors: usize) -> Self {
        let eof = match tokens.last() {
            Some(last) => Lexeme {
                token: Token::Semi,
                span: Span { start: last.span.end, end: last.span.end },
                line: last.line,
            },
            None => Lexeme { token: Token::Semi, span: Span::UNKNOWN, line: 1 },
        };
        Parser { tokens, pos: 0, errors: Vec::new(), max_errors: max_errors.max(1), eof, depth: 0, links: 0 }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos).map(|l| &l.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + offset).map(|l| &l.token)
    }

    /// Current lexeme, or the end-of-input marker.
    fn here(&self) -> &Lexeme {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let tok = self.tokens.get(self.pos).map(|l| &l.token);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.peek() {
            Some(tok) if tok == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(self.error("EMB-P001", format!("expected {expected}, found {tok}"))),
            None => Err(self.error("EMB-P006", format!("expected {expected}, found end of input"))),
        }
    }

    fn expect_variable(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Variable(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            Some(tok) => Err(self.error("EMB-P007", format!("expected a variable, found {tok}"))),
            None => Err(self.error("EMB-P006", "expected a variable, found end of input".into())),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            Some(tok) => Err(self.error("EMB-P008", format!("expected a name, found {tok}"))),
            None => Err(self.error("EMB-P006", "expected a name, found end of input".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError::at(code, self.here(), message)
    }

    fn span_from(&self, start: usize) -> Span {
        let first = self.tokens.get(start).map_or(self.eof.span, |l| l.span);
        let last = self
            .tokens
            .get(self.pos.saturating_sub(1).max(start))
            .map_or(first, |l| l.span);
        first.merge(last)
    }

    fn stmt(&self, kind: StmtKind, start: usize) -> Stmt {
        let line = self.tokens.get(start).map_or(self.eof.line, |l| l.line);
        Stmt::new(kind, self.span_from(start), line)
    }

    fn give_up(&self) -> bool {
        self.errors.len() >= self.max_errors
    }

    /// Runs `parse` one statement level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("EMB-P013", format!("statements nested more than {MAX_NESTING} levels deep")));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn nesting(&self) -> Nesting {
        Nesting { depth: self.depth, links: self.links }
    }

    fn expr(&self, tokens: &[Lexeme], anchor: &Lexeme) -> Result<Expr> {
        build_nested(tokens, anchor, &mut self.nesting())
    }

    fn list(&self, tokens: &[Lexeme], anchor: &Lexeme) -> Result<Vec<Expr>> {
        build_list(tokens, anchor, false, &mut self.nesting())
    }

    // ---- Statement lists and recovery ----

    pub fn parse_program(&mut self) -> Program {
        let mut body = Vec::new();
        while !self.at_end() && !self.give_up() {
            if self.peek() == Some(&Token::RBrace) {
                let err = self.error("EMB-P002", "unbalanced '}'".into());
                self.errors.push(err);
                self.advance();
                continue;
            }
            self.statement_into(&mut body);
        }
        Program { body }
    }

    /// Parses statements until the closing `}` of the current block (left
    /// unconsumed) or end of input.
    fn statements_until_brace(&mut self) -> Vec<Stmt> {
        let mut body = Vec::new();
        while !self.at_end() && self.peek() != Some(&Token::RBrace) && !self.give_up() {
            self.statement_into(&mut body);
        }
        body
    }

    fn statement_into(&mut self, body: &mut Vec<Stmt>) {
        let before = self.pos;
        match self.statement() {
            Ok(stmt) => body.push(stmt),
            Err(e) => {
                self.errors.push(e);
                let already_synced = self.pos > before
                    && self.tokens.get(self.pos - 1).is_some_and(|l| l.token == Token::Semi);
                if !already_synced {
                    self.sync_to_statement_boundary();
                }
                if self.pos == before {
                    self.advance();
                }
            }
        }
    }

    /// Skips to just past the next `;` outside braces, or up to a `}` that
    /// closes the enclosing block.
    fn sync_to_statement_boundary(&mut self) {
        let mut depth = 0usize;
        while let Some(tok) = self.peek() {
            match tok {
                Token::LBrace => depth += 1,
                Token::RBrace if depth == 0 => return,
                Token::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                Token::Semi if depth == 0 => {
                    self.advance();
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }

    // ---- Statements ----

    fn statement(&mut self) -> Result<Stmt> {
        self.nested(Self::any_statement)
    }

    fn any_statement(&mut self) -> Result<Stmt> {
        let start = self.pos;
        let Some(token) = self.peek() else {
            return Err(self.error("EMB-P006", "expected a statement, found end of input".into()));
        };
        let kind = match token {
            Token::Semi => {
                self.advance();
                StmtKind::Empty
            }
            Token::LBrace => StmtKind::Block { body: self.block()? },
            Token::If => self.if_statement()?,
            Token::While => {
                self.advance();
                let cond = self.paren_expr()?;
                let body = self.body()?;
                StmtKind::While { cond, body }
            }
            Token::Do => {
                self.advance();
                let body = self.body()?;
                self.expect(&Token::While)?;
                let cond = self.paren_expr()?;
                self.end_of_statement()?;
                StmtKind::DoWhile { body, cond }
            }
            Token::For => self.for_statement()?,
            Token::Foreach => self.foreach_statement()?,
            Token::Switch => self.switch_statement()?,
            Token::Break | Token::Continue => {
                let is_break = *token == Token::Break;
                self.advance();
                let levels = match self.peek() {
                    Some(Token::Number(crate::value::Numeric::Int(n))) if *n >= 1 => {
                        let n = u32::try_from(*n).unwrap_or(u32::MAX);
                        self.advance();
                        n
                    }
                    _ => 1,
                };
                self.end_of_statement()?;
                if is_break { StmtKind::Break { levels } } else { StmtKind::Continue { levels } }
            }
            Token::Return => {
                self.advance();
                let value = self.optional_expr()?;
                StmtKind::Return { value }
            }
            Token::Function if matches!(self.peek_at(1), Some(Token::Ident(_))) => {
                StmtKind::Function { decl: self.function_decl()? }
            }
            Token::Static if matches!(self.peek_at(1), Some(Token::Variable(_))) => {
                self.advance();
                StmtKind::Static { vars: self.static_vars()? }
            }
            Token::Uplink => {
                self.advance();
                let mut names = vec![self.expect_variable()?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_variable()?);
                }
                self.end_of_statement()?;
                StmtKind::Uplink { names }
            }
            Token::Const => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(&Token::Assign)?;
                let value = self.expr_until_semi()?;
                StmtKind::Const { name, value }
            }
            Token::Print => {
                let anchor = self.pos;
                self.advance();
                let tokens = self.slice_until_semi()?;
                let args = self.list(tokens, &self.tokens[anchor])?;
                if args.is_empty() {
                    return Err(ParseError::at("EMB-P003", &self.tokens[anchor], "print needs an argument".into()));
                }
                StmtKind::Print { args }
            }
            Token::Unset => {
                let anchor = self.pos;
                self.advance();
                let inner = self.paren_group()?;
                let targets = self.list(inner, &self.tokens[anchor])?;
                if targets.is_empty() || targets.iter().any(|t| !t.is_lvalue()) {
                    return Err(ParseError::at("EMB-P004", &self.tokens[anchor], "unset() expects variables".into()));
                }
                self.end_of_statement()?;
                StmtKind::Unset { targets }
            }
            Token::Else | Token::ElseIf | Token::Case | Token::Default | Token::As => {
                return Err(self.error("EMB-P001", format!("unexpected {token}")));
            }
            _ => StmtKind::Expr { expr: self.expr_until_semi()? },
        };
        Ok(self.stmt(kind, start))
    }

    /// Body of a control statement. A braced body shares the level of the
    /// statement that owns it.
    fn body(&mut self) -> Result<Box<Stmt>> {
        if self.peek() != Some(&Token::LBrace) {
            return self.statement().map(Box::new);
        }
        let start = self.pos;
        let body = self.block()?;
        Ok(Box::new(self.stmt(StmtKind::Block { body }, start)))
    }

    /// `{ statements }`
    fn block(&mut self) -> Result<Vec<Stmt>> {
        let open = self.pos;
        self.expect(&Token::LBrace)?;
        let body = self.statements_until_brace();
        if self.give_up() {
            return Ok(body);
        }
        if !self.eat(&Token::RBrace) {
            return Err(ParseError::at("EMB-P002", &self.tokens[open], "unclosed '{'".into()));
        }
        Ok(body)
    }

    fn if_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let cond = self.paren_expr()?;
        let then = self.body()?;
        let otherwise = match self.peek() {
            Some(Token::ElseIf) => {
                let start = self.pos;
                let chained = self.nested(Self::if_statement)?;
                Some(Box::new(self.stmt(chained, start)))
            }
            Some(Token::Else) => {
                self.advance();
                Some(self.body()?)
            }
            _ => None,
        };
        Ok(StmtKind::If { cond, then, otherwise })
    }

    fn for_statement(&mut self) -> Result<StmtKind> {
        let anchor = self.pos;
        self.advance();
        let inner = self.paren_group()?;
        let clauses = split_top_level(inner, |t| *t == Token::Semi);
        let [init, cond, step] = clauses.as_slice() else {
            return Err(ParseError::at(
                "EMB-P009",
                &self.tokens[anchor],
                "for loop header needs exactly three clauses".into(),
            ));
        };
        let here = &self.tokens[anchor];
        let init = self.list(init, here)?;
        let cond = self.list(cond, here)?;
        let step = self.list(step, here)?;
        let body = self.body()?;
        Ok(StmtKind::For { init, cond, step, body })
    }

    /// `foreach (subject as $v)`, `as $k => $v` or `as $k, $v`.
    fn foreach_statement(&mut self) -> Result<StmtKind> {
        let anchor = self.pos;
        self.advance();
        let inner = self.paren_group()?;
        let parts = split_top_level(inner, |t| *t == Token::As);
        let [subject, binding] = parts.as_slice() else {
            return Err(ParseError::at("EMB-P009", &self.tokens[anchor], "expected 'as' in foreach".into()));
        };
        let subject = self.expr(subject, &self.tokens[anchor])?;
        let names: Vec<String> = binding
            .iter()
            .filter(|l| !matches!(l.token, Token::FatArrow | Token::Comma | Token::Amp))
            .map(|l| match &l.token {
                Token::Variable(name) => Ok(name.clone()),
                other => Err(ParseError::at("EMB-P007", l, format!("expected a variable in foreach, found {other}"))),
            })
            .collect::<Result<_>>()?;
        let separators = binding.iter().filter(|l| matches!(l.token, Token::FatArrow | Token::Comma)).count();
        let (key, value) = match (names.as_slice(), separators) {
            ([value], 0) => (None, value.clone()),
            ([key, value], 1) => (Some(key.clone()), value.clone()),
            _ => {
                return Err(ParseError::at("EMB-P009", &self.tokens[anchor], "malformed foreach binding".into()));
            }
        };
        let body = self.body()?;
        Ok(StmtKind::Foreach { subject, key, value, body })
    }

    fn switch_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let subject = self.paren_expr()?;
        let open = self.pos;
        self.expect(&Token::LBrace)?;
        let mut cases: Vec<SwitchCase> = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.advance();
                    break;
                }
                Some(Token::Case) => {
                    let line = self.here().line;
                    let anchor = self.pos;
                    self.advance();
                    let rest = &self.tokens[self.pos..];
                    let colon = find_case_colon(rest)
                        .filter(|&at| !rest[..at].iter().any(|l| l.token == Token::Semi))
                        .or_else(|| rest.iter().position(|l| l.token == Token::Semi))
                        .ok_or_else(|| ParseError::at("EMB-P009", &self.tokens[anchor], "expected ':' after case".into()))?;
                    let test = self.expr(&rest[..colon], &self.tokens[anchor])?;
                    self.pos += colon + 1;
                    cases.push(SwitchCase { test: Some(test), body: self.case_body(), line });
                }
                Some(Token::Default) => {
                    let line = self.here().line;
                    self.advance();
                    if !self.eat(&Token::Colon) {
                        self.expect(&Token::Semi)?;
                    }
                    if cases.iter().any(|c| c.test.is_none()) {
                        return Err(self.error("EMB-P010", "switch has more than one default".into()));
                    }
                    cases.push(SwitchCase { test: None, body: self.case_body(), line });
                }
                Some(tok) => return Err(self.error("EMB-P001", format!("expected 'case' or 'default', found {tok}"))),
                None => return Err(ParseError::at("EMB-P002", &self.tokens[open], "unclosed switch body".into())),
            }
            if self.give_up() {
                break;
            }
        }
        Ok(StmtKind::Switch { subject, cases })
    }

    fn case_body(&mut self) -> Vec<Stmt> {
        let mut body = Vec::new();
        while !matches!(self.peek(), None | Some(Token::Case | Token::Default | Token::RBrace)) && !self.give_up() {
            self.statement_into(&mut body);
        }
        body
    }

    /// `function name([hint] $p [= default], ...) { body }`
    fn function_decl(&mut self) -> Result<FunctionDecl> {
        let line = self.here().line;
        self.advance();
        let name = self.expect_ident()?;
        let anchor = self.pos;
        let inner = self.paren_group()?;
        let params = self.params(inner, &self.tokens[anchor], &name)?;
        let body = self.block()?;
        Ok(FunctionDecl { name, params, body, line })
    }

    /// Parameter list of `name`; `anchor` is its opening parenthesis.
    fn params(&self, inner: &[Lexeme], anchor: &Lexeme, name: &str) -> Result<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        if inner.is_empty() {
            return Ok(params);
        }
        for piece in split_top_level(inner, |t| *t == Token::Comma) {
            let param = self.param(piece, anchor)?;
            if params.iter().any(|p| p.name == param.name) {
                return Err(ParseError::at("EMB-P011", anchor, format!("duplicate parameter ${} in {name}()", param.name)));
            }
            params.push(param);
        }
        Ok(params)
    }

    fn param(&self, piece: &[Lexeme], anchor: &Lexeme) -> Result<Param> {
        let here = piece.first().unwrap_or(anchor);
        let mut rest = piece;
        let hint = match rest.first().map(|l| &l.token) {
            Some(Token::Ident(hint)) => {
                let kind = CastKind::from_name(hint)
                    .filter(|k| !matches!(k, CastKind::Null))
                    .ok_or_else(|| ParseError::at("EMB-P012", here, format!("unknown type hint '{hint}'")))?;
                rest = &rest[1..];
                Some(kind)
            }
            Some(Token::Array) => {
                rest = &rest[1..];
                Some(CastKind::Array)
            }
            _ => None,
        };
        if rest.first().map(|l| &l.token) == Some(&Token::Amp) {
            rest = &rest[1..];
        }
        let name = match rest.first() {
            Some(Lexeme { token: Token::Variable(name), .. }) => name.clone(),
            Some(other) => return Err(ParseError::at("EMB-P007", other, format!("expected a parameter, found {}", other.token))),
            None => return Err(ParseError::at("EMB-P003", here, "empty parameter".into())),
        };
        let default = match rest.get(1) {
            None => None,
            Some(Lexeme { token: Token::Assign, .. }) => Some(self.expr(&rest[2..], &rest[1])?),
            Some(other) => return Err(ParseError::at("EMB-P001", other, format!("unexpected {} in parameter list", other.token))),
        };
        Ok(Param { name, hint, default })
    }

    /// `$a [= expr], $b ...;`
    fn static_vars(&mut self) -> Result<Vec<StaticVar>> {
        let anchor = self.pos;
        let tokens = self.slice_until_semi()?;
        let mut vars = Vec::new();
        for piece in split_top_level(tokens, |t| *t == Token::Comma) {
            let name = match piece.first() {
                Some(Lexeme { token: Token::Variable(name), .. }) => name.clone(),
                Some(other) => return Err(ParseError::at("EMB-P007", other, format!("expected a variable, found {}", other.token))),
                None => return Err(ParseError::at("EMB-P003", &self.tokens[anchor], "empty static declaration".into())),
            };
            let init = match piece.get(1) {
                None => None,
                Some(Lexeme { token: Token::Assign, .. }) => Some(self.expr(&piece[2..], &piece[1])?),
                Some(other) => return Err(ParseError::at("EMB-P001", other, format!("unexpected {}", other.token))),
            };
            vars.push(StaticVar { name, init });
        }
        Ok(vars)
    }

    // ---- Expression delimiting ----

    /// Inner tokens of the parenthesised group at the cursor.
    fn paren_group(&mut self) -> Result<&'t [Lexeme]> {
        if self.peek() != Some(&Token::LParen) {
            let found = self.peek().map_or("end of input".to_string(), |t| t.to_string());
            return Err(self.error("EMB-P001", format!("expected '(', found {found}")));
        }
        let close = matching_close(self.tokens, self.pos)
            .ok_or_else(|| self.error("EMB-P002", "unclosed '('".into()))?;
        let inner = &self.tokens[self.pos + 1..close];
        check_balanced(inner)?;
        self.pos = close + 1;
        Ok(inner)
    }

    fn paren_expr(&mut self) -> Result<Expr> {
        let anchor = self.pos;
        let inner = self.paren_group()?;
        self.expr(inner, &self.tokens[anchor])
    }

    /// Tokens up to the next `;` outside braces, consuming it. Any other
    /// `;` ends the slice, so an unclosed parenthesis cannot swallow the
    /// statements after it; braces may hold a function body. End of input
    /// also terminates the final statement.
    fn slice_until_semi(&mut self) -> Result<&'t [Lexeme]> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut braces = 0usize;
        let mut i = start;
        while let Some(lexeme) = self.tokens.get(i) {
            let class = lexeme.class();
            if class.contains(TokenClass::OPEN) {
                depth += 1;
                braces += usize::from(lexeme.token == Token::LBrace);
            } else if class.contains(TokenClass::CLOSE) {
                if depth == 0 {
                    return Err(ParseError::at("EMB-P006", lexeme, format!("expected ';' before {}", lexeme.token)));
                }
                depth -= 1;
                braces -= usize::from(lexeme.token == Token::RBrace && braces > 0);
            } else if lexeme.token == Token::Semi && braces == 0 {
                self.pos = i + 1;
                return Ok(&self.tokens[start..i]);
            }
            i += 1;
        }
        self.pos = i;
        Ok(&self.tokens[start..i])
    }

    fn expr_until_semi(&mut self) -> Result<Expr> {
        let anchor = self.pos.min(self.tokens.len().saturating_sub(1));
        let tokens = self.slice_until_semi()?;
        let here = self.tokens.get(anchor).unwrap_or(&self.eof);
        self.expr(tokens, here)
    }

    fn optional_expr(&mut self) -> Result<Option<Expr>> {
        if self.eat(&Token::Semi) || self.at_end() || self.peek() == Some(&Token::RBrace) {
            return Ok(None);
        }
        self.expr_until_semi().map(Some)
    }

    fn end_of_statement(&mut self) -> Result<()> {
        if self.at_end() || self.eat(&Token::Semi) {
            return Ok(());
        }
        let found = self.here().token.clone();
        Err(self.error("EMB-P006", format!("expected ';', found {found}")))
    }
}

/// Declaration of an anonymous `function (params) { body }`. `params` and
/// `body` are the insides of its two groups; the body is parsed one level
/// below `nesting`.
pub(crate) fn closure_decl(keyword: &Lexeme, params: &[Lexeme], body: &[Lexeme], nesting: Nesting) -> Result<FunctionDecl> {
    let mut parser = Parser::new(body, 1);
    parser.depth = nesting.depth + 1;
    parser.links = nesting.links;
    let params = parser.params(params, keyword, "{closure}")?;
    let body = parser.statements_until_brace();
    match parser.errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(FunctionDecl { name: String::new(), params, body, line: keyword.line }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ExprKind;
    use crate::lexer::tokenize;

    fn parse_str(source: &str) -> Program {
        let tokens = tokenize(source).unwrap();
        let (program, errors) = parse(&tokens, DEFAULT_MAX_ERRORS);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        program
    }

    fn parse_errors(source: &str) -> Vec<ParseError> {
        let tokens = tokenize(source).unwrap();
        parse(&tokens, DEFAULT_MAX_ERRORS).1
    }

    #[test]
    fn expression_statements() {
        let program = parse_str("$a = 1 + 2; $b = $a;");
        assert_eq!(program.body.len(), 2);
        assert!(matches!(&program.body[0].kind, StmtKind::Expr { expr } if matches!(expr.kind, ExprKind::Assign { .. })));
    }

    #[test]
    fn final_semicolon_optional_at_end_of_input() {
        let program = parse_str("print 1");
        assert!(matches!(program.body[0].kind, StmtKind::Print { .. }));
    }

    #[test]
    fn if_elseif_else_chain() {
        let program = parse_str("if ($a) { print 1; } elseif ($b) print 2; else if ($c) print 3; else print 4;");
        let StmtKind::If { otherwise: Some(second), .. } = &program.body[0].kind else { panic!() };
        let StmtKind::If { otherwise: Some(third), .. } = &second.kind else { panic!() };
        let StmtKind::If { otherwise: Some(last), .. } = &third.kind else { panic!() };
        assert!(matches!(last.kind, StmtKind::Print { .. }));
    }

    #[test]
    fn loops() {
        let program = parse_str(
            "while ($i < 3) $i++; do { $j--; } while ($j > 0); for ($i = 0, $j = 1; $i < 3; $i++) {} for (;;) break;",
        );
        assert!(matches!(program.body[0].kind, StmtKind::While { .. }));
        assert!(matches!(program.body[1].kind, StmtKind::DoWhile { .. }));
        let StmtKind::For { init, cond, step, .. } = &program.body[2].kind else { panic!() };
        assert_eq!((init.len(), cond.len(), step.len()), (2, 1, 1));
        let StmtKind::For { init, cond, .. } = &program.body[3].kind else { panic!() };
        assert!(init.is_empty() && cond.is_empty());
    }

    #[test]
    fn foreach_bindings() {
        let program = parse_str("foreach ($a as $v) {} foreach (f() as $k => $v) {} foreach ($a as $k, $v) {}");
        let keys: Vec<Option<String>> = program
            .body
            .iter()
            .map(|s| match &s.kind {
                StmtKind::Foreach { key, .. } => key.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec![None, Some("k".to_string()), Some("k".to_string())]);
    }

    #[test]
    fn switch_cases_and_default() {
        let program = parse_str(
            "switch ($x) { case 1: case 2: print 'low'; break; case $y ? 3 : 4: print 'mid'; default: print 'hi'; }",
        );
        let StmtKind::Switch { cases, .. } = &program.body[0].kind else { panic!() };
        assert_eq!(cases.len(), 4);
        assert!(cases[0].body.is_empty());
        assert_eq!(cases[1].body.len(), 2);
        assert!(matches!(cases[2].test.as_ref().unwrap().kind, ExprKind::Ternary { .. }));
        assert!(cases[3].test.is_none());
    }

    #[test]
    fn function_with_hints_and_defaults() {
        let program = parse_str("function add(int $a, $b = 10, array $c = []) { return $a + $b; }");
        let StmtKind::Function { decl } = &program.body[0].kind else { panic!() };
        assert_eq!(decl.name, "add");
        assert_eq!(decl.params.len(), 3);
        assert_eq!(decl.params[0].hint, Some(CastKind::Int));
        assert!(decl.params[1].default.is_some());
        assert_eq!(decl.params[2].hint, Some(CastKind::Array));
        assert_eq!(decl.body.len(), 1);
    }

    #[test]
    fn declarations() {
        let program = parse_str("static $n = 0, $m; uplink $g, $h; const LIMIT = 10; unset($a, $b[1]); break 2;");
        assert!(matches!(&program.body[0].kind, StmtKind::Static { vars } if vars.len() == 2 && vars[1].init.is_none()));
        assert!(matches!(&program.body[1].kind, StmtKind::Uplink { names } if names.len() == 2));
        assert!(matches!(&program.body[2].kind, StmtKind::Const { name, .. } if name == "LIMIT"));
        assert!(matches!(&program.body[3].kind, StmtKind::Unset { targets } if targets.len() == 2));
        assert!(matches!(program.body[4].kind, StmtKind::Break { levels: 2 }));
    }

    #[test]
    fn errors_recover_at_statement_boundaries() {
        let errors = parse_errors("$a = ;\n$b = 2;\nprint (1;\n$c = 3 +;");
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].code, "EMB-P002");
        assert_eq!(errors[2].line, 4);
    }

    #[test]
    fn missing_semicolon_before_brace() {
        let errors = parse_errors("if ($a) { $b = 1 }");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "EMB-P006");
    }

    #[test]
    fn error_budget_is_respected() {
        let source = "$a = ;".repeat(40);
        let tokens = tokenize(&source).unwrap();
        assert_eq!(parse(&tokens, 5).1.len(), 5);
    }

    #[test]
    fn stray_keywords_are_rejected() {
        assert_eq!(parse_errors("else print 1;")[0].code, "EMB-P001");
        assert_eq!(parse_errors("switch ($a) { default: default: }")[0].code, "EMB-P010");
        assert_eq!(parse_errors("function f($a, $a) {}")[0].code, "EMB-P011");
    }

    #[test]
    fn lines_are_recorded() {
        let program = parse_str("$a = 1;\n\nprint $a;");
        assert_eq!(program.body[1].line, 3);
    }
    #[test]
    fn moderate_statement_nesting_parses() {
        let ifs = format!("{}print 1;{}", "if ($a) { ".repeat(40), " }".repeat(40));
        assert_eq!(parse_str(&ifs).body.len(), 1);
        let elseifs = format!("if ($a) {{ }}{} else {{ }}", " elseif ($b) { }".repeat(40));
        assert_eq!(parse_str(&elseifs).body.len(), 1);
    }

    #[test]
    fn deep_statement_nesting_is_rejected() {
        let blocks = format!("{}print 1;{}", "{ ".repeat(500), " }".repeat(500));
        assert_eq!(parse_errors(&blocks)[0].code, "EMB-P013");

        let loops = format!("{}print 1;{}", "while ($a) ".repeat(500), "");
        let errors = parse_errors(&loops);
        assert_eq!(errors[0].code, "EMB-P013");
        assert!(errors[0].message.contains("statements nested"));

        let elseifs = format!("if ($a) {{ }}{}", " elseif ($b) { }".repeat(500));
        assert_eq!(parse_errors(&elseifs)[0].code, "EMB-P013");

        let closures = format!("$f = {}1{};", "function () { return ".repeat(200), "; }".repeat(200));
        assert_eq!(parse_errors(&closures)[0].code, "EMB-P013");
    }

    #[test]
    fn deep_expression_in_statement_is_rejected() {
        let source = format!("$a = {}1{};\nprint 2;", "(".repeat(1000), ")".repeat(1000));
        assert_eq!(parse_errors(&source)[0].code, "EMB-P013");
    }

    #[test]
    fn closure_expression_statement() {
        let program = parse_str("$f = function ($x) { return $x * 2; }; print $f(3);");
        assert_eq!(program.body.len(), 2);
        let StmtKind::Expr { expr } = &program.body[0].kind else {
            panic!("expected an expression statement");
        };
        let ExprKind::Assign { value, .. } = &expr.kind else {
            panic!("expected an assignment");
        };
        assert!(matches!(&value.kind, ExprKind::Closure { decl } if decl.params.len() == 1));
    }
}
