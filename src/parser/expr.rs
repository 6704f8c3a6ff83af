//! Expression builder.
//!
//! Works on the token slice of one expression. Delimiters are checked for
//! balance before anything else, so every nested construct can locate its
//! closing token by a plain depth scan and be built recursively from its
//! own sub-slice. Binary operators are climbed by rank from the table below;
//! postfix constructs are recognised structurally after a primary.
//!
//! Nesting is capped so that building, compiling and dropping a tree never
//! exhausts the native stack: [`MAX_NESTING`] bounds recursive levels
//! (groups, literals, operands, statement blocks) and [`MAX_CHAIN`] bounds
//! how many operators or postfix links a tree stacks up in total.

use crate::ast::{ArrayItem, BinaryOp, Expr, ExprKind, Span, UnaryOp};
use crate::lexer::{Lexeme, Token, TokenClass};
use crate::value::{ArithOp, BitOp, CastKind, Numeric};

use super::template;
use super::{ParseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpKind {
    Binary(BinaryOp),
    /// Plain (`None`) or compound assignment.
    Assign(Option<BinaryOp>),
    Ternary,
}

/// One row of the operator table. Rank 1 binds tightest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpInfo {
    pub rank: u8,
    pub assoc: Assoc,
    pub kind: OpKind,
}

/// Deepest recursive nesting of groups, operands and blocks.
pub const MAX_NESTING: usize = 64;
/// Most operator and postfix links in one statement's expression tree.
pub const MAX_CHAIN: usize = 512;

/// Where a slice sits: its nesting depth and the links already spent by
/// the tree it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nesting {
    pub depth: usize,
    pub links: usize,
}

impl Nesting {
    pub fn at(depth: usize) -> Self {
        Nesting { depth, links: 0 }
    }
}

const TERNARY_RANK: u8 = 13;
const ASSIGN_RANK: u8 = 14;
const LOOSEST_RANK: u8 = 17;

const fn op(rank: u8, assoc: Assoc, kind: OpKind) -> OpInfo {
    OpInfo { rank, assoc, kind }
}

const fn bin(rank: u8, binary: BinaryOp) -> OpInfo {
    op(rank, Assoc::Left, OpKind::Binary(binary))
}

const fn assign(binary: Option<BinaryOp>) -> OpInfo {
    op(ASSIGN_RANK, Assoc::Right, OpKind::Assign(binary))
}

static OPERATORS: &[(Token, OpInfo)] = &[
    (Token::Star, bin(3, BinaryOp::Arith(ArithOp::Mul))),
    (Token::Slash, bin(3, BinaryOp::Arith(ArithOp::Div))),
    (Token::Percent, bin(3, BinaryOp::Arith(ArithOp::Mod))),
    (Token::Plus, bin(4, BinaryOp::Arith(ArithOp::Add))),
    (Token::Minus, bin(4, BinaryOp::Arith(ArithOp::Sub))),
    (Token::Dot, bin(4, BinaryOp::Concat)),
    (Token::Shl, bin(5, BinaryOp::Bit(BitOp::Shl))),
    (Token::Shr, bin(5, BinaryOp::Bit(BitOp::Shr))),
    (Token::Lt, bin(6, BinaryOp::Lt)),
    (Token::Le, bin(6, BinaryOp::Le)),
    (Token::Gt, bin(6, BinaryOp::Gt)),
    (Token::Ge, bin(6, BinaryOp::Ge)),
    (Token::Eq, bin(7, BinaryOp::Eq)),
    (Token::Ne, bin(7, BinaryOp::Ne)),
    (Token::StrictEq, bin(7, BinaryOp::StrictEq)),
    (Token::StrictNe, bin(7, BinaryOp::StrictNe)),
    (Token::Amp, bin(8, BinaryOp::Bit(BitOp::And))),
    (Token::Caret, bin(9, BinaryOp::Bit(BitOp::Xor))),
    (Token::Pipe, bin(10, BinaryOp::Bit(BitOp::Or))),
    (Token::AndAnd, bin(11, BinaryOp::And)),
    (Token::OrOr, bin(12, BinaryOp::Or)),
    (Token::Question, op(TERNARY_RANK, Assoc::Right, OpKind::Ternary)),
    (Token::Assign, assign(None)),
    (Token::PlusAssign, assign(Some(BinaryOp::Arith(ArithOp::Add)))),
    (Token::MinusAssign, assign(Some(BinaryOp::Arith(ArithOp::Sub)))),
    (Token::StarAssign, assign(Some(BinaryOp::Arith(ArithOp::Mul)))),
    (Token::SlashAssign, assign(Some(BinaryOp::Arith(ArithOp::Div)))),
    (Token::PercentAssign, assign(Some(BinaryOp::Arith(ArithOp::Mod)))),
    (Token::DotAssign, assign(Some(BinaryOp::Concat))),
    (Token::AmpAssign, assign(Some(BinaryOp::Bit(BitOp::And)))),
    (Token::PipeAssign, assign(Some(BinaryOp::Bit(BitOp::Or)))),
    (Token::CaretAssign, assign(Some(BinaryOp::Bit(BitOp::Xor)))),
    (Token::ShlAssign, assign(Some(BinaryOp::Bit(BitOp::Shl)))),
    (Token::ShrAssign, assign(Some(BinaryOp::Bit(BitOp::Shr)))),
    (Token::WordAnd, bin(15, BinaryOp::And)),
    (Token::WordXor, bin(16, BinaryOp::Xor)),
    (Token::WordOr, bin(LOOSEST_RANK, BinaryOp::Or)),
];

/// Looks up the infix operator table.
pub fn infix_info(token: &Token) -> Option<OpInfo> {
    OPERATORS.iter().find(|(t, _)| t == token).map(|(_, info)| *info)
}

// ── Delimiter helpers ────────────────────────────────────────────────

fn closer_for(token: &Token) -> Option<Token> {
    match token {
        Token::LParen => Some(Token::RParen),
        Token::LBracket => Some(Token::RBracket),
        Token::LBrace => Some(Token::RBrace),
        _ => None,
    }
}

/// Verifies that every `(`, `[` and `{` in `tokens` is closed by the right
/// token. Reports the first offending delimiter.
pub fn check_balanced(tokens: &[Lexeme]) -> Result<()> {
    let mut open: Vec<(usize, Token)> = Vec::new();
    for (i, lexeme) in tokens.iter().enumerate() {
        if let Some(close) = closer_for(&lexeme.token) {
            open.push((i, close));
        } else if lexeme.class().contains(TokenClass::CLOSE) {
            match open.pop() {
                Some((_, expected)) if expected == lexeme.token => {}
                Some((_, expected)) => {
                    return Err(ParseError::at(
                        "EMB-P002",
                        lexeme,
                        format!("mismatched delimiter: expected {expected}, found {}", lexeme.token),
                    ));
                }
                None => {
                    return Err(ParseError::at("EMB-P002", lexeme, format!("unbalanced {}", lexeme.token)));
                }
            }
        }
    }
    match open.pop() {
        Some((i, expected)) => Err(ParseError::at(
            "EMB-P002",
            &tokens[i],
            format!("unclosed {}: expected {expected}", tokens[i].token),
        )),
        None => Ok(()),
    }
}

/// Index of the token closing the delimiter at `open`. The slice must have
/// passed [`check_balanced`] (or be otherwise known to be balanced from
/// `open` onward); `None` when it runs out first.
pub fn matching_close(tokens: &[Lexeme], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, lexeme) in tokens.iter().enumerate().skip(open) {
        let class = lexeme.class();
        if class.contains(TokenClass::OPEN) {
            depth += 1;
        } else if class.contains(TokenClass::CLOSE) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Splits at every depth-0 token accepted by `is_sep`.
pub fn split_top_level<'t>(tokens: &'t [Lexeme], is_sep: impl Fn(&Token) -> bool) -> Vec<&'t [Lexeme]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, lexeme) in tokens.iter().enumerate() {
        let class = lexeme.class();
        if class.contains(TokenClass::OPEN) {
            depth += 1;
        } else if class.contains(TokenClass::CLOSE) {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && is_sep(&lexeme.token) {
            parts.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    parts.push(&tokens[start..]);
    parts
}

/// Position of the first depth-0 `:` that is not the middle of a `?:`.
pub fn find_case_colon(tokens: &[Lexeme]) -> Option<usize> {
    let mut depth = 0usize;
    let mut pending_ternaries = 0usize;
    for (i, lexeme) in tokens.iter().enumerate() {
        let class = lexeme.class();
        if class.contains(TokenClass::OPEN) {
            depth += 1;
        } else if class.contains(TokenClass::CLOSE) {
            depth = depth.saturating_sub(1);
        } else if depth == 0 {
            match lexeme.token {
                Token::Question => pending_ternaries += 1,
                Token::Colon if pending_ternaries > 0 => pending_ternaries -= 1,
                Token::Colon => return Some(i),
                _ => {}
            }
        }
    }
    None
}

// ── Builder ──────────────────────────────────────────────────────────

/// Builds one expression from a complete token slice. `anchor` locates
/// errors for an empty slice.
pub fn build_expr(tokens: &[Lexeme], anchor: &Lexeme) -> Result<Expr> {
    build_nested(tokens, anchor, &mut Nesting::default())
}

/// [`build_expr`] for a nested slice. The links it uses are added to
/// `nesting`.
pub fn build_nested(tokens: &[Lexeme], anchor: &Lexeme, nesting: &mut Nesting) -> Result<Expr> {
    if tokens.is_empty() {
        return Err(ParseError::at("EMB-P003", anchor, "empty expression".to_string()));
    }
    check_balanced(tokens)?;
    let mut builder = ExprBuilder::new(tokens, *nesting);
    let expr = builder.finish()?;
    nesting.links = builder.links;
    Ok(expr)
}

/// Builds a comma-separated list. An empty slice is an empty list; empty
/// items are errors unless `trailing_comma` allows one at the end.
pub fn build_list(tokens: &[Lexeme], anchor: &Lexeme, trailing_comma: bool, nesting: &mut Nesting) -> Result<Vec<Expr>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    check_balanced(tokens)?;
    let mut parts = split_top_level(tokens, |t| *t == Token::Comma);
    if trailing_comma && parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            let here = tokens.get(position_of(tokens, part, i)).unwrap_or(anchor);
            build_nested(part, here, nesting)
        })
        .collect()
}

/// Best token to blame for the `i`th (possibly empty) part of a split.
fn position_of(tokens: &[Lexeme], part: &[Lexeme], i: usize) -> usize {
    match part.first() {
        Some(first) => tokens.iter().position(|t| std::ptr::eq(t, first)).unwrap_or(0),
        None => {
            let commas: Vec<usize> = tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| t.token == Token::Comma)
                .map(|(idx, _)| idx)
                .collect();
            commas.get(i).copied().or_else(|| commas.last().copied()).unwrap_or(0)
        }
    }
}

struct ExprBuilder<'t> {
    tokens: &'t [Lexeme],
    pos: usize,
    depth: usize,
    links: usize,
}

impl<'t> ExprBuilder<'t> {
    fn new(tokens: &'t [Lexeme], nesting: Nesting) -> Self {
        ExprBuilder { tokens, pos: 0, depth: nesting.depth, links: nesting.links }
    }

    fn nesting(&self) -> Nesting {
        Nesting { depth: self.depth, links: self.links }
    }

    /// Builds the group closing at `close` as its own expression.
    fn group(&mut self, inner: &[Lexeme], close: usize) -> Result<Expr> {
        let mut nesting = self.nesting();
        let expr = build_nested(inner, &self.tokens[close], &mut nesting)?;
        self.links = nesting.links;
        Ok(expr)
    }

    fn group_list(&mut self, inner: &[Lexeme], close: usize) -> Result<Vec<Expr>> {
        let mut nesting = self.nesting();
        let list = build_list(inner, &self.tokens[close], false, &mut nesting)?;
        self.links = nesting.links;
        Ok(list)
    }

    fn group_items(&mut self, inner: &[Lexeme], close: usize, key_sep: &Token) -> Result<Vec<ArrayItem>> {
        let mut nesting = self.nesting();
        let items = array_items(inner, &self.tokens[close], key_sep, &mut nesting)?;
        self.links = nesting.links;
        Ok(items)
    }

    fn finish(&mut self) -> Result<Expr> {
        let expr = self.expression(LOOSEST_RANK)?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some(extra) => Err(ParseError::at(
                "EMB-P001",
                extra,
                format!("unexpected {} in expression", extra.token),
            )),
        }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos).map(|l| &l.token)
    }

    fn lexeme(&self) -> &'t Lexeme {
        let idx = self.pos.min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError::at(code, self.lexeme(), message)
    }

    fn span_from(&self, start: usize) -> Span {
        let first = self.tokens[start].span;
        let last = self.tokens[self.pos.saturating_sub(1).max(start)].span;
        first.merge(last)
    }

    fn node(&self, kind: ExprKind, start: usize) -> Expr {
        Expr::new(kind, self.span_from(start), self.tokens[start].line)
    }

    /// Runs `build` one level deeper.
    fn nested<T>(&mut self, build: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("EMB-P013", format!("expression nested more than {MAX_NESTING} levels deep")));
        }
        self.depth += 1;
        let built = build(self);
        self.depth -= 1;
        built
    }

    /// Counts one more operator or postfix link in the tree.
    fn link(&mut self) -> Result<()> {
        self.links += 1;
        if self.links > MAX_CHAIN {
            return Err(self.error("EMB-P013", format!("expression chains more than {MAX_CHAIN} operators")));
        }
        Ok(())
    }

    fn expression(&mut self, max_rank: u8) -> Result<Expr> {
        self.nested(|b| b.climb(max_rank))
    }

    /// Climbs binary operators whose rank is at most `max_rank`.
    fn climb(&mut self, max_rank: u8) -> Result<Expr> {
        let start = self.pos;
        let mut lhs = self.unary()?;
        while let Some(token) = self.peek() {
            let Some(info) = infix_info(token) else { break };
            if info.rank > max_rank {
                break;
            }
            match info.kind {
                OpKind::Assign(_) => {
                    return Err(self.error("EMB-P004", "cannot assign to this expression".to_string()));
                }
                OpKind::Ternary => {
                    self.link()?;
                    self.pos += 1;
                    let then = if self.peek() == Some(&Token::Colon) {
                        None
                    } else {
                        Some(Box::new(self.expression(LOOSEST_RANK)?))
                    };
                    self.expect(Token::Colon)?;
                    let otherwise = self.expression(TERNARY_RANK)?;
                    lhs = self.node(
                        ExprKind::Ternary { cond: Box::new(lhs), then, otherwise: Box::new(otherwise) },
                        start,
                    );
                }
                OpKind::Binary(op) => {
                    self.link()?;
                    self.pos += 1;
                    let next_max = match info.assoc {
                        Assoc::Left => info.rank - 1,
                        Assoc::Right => info.rank,
                    };
                    let rhs = self.expression(next_max)?;
                    lhs = self.node(
                        ExprKind::Binary { op, left: Box::new(lhs), right: Box::new(rhs) },
                        start,
                    );
                }
            }
        }
        Ok(lhs)
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.peek() {
            Some(t) if *t == token => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(self.error("EMB-P001", format!("expected {token}, found {t}"))),
            None => Err(self.error("EMB-P001", format!("expected {token} before end of expression"))),
        }
    }

    /// Prefix operators, casts, then a postfix chain. An lvalue followed by
    /// an assignment operator takes the assignment here, so `$a + $b = 1`
    /// reads as `$a + ($b = 1)`.
    fn unary(&mut self) -> Result<Expr> {
        let start = self.pos;
        let Some(token) = self.peek() else {
            return Err(self.error("EMB-P003", "expected an operand".to_string()));
        };
        let prefix = match token {
            Token::Bang => Some(UnaryOp::Not),
            Token::Tilde => Some(UnaryOp::BitNot),
            Token::Minus => Some(UnaryOp::Neg),
            Token::Plus => Some(UnaryOp::Plus),
            _ => None,
        };
        if let Some(op) = prefix {
            self.pos += 1;
            let operand = self.nested(Self::unary)?;
            return Ok(fold_unary(op, operand, self.span_from(start), self.tokens[start].line));
        }
        if matches!(token, Token::Inc | Token::Dec) {
            let increment = *token == Token::Inc;
            self.pos += 1;
            let target = self.postfix()?;
            if !target.is_lvalue() {
                return Err(ParseError::at("EMB-P004", &self.tokens[start], "cannot increment this expression".to_string()));
            }
            return Ok(self.node(ExprKind::IncDec { increment, prefix: true, target: Box::new(target) }, start));
        }
        if let Some(to) = self.cast_ahead() {
            self.pos += 3;
            let operand = self.nested(Self::unary)?;
            return Ok(self.node(ExprKind::Cast { to, operand: Box::new(operand) }, start));
        }

        let expr = self.postfix()?;
        if expr.is_lvalue() {
            if let Some(OpInfo { kind: OpKind::Assign(op), .. }) = self.peek().and_then(infix_info) {
                self.pos += 1;
                if op.is_none() && self.peek() == Some(&Token::Amp) {
                    self.pos += 1;
                    let source = self.postfix()?;
                    if !source.is_lvalue() {
                        return Err(ParseError::at("EMB-P004", &self.tokens[start], "only variables can be bound by reference".to_string()));
                    }
                    return Ok(self.node(
                        ExprKind::AssignRef { target: Box::new(expr), source: Box::new(source) },
                        start,
                    ));
                }
                let value = self.expression(ASSIGN_RANK)?;
                return Ok(self.node(
                    ExprKind::Assign { op, target: Box::new(expr), value: Box::new(value) },
                    start,
                ));
            }
        }
        Ok(expr)
    }

    /// `(int)`-style cast at the cursor, when followed by an operand.
    fn cast_ahead(&self) -> Option<CastKind> {
        if self.peek() != Some(&Token::LParen) {
            return None;
        }
        let name = match self.tokens.get(self.pos + 1).map(|l| &l.token) {
            Some(Token::Ident(name)) => name.as_str(),
            Some(Token::Array) => "array",
            Some(Token::Null) => "null",
            _ => return None,
        };
        if self.tokens.get(self.pos + 2).map(|l| &l.token) != Some(&Token::RParen) {
            return None;
        }
        let operand_follows = self.tokens.get(self.pos + 3).is_some_and(|l| {
            let class = l.class();
            !class.intersects(TokenClass::CLOSE | TokenClass::PUNCTUATION)
                && (infix_info(&l.token).is_none() || matches!(l.token, Token::Minus | Token::Plus))
                || l.token == Token::LParen
                || l.token == Token::LBracket
        });
        if !operand_follows {
            return None;
        }
        CastKind::from_name(name)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let start = self.pos;
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Some(Token::LParen | Token::LBracket | Token::Arrow | Token::Inc | Token::Dec)) {
                self.link()?;
            }
            match self.peek() {
                Some(Token::LParen) => {
                    let (inner, close) = self.delimited()?;
                    let args = self.group_list(inner, close)?;
                    self.pos = close + 1;
                    expr = self.node(ExprKind::Call { callee: Box::new(expr), args }, start);
                }
                Some(Token::LBracket) => {
                    let (inner, close) = self.delimited()?;
                    let index = if inner.is_empty() {
                        None
                    } else {
                        Some(Box::new(self.group(inner, close)?))
                    };
                    self.pos = close + 1;
                    expr = self.node(ExprKind::Index { base: Box::new(expr), index }, start);
                }
                Some(Token::Arrow) => {
                    self.pos += 1;
                    let name = match self.peek() {
                        Some(Token::Ident(name)) => name.clone(),
                        Some(other) if other.class().contains(TokenClass::KEYWORD) => keyword_text(other),
                        _ => return Err(self.error("EMB-P001", "expected a member name after '->'".to_string())),
                    };
                    self.pos += 1;
                    expr = self.node(ExprKind::Member { base: Box::new(expr), name }, start);
                }
                Some(Token::Inc | Token::Dec) if expr.is_lvalue() => {
                    let increment = self.peek() == Some(&Token::Inc);
                    self.pos += 1;
                    expr = self.node(
                        ExprKind::IncDec { increment, prefix: false, target: Box::new(expr) },
                        start,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Inner slice of the delimited group opening at the cursor, plus the
    /// index of its closing token.
    fn delimited(&self) -> Result<(&'t [Lexeme], usize)> {
        let close = matching_close(self.tokens, self.pos)
            .ok_or_else(|| self.error("EMB-P002", format!("unclosed {}", self.lexeme().token)))?;
        Ok((&self.tokens[self.pos + 1..close], close))
    }

    fn primary(&mut self) -> Result<Expr> {
        let start = self.pos;
        let lexeme = self.lexeme();
        let Some(token) = self.peek() else {
            return Err(self.error("EMB-P003", "expected an operand".to_string()));
        };
        let kind = match token {
            Token::Number(Numeric::Int(n)) => ExprKind::Int { value: *n },
            Token::Number(Numeric::Real(r)) => ExprKind::Real { value: *r },
            Token::Str(s) => ExprKind::Str { value: s.clone() },
            Token::Template(raw) => {
                let mut nesting = self.nesting();
                let kind = template::interpolate(raw, lexeme, &mut nesting)?;
                self.links = nesting.links;
                kind
            }
            Token::True => ExprKind::Bool { value: true },
            Token::False => ExprKind::Bool { value: false },
            Token::Null => ExprKind::Null,
            Token::Variable(name) => ExprKind::Variable { name: name.clone() },
            Token::Ident(name) => ExprKind::Constant { name: name.clone() },
            Token::LParen => {
                let (inner, close) = self.delimited()?;
                let expr = self.group(inner, close)?;
                self.pos = close + 1;
                return Ok(expr);
            }
            Token::LBracket => {
                let (inner, close) = self.delimited()?;
                let items = self.group_items(inner, close, &Token::FatArrow)?;
                self.pos = close + 1;
                return Ok(self.node(ExprKind::Array { items }, start));
            }
            Token::LBrace => {
                let (inner, close) = self.delimited()?;
                let items = self.group_items(inner, close, &Token::Colon)?;
                self.pos = close + 1;
                return Ok(self.node(ExprKind::Array { items }, start));
            }
            Token::Array => {
                self.pos += 1;
                if self.peek() != Some(&Token::LParen) {
                    return Err(self.error("EMB-P001", "expected '(' after 'array'".to_string()));
                }
                let (inner, close) = self.delimited()?;
                let items = self.group_items(inner, close, &Token::FatArrow)?;
                self.pos = close + 1;
                return Ok(self.node(ExprKind::Array { items }, start));
            }
            Token::Isset => {
                self.pos += 1;
                if self.peek() != Some(&Token::LParen) {
                    return Err(self.error("EMB-P001", "expected '(' after 'isset'".to_string()));
                }
                let (inner, close) = self.delimited()?;
                let targets = self.group_list(inner, close)?;
                if targets.is_empty() || targets.iter().any(|t| !t.is_lvalue()) {
                    return Err(ParseError::at("EMB-P004", lexeme, "isset() expects variables".to_string()));
                }
                self.pos = close + 1;
                return Ok(self.node(ExprKind::Isset { targets }, start));
            }
            Token::Function => {
                self.pos += 1;
                if self.peek() != Some(&Token::LParen) {
                    return Err(self.error("EMB-P001", "expected '(' after 'function'".to_string()));
                }
                let (params, close) = self.delimited()?;
                self.pos = close + 1;
                if self.peek() != Some(&Token::LBrace) {
                    return Err(self.error("EMB-P001", "expected '{' before the function body".to_string()));
                }
                let (body, close) = self.delimited()?;
                let decl = super::closure_decl(lexeme, params, body, self.nesting())?;
                self.pos = close + 1;
                return Ok(self.node(ExprKind::Closure { decl: Box::new(decl) }, start));
            }
            Token::Include | Token::Import => {
                self.pos += 1;
                let path = self.expression(TERNARY_RANK - 1)?;
                return Ok(self.node(ExprKind::Include { path: Box::new(path) }, start));
            }
            Token::Exit | Token::Die => {
                self.pos += 1;
                let status = if self.peek() == Some(&Token::LParen) {
                    let (inner, close) = self.delimited()?;
                    let status = if inner.is_empty() {
                        None
                    } else {
                        Some(Box::new(self.group(inner, close)?))
                    };
                    self.pos = close + 1;
                    status
                } else if self.peek().is_some_and(|t| infix_info(t).is_none()) {
                    Some(Box::new(self.expression(TERNARY_RANK - 1)?))
                } else {
                    None
                };
                return Ok(self.node(ExprKind::Exit { status }, start));
            }
            other => {
                return Err(self.error("EMB-P001", format!("unexpected {other} in expression")));
            }
        };
        self.pos += 1;
        Ok(self.node(kind, start))
    }
}

fn keyword_text(token: &Token) -> String {
    token.to_string().trim_matches('\'').to_string()
}

/// Parses `value` or `key SEP value` entries of an array or object literal.
fn array_items(tokens: &[Lexeme], anchor: &Lexeme, key_sep: &Token, nesting: &mut Nesting) -> Result<Vec<ArrayItem>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    check_balanced(tokens)?;
    let mut parts = split_top_level(tokens, |t| *t == Token::Comma);
    if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    let mut items = Vec::with_capacity(parts.len());
    for (i, part) in parts.into_iter().enumerate() {
        let here = tokens.get(position_of(tokens, part, i)).unwrap_or(anchor);
        let split = if *key_sep == Token::Colon {
            find_case_colon(part).map(|at| vec![&part[..at], &part[at + 1..]])
        } else {
            let pieces = split_top_level(part, |t| t == key_sep);
            (pieces.len() > 1).then_some(pieces)
        };
        match split.as_deref() {
            Some([key, value]) => items.push(ArrayItem {
                key: Some(build_nested(key, here, nesting)?),
                value: build_nested(value, here, nesting)?,
            }),
            Some(_) => return Err(ParseError::at("EMB-P001", here, format!("unexpected {key_sep} in array entry"))),
            None if *key_sep == Token::Colon => {
                return Err(ParseError::at("EMB-P001", here, "object entries need a key".to_string()));
            }
            None => items.push(ArrayItem { key: None, value: build_nested(part, here, nesting)? }),
        }
    }
    Ok(items)
}

/// Folds `-` and `+` applied to numeric literals. Integer literals stay
/// in 64 bits, like the lexer's accumulation.
fn fold_unary(op: UnaryOp, operand: Expr, span: Span, line: u32) -> Expr {
    let kind = match (op, &operand.kind) {
        (UnaryOp::Neg, ExprKind::Int { value }) => ExprKind::Int { value: value.wrapping_neg() },
        (UnaryOp::Neg, ExprKind::Real { value }) => ExprKind::Real { value: -value },
        (UnaryOp::Plus, ExprKind::Int { .. } | ExprKind::Real { .. }) => operand.kind.clone(),
        _ => ExprKind::Unary { op, operand: Box::new(operand) },
    };
    Expr::new(kind, span, line)
}
