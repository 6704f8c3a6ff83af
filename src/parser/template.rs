//! Interpolation inside double-quoted strings.
//!
//! Recognised forms: `$name`, `$name[index]` (integer, bareword or
//! `$variable` index), `$name->member` and `{$expression}`. Everything else is
//! literal text with the double-quote escapes applied.

use crate::ast::{Expr, ExprKind, Span};
use crate::hashmap::canonical_int;
use crate::lexer::{tokenize, unescape, Lexeme};

use super::expr::{build_nested, Nesting};
use super::{ParseError, Result};

fn is_name_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic() || !c.is_ascii()
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit()
}

/// Builds the expression for the raw body of a double-quoted literal.
pub fn interpolate(raw: &str, lexeme: &Lexeme, nesting: &mut Nesting) -> Result<ExprKind> {
    let mut scanner = Scanner { raw, lexeme, nesting: *nesting, pos: 0, parts: Vec::new(), literal_start: 0 };
    scanner.run()?;
    nesting.links = scanner.nesting.links;
    let Scanner { mut parts, .. } = scanner;
    match parts.len() {
        0 => Ok(ExprKind::Str { value: String::new() }),
        1 if matches!(parts[0].kind, ExprKind::Str { .. }) => Ok(parts.remove(0).kind),
        _ => Ok(ExprKind::Interpolated { parts }),
    }
}

struct Scanner<'a> {
    raw: &'a str,
    lexeme: &'a Lexeme,
    nesting: Nesting,
    pos: usize,
    parts: Vec<Expr>,
    literal_start: usize,
}

impl Scanner<'_> {
    /// Byte offset of `raw` position `at` in the whole source.
    fn source_offset(&self, at: usize) -> usize {
        self.lexeme.span.start + 1 + at
    }

    fn line_at(&self, at: usize) -> u32 {
        self.lexeme.line + self.raw[..at].matches('\n').count() as u32
    }

    fn span(&self, from: usize, to: usize) -> Span {
        Span { start: self.source_offset(from), end: self.source_offset(to) }
    }

    fn node(&self, kind: ExprKind, from: usize, to: usize) -> Expr {
        Expr::new(kind, self.span(from, to), self.line_at(from))
    }

    fn peek_at(&self, at: usize) -> Option<char> {
        self.raw[at..].chars().next()
    }

    fn flush_literal(&mut self, end: usize) {
        if end > self.literal_start {
            let value = unescape(&self.raw[self.literal_start..end]);
            let node = self.node(ExprKind::Str { value }, self.literal_start, end);
            self.parts.push(node);
        }
    }

    fn run(&mut self) -> Result<()> {
        while let Some(c) = self.peek_at(self.pos) {
            match c {
                '\\' => {
                    // skip the escaped character so `\$` and `\{` stay literal
                    self.pos += 1;
                    if let Some(next) = self.peek_at(self.pos) {
                        self.pos += next.len_utf8();
                    }
                }
                '$' if self.peek_at(self.pos + 1).is_some_and(is_name_start) => {
                    self.flush_literal(self.pos);
                    let expr = self.simple_variable()?;
                    self.parts.push(expr);
                    self.literal_start = self.pos;
                }
                '{' if self.peek_at(self.pos + 1) == Some('$') => {
                    self.flush_literal(self.pos);
                    let expr = self.braced()?;
                    self.parts.push(expr);
                    self.literal_start = self.pos;
                }
                _ => self.pos += c.len_utf8(),
            }
        }
        self.flush_literal(self.raw.len());
        Ok(())
    }

    fn name_at(&self, start: usize) -> &str {
        let len = self.raw[start..]
            .char_indices()
            .find(|&(_, c)| !is_name_char(c))
            .map_or(self.raw.len() - start, |(i, _)| i);
        &self.raw[start..start + len]
    }

    /// `$name`, optionally followed by one `[index]` or `->member`.
    fn simple_variable(&mut self) -> Result<Expr> {
        let start = self.pos;
        let name = self.name_at(start + 1).to_string();
        self.pos = start + 1 + name.len();
        let var = self.node(ExprKind::Variable { name }, start, self.pos);

        if self.peek_at(self.pos) == Some('[') {
            let Some(close) = self.raw[self.pos..].find(']').map(|i| self.pos + i) else {
                return Ok(var);
            };
            let inner = &self.raw[self.pos + 1..close];
            let Some(index) = self.simple_index(inner, self.pos + 1) else {
                return Ok(var);
            };
            self.pos = close + 1;
            return Ok(self.node(
                ExprKind::Index { base: Box::new(var), index: Some(Box::new(index)) },
                start,
                self.pos,
            ));
        }

        if self.raw[self.pos..].starts_with("->")
            && self.peek_at(self.pos + 2).is_some_and(is_name_start)
        {
            let member = self.name_at(self.pos + 2).to_string();
            self.pos += 2 + member.len();
            return Ok(self.node(ExprKind::Member { base: Box::new(var), name: member }, start, self.pos));
        }

        Ok(var)
    }

    fn simple_index(&self, inner: &str, at: usize) -> Option<Expr> {
        let to = at + inner.len();
        if let Some(n) = canonical_int(inner) {
            return Some(self.node(ExprKind::Int { value: n }, at, to));
        }
        if let Some(name) = inner.strip_prefix('$') {
            if !name.is_empty() && name.starts_with(is_name_start) && name.chars().all(is_name_char) {
                return Some(self.node(ExprKind::Variable { name: name.to_string() }, at, to));
            }
            return None;
        }
        if !inner.is_empty() && inner.chars().all(|c| is_name_char(c) || c == '-') {
            return Some(self.node(ExprKind::Str { value: inner.to_string() }, at, to));
        }
        None
    }

    /// `{$ ... }` with a full expression inside.
    fn braced(&mut self) -> Result<Expr> {
        let open = self.pos;
        let close = self.matching_brace(open).ok_or_else(|| ParseError {
            code: "EMB-P005",
            line: self.line_at(open),
            span: self.span(open, self.raw.len()),
            message: "unterminated '{$' interpolation".to_string(),
        })?;
        let body = self.raw[open + 1..close].replace("\\\"", "\"");
        let offset = self.source_offset(open + 1);
        let first_line = self.line_at(open + 1);
        let tokens: Vec<Lexeme> = tokenize(&body)
            .map_err(|e| ParseError {
                code: "EMB-P005",
                line: first_line + e.line - 1,
                span: e.span.shifted(offset),
                message: format!("in interpolation: {}", e.message),
            })?
            .into_iter()
            .map(|l| Lexeme { span: l.span.shifted(offset), line: first_line + l.line - 1, token: l.token })
            .collect();
        self.pos = close + 1;
        build_nested(&tokens, self.lexeme, &mut self.nesting)
    }

    /// Closing brace for the `{` at `open`, skipping quoted text.
    fn matching_brace(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut chars = self.raw[open..].char_indices();
        while let Some((i, c)) = chars.next() {
            match (quote, c) {
                (_, '\\') => {
                    chars.next();
                }
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'') => quote = Some('\''),
                (None, '{') => depth += 1,
                (None, '}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(open + i);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Token;

    fn run(raw: &str) -> ExprKind {
        let lexeme = Lexeme { token: Token::Template(raw.to_string()), span: Span { start: 0, end: raw.len() + 2 }, line: 1 };
        interpolate(raw, &lexeme, &mut Nesting::default()).unwrap()
    }

    fn shapes(kind: &ExprKind) -> Vec<String> {
        match kind {
            ExprKind::Interpolated { parts } => parts
                .iter()
                .map(|p| match &p.kind {
                    ExprKind::Str { value } => format!("str:{value}"),
                    ExprKind::Variable { name } => format!("var:{name}"),
                    ExprKind::Index { .. } => "index".to_string(),
                    ExprKind::Member { name, .. } => format!("member:{name}"),
                    other => format!("{other:?}"),
                })
                .collect(),
            other => vec![format!("{other:?}")],
        }
    }

    #[test]
    fn plain_text_is_a_string() {
        assert_eq!(run("hello\\tworld"), ExprKind::Str { value: "hello\tworld".into() });
        assert_eq!(run(""), ExprKind::Str { value: String::new() });
        assert_eq!(run("cost: \\$5 or $"), ExprKind::Str { value: "cost: $5 or $".into() });
    }

    #[test]
    fn simple_forms() {
        assert_eq!(shapes(&run("hi $name!")), vec!["str:hi ", "var:name", "str:!"]);
        assert_eq!(shapes(&run("$a[0] $a[key] $a[$i]")), vec!["index", "str: ", "index", "str: ", "index"]);
        assert_eq!(shapes(&run("$user->name.")), vec!["member:name", "str:."]);
    }

    #[test]
    fn unclosed_subscript_stays_literal() {
        assert_eq!(shapes(&run("$a[ oops")), vec!["var:a", "str:[ oops"]);
    }

    #[test]
    fn braced_expressions() {
        match run("sum={$a + $b[\\\"k\\\"]}") {
            ExprKind::Interpolated { parts } => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1].kind, ExprKind::Binary { .. }));
                assert_eq!(parts[1].span.start, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unterminated_brace_is_an_error() {
        let lexeme = Lexeme { token: Token::Template(String::new()), span: Span::UNKNOWN, line: 2 };
        let err = interpolate("x {$a", &lexeme, &mut Nesting::default()).unwrap_err();
        assert_eq!(err.code, "EMB-P005");
        assert_eq!(err.line, 2);
    }
}
