use std::fmt;

use bitflags::bitflags;
use logos::{Lexer, Logos};

use crate::ast::Span;
use crate::value::Numeric;

mod lines;

pub use lines::LineIndex;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    // Keywords
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("elseif")]
    ElseIf,
    #[token("while")]
    While,
    #[token("do")]
    Do,
    #[token("for")]
    For,
    #[token("foreach")]
    Foreach,
    #[token("as")]
    As,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("function")]
    Function,
    #[token("static")]
    Static,
    #[token("uplink")]
    Uplink,
    #[token("print")]
    Print,
    #[token("exit")]
    Exit,
    #[token("die")]
    Die,
    #[token("const")]
    Const,
    #[token("include")]
    Include,
    #[token("import")]
    Import,
    #[token("array")]
    Array,
    #[token("unset")]
    Unset,
    #[token("isset")]
    Isset,
    #[token("true", ignore(ascii_case))]
    True,
    #[token("false", ignore(ascii_case))]
    False,
    #[token("null", ignore(ascii_case))]
    Null,
    #[token("and", ignore(ascii_case))]
    WordAnd,
    #[token("or", ignore(ascii_case))]
    WordOr,
    #[token("xor", ignore(ascii_case))]
    WordXor,

    // Literals
    #[regex(r"[0-9]+", decimal_or_octal)]
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| radix_int(lex, 16))]
    #[regex(r"0[bB][01]+", |lex| radix_int(lex, 2))]
    #[regex(r"0[xXbB]", |_| None::<Numeric>)]
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", real)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", real)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", real)]
    Number(Numeric),

    /// Single-quoted literal, escapes already applied.
    #[regex(r"'([^'\\]|\\(.|\n))*'", single_quoted)]
    Str(String),

    /// Double-quoted body, raw. Escapes and `$` interpolation are resolved
    /// by the parser.
    #[regex(r#""([^"\\]|\\(.|\n))*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Template(String),

    #[regex(r#""([^"\\]|\\(.|\n))*"#)]
    #[regex(r"'([^'\\]|\\(.|\n))*")]
    UnterminatedString,

    #[regex(r"/\*([^*]|\*+[^*/])*\**")]
    UnterminatedComment,

    #[regex(r"\$[A-Za-z_\x{80}-\x{10FFFF}][A-Za-z0-9_\x{80}-\x{10FFFF}]*", |lex| lex.slice()[1..].to_string())]
    Variable(String),

    #[regex(r"[A-Za-z_\x{80}-\x{10FFFF}][A-Za-z0-9_\x{80}-\x{10FFFF}]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators, longest match first by construction
    #[token("===")]
    StrictEq,
    #[token("!==")]
    StrictNe,
    #[token("==")]
    Eq,
    #[token("!=")]
    #[token("<>")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token(".")]
    Dot,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("++")]
    Inc,
    #[token("--")]
    Dec,
    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token(".=")]
    DotAssign,
    #[token("&=")]
    AmpAssign,
    #[token("|=")]
    PipeAssign,
    #[token("^=")]
    CaretAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,
    #[token("->")]
    Arrow,
    #[token("=>")]
    FatArrow,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
}

/// Integer literals of every radix accumulate into an `i64` with
/// wrapping arithmetic: they never fail and never turn into reals, so
/// `0xFFFFFFFFFFFFFFFF` is `-1`.
fn accumulate(digits: &str, radix: u32) -> i64 {
    digits
        .chars()
        .map_while(|c| c.to_digit(radix))
        .fold(0i64, |acc, d| acc.wrapping_mul(radix as i64).wrapping_add(d as i64))
}

/// A leading `0` selects octal; the value ends at the first 8 or 9.
fn decimal_or_octal(lex: &mut Lexer<Token>) -> Option<Numeric> {
    let text = lex.slice();
    let value = match text.strip_prefix('0') {
        Some(octal) => accumulate(octal, 8),
        None => accumulate(text, 10),
    };
    Some(Numeric::Int(value))
}

fn radix_int(lex: &mut Lexer<Token>, radix: u32) -> Option<Numeric> {
    Some(Numeric::Int(accumulate(&lex.slice()[2..], radix)))
}

fn real(lex: &mut Lexer<Token>) -> Option<Numeric> {
    lex.slice().parse::<f64>().ok().map(Numeric::Real)
}

fn single_quoted(lex: &mut Lexer<Token>) -> String {
    let body = &lex.slice()[1..lex.slice().len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(e @ ('\'' | '\\')) => out.push(e),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Applies double-quote escapes to a literal run of template text.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('v') => out.push('\x0B'),
            Some('f') => out.push('\x0C'),
            Some('e') => out.push('\x1B'),
            Some('0') => out.push('\0'),
            Some(e @ ('\\' | '"' | '$')) => out.push(e),
            Some('x') => {
                let mut code = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            code = code * 16 + d;
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.push_str("\\x");
                } else {
                    out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ── Token classes ────────────────────────────────────────────────────

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TokenClass: u32 {
        const INTEGER = 1 << 0;
        const REAL = 1 << 1;
        const NUMERIC = Self::INTEGER.bits() | Self::REAL.bits();
        const IDENTIFIER = 1 << 2;
        const VARIABLE = 1 << 3;
        const KEYWORD = 1 << 4;
        const OPERATOR = 1 << 5;
        const STRING = 1 << 6;
        const INTERPOLATED = 1 << 7;
        const PUNCTUATION = 1 << 8;
        const OPEN = 1 << 9;
        const CLOSE = 1 << 10;
        const ERROR = 1 << 11;
    }
}

impl Token {
    pub fn class(&self) -> TokenClass {
        use Token::*;
        match self {
            Number(Numeric::Int(_)) => TokenClass::INTEGER,
            Number(Numeric::Real(_)) => TokenClass::REAL,
            Str(_) => TokenClass::STRING,
            Template(_) => TokenClass::STRING | TokenClass::INTERPOLATED,
            Variable(_) => TokenClass::VARIABLE,
            Ident(_) => TokenClass::IDENTIFIER,
            UnterminatedString | UnterminatedComment => TokenClass::ERROR,
            LParen | LBracket | LBrace => TokenClass::PUNCTUATION | TokenClass::OPEN,
            RParen | RBracket | RBrace => TokenClass::PUNCTUATION | TokenClass::CLOSE,
            Comma | Semi => TokenClass::PUNCTUATION,
            WordAnd | WordOr | WordXor => TokenClass::KEYWORD | TokenClass::OPERATOR,
            If | Else | ElseIf | While | Do | For | Foreach | As | Switch | Case | Default | Break
            | Continue | Return | Function | Static | Uplink | Print | Exit | Die | Const
            | Include | Import | Array | Unset | Isset | True | False | Null => TokenClass::KEYWORD,
            _ => TokenClass::OPERATOR,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;
        let text = match self {
            Number(Numeric::Int(n)) => return write!(f, "number {n}"),
            Number(Numeric::Real(r)) => return write!(f, "number {r}"),
            Str(_) | Template(_) => "string literal",
            Variable(name) => return write!(f, "variable ${name}"),
            Ident(name) => return write!(f, "identifier '{name}'"),
            UnterminatedString => "unterminated string",
            UnterminatedComment => "unterminated comment",
            If => "'if'",
            Else => "'else'",
            ElseIf => "'elseif'",
            While => "'while'",
            Do => "'do'",
            For => "'for'",
            Foreach => "'foreach'",
            As => "'as'",
            Switch => "'switch'",
            Case => "'case'",
            Default => "'default'",
            Break => "'break'",
            Continue => "'continue'",
            Return => "'return'",
            Function => "'function'",
            Static => "'static'",
            Uplink => "'uplink'",
            Print => "'print'",
            Exit => "'exit'",
            Die => "'die'",
            Const => "'const'",
            Include => "'include'",
            Import => "'import'",
            Array => "'array'",
            Unset => "'unset'",
            Isset => "'isset'",
            True => "'true'",
            False => "'false'",
            Null => "'null'",
            WordAnd => "'and'",
            WordOr => "'or'",
            WordXor => "'xor'",
            StrictEq => "'==='",
            StrictNe => "'!=='",
            Eq => "'=='",
            Ne => "'!='",
            Le => "'<='",
            Ge => "'>='",
            Lt => "'<'",
            Gt => "'>'",
            Shl => "'<<'",
            Shr => "'>>'",
            AndAnd => "'&&'",
            OrOr => "'||'",
            Bang => "'!'",
            Tilde => "'~'",
            Plus => "'+'",
            Minus => "'-'",
            Star => "'*'",
            Slash => "'/'",
            Percent => "'%'",
            Dot => "'.'",
            Amp => "'&'",
            Pipe => "'|'",
            Caret => "'^'",
            Inc => "'++'",
            Dec => "'--'",
            Assign => "'='",
            PlusAssign => "'+='",
            MinusAssign => "'-='",
            StarAssign => "'*='",
            SlashAssign => "'/='",
            PercentAssign => "'%='",
            DotAssign => "'.='",
            AmpAssign => "'&='",
            PipeAssign => "'|='",
            CaretAssign => "'^='",
            ShlAssign => "'<<='",
            ShrAssign => "'>>='",
            Arrow => "'->'",
            FatArrow => "'=>'",
            Question => "'?'",
            Colon => "':'",
            LParen => "'('",
            RParen => "')'",
            LBracket => "'['",
            RBracket => "']'",
            LBrace => "'{'",
            RBrace => "'}'",
            Comma => "','",
            Semi => "';'",
        };
        f.write_str(text)
    }
}

// ── Token stream ─────────────────────────────────────────────────────

/// One scanned token with its byte span and 1-based line.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub span: Span,
    pub line: u32,
}

impl Lexeme {
    pub fn class(&self) -> TokenClass {
        self.token.class()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexErrorKind {
    UnexpectedChar,
    UnterminatedString,
    UnterminatedComment,
    InvalidNumber,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub line: u32,
    pub span: Span,
    pub snippet: String,
    pub message: String,
}

impl LexError {
    pub fn code(&self) -> &'static str {
        match self.kind {
            LexErrorKind::UnexpectedChar => "EMB-L001",
            LexErrorKind::UnterminatedString => "EMB-L002",
            LexErrorKind::UnterminatedComment => "EMB-L003",
            LexErrorKind::InvalidNumber => "EMB-L004",
        }
    }

    fn new(kind: LexErrorKind, line: u32, span: Span, snippet: String) -> Self {
        let message = match kind {
            LexErrorKind::UnexpectedChar => format!("unexpected character '{snippet}'"),
            LexErrorKind::UnterminatedString => "unterminated string literal".to_string(),
            LexErrorKind::UnterminatedComment => "unterminated block comment".to_string(),
            LexErrorKind::InvalidNumber => format!("invalid numeric literal '{snippet}'"),
        };
        LexError { kind, line, span, snippet, message }
    }
}

/// Scans the whole source, collecting every lexical error instead of
/// stopping at the first one. Bad input never produces a token.
pub fn tokenize_all(source: &str) -> (Vec<Lexeme>, Vec<LexError>) {
    let lines = LineIndex::new(source);
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span { start: range.start, end: range.end };
        let line = lines.line_of(range.start);
        let kind = match result {
            Ok(Token::UnterminatedString) => LexErrorKind::UnterminatedString,
            Ok(Token::UnterminatedComment) => LexErrorKind::UnterminatedComment,
            Ok(token) => {
                tokens.push(Lexeme { token, span, line });
                continue;
            }
            Err(()) if text_at(source, &range).starts_with(|c: char| c.is_ascii_digit()) => {
                LexErrorKind::InvalidNumber
            }
            Err(()) => LexErrorKind::UnexpectedChar,
        };
        let snippet: String = text_at(source, &range).chars().take(24).collect();
        errors.push(LexError::new(kind, line, span, snippet));
    }

    (tokens, errors)
}

fn text_at<'s>(source: &'s str, range: &std::ops::Range<usize>) -> &'s str {
    source.get(range.clone()).unwrap_or("")
}

/// Scans the source, failing on the first lexical error.
pub fn tokenize(source: &str) -> Result<Vec<Lexeme>, LexError> {
    let (tokens, mut errors) = tokenize_all(source);
    if errors.is_empty() {
        Ok(tokens)
    } else {
        Err(errors.swap_remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|l| l.token).collect()
    }

    #[test]
    fn lex_assignment() {
        assert_eq!(
            kinds("$a = 1 + 2;"),
            vec![
                Token::Variable("a".into()),
                Token::Assign,
                Token::Number(Numeric::Int(1)),
                Token::Plus,
                Token::Number(Numeric::Int(2)),
                Token::Semi,
            ]
        );
    }

    #[test]
    fn number_prefixes() {
        assert_eq!(kinds("0x1F 0b101 017 0 42"), vec![
            Token::Number(Numeric::Int(31)),
            Token::Number(Numeric::Int(5)),
            Token::Number(Numeric::Int(15)),
            Token::Number(Numeric::Int(0)),
            Token::Number(Numeric::Int(42)),
        ]);
        assert_eq!(kinds("1.5 .25 2e3"), vec![
            Token::Number(Numeric::Real(1.5)),
            Token::Number(Numeric::Real(0.25)),
            Token::Number(Numeric::Real(2000.0)),
        ]);
    }

    #[test]
    fn integer_literals_wrap_into_64_bits() {
        assert_eq!(kinds("9223372036854775807 9223372036854775808 18446744073709551617"), vec![
            Token::Number(Numeric::Int(i64::MAX)),
            Token::Number(Numeric::Int(i64::MIN)),
            Token::Number(Numeric::Int(1)),
        ]);
        assert_eq!(kinds("0xFFFFFFFFFFFFFFFF 0xFFFFFFFFFFFFFFFFF 0x7FFFFFFFFFFFFFFF"), vec![
            Token::Number(Numeric::Int(-1)),
            Token::Number(Numeric::Int(-1)),
            Token::Number(Numeric::Int(i64::MAX)),
        ]);
        let bits = format!("0b1{}", "0".repeat(64));
        assert_eq!(kinds(&bits), vec![Token::Number(Numeric::Int(0))]);
        assert_eq!(kinds("01777777777777777777777"), vec![Token::Number(Numeric::Int(-1))]);
    }

    #[test]
    fn octal_stops_at_first_decimal_digit() {
        assert_eq!(kinds("089 0178 0"), vec![
            Token::Number(Numeric::Int(0)),
            Token::Number(Numeric::Int(15)),
            Token::Number(Numeric::Int(0)),
        ]);
    }

    #[test]
    fn prefix_without_digits_is_an_error() {
        let err = tokenize("$a = 0x;").unwrap_err();
        assert_eq!(err.kind, LexErrorKind::InvalidNumber);
        assert_eq!(err.code(), "EMB-L004");
        assert!(tokenize("$a = 0b;").is_err());
    }

    #[test]
    fn longest_match_operators() {
        assert_eq!(kinds("=== !== == = <<= << <= <> -> => .= ."), vec![
            Token::StrictEq,
            Token::StrictNe,
            Token::Eq,
            Token::Assign,
            Token::ShlAssign,
            Token::Shl,
            Token::Le,
            Token::Ne,
            Token::Arrow,
            Token::FatArrow,
            Token::DotAssign,
            Token::Dot,
        ]);
    }

    #[test]
    fn strings_literal_and_interpolated() {
        assert_eq!(kinds(r#"'it\'s $x' "hi $x\n""#), vec![
            Token::Str("it's $x".into()),
            Token::Template("hi $x\\n".into()),
        ]);
        assert_eq!(unescape(r#"a\tb\"c\$d\x41\q"#), "a\tb\"c$dA\\q");
    }

    #[test]
    fn keywords_versus_identifiers() {
        assert_eq!(kinds("if iffy TRUE Null print printer"), vec![
            Token::If,
            Token::Ident("iffy".into()),
            Token::True,
            Token::Null,
            Token::Print,
            Token::Ident("printer".into()),
        ]);
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let tokens = tokenize("// one\n# two\n/* three\n */ $x;\n$y").unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].line, 4);
        assert_eq!(tokens[2].line, 5);
        assert_eq!(tokens[0].class(), TokenClass::VARIABLE);
    }

    #[test]
    fn unterminated_string_fails_closed() {
        let err = tokenize("print \"abc;\n$x = 1;").unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedString);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn unterminated_comment_fails_closed() {
        let err = tokenize("$a = 1; /* never closed").unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedComment);
    }

    #[test]
    fn collects_multiple_errors() {
        let (tokens, errors) = tokenize_all("$a = `;\n$b = @;\n$c = 3;");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].line, 2);
        assert!(tokens.iter().any(|l| l.token == Token::Variable("c".into())));
    }

    #[test]
    fn token_classes() {
        assert!(Token::Number(Numeric::Int(1)).class().intersects(TokenClass::NUMERIC));
        assert!(Token::Template(String::new()).class().contains(TokenClass::STRING | TokenClass::INTERPOLATED));
        assert!(Token::LBracket.class().contains(TokenClass::OPEN));
        assert_eq!(Token::Print.class(), TokenClass::KEYWORD);
        assert_eq!(Token::Plus.class(), TokenClass::OPERATOR);
    }
}
