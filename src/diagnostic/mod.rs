pub mod ansi;
pub mod json;
pub mod registry;

use serde::Serialize;

use crate::ast::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Execution was aborted.
    Fatal,
    /// Compilation failed; nothing runs.
    Error,
    Warning,
    Notice,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Fatal => "fatal",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    /// 1-based source line, when known.
    pub line: Option<u32>,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Diagnostic {
            severity,
            code: None,
            message: message.into(),
            line: None,
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Diagnostic::new(Severity::Fatal, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic::new(Severity::Warning, message)
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Diagnostic::new(Severity::Notice, message)
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_fatal_or_error(&self) -> bool {
        matches!(self.severity, Severity::Fatal | Severity::Error)
    }
}

// ---- From impls for stage errors ----

impl From<&crate::lexer::LexError> for Diagnostic {
    fn from(e: &crate::lexer::LexError) -> Self {
        let mut d = Diagnostic::error(&e.message)
            .with_code(e.code())
            .at_line(e.line)
            .with_span(e.span, "here");
        if e.kind == crate::lexer::LexErrorKind::UnterminatedString {
            d = d.with_suggestion("close the string with a matching quote");
        }
        d
    }
}

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        Diagnostic::error(&e.message)
            .with_code(e.code)
            .at_line(e.line)
            .with_span(e.span, "here")
    }
}

impl From<&crate::compiler::CompileError> for Diagnostic {
    fn from(e: &crate::compiler::CompileError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).at_line(e.line)
    }
}

impl From<&crate::vm::VmError> for Diagnostic {
    fn from(e: &crate::vm::VmError) -> Self {
        let mut d = Diagnostic::fatal(e.to_string()).with_code(e.code());
        if let Some(line) = e.line() {
            d = d.at_line(line);
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    #[test]
    fn diagnostic_builder() {
        let d = Diagnostic::warning("Division by zero").with_code("EMB-R201").at_line(4);
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.code, Some("EMB-R201"));
        assert_eq!(d.line, Some(4));
        assert!(d.labels.is_empty());
        assert!(!d.is_fatal_or_error());
    }

    #[test]
    fn diagnostic_with_span() {
        let d = Diagnostic::error("bad token").with_span(Span { start: 5, end: 8 }, "here");
        assert_eq!(d.labels.len(), 1);
        assert_eq!(d.labels[0].span, Span { start: 5, end: 8 });
        assert!(d.labels[0].is_primary);
    }

    #[test]
    fn severities_order_by_gravity() {
        assert!(Severity::Fatal < Severity::Error);
        assert!(Severity::Warning < Severity::Notice);
        assert_eq!(Severity::Notice.label(), "notice");
    }

    #[test]
    fn from_lex_error() {
        let e = crate::lexer::tokenize("$a = 'open").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("EMB-L002"));
        assert_eq!(d.line, Some(1));
        assert_eq!(d.labels[0].span.start, 5);
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_parse_error() {
        let e = crate::parser::ParseError {
            code: "EMB-P001",
            line: 2,
            span: Span { start: 10, end: 15 },
            message: "unexpected token".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.line, Some(2));
        assert_eq!(d.labels[0].span, Span { start: 10, end: 15 });
    }

    #[test]
    fn from_compile_error_has_no_span() {
        let e = crate::compiler::CompileError {
            code: "EMB-C001",
            line: 3,
            message: "'break' outside of a loop or switch".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert!(d.labels.is_empty());
        assert_eq!(d.code, Some("EMB-C001"));
    }

    #[test]
    fn from_vm_error_is_fatal() {
        let e = crate::vm::VmError::RecursionLimit { limit: 8, function: "f".into(), line: 1 };
        let d = Diagnostic::from(&e);
        assert_eq!(d.severity, Severity::Fatal);
        assert_eq!(d.code, Some("EMB-R001"));
        assert!(d.message.contains("f()"));
    }
}
