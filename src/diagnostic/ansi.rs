use std::fmt::Write as _;

use crate::lexer::LineIndex;
use super::{Diagnostic, Severity};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, code: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{code}m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold(&self, s: &str) -> String {
        self.paint("1", s)
    }

    fn cyan(&self, s: &str) -> String {
        self.paint("36", s)
    }

    fn dim(&self, s: &str) -> String {
        self.paint("2", s)
    }

    fn severity_color(&self, severity: Severity) -> &'static str {
        match severity {
            Severity::Fatal | Severity::Error => "1;31",
            Severity::Warning => "1;33",
            Severity::Notice => "1;36",
        }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();
        let color = self.severity_color(d.severity);

        // "warning[EMB-R201]: message"
        let head = match d.code {
            Some(code) => format!("{}[{code}]", d.severity.label()),
            None => d.severity.label().to_string(),
        };
        let _ = writeln!(out, "{}: {}", self.paint(color, &head), self.bold(&d.message));

        let primary = d.labels.iter().find(|l| l.is_primary);
        match (primary, &d.source) {
            (Some(label), Some(source)) => {
                let index = LineIndex::new(source);
                let (line, col) = index.position(label.span.start);
                let line_text = index.line_text(source, line);

                let _ = writeln!(out, "  {} line {line}:{col}", self.cyan("-->"));

                let gutter = line.to_string().len();
                let pipe = self.cyan("|");
                let pad = " ".repeat(gutter);
                let _ = writeln!(out, "{pad} {pipe}");
                let line_num = self.cyan(&format!("{line:>gutter$}"));
                let _ = writeln!(out, "{line_num} {pipe} {line_text}");

                // Carets stop at the end of the line for spans that run past it.
                let start_in_line = col.saturating_sub(1);
                let room = line_text.len().saturating_sub(start_in_line).max(1);
                let span_len = label.span.end.saturating_sub(label.span.start).clamp(1, room);
                let carets = self.paint(color, &"^".repeat(span_len));
                let indent = " ".repeat(start_in_line);
                if label.message.is_empty() {
                    let _ = writeln!(out, "{pad} {pipe} {indent}{carets}");
                } else {
                    let _ = writeln!(out, "{pad} {pipe} {indent}{carets} {}", self.paint(color, &label.message));
                }
                let _ = writeln!(out, "{pad} {pipe}");
            }
            _ => {
                if let Some(line) = d.line {
                    let _ = writeln!(out, "  {} line {line}", self.cyan("-->"));
                }
            }
        }

        for label in d.labels.iter().filter(|l| !l.is_primary) {
            if !label.message.is_empty() {
                let _ = writeln!(out, "  {} {}", self.dim("="), label.message);
            }
        }

        for note in &d.notes {
            let _ = writeln!(out, "  {} note: {}", self.dim("="), note);
        }

        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {} suggestion: {}", self.dim("="), suggestion);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn make_diag(source: &str, start: usize, end: usize) -> Diagnostic {
        Diagnostic::error("unexpected token")
            .with_code("EMB-P001")
            .with_span(Span { start, end }, "here")
            .with_source(source.to_string())
            .with_note("while parsing an expression")
            .with_suggestion("remove the extra operator")
    }

    #[test]
    fn render_contains_severity_and_code() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("$a = + ;", 7, 8));
        assert!(out.contains("error[EMB-P001]: unexpected token"), "got:\n{out}");
    }

    #[test]
    fn render_contains_location_and_source_line() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("$a = + ;", 7, 8));
        assert!(out.contains("--> line 1:8"), "got:\n{out}");
        assert!(out.contains("$a = + ;"), "got:\n{out}");
        assert!(out.contains('^'), "got:\n{out}");
    }

    #[test]
    fn render_contains_note_and_suggestion() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("$a = + ;", 7, 8));
        assert!(out.contains("note: while parsing an expression"), "got:\n{out}");
        assert!(out.contains("suggestion: remove the extra operator"), "got:\n{out}");
    }

    #[test]
    fn runtime_diagnostic_shows_line_only() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::notice("Undefined variable: $x").at_line(3);
        let out = r.render(&d);
        assert!(out.starts_with("notice: Undefined variable: $x"));
        assert!(out.contains("--> line 3"));
        assert!(!out.contains('|'));
    }

    #[test]
    fn render_multiline_source_correct_line() {
        let source = "$a = 1;\n$b = ];";
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("bad")
            .with_span(Span { start: 13, end: 14 }, "here")
            .with_source(source.to_string());
        let out = r.render(&d);
        assert!(out.contains("line 2:6"), "got:\n{out}");
        assert!(out.contains("$b = ];"), "got:\n{out}");
    }

    #[test]
    fn caret_length_matches_span() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("bad")
            .with_span(Span { start: 5, end: 8 }, "")
            .with_source("$a = foo;".to_string());
        let out = r.render(&d);
        assert!(out.contains("     ^^^\n"), "got:\n{out}");
    }

    #[test]
    fn color_codes_only_when_enabled() {
        let d = make_diag("$a = + ;", 7, 8);
        assert!(AnsiRenderer { use_color: true }.render(&d).contains("\x1b["));
        assert!(!AnsiRenderer { use_color: false }.render(&d).contains("\x1b["));
    }
}
