/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    /// One line, for listings.
    pub short: &'static str,
    /// Markdown shown by `ember --explain`.
    pub long: &'static str,
}

/// Every stable diagnostic code ember emits.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Lexer ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "EMB-L001",
        short: "unexpected character",
        long: r#"## EMB-L001: unexpected character

A character that cannot start any token was found.

**Example:**

    $a = 1 @ 2;

Remove the character, or quote it inside a string literal.
"#,
    },
    ErrorEntry {
        code: "EMB-L002",
        short: "unterminated string literal",
        long: r#"## EMB-L002: unterminated string literal

A single- or double-quoted string runs to the end of the source without
its closing quote.

**Example:**

    print 'hello;

**Fix:**

    print 'hello';
"#,
    },
    ErrorEntry {
        code: "EMB-L003",
        short: "unterminated block comment",
        long: r#"## EMB-L003: unterminated block comment

A `/*` comment has no matching `*/`.

**Example:**

    /* disabled
    print 1;

Close the comment with `*/`.
"#,
    },
    ErrorEntry {
        code: "EMB-L004",
        short: "invalid number literal",
        long: r#"## EMB-L004: invalid number literal

A hex or binary prefix (`0x`, `0b`) was not followed by any digit.
Integer literals that do not fit in 64 bits are not errors: their digits
accumulate with wrapping arithmetic.

**Example:**

    $mask = 0x;
"#,
    },
    // ── Parser ────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "EMB-P001",
        short: "unexpected token",
        long: r#"## EMB-P001: unexpected token

A token appeared where the grammar does not allow it.

**Example:**

    if $a { print 1; }

**Fix:**

    if ($a) { print 1; }
"#,
    },
    ErrorEntry {
        code: "EMB-P002",
        short: "unbalanced delimiter",
        long: r#"## EMB-P002: unbalanced delimiter

A `(`, `[` or `{` has no matching closer, or a closer appears without an
opener.

**Example:**

    function f() { print 1;

Add the missing `}`.
"#,
    },
    ErrorEntry {
        code: "EMB-P003",
        short: "missing operand or expression",
        long: r#"## EMB-P003: missing operand or expression

An expression slot is empty: an operator without a right operand, an empty
argument between commas, or a statement that needs a value.

**Example:**

    $a = 1 + ;
    f(1, , 2);
"#,
    },
    ErrorEntry {
        code: "EMB-P004",
        short: "not assignable",
        long: r#"## EMB-P004: not assignable

The left side of an assignment, `++`/`--`, `=&`, `isset()` or `unset()`
must be a variable, optionally followed by `[key]` or `->name` segments.

**Example:**

    1 = $a;
    f() = 2;
"#,
    },
    ErrorEntry {
        code: "EMB-P005",
        short: "malformed string interpolation",
        long: r#"## EMB-P005: malformed string interpolation

A `{$...}` interpolation inside a double-quoted string is unclosed or
does not contain a valid expression.

**Example:**

    print "total: {$sum";

**Fix:**

    print "total: {$sum}";
"#,
    },
    ErrorEntry {
        code: "EMB-P006",
        short: "unexpected end of input",
        long: r#"## EMB-P006: unexpected end of input

The source ended in the middle of a statement.

**Example:**

    $a =
"#,
    },
    ErrorEntry {
        code: "EMB-P007",
        short: "expected a variable",
        long: r#"## EMB-P007: expected a variable

A `$variable` is required here: in a foreach binding, a parameter list, a
`static` declaration or an `uplink` list.

**Example:**

    foreach ($items as item) { }

**Fix:**

    foreach ($items as $item) { }
"#,
    },
    ErrorEntry {
        code: "EMB-P008",
        short: "expected a name",
        long: r#"## EMB-P008: expected a name

A bare identifier is required, for example after `function` or `const`.

**Example:**

    function (1) { }
"#,
    },
    ErrorEntry {
        code: "EMB-P009",
        short: "malformed loop header",
        long: r#"## EMB-P009: malformed loop header

A `for` header must have exactly three `;`-separated clauses, a
`foreach` header needs `as` and one or two variables, and a `case` needs
a `:`.

**Example:**

    for ($i = 0; $i < 3) { }
"#,
    },
    ErrorEntry {
        code: "EMB-P010",
        short: "duplicate default",
        long: r#"## EMB-P010: duplicate default

A `switch` body may contain at most one `default:` label.
"#,
    },
    ErrorEntry {
        code: "EMB-P011",
        short: "duplicate parameter",
        long: r#"## EMB-P011: duplicate parameter

A function declares the same parameter name twice.

**Example:**

    function f($a, $a) { }
"#,
    },
    ErrorEntry {
        code: "EMB-P012",
        short: "unknown type hint",
        long: r#"## EMB-P012: unknown type hint

A parameter type hint must be one of `int`, `float`, `string`, `bool` or
`array`.

**Example:**

    function f(object $o) { }
"#,
    },
    ErrorEntry {
        code: "EMB-P013",
        short: "nesting too deep",
        long: r#"## EMB-P013: nesting too deep

Expressions and statements may nest at most 64 levels deep: parentheses,
array literals, prefix operators and blocks each add a level. A single
statement may also chain at most 512 operators, calls and subscripts.
Split the construct into smaller statements with temporaries.

**Example:**

    $a = ((((((((((((((((... 1 ...))))))))))))))));
"#,
    },
    // ── Compiler ──────────────────────────────────────────────────────────
    ErrorEntry {
        code: "EMB-C001",
        short: "break or continue outside a loop",
        long: r#"## EMB-C001: break or continue outside a loop

`break` and `continue` only work inside `for`, `while`, `do`, `foreach`
or `switch`.

**Example:**

    function f() { break; }
"#,
    },
    ErrorEntry {
        code: "EMB-C002",
        short: "break or continue level too deep",
        long: r#"## EMB-C002: break or continue level too deep

`break N` / `continue N` names more enclosing loops than exist.

**Example:**

    while (true) { break 2; }
"#,
    },
    ErrorEntry {
        code: "EMB-C003",
        short: "function already declared",
        long: r#"## EMB-C003: function already declared

Function names are unique across a program, including every included
file. Functions are hoisted, so the second declaration is rejected even
when it appears inside a block that never runs.

**Example:**

    function f() { }
    function f() { }
"#,
    },
    ErrorEntry {
        code: "EMB-C004",
        short: "invalid use of []",
        long: r#"## EMB-C004: invalid use of []

The append form `$a[]` only works as an assignment target. It cannot be
read, tested with `isset()` or removed with `unset()`.

**Example:**

    print $a[];
"#,
    },
    ErrorEntry {
        code: "EMB-C005",
        short: "invalid assignment",
        long: r#"## EMB-C005: invalid assignment

The assignment cannot be compiled: `=&` binds only plain variables,
and `&&=`-style compound forms do not exist.

**Example:**

    $a[0] =& $b;
"#,
    },
    ErrorEntry {
        code: "EMB-C006",
        short: "assignment path too deep",
        long: r#"## EMB-C006: assignment path too deep

An assignment target has more nested `[key]` segments than the VM
supports in one instruction. Assign through an intermediate variable.
"#,
    },
    // ── Fatal ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "EMB-R001",
        short: "recursion limit exceeded",
        long: r#"## EMB-R001: recursion limit exceeded

Nested function calls and includes went deeper than
`max_recursion_depth` (256 by default). Execution stops and every frame
is unwound.

**Example:**

    function f($n) { return f($n + 1); }
    f(0);

Raise the limit with `--max-depth` or rewrite the recursion as a loop.
"#,
    },
    ErrorEntry {
        code: "EMB-R002",
        short: "out of memory",
        long: r#"## EMB-R002: out of memory

The script bound more live variables than `max_values` allows.
Execution stops and every frame is unwound.
"#,
    },
    ErrorEntry {
        code: "EMB-R003",
        short: "internal VM error",
        long: r#"## EMB-R003: internal VM error

The VM met an instruction stream it cannot execute. This indicates a bug
in the engine; please report it with the script that triggers it.
"#,
    },
    // ── Runtime notices ───────────────────────────────────────────────────
    ErrorEntry {
        code: "EMB-R101",
        short: "undefined variable",
        long: r#"## EMB-R101: undefined variable

A variable was read before anything was assigned to it. The read yields
null.

**Example:**

    print $count + 1;
"#,
    },
    ErrorEntry {
        code: "EMB-R102",
        short: "undefined index",
        long: r#"## EMB-R102: undefined index

An array was read at a key it does not contain. The read yields null.
Test with `isset()` first when a key may be missing.
"#,
    },
    ErrorEntry {
        code: "EMB-R103",
        short: "undefined constant",
        long: r#"## EMB-R103: undefined constant

A bare name was used as a value but no constant with that name exists.
The name itself is used as a string.

**Example:**

    print GREETING;   // prints "GREETING"
"#,
    },
    ErrorEntry {
        code: "EMB-R104",
        short: "uninitialized string offset",
        long: r#"## EMB-R104: uninitialized string offset

A string was subscripted past its end. The read yields null.

**Example:**

    $s = 'ab'; print $s[5];
"#,
    },
    // ── Runtime warnings ──────────────────────────────────────────────────
    ErrorEntry {
        code: "EMB-R201",
        short: "division by zero",
        long: r#"## EMB-R201: division by zero

The right operand of `/` or `%` (or `/=`, `%=`) is zero. The result is
int 0.
"#,
    },
    ErrorEntry {
        code: "EMB-R202",
        short: "invalid foreach subject",
        long: r#"## EMB-R202: invalid foreach subject

`foreach` was given a scalar. The loop is skipped. A null subject is
skipped silently.
"#,
    },
    ErrorEntry {
        code: "EMB-R203",
        short: "missing argument",
        long: r#"## EMB-R203: missing argument

A user function was called with fewer arguments than it has parameters,
and the missing parameter has no default. It is bound to null.

**Example:**

    function greet($name) { print "hi $name"; }
    greet();
"#,
    },
    ErrorEntry {
        code: "EMB-R204",
        short: "undefined function",
        long: r#"## EMB-R204: undefined function

No user function or host function has that name. The call yields null.
Function names are case-sensitive.
"#,
    },
    ErrorEntry {
        code: "EMB-R205",
        short: "scalar used as array",
        long: r#"## EMB-R205: scalar used as array

A subscript was applied to an int, real, bool or resource, either for
reading or as an assignment target. Only arrays, strings (for reading)
and null (for assignment) accept subscripts.

**Example:**

    $n = 5; $n[0] = 1;
"#,
    },
    ErrorEntry {
        code: "EMB-R206",
        short: "host function arity mismatch",
        long: r#"## EMB-R206: host function arity mismatch

A host function was called with a number of arguments it does not
accept. The call is skipped and yields null.
"#,
    },
    ErrorEntry {
        code: "EMB-R207",
        short: "include failed",
        long: r#"## EMB-R207: include failed

An included file could not be found, read or compiled. The `include`
expression yields false and execution continues. Relative paths are
searched in the configured include paths, then the working directory.
"#,
    },
    ErrorEntry {
        code: "EMB-R208",
        short: "constant already defined",
        long: r#"## EMB-R208: constant already defined

A `const` declaration names a constant that the script or the host
already defined. The first definition is kept.
"#,
    },
    ErrorEntry {
        code: "EMB-R209",
        short: "array index exhausted",
        long: r#"## EMB-R209: array index exhausted

`$a[] = ...` needs the next integer key after the largest one used, and
that key would overflow.
"#,
    },
];

pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    let code = code.trim();
    REGISTRY.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_code() {
        let e = lookup("EMB-R201").expect("EMB-R201 should be in registry");
        assert_eq!(e.code, "EMB-R201");
        assert_eq!(e.short, "division by zero");
        assert!(e.long.contains("EMB-R201"));
    }

    #[test]
    fn lookup_ignores_case_and_whitespace() {
        assert_eq!(lookup(" emb-c003 ").map(|e| e.code), Some("EMB-C003"));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("EMB-X999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn all_codes_unique() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let len_before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), len_before, "duplicate codes in registry");
    }

    #[test]
    fn all_codes_have_content() {
        for entry in REGISTRY {
            assert!(!entry.short.is_empty(), "{} missing short description", entry.code);
            assert!(entry.long.starts_with(&format!("## {}", entry.code)), "{} heading", entry.code);
        }
    }

    #[test]
    fn stage_error_codes_are_registered() {
        let lex = crate::lexer::tokenize("'open").unwrap_err();
        assert!(lookup(lex.code()).is_some());
        let fatal = crate::vm::VmError::Internal { message: String::new() };
        assert!(lookup(fatal.code()).is_some());
    }
}
