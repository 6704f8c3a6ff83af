use serde::Serialize;

use crate::value::{ArithOp, BitOp, CastKind};

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn shifted(self, offset: usize) -> Span {
        Span { start: self.start + offset, end: self.end + offset }
    }
}

// ---- Operators ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryOp {
    Arith(ArithOp),
    Bit(BitOp),
    Concat,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit `&&` / `and`.
    And,
    /// Short-circuit `||` / `or`.
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

// ---- Expressions ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expr {
    #[serde(flatten)]
    pub kind: ExprKind,
    #[serde(skip)]
    pub span: Span,
    #[serde(skip)]
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayItem {
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "expr")]
pub enum ExprKind {
    Null,
    Bool { value: bool },
    Int { value: i64 },
    Real { value: f64 },
    Str { value: String },
    /// Double-quoted string with embedded expressions, concatenated in order.
    Interpolated { parts: Vec<Expr> },
    Variable { name: String },
    /// Bare identifier: a constant, or a function name when called.
    Constant { name: String },
    Array { items: Vec<ArrayItem> },
    /// `base[index]`; `index` is `None` for the append form `base[]`.
    Index { base: Box<Expr>, index: Option<Box<Expr>> },
    /// `base->name`, equivalent to `base["name"]`.
    Member { base: Box<Expr>, name: String },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    /// `target = value` or a compound assignment when `op` is set.
    Assign { op: Option<BinaryOp>, target: Box<Expr>, value: Box<Expr> },
    /// `target =& source`: both names bind the same storage.
    AssignRef { target: Box<Expr>, source: Box<Expr> },
    IncDec { increment: bool, prefix: bool, target: Box<Expr> },
    /// `cond ? then : otherwise`; `then` is absent in the `?:` short form.
    Ternary { cond: Box<Expr>, then: Option<Box<Expr>>, otherwise: Box<Expr> },
    Cast { to: CastKind, operand: Box<Expr> },
    Isset { targets: Vec<Expr> },
    Include { path: Box<Expr> },
    Exit { status: Option<Box<Expr>> },
    /// `function (params) { body }`; evaluates to the callable name the
    /// compiler gives it.
    Closure { decl: Box<FunctionDecl> },
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span, line: u32) -> Self {
        Expr { kind, span, line }
    }

    /// True for expressions that name storage: variables, subscripts and
    /// member accesses rooted at a variable.
    pub fn is_lvalue(&self) -> bool {
        match &self.kind {
            ExprKind::Variable { .. } => true,
            ExprKind::Index { base, .. } | ExprKind::Member { base, .. } => base.is_lvalue(),
            _ => false,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Null
                | ExprKind::Bool { .. }
                | ExprKind::Int { .. }
                | ExprKind::Real { .. }
                | ExprKind::Str { .. }
        )
    }
}

// ---- Statements ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stmt {
    #[serde(flatten)]
    pub kind: StmtKind,
    #[serde(skip)]
    pub span: Span,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchCase {
    /// `None` for `default:`.
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub name: String,
    pub hint: Option<CastKind>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaticVar {
    pub name: String,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stmt")]
pub enum StmtKind {
    Empty,
    Expr { expr: Expr },
    Block { body: Vec<Stmt> },
    If { cond: Expr, then: Box<Stmt>, otherwise: Option<Box<Stmt>> },
    While { cond: Expr, body: Box<Stmt> },
    DoWhile { body: Box<Stmt>, cond: Expr },
    For { init: Vec<Expr>, cond: Vec<Expr>, step: Vec<Expr>, body: Box<Stmt> },
    Foreach { subject: Expr, key: Option<String>, value: String, body: Box<Stmt> },
    Switch { subject: Expr, cases: Vec<SwitchCase> },
    Break { levels: u32 },
    Continue { levels: u32 },
    Return { value: Option<Expr> },
    Function { decl: FunctionDecl },
    Static { vars: Vec<StaticVar> },
    Uplink { names: Vec<String> },
    Const { name: String, value: Expr },
    Print { args: Vec<Expr> },
    Unset { targets: Vec<Expr> },
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span, line: u32) -> Self {
        Stmt { kind, span, line }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::new(ExprKind::Variable { name: name.into() }, Span::UNKNOWN, 1)
    }

    #[test]
    fn span_merge_and_shift() {
        let a = Span { start: 4, end: 6 };
        let b = Span { start: 1, end: 3 };
        assert_eq!(a.merge(b), Span { start: 1, end: 6 });
        assert_eq!(b.shifted(10), Span { start: 11, end: 13 });
    }

    #[test]
    fn lvalues_are_rooted_at_variables() {
        let index = Expr::new(
            ExprKind::Index { base: Box::new(var("a")), index: None },
            Span::UNKNOWN,
            1,
        );
        assert!(index.is_lvalue());
        let member = Expr::new(
            ExprKind::Member { base: Box::new(index), name: "k".into() },
            Span::UNKNOWN,
            1,
        );
        assert!(member.is_lvalue());
        let call = Expr::new(
            ExprKind::Call { callee: Box::new(var("f")), args: vec![] },
            Span::UNKNOWN,
            1,
        );
        assert!(!call.is_lvalue());
    }

    #[test]
    fn ast_serializes_with_tags() {
        let stmt = Stmt::new(StmtKind::Expr { expr: var("x") }, Span::UNKNOWN, 3);
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(json["stmt"], "Expr");
        assert_eq!(json["expr"]["expr"], "Variable");
        assert_eq!(json["expr"]["name"], "x");
        assert_eq!(json["line"], 3);
    }
}
