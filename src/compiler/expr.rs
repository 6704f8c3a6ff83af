use crate::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use crate::bytecode::{AssignOp, AssignSpec, Aux, NameId, Opcode, UNPATCHED};
use crate::value::{ArithOp, BitOp, CastKind, Value};

use super::Compiler;

/// Deepest assignable path: the append mask is one `u64`.
const MAX_PATH_DEPTH: usize = 64;

/// A variable path target: `$root[k1]->k2[]...`.
pub(super) struct LvaluePath<'e> {
    pub root: &'e str,
    /// `None` for an append segment.
    pub segments: Vec<Option<Segment<'e>>>,
}

pub(super) enum Segment<'e> {
    Expr(&'e Expr),
    Name(&'e str),
}

pub(super) fn lvalue_path(expr: &Expr) -> Option<LvaluePath<'_>> {
    match &expr.kind {
        ExprKind::Variable { name } => Some(LvaluePath { root: name, segments: Vec::new() }),
        ExprKind::Index { base, index } => {
            let mut path = lvalue_path(base)?;
            path.segments.push(index.as_deref().map(Segment::Expr));
            Some(path)
        }
        ExprKind::Member { base, name } => {
            let mut path = lvalue_path(base)?;
            path.segments.push(Some(Segment::Name(name)));
            Some(path)
        }
        _ => None,
    }
}

/// Opcode of a strict binary operator; `None` for the short-circuit forms,
/// which compile to jumps.
pub(super) fn binary_opcode(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Arith(ArithOp::Add) => Opcode::Add,
        BinaryOp::Arith(ArithOp::Sub) => Opcode::Sub,
        BinaryOp::Arith(ArithOp::Mul) => Opcode::Mul,
        BinaryOp::Arith(ArithOp::Div) => Opcode::Div,
        BinaryOp::Arith(ArithOp::Mod) => Opcode::Mod,
        BinaryOp::Bit(BitOp::And) => Opcode::BitAnd,
        BinaryOp::Bit(BitOp::Or) => Opcode::BitOr,
        BinaryOp::Bit(BitOp::Xor) => Opcode::BitXor,
        BinaryOp::Bit(BitOp::Shl) => Opcode::Shl,
        BinaryOp::Bit(BitOp::Shr) => Opcode::Shr,
        BinaryOp::Concat => Opcode::Concat,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::StrictEq => Opcode::StrictEq,
        BinaryOp::StrictNe => Opcode::StrictNe,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::Xor => Opcode::Xor,
        BinaryOp::And | BinaryOp::Or => return None,
    })
}

impl Compiler<'_> {
    pub(super) fn compile_expr(&mut self, expr: &Expr) {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Null => self.load_literal(Value::null(), line),
            ExprKind::Bool { value } => self.load_literal(Value::from(*value), line),
            ExprKind::Int { value } => self.load_literal(Value::from(*value), line),
            ExprKind::Real { value } => self.load_literal(Value::from(*value), line),
            ExprKind::Str { value } => self.load_literal(Value::from(value.as_str()), line),
            ExprKind::Interpolated { parts } => {
                let mut parts = parts.iter();
                match parts.next() {
                    Some(first) => self.compile_expr(first),
                    None => self.load_literal(Value::from(""), line),
                }
                let mut joined = false;
                for part in parts {
                    self.compile_expr(part);
                    self.emit(Opcode::Concat, 0, 0, line);
                    joined = true;
                }
                if !joined {
                    self.emit_aux(Opcode::Cast, 0, 0, Aux::Cast(CastKind::Str), line);
                }
            }
            ExprKind::Variable { name } => {
                let id = self.name(name);
                self.emit(Opcode::LoadVar, 0, id, line);
            }
            ExprKind::Constant { name } => {
                let id = self.name(name);
                self.emit(Opcode::LoadConstant, 0, id, line);
            }
            ExprKind::Array { items } => {
                self.emit(Opcode::NewArray, 0, 0, line);
                for item in items {
                    match &item.key {
                        Some(key) => {
                            self.compile_expr(key);
                            self.compile_expr(&item.value);
                            self.emit(Opcode::ArrayInsert, 0, 0, item.value.line);
                        }
                        None => {
                            self.compile_expr(&item.value);
                            self.emit(Opcode::ArrayPush, 0, 0, item.value.line);
                        }
                    }
                }
            }
            ExprKind::Index { base, index } => {
                self.compile_expr(base);
                match index {
                    Some(index) => self.compile_expr(index),
                    None => {
                        self.error("EMB-C004", line, "cannot use [] for reading".into());
                        self.load_literal(Value::null(), line);
                    }
                }
                self.emit(Opcode::LoadIdx, 0, 0, line);
            }
            ExprKind::Member { base, name } => {
                self.compile_expr(base);
                self.load_literal(Value::from(name.as_str()), line);
                self.emit(Opcode::LoadIdx, 0, 0, line);
            }
            ExprKind::Call { callee, args } => match &callee.kind {
                ExprKind::Constant { name } => {
                    let id = self.name(name);
                    for arg in args {
                        self.compile_expr(arg);
                    }
                    self.emit(Opcode::Call, args.len() as i32, id, line);
                }
                _ => {
                    self.compile_expr(callee);
                    for arg in args {
                        self.compile_expr(arg);
                    }
                    self.emit(Opcode::CallDynamic, args.len() as i32, 0, line);
                }
            },
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand);
                let op = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Plus => Opcode::Plus,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitNot => Opcode::BitNot,
                };
                self.emit(op, 0, 0, line);
            }
            ExprKind::Binary { op: op @ (BinaryOp::And | BinaryOp::Or), left, right } => {
                self.compile_expr(left);
                let jump = if *op == BinaryOp::And { Opcode::JzKeep } else { Opcode::JnzKeep };
                let at = self.emit(jump, 0, UNPATCHED, line);
                self.compile_expr(right);
                self.chunk.patch_jump(at);
                self.emit_aux(Opcode::Cast, 0, 0, Aux::Cast(CastKind::Bool), line);
            }
            ExprKind::Binary { op, left, right } => {
                self.compile_expr(left);
                self.compile_expr(right);
                if let Some(op) = binary_opcode(*op) {
                    self.emit(op, 0, 0, line);
                }
            }
            ExprKind::Assign { op, target, value } => {
                let op = match op.map(binary_opcode) {
                    None => AssignOp::Set,
                    Some(Some(op)) => AssignOp::Compound(op),
                    Some(None) => {
                        self.error("EMB-C005", line, "logical operators have no compound assignment".into());
                        AssignOp::Set
                    }
                };
                self.compile_assign(target, Some(value), op, line);
            }
            ExprKind::IncDec { increment, prefix, target } => {
                let op = match (increment, prefix) {
                    (true, true) => AssignOp::PreInc,
                    (true, false) => AssignOp::PostInc,
                    (false, true) => AssignOp::PreDec,
                    (false, false) => AssignOp::PostDec,
                };
                self.compile_assign(target, None, op, line);
            }
            ExprKind::AssignRef { target, source } => match (&target.kind, &source.kind) {
                (ExprKind::Variable { name: target }, ExprKind::Variable { name: source }) => {
                    let target = self.name(target);
                    let source = self.name(source);
                    self.emit(Opcode::BindRef, source as i32, target, line);
                }
                _ => {
                    self.error("EMB-C005", line, "references can only bind plain variables".into());
                    self.load_literal(Value::null(), line);
                }
            },
            ExprKind::Ternary { cond, then, otherwise } => {
                self.compile_expr(cond);
                match then {
                    Some(then) => {
                        let to_else = self.emit(Opcode::Jz, 0, UNPATCHED, line);
                        self.compile_expr(then);
                        let to_end = self.emit(Opcode::Jmp, 0, UNPATCHED, line);
                        self.chunk.patch_jump(to_else);
                        self.compile_expr(otherwise);
                        self.chunk.patch_jump(to_end);
                    }
                    None => {
                        let to_end = self.emit(Opcode::JnzKeep, 0, UNPATCHED, line);
                        self.compile_expr(otherwise);
                        self.chunk.patch_jump(to_end);
                    }
                }
            }
            ExprKind::Cast { to, operand } => {
                self.compile_expr(operand);
                self.emit_aux(Opcode::Cast, 0, 0, Aux::Cast(*to), line);
            }
            ExprKind::Isset { targets } => {
                let mut exits = Vec::new();
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        exits.push(self.emit(Opcode::JzKeep, 0, UNPATCHED, line));
                    }
                    match self.compile_path_keys(target, "isset") {
                        Some((root, depth)) => {
                            self.emit(Opcode::Isset, depth, root, line);
                        }
                        None => self.load_literal(Value::from(false), line),
                    }
                }
                for at in exits {
                    self.chunk.patch_jump(at);
                }
            }
            ExprKind::Closure { decl } => {
                let name = self.compile_closure(decl);
                self.load_literal(Value::from(name.as_str()), line);
            }
            ExprKind::Include { path } => {
                self.compile_expr(path);
                self.emit(Opcode::Include, 0, 0, line);
            }
            ExprKind::Exit { status } => {
                let has_operand = match status {
                    Some(status) => {
                        self.compile_expr(status);
                        1
                    }
                    None => 0,
                };
                self.emit(Opcode::Halt, has_operand, 0, line);
                // keeps the stack balanced for the enclosing statement
                self.load_literal(Value::null(), line);
            }
        }
    }

    /// Emits the keys of `target` for an `Isset`/`Unset` walk, rejecting
    /// append segments. Returns the root name id and path depth.
    pub(super) fn compile_path_keys(&mut self, target: &Expr, what: &str) -> Option<(NameId, i32)> {
        let Some(path) = lvalue_path(target) else {
            self.error("EMB-C004", target.line, format!("{what}() expects a variable"));
            return None;
        };
        if path.segments.iter().any(Option::is_none) {
            self.error("EMB-C004", target.line, format!("cannot use [] in {what}()"));
            return None;
        }
        let root = self.name(path.root);
        let depth = path.segments.len() as i32;
        for segment in path.segments.into_iter().flatten() {
            self.compile_segment(segment, target.line);
        }
        Some((root, depth))
    }

    fn compile_segment(&mut self, segment: Segment<'_>, line: u32) {
        match segment {
            Segment::Expr(key) => self.compile_expr(key),
            Segment::Name(name) => self.load_literal(Value::from(name), line),
        }
    }

    fn compile_assign(&mut self, target: &Expr, value: Option<&Expr>, op: AssignOp, line: u32) {
        let Some(path) = lvalue_path(target) else {
            self.error("EMB-C005", line, "cannot assign to this expression".into());
            self.load_literal(Value::null(), line);
            return;
        };
        if path.segments.len() > MAX_PATH_DEPTH - 1 {
            self.error("EMB-C006", line, format!("assignment path deeper than {} levels", MAX_PATH_DEPTH - 1));
            self.load_literal(Value::null(), line);
            return;
        }
        let root = self.name(path.root);
        let depth = path.segments.len() as i32;
        let mut appends = 0u64;
        for (i, segment) in path.segments.into_iter().enumerate() {
            match segment {
                Some(segment) => self.compile_segment(segment, line),
                None => appends |= 1 << i,
            }
        }
        if let Some(value) = value {
            self.compile_expr(value);
        }
        self.emit_aux(Opcode::Assign, depth, root, Aux::Assign(AssignSpec { op, appends }), line);
    }
}
