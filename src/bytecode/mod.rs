//! Instruction set and compiled program layout.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use serde::Serialize;

use crate::value::{CastKind, Repr, Value};

pub type ChunkId = u32;
pub type NameId = u32;
pub type FuncId = u32;

/// Jump placeholder until the owning block is patched.
pub const UNPATCHED: u32 = u32::MAX;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// Operand conventions: `p1` is a signed count or small index, `p2` an
// unsigned jump target, literal index or name id, `p3` structured data.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Opcode {
    /// End of chunk. p1: 0 yields null, 1 pops the result, 2 yields true.
    Done,
    /// `exit`/`die`. p1 = 1 when an operand is on the stack.
    Halt,
    /// Push literal p2.
    LoadConst,
    /// Push variable p2 (notice + null when undefined).
    LoadVar,
    /// Push named constant p2.
    LoadConstant,
    /// Pop key, pop base, push `base[key]`.
    LoadIdx,
    NewArray,
    /// Pop value, append to the array on top of the stack.
    ArrayPush,
    /// Pop value, pop key, insert into the array on top of the stack.
    ArrayInsert,

    Jmp,
    /// Pop; jump to p2 when falsy.
    Jz,
    /// Pop; jump to p2 when truthy.
    Jnz,
    /// Jump to p2 keeping the top when falsy, otherwise pop.
    JzKeep,
    /// Jump to p2 keeping the top when truthy, otherwise pop.
    JnzKeep,
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    /// Logical exclusive or.
    Xor,
    Neg,
    Plus,
    Not,
    BitNot,
    /// p3 = cast target.
    Cast,

    /// Assignment through a variable path. p2 = root name, p1 = path depth,
    /// p3 = [`AssignSpec`]. Path keys (except appends) are on the stack below
    /// the assigned value. Pushes the expression result.
    Assign,
    /// Bind name p2 to the storage of name p1. Pushes the shared value.
    BindRef,
    /// Unset a variable path (p2 root, p1 depth, keys on the stack).
    Unset,
    /// Push whether a variable path is set and not null.
    Isset,

    /// Call function p2 by name with p1 arguments.
    Call,
    /// Pop p1 arguments, then the callee name, and call it.
    CallDynamic,
    /// Pop the result and leave the current frame.
    Ret,
    /// Pop p1 values and write them to output in order.
    Print,

    /// Pop the subject and start iteration; jump to p2 when skipped.
    ForeachInit,
    /// Advance the innermost iteration, binding foreach info p1; pops the
    /// iteration and jumps to p2 when exhausted.
    ForeachStep,
    /// Drop the innermost iteration (break out of a foreach).
    IterPop,
    /// Pop the subject and dispatch through switch table p2.
    Switch,

    /// Bind name p2 to static slot p1, initializing it on first use.
    BindStatic,
    /// Bind name p2 to the global variable of the same name.
    Uplink,
    /// Pop a value and define constant p2.
    DefineConst,
    /// Pop a path, compile and run that file in the current scope.
    Include,
}

/// What an [`Opcode::Assign`] does at the end of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssignOp {
    Set,
    /// Read-modify-write with the given binary opcode.
    Compound(Opcode),
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

impl AssignOp {
    /// Whether a right-hand value is on the stack.
    pub fn takes_value(self) -> bool {
        matches!(self, AssignOp::Set | AssignOp::Compound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssignSpec {
    pub op: AssignOp,
    /// Bit `i` set when path segment `i` is an append (`[]`).
    pub appends: u64,
}

impl AssignSpec {
    pub fn is_append(&self, segment: usize) -> bool {
        segment < 64 && self.appends & (1 << segment) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Aux {
    #[default]
    None,
    Assign(AssignSpec),
    Cast(CastKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Instr {
    pub op: Opcode,
    pub p1: i32,
    pub p2: u32,
    pub p3: Aux,
    pub line: u32,
}

// ── Chunk ────────────────────────────────────────────────────────────

/// One independent instruction array: the main body, a function body or a
/// sub-program (default value, static initializer, case test).
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub name: String,
    pub code: Vec<Instr>,
}

impl Chunk {
    pub fn new(name: impl Into<String>) -> Self {
        Chunk { name: name.into(), code: Vec::new() }
    }

    pub fn emit(&mut self, op: Opcode, p1: i32, p2: u32, p3: Aux, line: u32) -> usize {
        let idx = self.code.len();
        self.code.push(Instr { op, p1, p2, p3, line });
        idx
    }

    pub fn next_pc(&self) -> u32 {
        self.code.len() as u32
    }

    /// Points the jump at `at` to the next instruction to be emitted.
    pub fn patch_jump(&mut self, at: usize) {
        let target = self.next_pc();
        self.patch_jump_to(at, target);
    }

    pub fn patch_jump_to(&mut self, at: usize, target: u32) {
        if let Some(instr) = self.code.get_mut(at) {
            instr.p2 = target;
        }
    }

    pub fn last_op(&self) -> Option<Opcode> {
        self.code.last().map(|i| i.op)
    }
}

// ── Program ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ParamDef {
    pub name: NameId,
    pub hint: Option<CastKind>,
    /// Sub-program producing the default value.
    pub default: Option<ChunkId>,
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: Rc<str>,
    pub params: Vec<ParamDef>,
    pub chunk: ChunkId,
    /// Static slots declared in the body, indexes into [`Program::statics`].
    pub statics: Vec<u32>,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticDef {
    pub name: NameId,
    pub init: Option<ChunkId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeachInfo {
    pub key: Option<NameId>,
    pub value: NameId,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchCase {
    /// Sub-program evaluating the case expression.
    pub test: ChunkId,
    pub target: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchTable {
    pub cases: Vec<SwitchCase>,
    pub default: Option<u32>,
    pub end: u32,
}

/// A compiled program. Included files are compiled into the same program
/// while it runs, so every table only grows.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub chunks: Vec<Rc<Chunk>>,
    pub literals: Vec<Value>,
    pub names: Vec<Rc<str>>,
    name_ids: HashMap<Rc<str>, NameId>,
    pub functions: Vec<FuncDef>,
    function_ids: HashMap<Rc<str>, FuncId>,
    pub statics: Vec<StaticDef>,
    pub foreach: Vec<ForeachInfo>,
    pub switches: Vec<SwitchTable>,
    /// Main chunk of the first compilation unit.
    pub entry: ChunkId,
}

impl Program {
    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.name_ids.get(name) {
            return id;
        }
        let id = self.names.len() as NameId;
        let name: Rc<str> = Rc::from(name);
        self.names.push(Rc::clone(&name));
        self.name_ids.insert(name, id);
        id
    }

    pub fn name(&self, id: NameId) -> &str {
        self.names.get(id as usize).map_or("?", |n| n)
    }

    pub fn name_id(&self, name: &str) -> Option<NameId> {
        self.name_ids.get(name).copied()
    }

    pub fn add_literal(&mut self, value: Value) -> u32 {
        self.literals.push(value);
        (self.literals.len() - 1) as u32
    }

    pub fn add_chunk(&mut self, chunk: Chunk) -> ChunkId {
        self.chunks.push(Rc::new(chunk));
        (self.chunks.len() - 1) as ChunkId
    }

    /// Reserves an id for a chunk whose code is filled in later.
    pub fn reserve_chunk(&mut self, name: impl Into<String>) -> ChunkId {
        self.add_chunk(Chunk::new(name))
    }

    pub fn replace_chunk(&mut self, id: ChunkId, chunk: Chunk) {
        if let Some(slot) = self.chunks.get_mut(id as usize) {
            *slot = Rc::new(chunk);
        }
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Rc<Chunk>> {
        self.chunks.get(id as usize)
    }

    pub fn function(&self, name: &str) -> Option<FuncId> {
        self.function_ids.get(name).copied()
    }

    /// Registers a function name; `None` when it is already taken.
    pub fn declare_function(&mut self, def: FuncDef) -> Option<FuncId> {
        if self.function_ids.contains_key(&def.name) {
            return None;
        }
        let id = self.functions.len() as FuncId;
        self.function_ids.insert(Rc::clone(&def.name), id);
        self.functions.push(def);
        Some(id)
    }

    pub fn instruction_count(&self) -> usize {
        self.chunks.iter().map(|c| c.code.len()).sum()
    }

    // ── Disassembly ──────────────────────────────────────────────────

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (id, chunk) in self.chunks.iter().enumerate() {
            let _ = writeln!(out, "== chunk {id}: {} ==", chunk.name);
            for (pc, instr) in chunk.code.iter().enumerate() {
                let _ = writeln!(out, "{pc:04}  L{:<4} {}", instr.line, self.describe(instr));
            }
        }
        for (id, f) in self.functions.iter().enumerate() {
            let params: Vec<String> = f
                .params
                .iter()
                .map(|p| {
                    let mut s = format!("${}", self.name(p.name));
                    if let Some(hint) = p.hint {
                        s = format!("{hint:?} {s}");
                    }
                    if let Some(d) = p.default {
                        let _ = write!(s, " = <chunk {d}>");
                    }
                    s
                })
                .collect();
            let _ = writeln!(out, "fn #{id} {}({}) -> chunk {}", f.name, params.join(", "), f.chunk);
        }
        out
    }

    fn describe(&self, instr: &Instr) -> String {
        let Instr { op, p1, p2, p3, .. } = instr;
        let operands = match op {
            Opcode::LoadConst => format!("{p2}  ; {}", render_literal(self.literals.get(*p2 as usize))),
            Opcode::LoadVar | Opcode::Uplink | Opcode::DefineConst | Opcode::LoadConstant => {
                format!("{p2}  ; {}", self.name(*p2))
            }
            Opcode::Call => format!("{p1} {p2}  ; {}()", self.name(*p2)),
            Opcode::Assign | Opcode::Unset | Opcode::Isset => {
                let spec = match p3 {
                    Aux::Assign(spec) => format!(" {:?}", spec.op),
                    _ => String::new(),
                };
                format!("{p1} {p2}  ; ${}{spec}", self.name(*p2))
            }
            Opcode::BindRef => format!("{p1} {p2}  ; ${} =& ${}", self.name(*p2), self.name(*p1 as u32)),
            Opcode::BindStatic => format!("{p1} {p2}  ; static ${}", self.name(*p2)),
            Opcode::Cast => match p3 {
                Aux::Cast(kind) => format!("{kind:?}"),
                _ => String::new(),
            },
            Opcode::Jmp | Opcode::Jz | Opcode::Jnz | Opcode::JzKeep | Opcode::JnzKeep | Opcode::ForeachInit => {
                format!("-> {p2}")
            }
            Opcode::ForeachStep => format!("{p1} -> {p2}"),
            Opcode::Switch => format!("table {p2}"),
            _ if *p1 != 0 || *p2 != 0 => format!("{p1} {p2}"),
            _ => String::new(),
        };
        format!("{:<12} {operands}", format!("{op:?}")).trim_end().to_string()
    }
}

fn render_literal(value: Option<&Value>) -> String {
    match value.map(Value::repr) {
        None => "?".into(),
        Some(Repr::Str(s)) => format!("{s:?}"),
        Some(_) => value.map(|v| format!("{v:?}")).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_emit_and_patch() {
        let mut chunk = Chunk::new("main");
        let jump = chunk.emit(Opcode::Jz, 0, UNPATCHED, Aux::None, 1);
        chunk.emit(Opcode::Pop, 0, 0, Aux::None, 1);
        chunk.patch_jump(jump);
        assert_eq!(chunk.code[jump].p2, 2);
        assert_eq!(chunk.last_op(), Some(Opcode::Pop));
    }

    #[test]
    fn names_are_interned_once() {
        let mut program = Program::default();
        let a = program.intern("a");
        let b = program.intern("b");
        assert_eq!(program.intern("a"), a);
        assert_ne!(a, b);
        assert_eq!(program.name(b), "b");
        assert_eq!(program.name_id("c"), None);
    }

    #[test]
    fn duplicate_functions_rejected() {
        let mut program = Program::default();
        let def = FuncDef { name: Rc::from("f"), params: vec![], chunk: 0, statics: vec![], line: 1 };
        assert_eq!(program.declare_function(def.clone()), Some(0));
        assert_eq!(program.declare_function(def), None);
        assert_eq!(program.function("f"), Some(0));
    }

    #[test]
    fn append_mask() {
        let spec = AssignSpec { op: AssignOp::Set, appends: 0b10 };
        assert!(!spec.is_append(0));
        assert!(spec.is_append(1));
        assert!(!spec.is_append(70));
        assert!(AssignOp::Compound(Opcode::Add).takes_value());
        assert!(!AssignOp::PostInc.takes_value());
    }

    #[test]
    fn disassembly_names_operands() {
        let mut program = Program::default();
        let lit = program.add_literal(Value::from("hi"));
        let name = program.intern("greeting");
        let mut chunk = Chunk::new("main");
        chunk.emit(Opcode::LoadConst, 0, lit, Aux::None, 1);
        chunk.emit(
            Opcode::Assign,
            0,
            name,
            Aux::Assign(AssignSpec { op: AssignOp::Set, appends: 0 }),
            1,
        );
        program.entry = program.add_chunk(chunk);
        let text = program.disassemble();
        assert!(text.contains("== chunk 0: main =="));
        assert!(text.contains("LoadConst    0  ; \"hi\""));
        assert!(text.contains("$greeting Set"));
    }
}
