//! Code generator: statement trees to chunked bytecode.
//!
//! Every compilation unit (the main script or an included file) appends to
//! one [`Program`]. Function declarations anywhere in a unit are hoisted:
//! they are registered before any code is emitted so calls may precede
//! declarations.

use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::ast::{self, FunctionDecl, Stmt, StmtKind};
use crate::bytecode::{
    Aux, Chunk, ChunkId, FuncDef, FuncId, ForeachInfo, NameId, Opcode, ParamDef, Program, StaticDef,
    SwitchCase, SwitchTable, UNPATCHED,
};
use crate::value::{Repr, Value};

mod block;
mod expr;

pub use block::{BlockArena, BlockKind, FixupKind, JumpError, JumpPlan};

#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct CompileError {
    pub code: &'static str,
    pub line: u32,
    pub message: String,
}

/// What the final `Done` of a unit's main chunk yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// The host's entry script: null.
    Main,
    /// An included file: true unless it returns a value.
    Include,
}

/// Compiles a parsed script into a fresh program.
pub fn compile(ast: &ast::Program) -> Result<Program, Vec<CompileError>> {
    let mut program = Program::default();
    let entry = compile_into(&mut program, ast, "main", UnitKind::Main)?;
    program.entry = entry;
    Ok(program)
}

/// Compiles one unit into `program`, returning its main chunk. On failure
/// `program` is left as it was.
pub fn compile_into(
    program: &mut Program,
    ast: &ast::Program,
    unit: &str,
    kind: UnitKind,
) -> Result<ChunkId, Vec<CompileError>> {
    let snapshot = program.clone();
    let mut compiler = Compiler::new(program);
    let entry = compiler.compile_unit(ast, unit, kind);
    let errors = mem::take(&mut compiler.errors);
    if errors.is_empty() {
        debug!(
            unit,
            chunks = program.chunks.len(),
            functions = program.functions.len(),
            instructions = program.instruction_count(),
            "compiled unit"
        );
        Ok(entry)
    } else {
        *program = snapshot;
        debug!(unit, errors = errors.len(), "compilation failed");
        Err(errors)
    }
}

/// Literal identity for deduplication; reals compare by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LiteralKey {
    Null,
    Bool(bool),
    Int(i64),
    Real(u64),
    Str(Rc<str>),
}

impl LiteralKey {
    fn of(value: &Value) -> Option<LiteralKey> {
        Some(match value.repr() {
            Repr::Null => LiteralKey::Null,
            Repr::Bool(b) => LiteralKey::Bool(*b),
            Repr::Int(n) => LiteralKey::Int(*n),
            Repr::Real(r) => LiteralKey::Real(r.to_bits()),
            Repr::Str(s) => LiteralKey::Str(Rc::clone(s)),
            Repr::Array(_) | Repr::Resource(_) => return None,
        })
    }
}

pub(crate) struct Compiler<'p> {
    program: &'p mut Program,
    literals: HashMap<LiteralKey, u32>,
    chunk: Chunk,
    blocks: BlockArena,
    /// Static slots declared by the function being compiled.
    statics: Vec<u32>,
    errors: Vec<CompileError>,
}

impl<'p> Compiler<'p> {
    fn new(program: &'p mut Program) -> Self {
        Compiler {
            program,
            literals: HashMap::new(),
            chunk: Chunk::new("main"),
            blocks: BlockArena::new(),
            statics: Vec::new(),
            errors: Vec::new(),
        }
    }

    // ── Emission helpers ─────────────────────────────────────────────

    fn emit(&mut self, op: Opcode, p1: i32, p2: u32, line: u32) -> usize {
        self.chunk.emit(op, p1, p2, Aux::None, line)
    }

    fn emit_aux(&mut self, op: Opcode, p1: i32, p2: u32, aux: Aux, line: u32) -> usize {
        self.chunk.emit(op, p1, p2, aux, line)
    }

    fn error(&mut self, code: &'static str, line: u32, message: String) {
        self.errors.push(CompileError { code, line, message });
    }

    fn name(&mut self, name: &str) -> NameId {
        self.program.intern(name)
    }

    /// Loads a literal, sharing one table slot per distinct literal in the
    /// unit.
    fn load_literal(&mut self, value: Value, line: u32) {
        let idx = match LiteralKey::of(&value) {
            Some(key) => match self.literals.get(&key) {
                Some(&idx) => idx,
                None => {
                    let idx = self.program.add_literal(value);
                    self.literals.insert(key, idx);
                    idx
                }
            },
            None => self.program.add_literal(value),
        };
        self.emit(Opcode::LoadConst, 0, idx, line);
    }

    /// Compiles into a fresh chunk with its own block arena, then restores
    /// the current one.
    fn in_chunk(&mut self, chunk_id: ChunkId, name: String, body: impl FnOnce(&mut Self)) {
        let outer_chunk = mem::replace(&mut self.chunk, Chunk::new(name));
        let outer_blocks = mem::take(&mut self.blocks);
        body(self);
        let chunk = mem::replace(&mut self.chunk, outer_chunk);
        self.blocks = outer_blocks;
        self.program.replace_chunk(chunk_id, chunk);
    }

    /// A one-expression sub-program that returns its value.
    fn sub_program(&mut self, name: String, expr: &ast::Expr) -> ChunkId {
        let id = self.program.reserve_chunk(name.clone());
        self.in_chunk(id, name, |c| {
            c.compile_expr(expr);
            c.emit(Opcode::Done, 1, 0, expr.line);
        });
        id
    }

    // ── Units and functions ──────────────────────────────────────────

    fn compile_unit(&mut self, ast: &ast::Program, unit: &str, kind: UnitKind) -> ChunkId {
        let mut decls = Vec::new();
        collect_functions(&ast.body, &mut decls);
        self.compile_functions(decls);

        let entry = self.program.reserve_chunk(unit);
        self.in_chunk(entry, unit.to_string(), |c| {
            for stmt in &ast.body {
                c.compile_stmt(stmt);
            }
            let last_line = ast.body.last().map_or(1, |s| s.line);
            let mode = if kind == UnitKind::Include { 2 } else { 0 };
            c.emit(Opcode::Done, mode, 0, last_line);
        });
        entry
    }

    /// Declares every function first so bodies may call each other.
    fn compile_functions(&mut self, decls: Vec<&FunctionDecl>) {
        let declared: Vec<(FuncId, &FunctionDecl)> = decls
            .into_iter()
            .filter_map(|decl| self.declare(&decl.name, decl).map(|id| (id, decl)))
            .collect();
        for (id, decl) in declared {
            self.compile_function(id, &decl.name, decl);
        }
    }

    /// Compiles an anonymous function under a generated name and returns
    /// that name. Scripts cannot spell it, so it never clashes.
    pub(super) fn compile_closure(&mut self, decl: &FunctionDecl) -> String {
        let name = format!("{{closure}}{}", self.program.functions.len());
        if let Some(id) = self.declare(&name, decl) {
            let mut inner = Vec::new();
            collect_functions(&decl.body, &mut inner);
            self.compile_functions(inner);
            self.compile_function(id, &name, decl);
        }
        name
    }

    fn declare(&mut self, name: &str, decl: &FunctionDecl) -> Option<FuncId> {
        let chunk = self.program.reserve_chunk(format!("function {name}"));
        let params = decl
            .params
            .iter()
            .map(|p| ParamDef { name: self.program.intern(&p.name), hint: p.hint, default: None })
            .collect();
        let def = FuncDef { name: Rc::from(name), params, chunk, statics: Vec::new(), line: decl.line };
        let id = self.program.declare_function(def);
        if id.is_none() {
            self.error("EMB-C003", decl.line, format!("function {name}() is already declared"));
        }
        id
    }

    fn compile_function(&mut self, id: FuncId, name: &str, decl: &FunctionDecl) {
        trace!(function = %name, params = decl.params.len(), "compiling function");
        let mut defaults = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            let default = param
                .default
                .as_ref()
                .map(|d| self.sub_program(format!("default {name}(${})", param.name), d));
            defaults.push(default);
        }

        let Some(chunk_id) = self.program.functions.get(id as usize).map(|f| f.chunk) else {
            return;
        };
        let outer_statics = mem::take(&mut self.statics);
        self.in_chunk(chunk_id, format!("function {name}"), |c| {
            for stmt in &decl.body {
                c.compile_stmt(stmt);
            }
            let line = decl.body.last().map_or(decl.line, |s| s.line);
            c.emit(Opcode::Done, 0, 0, line);
        });
        let statics = mem::replace(&mut self.statics, outer_statics);

        if let Some(def) = self.program.functions.get_mut(id as usize) {
            for (param, default) in def.params.iter_mut().zip(defaults) {
                param.default = default;
            }
            def.statics = statics;
        }
    }

    // ── Statements ───────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Empty | StmtKind::Function { .. } => {}
            StmtKind::Expr { expr } => {
                self.compile_expr(expr);
                self.emit(Opcode::Pop, 0, 0, line);
            }
            StmtKind::Block { body } => {
                for stmt in body {
                    self.compile_stmt(stmt);
                }
            }
            StmtKind::If { cond, then, otherwise } => {
                let block = self.blocks.push(BlockKind::Branch, self.chunk.next_pc());
                self.compile_expr(cond);
                let to_else = self.emit(Opcode::Jz, 0, UNPATCHED, line);
                self.compile_stmt(then);
                if let Some(otherwise) = otherwise {
                    let to_end = self.emit(Opcode::Jmp, 0, UNPATCHED, line);
                    self.blocks.add_fixup(block, FixupKind::End, to_end);
                    self.chunk.patch_jump(to_else);
                    self.compile_stmt(otherwise);
                } else {
                    self.chunk.patch_jump(to_else);
                }
                self.blocks.pop(&mut self.chunk);
            }
            StmtKind::While { cond, body } => {
                let start = self.chunk.next_pc();
                let block = self.blocks.push(BlockKind::Loop, start);
                self.blocks.set_continue_target(block, start);
                self.compile_expr(cond);
                let exit = self.emit(Opcode::Jz, 0, UNPATCHED, line);
                self.blocks.add_fixup(block, FixupKind::Break, exit);
                self.compile_stmt(body);
                self.emit(Opcode::Jmp, 0, start, line);
                self.blocks.pop(&mut self.chunk);
            }
            StmtKind::DoWhile { body, cond } => {
                let start = self.chunk.next_pc();
                let block = self.blocks.push(BlockKind::Loop, start);
                self.compile_stmt(body);
                // continue jumps forward to the condition
                self.blocks.set_continue_target(block, self.chunk.next_pc());
                self.compile_expr(cond);
                self.emit(Opcode::Jnz, 0, start, cond.line);
                self.blocks.pop(&mut self.chunk);
            }
            StmtKind::For { init, cond, step, body } => {
                for expr in init {
                    self.compile_expr(expr);
                    self.emit(Opcode::Pop, 0, 0, expr.line);
                }
                let start = self.chunk.next_pc();
                let block = self.blocks.push(BlockKind::Loop, start);
                if let Some((last, rest)) = cond.split_last() {
                    for expr in rest {
                        self.compile_expr(expr);
                        self.emit(Opcode::Pop, 0, 0, expr.line);
                    }
                    self.compile_expr(last);
                    let exit = self.emit(Opcode::Jz, 0, UNPATCHED, line);
                    self.blocks.add_fixup(block, FixupKind::Break, exit);
                }
                self.compile_stmt(body);
                self.blocks.set_continue_target(block, self.chunk.next_pc());
                for expr in step {
                    self.compile_expr(expr);
                    self.emit(Opcode::Pop, 0, 0, expr.line);
                }
                self.emit(Opcode::Jmp, 0, start, line);
                self.blocks.pop(&mut self.chunk);
            }
            StmtKind::Foreach { subject, key, value, body } => {
                self.compile_expr(subject);
                let block = self.blocks.push(BlockKind::Foreach, self.chunk.next_pc());
                let skip = self.emit(Opcode::ForeachInit, 0, UNPATCHED, line);
                self.blocks.add_fixup(block, FixupKind::End, skip);
                let info = ForeachInfo {
                    key: key.as_deref().map(|k| self.program.intern(k)),
                    value: self.program.intern(value),
                };
                self.program.foreach.push(info);
                let info = (self.program.foreach.len() - 1) as i32;
                let step = self.chunk.next_pc();
                self.blocks.set_continue_target(block, step);
                let done = self.emit(Opcode::ForeachStep, info, UNPATCHED, line);
                self.blocks.add_fixup(block, FixupKind::End, done);
                self.compile_stmt(body);
                self.emit(Opcode::Jmp, 0, step, line);
                self.blocks.pop(&mut self.chunk);
            }
            StmtKind::Switch { subject, cases } => self.compile_switch(subject, cases, line),
            StmtKind::Break { levels } | StmtKind::Continue { levels } => {
                let is_continue = matches!(stmt.kind, StmtKind::Continue { .. });
                self.compile_jump(*levels, is_continue, line);
            }
            StmtKind::Return { value } => {
                match value {
                    Some(value) => self.compile_expr(value),
                    None => self.load_literal(Value::null(), line),
                }
                self.emit(Opcode::Ret, 0, 0, line);
            }
            StmtKind::Static { vars } => {
                for var in vars {
                    let name = self.program.intern(&var.name);
                    let init = var
                        .init
                        .as_ref()
                        .map(|init| self.sub_program(format!("static ${}", var.name), init));
                    self.program.statics.push(StaticDef { name, init });
                    let slot = (self.program.statics.len() - 1) as u32;
                    self.statics.push(slot);
                    self.emit(Opcode::BindStatic, slot as i32, name, line);
                }
            }
            StmtKind::Uplink { names } => {
                for name in names {
                    let id = self.name(name);
                    self.emit(Opcode::Uplink, 0, id, line);
                }
            }
            StmtKind::Const { name, value } => {
                self.compile_expr(value);
                let id = self.name(name);
                self.emit(Opcode::DefineConst, 0, id, line);
            }
            StmtKind::Print { args } => {
                for arg in args {
                    self.compile_expr(arg);
                }
                self.emit(Opcode::Print, args.len() as i32, 0, line);
            }
            StmtKind::Unset { targets } => {
                for target in targets {
                    if let Some((root, depth)) = self.compile_path_keys(target, "unset") {
                        self.emit(Opcode::Unset, depth, root, line);
                    }
                }
            }
        }
    }

    fn compile_jump(&mut self, levels: u32, is_continue: bool, line: u32) {
        let word = if is_continue { "continue" } else { "break" };
        match self.blocks.plan_jump(levels, is_continue) {
            Ok(JumpPlan { target, kind, iter_pops }) => {
                for _ in 0..iter_pops {
                    self.emit(Opcode::IterPop, 0, 0, line);
                }
                let at = self.emit(Opcode::Jmp, 0, UNPATCHED, line);
                self.blocks.add_fixup(target, kind, at);
            }
            Err(JumpError::NotInLoop) => {
                self.error("EMB-C001", line, format!("'{word}' outside of a loop or switch"));
            }
            Err(JumpError::TooDeep { available }) => {
                self.error(
                    "EMB-C002",
                    line,
                    format!("cannot {word} {levels} levels; only {available} enclosing"),
                );
            }
        }
    }

    /// Case tests become sub-programs evaluated against the subject in
    /// order; bodies are laid out back to back so cases fall through.
    fn compile_switch(&mut self, subject: &ast::Expr, cases: &[ast::SwitchCase], line: u32) {
        self.compile_expr(subject);
        let table = self.program.switches.len() as u32;
        self.program.switches.push(SwitchTable { cases: Vec::new(), default: None, end: UNPATCHED });
        self.emit(Opcode::Switch, 0, table, line);
        self.blocks.push(BlockKind::Switch, self.chunk.next_pc());

        let mut entries = Vec::with_capacity(cases.len());
        let mut default = None;
        for case in cases {
            let target = self.chunk.next_pc();
            match &case.test {
                Some(test) => entries.push((case.line, test, target)),
                None => default = Some(target),
            }
            for stmt in &case.body {
                self.compile_stmt(stmt);
            }
        }
        self.blocks.pop(&mut self.chunk);
        let end = self.chunk.next_pc();

        let mut compiled = Vec::with_capacity(entries.len());
        for (case_line, test, target) in entries {
            let test = self.sub_program(format!("case line {case_line}"), test);
            compiled.push(SwitchCase { test, target });
        }
        if let Some(slot) = self.program.switches.get_mut(table as usize) {
            slot.cases = compiled;
            slot.default = default;
            slot.end = end;
        }
    }
}

/// Every function declaration in `body`, nested ones included, in source
/// order.
fn collect_functions<'a>(body: &'a [Stmt], out: &mut Vec<&'a FunctionDecl>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Function { decl } => {
                out.push(decl);
                collect_functions(&decl.body, out);
            }
            StmtKind::Block { body } => collect_functions(body, out),
            StmtKind::If { then, otherwise, .. } => {
                collect_functions(std::slice::from_ref(then.as_ref()), out);
                if let Some(otherwise) = otherwise {
                    collect_functions(std::slice::from_ref(otherwise.as_ref()), out);
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::DoWhile { body, .. }
            | StmtKind::For { body, .. }
            | StmtKind::Foreach { body, .. } => collect_functions(std::slice::from_ref(body.as_ref()), out),
            StmtKind::Switch { cases, .. } => {
                for case in cases {
                    collect_functions(&case.body, out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser;

    fn compile_src(source: &str) -> Result<Program, Vec<CompileError>> {
        let tokens = tokenize(source).unwrap();
        let (ast, errors) = parser::parse(&tokens, parser::DEFAULT_MAX_ERRORS);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        compile(&ast)
    }

    fn ops(program: &Program, chunk: ChunkId) -> Vec<Opcode> {
        program.chunks[chunk as usize].code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn simple_assignment() {
        let program = compile_src("$a = 1 + 2;").unwrap();
        assert_eq!(
            ops(&program, program.entry),
            vec![Opcode::LoadConst, Opcode::LoadConst, Opcode::Add, Opcode::Assign, Opcode::Pop, Opcode::Done]
        );
    }

    #[test]
    fn identical_literals_share_a_slot() {
        let program = compile_src("$a = 'x'; $b = 'x'; $c = 1; $d = 1; $e = 1.0;").unwrap();
        assert_eq!(program.literals.len(), 3);
    }

    #[test]
    fn functions_are_hoisted() {
        let program = compile_src("print f(2); function f($n) { return $n * 2; }").unwrap();
        let f = program.function("f").unwrap();
        assert_eq!(program.functions[f as usize].params.len(), 1);
        let body = ops(&program, program.functions[f as usize].chunk);
        assert!(body.contains(&Opcode::Ret));
        assert_eq!(*body.last().unwrap(), Opcode::Done);
    }

    #[test]
    fn nested_and_conditional_declarations_are_hoisted() {
        let program = compile_src("if (true) { function g() {} } function outer() { function inner() {} }").unwrap();
        assert!(program.function("g").is_some());
        assert!(program.function("inner").is_some());
    }

    #[test]
    fn redeclaration_is_an_error() {
        let errors = compile_src("function f() {} function f() {}").unwrap_err();
        assert_eq!(errors[0].code, "EMB-C003");
    }

    #[test]
    fn defaults_and_statics_get_sub_programs() {
        let program = compile_src("function f($a, $b = 5) { static $n = 10; $n++; return $n; }").unwrap();
        let def = &program.functions[program.function("f").unwrap() as usize];
        assert!(def.params[0].default.is_none());
        let default = def.params[1].default.unwrap();
        assert_eq!(ops(&program, default), vec![Opcode::LoadConst, Opcode::Done]);
        assert_eq!(def.statics.len(), 1);
        assert!(program.statics[def.statics[0] as usize].init.is_some());
    }

    #[test]
    fn break_outside_loop_rejected() {
        let errors = compile_src("break;").unwrap_err();
        assert_eq!(errors[0].code, "EMB-C001");
        let errors = compile_src("while (1) { break 2; }").unwrap_err();
        assert_eq!(errors[0].code, "EMB-C002");
    }

    #[test]
    fn every_jump_is_patched() {
        let program = compile_src(
            "for ($i = 0; $i < 3; $i++) { if ($i == 1) continue; foreach ([1] as $v) { if ($v) break 2; } }
             do { $j++; } while ($j < 3);
             switch ($j) { case 1: break; default: print 'x'; }
             $k = $a && $b || !$c ? 1 : ($d ?: 2);",
        )
        .unwrap();
        for chunk in &program.chunks {
            for instr in &chunk.code {
                let is_jump = matches!(
                    instr.op,
                    Opcode::Jmp | Opcode::Jz | Opcode::Jnz | Opcode::JzKeep | Opcode::JnzKeep
                        | Opcode::ForeachInit | Opcode::ForeachStep
                );
                if is_jump {
                    assert_ne!(instr.p2, UNPATCHED, "unpatched {:?} in {}", instr.op, chunk.name);
                    assert!(instr.p2 <= chunk.code.len() as u32);
                }
            }
        }
        let table = &program.switches[0];
        assert_eq!(table.cases.len(), 1);
        assert!(table.default.is_some());
        assert_ne!(table.end, UNPATCHED);
    }

    #[test]
    fn break_out_of_foreach_drops_iterations() {
        let program = compile_src("foreach ($a as $x) { foreach ($b as $y) { break 2; } }").unwrap();
        let code = ops(&program, program.entry);
        let pops = code.windows(3).any(|w| w == [Opcode::IterPop, Opcode::IterPop, Opcode::Jmp]);
        assert!(pops, "{code:?}");
    }

    #[test]
    fn reference_needs_plain_variables() {
        let errors = compile_src("$a[0] =& $b;").unwrap_err();
        assert_eq!(errors[0].code, "EMB-C005");
    }

    #[test]
    fn failed_unit_leaves_program_untouched() {
        let mut program = compile_src("function f() {}").unwrap();
        let before = (program.chunks.len(), program.functions.len(), program.literals.len());
        let tokens = tokenize("function g() {} function f() {} $x = 'new';").unwrap();
        let (ast, _) = parser::parse(&tokens, 10);
        assert!(compile_into(&mut program, &ast, "inc", UnitKind::Include).is_err());
        assert_eq!(before, (program.chunks.len(), program.functions.len(), program.literals.len()));
        assert!(program.function("g").is_none());
    }

    #[test]
    fn anonymous_functions_compile_under_generated_names() {
        let program = compile_src("function f() {} $g = function ($x) { function inner() {} return $x; };").unwrap();
        let id = program.function("{closure}1").unwrap();
        assert_eq!(program.functions[id as usize].params.len(), 1);
        assert!(program.function("inner").is_some());
        assert!(program.literals.contains(&Value::from("{closure}1")));
    }

    #[test]
    fn instructions_carry_lines() {
        let program = compile_src("$a = 1;\n\n$b = 2;").unwrap();
        let lines: Vec<u32> = program.chunks[program.entry as usize].code.iter().map(|i| i.line).collect();
        assert_eq!(lines.first(), Some(&1));
        assert!(lines.contains(&3));
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let src = "function f($x) { return $x . 'a'; } foreach ([1, 2] as $k => $v) print f($v);";
        let a = compile_src(src).unwrap().disassemble();
        let b = compile_src(src).unwrap().disassemble();
        assert_eq!(a, b);
    }
}
