//! Stack virtual machine.
//!
//! One dispatch loop runs every frame kind. Calls, includes and the
//! sub-programs behind default values, static initializers and case tests
//! all push frames onto the same frame stack, so script recursion never
//! nests native calls. A sub-program frame carries a [`Resume`] that the
//! loop continues with once the sub-program returns.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::bytecode::{AssignOp, AssignSpec, Aux, Chunk, ChunkId, FuncId, Instr, NameId, Opcode, ParamDef, Program};
use crate::compiler::{self, UnitKind};
use crate::diagnostic::Diagnostic;
use crate::engine::{self, CallContext, Host, HostFunction};
use crate::hashmap::Key;
use crate::value::{
    arith, bitwise, concat, loose_cmp, loose_eq, strict_eq, ArithOp, BitOp, DivisionByZero, Repr, Value,
};

mod frame;
mod slots;

use frame::{AfterStatic, Frame, FrameKind, IterCtx, Resume, Scope};
pub use slots::{SlotId, SlotTable, TableFull};

#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    #[error("maximum recursion depth of {limit} exceeded calling {function}()")]
    RecursionLimit { limit: usize, function: String, line: u32 },
    #[error("out of memory: {source}")]
    OutOfMemory { source: TableFull, line: u32 },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl VmError {
    pub fn code(&self) -> &'static str {
        match self {
            VmError::RecursionLimit { .. } => "EMB-R001",
            VmError::OutOfMemory { .. } => "EMB-R002",
            VmError::Internal { .. } => "EMB-R003",
        }
    }

    pub fn line(&self) -> Option<u32> {
        match self {
            VmError::RecursionLimit { line, .. } | VmError::OutOfMemory { line, .. } => Some(*line),
            VmError::Internal { .. } => None,
        }
    }
}

/// Why the dispatch loop stopped early.
enum Stop {
    /// `exit` / `die`.
    Exit,
    Fatal(VmError),
}

impl From<VmError> for Stop {
    fn from(e: VmError) -> Self {
        Stop::Fatal(e)
    }
}

type Flow<T> = Result<T, Stop>;

fn internal(message: impl Into<String>) -> Stop {
    Stop::Fatal(VmError::Internal { message: message.into() })
}

/// Applies a strict (non short-circuit) binary opcode.
fn binary(op: Opcode, a: &Value, b: &Value) -> Result<Value, DivisionByZero> {
    let ordered = |test: fn(std::cmp::Ordering) -> bool| Value::from(test(loose_cmp(a, b)));
    Ok(match op {
        Opcode::Add => return arith(ArithOp::Add, a, b),
        Opcode::Sub => return arith(ArithOp::Sub, a, b),
        Opcode::Mul => return arith(ArithOp::Mul, a, b),
        Opcode::Div => return arith(ArithOp::Div, a, b),
        Opcode::Mod => return arith(ArithOp::Mod, a, b),
        Opcode::Concat => concat(a, b),
        Opcode::BitAnd => bitwise(BitOp::And, a, b),
        Opcode::BitOr => bitwise(BitOp::Or, a, b),
        Opcode::BitXor => bitwise(BitOp::Xor, a, b),
        Opcode::Shl => bitwise(BitOp::Shl, a, b),
        Opcode::Shr => bitwise(BitOp::Shr, a, b),
        Opcode::Eq => Value::from(loose_eq(a, b)),
        Opcode::Ne => Value::from(!loose_eq(a, b)),
        Opcode::StrictEq => Value::from(strict_eq(a, b)),
        Opcode::StrictNe => Value::from(!strict_eq(a, b)),
        Opcode::Lt => ordered(|o| o.is_lt()),
        Opcode::Le => ordered(|o| o.is_le()),
        Opcode::Gt => ordered(|o| o.is_gt()),
        Opcode::Ge => ordered(|o| o.is_ge()),
        Opcode::Xor => Value::from(a.to_bool() ^ b.to_bool()),
        _ => Value::null(),
    })
}

enum PathError {
    /// A non-array, non-null value on the path.
    Scalar,
    /// `[]` on an array whose integer keys are used up.
    IndexExhausted,
}

/// Walks an assignment path from `root`, turning nulls into arrays and
/// creating missing entries. Shared arrays are copied on the way down.
fn walk_path<'v>(
    root: &'v mut Value,
    keys: &[Value],
    spec: &AssignSpec,
    depth: usize,
) -> Result<&'v mut Value, PathError> {
    let mut target = root;
    let mut keys = keys.iter();
    for segment in 0..depth {
        if target.is_null() {
            *target = Value::empty_array();
        }
        let Some(map) = target.array_mut() else {
            return Err(PathError::Scalar);
        };
        target = if spec.is_append(segment) {
            map.push_slot(Value::null()).ok_or(PathError::IndexExhausted)?
        } else {
            let key = keys.next().map(Key::from_value).unwrap_or_else(|| Key::from(""));
            map.entry_or_insert_with(key, Value::null)
        };
    }
    Ok(target)
}

/// Performs the write at the end of an assignment path. Returns the
/// expression result and whether a division by zero occurred.
fn apply_assign(target: &mut Value, op: AssignOp, value: Value) -> (Value, bool) {
    match op {
        AssignOp::Set => {
            *target = value.clone();
            (value, false)
        }
        AssignOp::Compound(op) => {
            let (result, div_zero) = match binary(op, target, &value) {
                Ok(v) => (v, false),
                Err(DivisionByZero) => (Value::from(0), true),
            };
            *target = result.clone();
            (result, div_zero)
        }
        AssignOp::PreInc | AssignOp::PreDec => {
            let result = target.stepped(op == AssignOp::PreInc);
            *target = result.clone();
            (result, false)
        }
        AssignOp::PostInc | AssignOp::PostDec => {
            let old = target.clone();
            *target = old.stepped(op == AssignOp::PostInc);
            (old, false)
        }
    }
}

// ── VM ───────────────────────────────────────────────────────────────

pub struct Vm<'h> {
    host: &'h mut Host,
    program: Program,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Scope 0 holds the globals; each call pushes one.
    scopes: Vec<Scope>,
    slots: SlotTable,
    /// Static variable slots by static index, created on first use.
    statics: HashMap<u32, SlotId>,
    /// Constants defined by the script.
    constants: HashMap<Rc<str>, Value>,
    depth: usize,
    line: u32,
    exit_status: i32,
}

impl<'h> Vm<'h> {
    pub fn new(host: &'h mut Host, program: Program) -> Self {
        let slots = SlotTable::new(host.config().max_values);
        Vm {
            host,
            program,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            scopes: vec![Scope::default()],
            slots,
            statics: HashMap::new(),
            constants: HashMap::new(),
            depth: 0,
            line: 0,
            exit_status: 0,
        }
    }

    /// Binds a global variable before the program runs.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        let id = self.program.intern(name);
        self.assign_var(0, id, value).map_err(|stop| match stop {
            Stop::Fatal(e) => e,
            Stop::Exit => VmError::Internal { message: "exit while binding globals".into() },
        })
    }

    /// Runs the program's entry chunk. `exit` ends the run normally with a
    /// null result.
    pub fn run(&mut self) -> Result<Value, VmError> {
        let outcome = self.chunk(self.program.entry).and_then(|chunk| {
            self.frames.push(Frame::new(chunk, 0, 0, FrameKind::Main));
            self.execute()
        });
        match outcome {
            Ok(value) => Ok(value),
            Err(Stop::Exit) => {
                debug!(status = self.exit_status, "exit");
                self.unwind();
                Ok(Value::null())
            }
            Err(Stop::Fatal(e)) => {
                error!(code = e.code(), depth = self.depth, "{e}");
                self.unwind();
                Err(e)
            }
        }
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Global variables and their current values.
    pub fn globals(&self) -> HashMap<String, Value> {
        let Some(global) = self.scopes.first() else {
            return HashMap::new();
        };
        global
            .vars
            .iter()
            .filter_map(|(&name, &slot)| {
                let value = self.slots.get(slot)?.clone();
                Some((self.program.name(name).to_string(), value))
            })
            .collect()
    }

    /// The program, including every unit compiled by `include`.
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn live_slots(&self) -> usize {
        self.slots.live()
    }

    fn unwind(&mut self) {
        self.frames.clear();
        self.stack.clear();
        while self.scopes.len() > 1 {
            if let Some(scope) = self.scopes.pop() {
                self.release_scope(scope);
            }
        }
        self.depth = 0;
    }

    // ── Dispatch loop ────────────────────────────────────────────────

    /// Runs until the frame stack is empty, returning the result of the
    /// bottom frame.
    fn execute(&mut self) -> Flow<Value> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(Value::null());
            };
            let Some(instr) = frame.chunk.code.get(frame.pc).copied() else {
                // running off the end behaves as `Done 0`
                if let Some(result) = self.leave_frame(Value::null())? {
                    return Ok(result);
                }
                continue;
            };
            frame.pc += 1;
            self.line = instr.line;

            match instr.op {
                Opcode::Done => {
                    let result = match instr.p1 {
                        1 => self.pop(),
                        2 => Value::from(true),
                        _ => Value::null(),
                    };
                    if let Some(result) = self.leave_frame(result)? {
                        return Ok(result);
                    }
                }
                Opcode::Ret => {
                    let result = self.pop();
                    if let Some(result) = self.leave_frame(result)? {
                        return Ok(result);
                    }
                }
                Opcode::Halt => {
                    if instr.p1 == 1 {
                        let status = self.pop();
                        match status.repr() {
                            Repr::Int(n) => self.exit_status = *n as i32,
                            _ => self.host.write(status.to_str().as_bytes()),
                        }
                    }
                    return Err(Stop::Exit);
                }

                Opcode::LoadConst => {
                    let value = self.program.literals.get(instr.p2 as usize).cloned().unwrap_or_default();
                    self.stack.push(value);
                }
                Opcode::LoadVar => {
                    let value = self.read_var(instr.p2);
                    self.stack.push(value);
                }
                Opcode::LoadConstant => {
                    let value = self.load_constant(instr.p2);
                    self.stack.push(value);
                }
                Opcode::LoadIdx => {
                    let key = self.pop();
                    let base = self.pop();
                    let value = self.index(&base, &key);
                    self.stack.push(value);
                }
                Opcode::NewArray => self.stack.push(Value::empty_array()),
                Opcode::ArrayPush => {
                    let value = self.pop();
                    let pushed = self.stack.last_mut().and_then(Value::array_mut).and_then(|map| map.push(value));
                    if pushed.is_none() {
                        self.warn_index_exhausted();
                    }
                }
                Opcode::ArrayInsert => {
                    let value = self.pop();
                    let key = Key::from_value(&self.pop());
                    if let Some(map) = self.stack.last_mut().and_then(Value::array_mut) {
                        map.insert(key, value);
                    }
                }

                Opcode::Jmp => self.jump(instr.p2),
                Opcode::Jz => {
                    if !self.pop().to_bool() {
                        self.jump(instr.p2);
                    }
                }
                Opcode::Jnz => {
                    if self.pop().to_bool() {
                        self.jump(instr.p2);
                    }
                }
                Opcode::JzKeep | Opcode::JnzKeep => {
                    let truthy = self.stack.last().is_some_and(Value::to_bool);
                    if truthy == (instr.op == Opcode::JnzKeep) {
                        self.jump(instr.p2);
                    } else {
                        self.stack.pop();
                    }
                }
                Opcode::Pop => {
                    self.stack.pop();
                }

                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Concat
                | Opcode::BitAnd
                | Opcode::BitOr
                | Opcode::BitXor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::StrictEq
                | Opcode::StrictNe
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::Xor => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = match binary(instr.op, &a, &b) {
                        Ok(v) => v,
                        Err(DivisionByZero) => {
                            self.warning("EMB-R201", DivisionByZero.to_string());
                            Value::from(0)
                        }
                    };
                    self.stack.push(result);
                }
                Opcode::Neg | Opcode::Plus | Opcode::Not | Opcode::BitNot => {
                    let v = self.pop();
                    let result = match instr.op {
                        Opcode::Neg => v.negate(),
                        Opcode::Plus => v.plus(),
                        Opcode::Not => Value::from(!v.to_bool()),
                        _ => v.bit_not(),
                    };
                    self.stack.push(result);
                }
                Opcode::Cast => {
                    let v = self.pop();
                    let result = match instr.p3 {
                        Aux::Cast(kind) => v.cast(kind),
                        _ => v,
                    };
                    self.stack.push(result);
                }

                Opcode::Assign => self.assign(&instr)?,
                Opcode::BindRef => {
                    let scope = self.current_scope();
                    let slot = self.var_slot(scope, instr.p1 as NameId)?;
                    self.bind_slot(scope, instr.p2, slot);
                    let value = self.slots.get(slot).cloned().unwrap_or_default();
                    self.stack.push(value);
                }
                Opcode::Unset => self.unset(&instr),
                Opcode::Isset => {
                    let keys = self.pop_n(instr.p1.max(0) as usize);
                    let set = self.isset(instr.p2, &keys);
                    self.stack.push(Value::from(set));
                }

                Opcode::Call => {
                    let args = self.pop_n(instr.p1.max(0) as usize);
                    let name = self.name_rc(instr.p2);
                    self.call(&name, args)?;
                }
                Opcode::CallDynamic => {
                    let args = self.pop_n(instr.p1.max(0) as usize);
                    let name = self.pop().to_str();
                    self.call(&name, args)?;
                }
                Opcode::Print => {
                    for value in self.pop_n(instr.p1.max(0) as usize) {
                        self.host.write(value.to_str().as_bytes());
                    }
                }

                Opcode::ForeachInit => {
                    let subject = self.pop();
                    match subject.array_handle() {
                        Some(map) => {
                            if let Some(frame) = self.frames.last_mut() {
                                frame.iters.push(IterCtx::new(map));
                            }
                        }
                        None => {
                            if !subject.is_null() {
                                self.warning("EMB-R202", "Invalid argument supplied for foreach".into());
                            }
                            self.jump(instr.p2);
                        }
                    }
                }
                Opcode::ForeachStep => self.foreach_step(&instr)?,
                Opcode::IterPop => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.iters.pop();
                    }
                }
                Opcode::Switch => self.switch(instr.p2)?,

                Opcode::BindStatic => {
                    let name = instr.p2;
                    if let Some(slot) = self.init_static(instr.p1 as u32, AfterStatic::Bind { name })? {
                        let scope = self.current_scope();
                        self.bind_slot(scope, name, slot);
                    }
                }
                Opcode::Uplink => {
                    let scope = self.current_scope();
                    if scope != 0 {
                        let slot = self.var_slot(0, instr.p2)?;
                        self.bind_slot(scope, instr.p2, slot);
                    }
                }
                Opcode::DefineConst => {
                    let value = self.pop();
                    let name = self.name_rc(instr.p2);
                    if self.constants.contains_key(&name) || self.host.constant(&name).is_some() {
                        self.warning("EMB-R208", format!("Constant {name} already defined"));
                    } else {
                        self.constants.insert(name, value);
                    }
                }
                Opcode::Include => {
                    let path = self.pop().to_str();
                    self.include(&path)?;
                }
            }
        }
    }

    /// Pops the top frame and hands its result on: to the continuation of
    /// a sub-program, to the caller's stack, or back out of the loop once
    /// the bottom frame is gone.
    fn leave_frame(&mut self, result: Value) -> Flow<Option<Value>> {
        let Some(frame) = self.frames.pop() else {
            return Ok(Some(result));
        };
        self.stack.truncate(frame.stack_base);
        match frame.kind {
            FrameKind::Call { .. } => {
                if let Some(scope) = self.scopes.pop() {
                    self.release_scope(scope);
                }
                self.depth = self.depth.saturating_sub(1);
            }
            FrameKind::Include => self.depth = self.depth.saturating_sub(1),
            FrameKind::Sub(resume) => {
                self.resume(resume, result)?;
                return Ok(None);
            }
            FrameKind::Main => {}
        }
        if self.frames.is_empty() {
            return Ok(Some(result));
        }
        self.stack.push(result);
        Ok(None)
    }

    /// Starts a sub-program in the current scope. The dispatch loop runs
    /// it and passes its result to `resume`.
    fn push_sub(&mut self, chunk: ChunkId, resume: Resume) -> Flow<()> {
        let chunk = self.chunk(chunk)?;
        let scope = self.current_scope();
        self.frames.push(Frame::new(chunk, scope, self.stack.len(), FrameKind::Sub(resume)));
        Ok(())
    }

    fn resume(&mut self, resume: Resume, result: Value) -> Flow<()> {
        match resume {
            Resume::Param { func, param } => {
                self.bind_param(func, param, result)?;
                self.bind_params(func, param + 1)
            }
            Resume::Static { index, then } => {
                let slot = self.store_static(index, result)?;
                match then {
                    AfterStatic::Entry { func, position } => self.enter_statics(func, position + 1),
                    AfterStatic::Bind { name } => {
                        let scope = self.current_scope();
                        self.bind_slot(scope, name, slot);
                        Ok(())
                    }
                }
            }
            Resume::Case { table, case, subject } => {
                if !loose_eq(&subject, &result) {
                    return self.next_case(table, case + 1, subject);
                }
                let target = self
                    .program
                    .switches
                    .get(table as usize)
                    .and_then(|t| t.cases.get(case))
                    .map(|c| c.target)
                    .ok_or_else(|| internal(format!("missing case {case} of switch {table}")))?;
                self.jump(target);
                Ok(())
            }
        }
    }

    // ── Stack and frame helpers ──────────────────────────────────────

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    fn jump(&mut self, target: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = target as usize;
        }
    }

    fn chunk(&self, id: ChunkId) -> Flow<Rc<Chunk>> {
        self.program.chunk(id).cloned().ok_or_else(|| internal(format!("missing chunk {id}")))
    }

    fn name_rc(&self, id: NameId) -> Rc<str> {
        self.program.names.get(id as usize).cloned().unwrap_or_else(|| Rc::from("?"))
    }

    fn current_scope(&self) -> usize {
        self.frames.last().map_or(0, |f| f.scope)
    }

    /// Name of the innermost user function being run.
    fn current_function(&self) -> Option<Rc<str>> {
        self.frames.iter().rev().find_map(|f| match f.kind {
            FrameKind::Call { func } => self.program.functions.get(func as usize).map(|d| Rc::clone(&d.name)),
            _ => None,
        })
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    fn raise(&mut self, diagnostic: Diagnostic) {
        let mut diagnostic = diagnostic.at_line(self.line);
        if let Some(function) = self.current_function() {
            diagnostic = diagnostic.with_note(format!("in {function}()"));
        }
        self.host.report(diagnostic);
    }

    fn notice(&mut self, code: &'static str, message: String) {
        self.raise(Diagnostic::notice(message).with_code(code));
    }

    fn warning(&mut self, code: &'static str, message: String) {
        self.raise(Diagnostic::warning(message).with_code(code));
    }

    fn warn_index_exhausted(&mut self) {
        self.warning(
            "EMB-R209",
            "Cannot add element to the array as the next element is already occupied".into(),
        );
    }

    // ── Variables ────────────────────────────────────────────────────

    fn alloc(&mut self, value: Value) -> Flow<SlotId> {
        let line = self.line;
        self.slots.alloc(value).map_err(|source| Stop::Fatal(VmError::OutOfMemory { source, line }))
    }

    /// Slot bound to `name` in `scope`, binding a fresh null slot if needed.
    fn var_slot(&mut self, scope: usize, name: NameId) -> Flow<SlotId> {
        if let Some(&slot) = self.scopes.get(scope).and_then(|s| s.vars.get(&name)) {
            return Ok(slot);
        }
        let slot = self.alloc(Value::null())?;
        match self.scopes.get_mut(scope) {
            Some(s) => {
                s.vars.insert(name, slot);
                Ok(slot)
            }
            None => Err(internal(format!("missing scope {scope}"))),
        }
    }

    fn assign_var(&mut self, scope: usize, name: NameId, value: Value) -> Flow<()> {
        let slot = self.var_slot(scope, name)?;
        if let Some(target) = self.slots.get_mut(slot) {
            *target = value;
        }
        Ok(())
    }

    /// Points `name` at `slot`, dropping its previous binding.
    fn bind_slot(&mut self, scope: usize, name: NameId, slot: SlotId) {
        self.slots.retain(slot);
        let previous = self.scopes.get_mut(scope).and_then(|s| s.vars.insert(name, slot));
        if let Some(previous) = previous {
            self.slots.release(previous);
        }
    }

    fn release_scope(&mut self, scope: Scope) {
        for slot in scope.vars.into_values() {
            self.slots.release(slot);
        }
    }

    fn read_var(&mut self, name: NameId) -> Value {
        let scope = self.current_scope();
        let found = self
            .scopes
            .get(scope)
            .and_then(|s| s.vars.get(&name))
            .and_then(|&slot| self.slots.get(slot));
        match found {
            Some(value) => value.clone(),
            None => {
                let message = format!("Undefined variable: ${}", self.program.name(name));
                self.notice("EMB-R101", message);
                Value::null()
            }
        }
    }

    fn load_constant(&mut self, name: NameId) -> Value {
        let name = self.name_rc(name);
        if let Some(value) = self.constants.get(&name) {
            return value.clone();
        }
        if let Some(value) = self.host.constant(&name) {
            return value;
        }
        self.notice("EMB-R103", format!("Use of undefined constant {name} - assumed '{name}'"));
        Value::from(name)
    }

    fn index(&mut self, base: &Value, key: &Value) -> Value {
        match base.repr() {
            Repr::Array(map) => {
                let key = Key::from_value(key);
                match map.get(&key) {
                    Some(value) => value.clone(),
                    None => {
                        self.notice("EMB-R102", format!("Undefined index: {key}"));
                        Value::null()
                    }
                }
            }
            Repr::Null => Value::null(),
            Repr::Str(text) => {
                let offset = key.to_int();
                let len = text.chars().count() as i64;
                let at = if offset < 0 { len + offset } else { offset };
                match usize::try_from(at).ok().and_then(|at| text.chars().nth(at)) {
                    Some(c) => Value::from(c.to_string()),
                    None => {
                        self.notice("EMB-R104", format!("Uninitialized string offset: {offset}"));
                        Value::null()
                    }
                }
            }
            _ => {
                self.warning("EMB-R205", "Cannot use a scalar value as an array".into());
                Value::null()
            }
        }
    }

    fn assign(&mut self, instr: &Instr) -> Flow<()> {
        let Aux::Assign(spec) = instr.p3 else {
            return Err(internal("assignment without a spec"));
        };
        let value = if spec.op.takes_value() { self.pop() } else { Value::null() };
        let depth = instr.p1.max(0) as usize;
        let key_count = (0..depth).filter(|&i| !spec.is_append(i)).count();
        let keys = self.pop_n(key_count);
        let scope = self.current_scope();
        let slot = self.var_slot(scope, instr.p2)?;
        let Some(root) = self.slots.get_mut(slot) else {
            return Err(internal(format!("dangling slot {slot}")));
        };
        let outcome = walk_path(root, &keys, &spec, depth).map(|target| apply_assign(target, spec.op, value));
        match outcome {
            Ok((result, div_zero)) => {
                if div_zero {
                    self.warning("EMB-R201", DivisionByZero.to_string());
                }
                self.stack.push(result);
            }
            Err(PathError::Scalar) => {
                self.warning("EMB-R205", "Cannot use a scalar value as an array".into());
                self.stack.push(Value::null());
            }
            Err(PathError::IndexExhausted) => {
                self.warn_index_exhausted();
                self.stack.push(Value::null());
            }
        }
        Ok(())
    }

    fn unset(&mut self, instr: &Instr) {
        let keys = self.pop_n(instr.p1.max(0) as usize);
        let scope = self.current_scope();
        let Some(vars) = self.scopes.get_mut(scope).map(|s| &mut s.vars) else {
            return;
        };
        let Some((last, path)) = keys.split_last() else {
            if let Some(slot) = vars.remove(&instr.p2) {
                self.slots.release(slot);
            }
            return;
        };
        let Some(&slot) = vars.get(&instr.p2) else {
            return;
        };
        let Some(mut target) = self.slots.get_mut(slot) else {
            return;
        };
        for key in path {
            target = match target.array_mut().and_then(|map| map.get_mut(&Key::from_value(key))) {
                Some(next) => next,
                None => return,
            };
        }
        if let Some(map) = target.array_mut() {
            map.remove(&Key::from_value(last));
        }
    }

    fn isset(&self, name: NameId, keys: &[Value]) -> bool {
        let scope = self.current_scope();
        let Some(mut value) = self
            .scopes
            .get(scope)
            .and_then(|s| s.vars.get(&name))
            .and_then(|&slot| self.slots.get(slot))
        else {
            return false;
        };
        for key in keys {
            value = match value.as_array().and_then(|map| map.get(&Key::from_value(key))) {
                Some(next) => next,
                None => return false,
            };
        }
        !value.is_null()
    }

    /// Slot of static `index`. `None` means its initializer was started
    /// and `then` runs once it finishes.
    fn init_static(&mut self, index: u32, then: AfterStatic) -> Flow<Option<SlotId>> {
        if let Some(&slot) = self.statics.get(&index) {
            return Ok(Some(slot));
        }
        match self.program.statics.get(index as usize).and_then(|s| s.init) {
            Some(chunk) => {
                self.push_sub(chunk, Resume::Static { index, then })?;
                Ok(None)
            }
            None => self.store_static(index, Value::null()).map(Some),
        }
    }

    /// Creates the slot of static `index`. An initializer that re-entered
    /// the function may have created it already; that slot wins.
    fn store_static(&mut self, index: u32, value: Value) -> Flow<SlotId> {
        if let Some(&slot) = self.statics.get(&index) {
            return Ok(slot);
        }
        let slot = self.alloc(value)?;
        self.statics.insert(index, slot);
        Ok(slot)
    }

    fn enter_statics(&mut self, func: FuncId, position: usize) -> Flow<()> {
        let mut position = position;
        while let Some(index) = self.program.functions.get(func as usize).and_then(|d| d.statics.get(position)).copied() {
            if self.init_static(index, AfterStatic::Entry { func, position })?.is_none() {
                return Ok(());
            }
            position += 1;
        }
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────

    fn call(&mut self, name: &str, args: Vec<Value>) -> Flow<()> {
        if let Some(func) = self.program.function(name) {
            return self.call_user(func, args);
        }
        if let Some(function) = self.host.function(name) {
            self.call_host(name, &function, args);
            return Ok(());
        }
        self.warning("EMB-R204", format!("Call to undefined function {name}()"));
        self.stack.push(Value::null());
        Ok(())
    }

    fn call_user(&mut self, func: FuncId, args: Vec<Value>) -> Flow<()> {
        let Some(def) = self.program.functions.get(func as usize) else {
            return Err(internal(format!("missing function {func}")));
        };
        let (name, chunk) = (Rc::clone(&def.name), def.chunk);

        let limit = self.host.config().max_recursion_depth;
        if self.depth >= limit {
            return Err(Stop::Fatal(VmError::RecursionLimit { limit, function: name.to_string(), line: self.line }));
        }
        let chunk = self.chunk(chunk)?;
        trace!(function = %name, depth = self.depth + 1, args = args.len(), "call");

        self.scopes.push(Scope::with_args(args));
        let scope = self.scopes.len() - 1;
        self.frames.push(Frame::new(chunk, scope, self.stack.len(), FrameKind::Call { func }));
        self.depth += 1;
        self.bind_params(func, 0)
    }

    /// Binds parameters of the running call from `start` on. A missing
    /// argument with a default suspends binding until the default's
    /// sub-program returns. Statics are set up after the last parameter.
    fn bind_params(&mut self, func: FuncId, start: usize) -> Flow<()> {
        let scope = self.current_scope();
        let mut position = start;
        while let Some(param) = self.param(func, position) {
            let passed = self.scopes.get(scope).and_then(|s| s.args.get(position)).cloned();
            let value = match (passed, param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => return self.push_sub(default, Resume::Param { func, param: position }),
                (None, None) => {
                    let name = self.program.functions.get(func as usize).map(|d| Rc::clone(&d.name));
                    let name = name.unwrap_or_else(|| Rc::from("?"));
                    self.warning("EMB-R203", format!("Missing argument {} for {name}()", position + 1));
                    Value::null()
                }
            };
            self.bind_param(func, position, value)?;
            position += 1;
        }
        self.enter_statics(func, 0)
    }

    fn param(&self, func: FuncId, position: usize) -> Option<ParamDef> {
        self.program.functions.get(func as usize)?.params.get(position).cloned()
    }

    fn bind_param(&mut self, func: FuncId, position: usize, value: Value) -> Flow<()> {
        let Some(param) = self.param(func, position) else {
            return Err(internal(format!("missing parameter {position} of function {func}")));
        };
        let value = match param.hint {
            Some(hint) => value.cast(hint),
            None => value,
        };
        let scope = self.current_scope();
        self.assign_var(scope, param.name, value)
    }

    fn call_host(&mut self, name: &str, function: &HostFunction, args: Vec<Value>) {
        if !function.arity.accepts(args.len()) {
            self.warning(
                "EMB-R206",
                format!("{name}() expects {}, {} given", function.arity, args.len()),
            );
            self.stack.push(Value::null());
            return;
        }
        let scope = self.current_scope();
        let caller_args = self.scopes.get(scope).map_or(&[][..], |s| &s.args[..]);
        let mut ctx = CallContext::new(name, self.line, caller_args, self.host.devices_mut());
        (function.callback)(&mut ctx, &args);
        let outcome = ctx.finish();
        self.host.write(&outcome.output);
        for diagnostic in outcome.diagnostics {
            self.raise(diagnostic);
        }
        self.stack.push(outcome.result);
    }

    // ── Control constructs ───────────────────────────────────────────

    fn foreach_step(&mut self, instr: &Instr) -> Flow<()> {
        let next = self.frames.last_mut().and_then(|f| f.iters.last_mut()).and_then(IterCtx::advance);
        let Some((key, value)) = next else {
            if let Some(frame) = self.frames.last_mut() {
                frame.iters.pop();
            }
            self.jump(instr.p2);
            return Ok(());
        };
        let Some(info) = self.program.foreach.get(instr.p1 as usize).cloned() else {
            return Err(internal(format!("missing foreach info {}", instr.p1)));
        };
        let scope = self.current_scope();
        if let Some(key_name) = info.key {
            self.assign_var(scope, key_name, key)?;
        }
        self.assign_var(scope, info.value, value)
    }

    fn switch(&mut self, table: u32) -> Flow<()> {
        let subject = self.pop();
        self.next_case(table, 0, subject)
    }

    /// Starts the test of case `case`, or jumps to the default arm (or past
    /// the switch) once every test has failed.
    fn next_case(&mut self, table: u32, case: usize, subject: Value) -> Flow<()> {
        let Some(switch) = self.program.switches.get(table as usize) else {
            return Err(internal(format!("missing switch table {table}")));
        };
        let (test, fallback) = (switch.cases.get(case).map(|c| c.test), switch.default.unwrap_or(switch.end));
        match test {
            Some(test) => self.push_sub(test, Resume::Case { table, case, subject }),
            None => {
                self.jump(fallback);
                Ok(())
            }
        }
    }

    /// Compiles a file into the running program and enters it in the
    /// current scope. Failures are warnings and yield false.
    fn include(&mut self, path: &str) -> Flow<()> {
        let (resolved, source) = match self.host.read_include(path) {
            Ok(found) => found,
            Err(err) => {
                self.warning("EMB-R207", format!("include({path}): failed to open stream: {err}"));
                self.stack.push(Value::from(false));
                return Ok(());
            }
        };
        let unit = resolved.display().to_string();
        debug!(path = %unit, "include");

        let max_errors = self.host.config().max_compile_errors;
        let compiled = engine::parse_source(&source, max_errors).and_then(|ast| {
            compiler::compile_into(&mut self.program, &ast, &unit, UnitKind::Include)
                .map_err(|errors| errors.iter().map(Diagnostic::from).collect())
        });
        let entry = match compiled {
            Ok(entry) => entry,
            Err(diagnostics) => {
                for diagnostic in diagnostics {
                    self.host.report(diagnostic.with_note(format!("in included file {unit}")));
                }
                self.warning("EMB-R207", format!("include({path}): compilation failed"));
                self.stack.push(Value::from(false));
                return Ok(());
            }
        };

        let limit = self.host.config().max_recursion_depth;
        if self.depth >= limit {
            return Err(Stop::Fatal(VmError::RecursionLimit { limit, function: "include".into(), line: self.line }));
        }
        let chunk = self.chunk(entry)?;
        let scope = self.current_scope();
        self.frames.push(Frame::new(chunk, scope, self.stack.len(), FrameKind::Include));
        self.depth += 1;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
