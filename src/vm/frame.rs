use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{Chunk, FuncId, NameId};
use crate::hashmap::{Hashmap, NodeId};
use crate::value::Value;

use super::slots::SlotId;

#[derive(Debug)]
pub enum FrameKind {
    Main,
    Call { func: FuncId },
    /// Default value, static initializer or case test. Its result goes to
    /// the continuation, not to the operand stack.
    Sub(Resume),
    Include,
}

/// Where the dispatch loop picks up once a sub-program returns.
#[derive(Debug)]
pub enum Resume {
    /// Bind parameter `param` of `func`, then keep entering the call.
    Param { func: FuncId, param: usize },
    /// Store static `index`, then carry on as `then` says.
    Static { index: u32, then: AfterStatic },
    /// Compare the result with `subject` for case `case` of switch `table`.
    Case { table: u32, case: usize, subject: Value },
}

#[derive(Debug, Clone, Copy)]
pub enum AfterStatic {
    /// Entering `func`: initialize its statics from `position` on.
    Entry { func: FuncId, position: usize },
    /// A `static` statement: bind the slot to `name` in the current scope.
    Bind { name: NameId },
}

/// One running `foreach`. The map is a snapshot: writes to the iterated
/// variable copy it, so traversal never sees them.
#[derive(Debug)]
pub struct IterCtx {
    pub map: Rc<Hashmap>,
    pub next: Option<NodeId>,
}

impl IterCtx {
    pub fn new(map: Rc<Hashmap>) -> Self {
        let next = map.first_node();
        IterCtx { map, next }
    }

    /// The next (key, value) pair, advancing the cursor.
    pub fn advance(&mut self) -> Option<(Value, Value)> {
        let id = self.next?;
        let (key, value) = self.map.entry(id);
        let pair = (key.to_value(), value.clone());
        self.next = self.map.next_node(id);
        Some(pair)
    }
}

#[derive(Debug)]
pub struct Frame {
    pub chunk: Rc<Chunk>,
    pub pc: usize,
    /// Index into the VM's scope stack.
    pub scope: usize,
    pub stack_base: usize,
    pub kind: FrameKind,
    pub iters: Vec<IterCtx>,
}

impl Frame {
    pub fn new(chunk: Rc<Chunk>, scope: usize, stack_base: usize, kind: FrameKind) -> Self {
        Frame { chunk, pc: 0, scope, stack_base, kind, iters: Vec::new() }
    }
}

/// Variable bindings of the global scope or one function call.
#[derive(Debug, Default)]
pub struct Scope {
    pub vars: HashMap<NameId, SlotId>,
    /// Every argument the caller passed, extras included.
    pub args: Vec<Value>,
}

impl Scope {
    pub fn with_args(args: Vec<Value>) -> Self {
        Scope { vars: HashMap::new(), args }
    }
}
