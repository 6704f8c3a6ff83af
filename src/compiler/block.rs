//! Lexical blocks with pending jump fixups.
//!
//! Blocks live in a per-chunk arena used as a stack and refer to their
//! parent by index. Forward jumps out of a block (`break`, `continue`, the
//! jump past an `else`) are recorded on the block they leave and patched when
//! the block closes, at which point every target is known.

use crate::bytecode::Chunk;

pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `if` chains: only end-of-construct jumps.
    Branch,
    Loop,
    Foreach,
    Switch,
}

impl BlockKind {
    fn is_jump_target(self) -> bool {
        !matches!(self, BlockKind::Branch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// Jump to the first instruction after the block.
    End,
    /// `break`: same target as `End`.
    Break,
    /// `continue`: the block's continue target.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub kind: FixupKind,
    pub at: usize,
}

#[derive(Debug)]
pub struct Block {
    pub kind: BlockKind,
    pub parent: Option<BlockId>,
    pub first_instr: u32,
    pub fixups: Vec<Fixup>,
    /// Where `continue` lands; may be set after the body is emitted.
    pub continue_target: Option<u32>,
}

/// Resolved `break n` / `continue n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpPlan {
    pub target: BlockId,
    pub kind: FixupKind,
    /// Foreach iterations to drop before jumping.
    pub iter_pops: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpError {
    NotInLoop,
    TooDeep { available: u32 },
}

#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: Vec<Block>,
}

impl BlockArena {
    pub fn new() -> Self {
        BlockArena::default()
    }

    pub fn current(&self) -> Option<BlockId> {
        self.blocks.len().checked_sub(1)
    }

    pub fn push(&mut self, kind: BlockKind, first_instr: u32) -> BlockId {
        let parent = self.current();
        self.blocks.push(Block { kind, parent, first_instr, fixups: Vec::new(), continue_target: None });
        self.blocks.len() - 1
    }

    pub fn set_continue_target(&mut self, id: BlockId, target: u32) {
        if let Some(block) = self.blocks.get_mut(id) {
            block.continue_target = Some(target);
        }
    }

    pub fn add_fixup(&mut self, id: BlockId, kind: FixupKind, at: usize) {
        if let Some(block) = self.blocks.get_mut(id) {
            block.fixups.push(Fixup { kind, at });
        }
    }

    /// Closes the innermost block and patches its fixups into `chunk`. End
    /// and break jumps land on the next instruction to be emitted.
    pub fn pop(&mut self, chunk: &mut Chunk) -> Option<Block> {
        let block = self.blocks.pop()?;
        let end = chunk.next_pc();
        for fixup in &block.fixups {
            let target = match fixup.kind {
                FixupKind::End | FixupKind::Break => end,
                FixupKind::Continue => block.continue_target.unwrap_or(end),
            };
            chunk.patch_jump_to(fixup.at, target);
        }
        Some(block)
    }

    /// Finds the block a `break levels` or `continue levels` leaves to.
    /// `continue` aimed at a `switch` acts as `break`.
    pub fn plan_jump(&self, levels: u32, is_continue: bool) -> Result<JumpPlan, JumpError> {
        let levels = levels.max(1);
        let mut seen = 0u32;
        let mut foreach_crossed = 0usize;
        let mut cursor = self.current();
        while let Some(id) = cursor {
            let block = &self.blocks[id];
            if block.kind.is_jump_target() {
                seen += 1;
                if seen == levels {
                    let kind = match (is_continue, block.kind) {
                        (true, BlockKind::Switch) | (false, _) => FixupKind::Break,
                        (true, _) => FixupKind::Continue,
                    };
                    let leaves_target = kind == FixupKind::Break && block.kind == BlockKind::Foreach;
                    return Ok(JumpPlan {
                        target: id,
                        kind,
                        iter_pops: foreach_crossed + usize::from(leaves_target),
                    });
                }
                if block.kind == BlockKind::Foreach {
                    foreach_crossed += 1;
                }
            }
            cursor = block.parent;
        }
        if seen == 0 {
            Err(JumpError::NotInLoop)
        } else {
            Err(JumpError::TooDeep { available: seen })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Aux, Opcode, UNPATCHED};

    #[test]
    fn fixups_patched_on_pop() {
        let mut chunk = Chunk::new("t");
        let mut arena = BlockArena::new();
        let id = arena.push(BlockKind::Loop, 0);
        arena.set_continue_target(id, 0);
        let brk = chunk.emit(Opcode::Jmp, 0, UNPATCHED, Aux::None, 1);
        let cont = chunk.emit(Opcode::Jmp, 0, UNPATCHED, Aux::None, 1);
        arena.add_fixup(id, FixupKind::Break, brk);
        arena.add_fixup(id, FixupKind::Continue, cont);
        chunk.emit(Opcode::Pop, 0, 0, Aux::None, 1);
        arena.pop(&mut chunk);
        assert_eq!(chunk.code[brk].p2, 3);
        assert_eq!(chunk.code[cont].p2, 0);
        assert!(arena.current().is_none());
    }

    #[test]
    fn break_counts_only_loops_and_switches() {
        let mut arena = BlockArena::new();
        let outer = arena.push(BlockKind::Foreach, 0);
        arena.push(BlockKind::Branch, 1);
        let inner = arena.push(BlockKind::Loop, 2);
        arena.push(BlockKind::Branch, 3);

        let one = arena.plan_jump(1, false).unwrap();
        assert_eq!((one.target, one.iter_pops), (inner, 0));
        let two = arena.plan_jump(2, false).unwrap();
        assert_eq!((two.target, two.iter_pops), (outer, 1));
        let cont = arena.plan_jump(2, true).unwrap();
        assert_eq!((cont.target, cont.kind, cont.iter_pops), (outer, FixupKind::Continue, 0));
        assert_eq!(arena.plan_jump(3, false), Err(JumpError::TooDeep { available: 2 }));
    }

    #[test]
    fn continue_in_switch_breaks() {
        let mut arena = BlockArena::new();
        arena.push(BlockKind::Switch, 0);
        assert_eq!(arena.plan_jump(1, true).unwrap().kind, FixupKind::Break);
        let empty = BlockArena::new();
        assert_eq!(empty.plan_jump(1, false), Err(JumpError::NotInLoop));
    }
}
