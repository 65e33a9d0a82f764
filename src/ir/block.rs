//! Arena identifiers and the basic-block type.
//!
//! Instructions and blocks are addressed by stable indices into the owning
//! [`Function`](crate::ir::Function)'s arenas. Rewrites never move arena
//! entries; they splice identifiers in and out of block instruction lists,
//! so an `InstrId` held across a mutation stays valid (it may merely become
//! unlinked).

use std::fmt;

use crate::ir::PhysReg;

/// Stable index of an instruction in a function's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl InstrId {
    /// The raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Stable index of a block in a function's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Index of a stack frame slot in a function's frame-object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSlotId(pub u32);

impl fmt::Display for FrameSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fi{}", self.0)
    }
}

/// A stack frame slot (size and alignment in bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Slot size in bytes.
    pub size: u32,
    /// Slot alignment in bytes.
    pub align: u32,
}

/// An ordered sequence of instructions with control-flow successors.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Instruction identifiers in execution order.
    pub(crate) instrs: Vec<InstrId>,
    /// Successor blocks.
    pub(crate) succs: Vec<BlockId>,
    /// Physical registers live on entry.
    pub(crate) live_in: Vec<PhysReg>,
}

impl Block {
    /// Instructions in execution order.
    #[must_use]
    pub fn instrs(&self) -> &[InstrId] {
        &self.instrs
    }

    /// Successor blocks.
    #[must_use]
    pub fn successors(&self) -> &[BlockId] {
        &self.succs
    }

    /// Live-in physical registers.
    #[must_use]
    pub fn live_in(&self) -> &[PhysReg] {
        &self.live_in
    }

    /// Whether the block holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// The last instruction of the block, if any.
    #[must_use]
    pub fn terminator(&self) -> Option<InstrId> {
        self.instrs.last().copied()
    }

    /// Records a live-in register, keeping the set unique and sorted by
    /// register code.
    pub fn add_live_in(&mut self, reg: PhysReg) {
        if !self.live_in.contains(&reg) {
            self.live_in.push(reg);
            self.live_in.sort_by_key(|r| r.code());
        }
    }
}
