//! The function container: instruction/block arenas and layout order.

use crate::{
    ir::{Block, BlockId, FrameSlot, FrameSlotId, Instruction, InstrId, VirtReg},
    Result,
};

/// A machine function: blocks of instructions plus a frame-object table.
///
/// Blocks and instructions live in arenas addressed by [`BlockId`] and
/// [`InstrId`]; the separate `layout` vector fixes the emission order of
/// blocks, which the CFI instrumenter manipulates when it creates trap
/// blocks and the entry prologue.
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name, used in logs only.
    pub name: String,
    instrs: Vec<Instruction>,
    blocks: Vec<Block>,
    layout: Vec<BlockId>,
    entry: BlockId,
    frame_slots: Vec<FrameSlot>,
    next_vreg: u32,
}

impl Function {
    /// Creates a function with a single empty entry block.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Function {
            name: name.into(),
            instrs: Vec::new(),
            blocks: vec![Block::default()],
            layout: vec![BlockId(0)],
            entry: BlockId(0),
            frame_slots: Vec::new(),
            next_vreg: 0,
        }
    }

    /// The entry block.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Changes the entry block (used when a prologue block is prepended).
    pub fn set_entry(&mut self, block: BlockId) {
        self.entry = block;
    }

    /// Block identifiers in emission order.
    #[must_use]
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    /// Borrows a block.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidBlock`] for a stale identifier.
    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id.index())
            .ok_or(crate::Error::InvalidBlock(id))
    }

    /// Mutably borrows a block.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidBlock`] for a stale identifier.
    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks
            .get_mut(id.index())
            .ok_or(crate::Error::InvalidBlock(id))
    }

    /// Borrows an instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInstr`] for a stale identifier.
    pub fn instr(&self, id: InstrId) -> Result<&Instruction> {
        self.instrs
            .get(id.index())
            .ok_or(crate::Error::InvalidInstr(id))
    }

    /// Mutably borrows an instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInstr`] for a stale identifier.
    pub fn instr_mut(&mut self, id: InstrId) -> Result<&mut Instruction> {
        self.instrs
            .get_mut(id.index())
            .ok_or(crate::Error::InvalidInstr(id))
    }

    /// Places an instruction into the arena without linking it to a block.
    pub fn alloc_instr(&mut self, instr: Instruction) -> InstrId {
        let id = InstrId(u32::try_from(self.instrs.len()).expect("instruction arena overflow"));
        self.instrs.push(instr);
        id
    }

    /// Appends an instruction to a block.
    ///
    /// # Errors
    ///
    /// Returns an error if the block identifier is stale.
    pub fn push_instr(&mut self, block: BlockId, instr: Instruction) -> Result<InstrId> {
        let id = self.alloc_instr(instr);
        self.block_mut(block)?.instrs.push(id);
        Ok(id)
    }

    /// Inserts an instruction at `index` within a block's instruction list.
    ///
    /// # Errors
    ///
    /// Returns an error if the block identifier is stale.
    pub fn insert_instr(
        &mut self,
        block: BlockId,
        index: usize,
        instr: Instruction,
    ) -> Result<InstrId> {
        let id = self.alloc_instr(instr);
        let list = &mut self.block_mut(block)?.instrs;
        let index = index.min(list.len());
        list.insert(index, id);
        Ok(id)
    }

    /// Position of an instruction within a block, if it is linked there.
    #[must_use]
    pub fn position_of(&self, block: BlockId, id: InstrId) -> Option<usize> {
        self.blocks
            .get(block.index())?
            .instrs
            .iter()
            .position(|&i| i == id)
    }

    /// Unlinks an instruction from a block. The arena entry survives, so
    /// outstanding identifiers never dangle.
    ///
    /// # Errors
    ///
    /// Returns an error if the block identifier is stale.
    pub fn remove_instr(&mut self, block: BlockId, id: InstrId) -> Result<()> {
        let list = &mut self.block_mut(block)?.instrs;
        list.retain(|&i| i != id);
        Ok(())
    }

    /// Unlinks the range `[from, to)` of a block's instruction list and
    /// returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the block identifier is stale.
    pub fn take_range(
        &mut self,
        block: BlockId,
        from: usize,
        to: usize,
    ) -> Result<Vec<InstrId>> {
        let list = &mut self.block_mut(block)?.instrs;
        let to = to.min(list.len());
        let from = from.min(to);
        Ok(list.drain(from..to).collect())
    }

    /// Appends a fresh block at the end of the layout.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block arena overflow"));
        self.blocks.push(Block::default());
        self.layout.push(id);
        id
    }

    /// Appends a fresh block placed directly after `after` in the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if `after` is not part of the layout.
    pub fn add_block_after(&mut self, after: BlockId) -> Result<BlockId> {
        let id = self.add_block();
        self.layout.pop();
        let pos = self
            .layout
            .iter()
            .position(|&b| b == after)
            .ok_or(crate::Error::InvalidBlock(after))?;
        self.layout.insert(pos + 1, id);
        Ok(id)
    }

    /// Appends a fresh block placed directly before `before` in the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if `before` is not part of the layout.
    pub fn add_block_before(&mut self, before: BlockId) -> Result<BlockId> {
        let id = self.add_block();
        self.layout.pop();
        let pos = self
            .layout
            .iter()
            .position(|&b| b == before)
            .ok_or(crate::Error::InvalidBlock(before))?;
        self.layout.insert(pos, id);
        Ok(id)
    }

    /// Adds a control-flow edge.
    ///
    /// # Errors
    ///
    /// Returns an error if the source block identifier is stale.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) -> Result<()> {
        let block = self.block_mut(from)?;
        if !block.succs.contains(&to) {
            block.succs.push(to);
        }
        Ok(())
    }

    /// Splits a block at `index`: instructions `[index..]` move into a new
    /// block placed after it in the layout, and the original block's
    /// successors transfer to the new block. No edge between the halves is
    /// created; the caller wires the control flow it wants.
    ///
    /// # Errors
    ///
    /// Returns an error if the block identifier is stale.
    pub fn split_block(&mut self, block: BlockId, index: usize) -> Result<BlockId> {
        let tail = self.take_range(block, index, usize::MAX)?;
        let succs = std::mem::take(&mut self.block_mut(block)?.succs);
        let new_block = self.add_block_after(block)?;
        let nb = self.block_mut(new_block)?;
        nb.instrs = tail;
        nb.succs = succs;
        Ok(new_block)
    }

    /// Allocates a fresh virtual register name.
    pub fn new_vreg(&mut self) -> VirtReg {
        let vreg = VirtReg(self.next_vreg);
        self.next_vreg += 1;
        vreg
    }

    /// Virtual register names allocated so far (exclusive upper bound).
    #[must_use]
    pub fn vreg_count(&self) -> u32 {
        self.next_vreg
    }

    /// Creates a stack frame slot.
    pub fn create_frame_slot(&mut self, size: u32, align: u32) -> FrameSlotId {
        let id = FrameSlotId(u32::try_from(self.frame_slots.len()).expect("frame table overflow"));
        self.frame_slots.push(FrameSlot { size, align });
        id
    }

    /// The frame-object table.
    #[must_use]
    pub fn frame_slots(&self) -> &[FrameSlot] {
        &self.frame_slots
    }

    /// Iterates over every linked instruction in layout order.
    pub fn iter_instrs(&self) -> impl Iterator<Item = (BlockId, InstrId)> + '_ {
        self.layout.iter().flat_map(move |&bid| {
            self.blocks[bid.index()]
                .instrs
                .iter()
                .map(move |&iid| (bid, iid))
        })
    }
}
