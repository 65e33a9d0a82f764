//! Machine IR: registers, instructions, blocks and functions.
//!
//! This is the representation the hardening engine transforms. It mirrors a
//! post-register-allocation instruction stream: operands may still name
//! virtual registers, but every virtual register already has a physical
//! assignment through the [`Allocator`](crate::regalloc::Allocator), and the
//! encoder resolves names through that mapping when producing bytes.
//!
//! Blocks and instructions are arena-indexed ([`BlockId`], [`InstrId`]);
//! all splicing is done through explicit insert/remove/split operations on
//! the owning [`Function`], never through pointer or iterator surgery.

mod block;
mod function;
mod instruction;
mod reg;

pub use block::{Block, BlockId, FrameSlot, FrameSlotId, InstrId};
pub use function::Function;
pub use instruction::{
    BaseAddr, FlagsEffect, Instruction, MemOperand, Opcode, Operand, Segment,
};
pub use reg::{PhysReg, Reg, VirtReg, Width};
