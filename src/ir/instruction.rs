//! Instruction, operand and opcode model.
//!
//! The instruction set is deliberately restricted to the integer/memory
//! operand classes the hardening engine reasons about: two-operand ALU
//! forms, moves, loads/stores, stack operations and control transfers.
//! Operand *form* (register-immediate, memory-register, ...) is not part of
//! the opcode; it is derived from the operand list, and the rewrite passes
//! switch forms by swapping operands (e.g. `add rax, 0xC3` into
//! `add rax, r10`).

use std::fmt;

use bitflags::bitflags;

use crate::ir::{BlockId, FrameSlotId, Reg, Width};

bitflags! {
    /// How an instruction interacts with the condition-flags register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagsEffect: u8 {
        /// The instruction reads the flags register.
        const READS = 0b01;
        /// The instruction defines the flags register.
        const WRITES = 0b10;
    }
}

/// Operation code, width-independent.
///
/// Width is carried on the [`Instruction`], matching how the encoder derives
/// prefixes; a `Mov` with [`Width::B8`] is the original's `MOV64xx` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Register/memory move. Defines its destination, no flags effect.
    Mov,
    /// Non-temporal store; its opcode byte sequence (`0F C3`) is an
    /// inherent hazard and is always lowered to `Mov`.
    Movnt,
    /// Byte-swap of a single register operand.
    Bswap,
    /// Load effective address.
    Lea,
    /// Integer add.
    Add,
    /// Integer subtract.
    Sub,
    /// Add with carry (reads flags).
    Adc,
    /// Subtract with borrow (reads flags).
    Sbb,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Bitwise and.
    And,
    /// Compare; defines flags, does not define its first operand.
    Cmp,
    /// Bit test; defines flags, does not define its first operand.
    Test,
    /// Push a register onto the stack.
    Push,
    /// Pop the top of stack into a register.
    Pop,
    /// Push the flags register.
    Pushf,
    /// Pop the flags register.
    Popf,
    /// Near return.
    Ret,
    /// Near return popping an immediate number of bytes.
    RetImm,
    /// Direct call to a symbol.
    Call,
    /// Indirect call through a register or memory operand.
    CallInd,
    /// Direct jump to a block label or an external symbol (tail call).
    Jmp,
    /// Indirect jump through a register or memory operand.
    JmpInd,
    /// Jump if equal.
    Je,
    /// Halt; the CFI trap instruction.
    Hlt,
    /// One-byte no-operation.
    Nop,
}

impl Opcode {
    /// The instruction's interaction with the condition-flags register.
    #[must_use]
    pub fn flags_effect(self) -> FlagsEffect {
        match self {
            Opcode::Adc | Opcode::Sbb => FlagsEffect::READS | FlagsEffect::WRITES,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Or
            | Opcode::Xor
            | Opcode::And
            | Opcode::Cmp
            | Opcode::Test => FlagsEffect::WRITES,
            Opcode::Pushf | Opcode::Je => FlagsEffect::READS,
            Opcode::Popf => FlagsEffect::WRITES,
            _ => FlagsEffect::empty(),
        }
    }

    /// Move-like opcodes define their destination outright.
    #[must_use]
    pub fn is_move_like(self) -> bool {
        matches!(self, Opcode::Mov | Opcode::Movnt)
    }

    /// Compare-like opcodes read both operands and define nothing but flags.
    #[must_use]
    pub fn is_compare_like(self) -> bool {
        matches!(self, Opcode::Cmp | Opcode::Test)
    }

    /// Whether a register-immediate form of this opcode has an equivalent
    /// register-register form the reconstructor can switch to.
    #[must_use]
    pub fn has_rr_form(self) -> bool {
        matches!(
            self,
            Opcode::Mov
                | Opcode::Add
                | Opcode::Sub
                | Opcode::Adc
                | Opcode::Sbb
                | Opcode::Or
                | Opcode::Xor
                | Opcode::And
                | Opcode::Cmp
                | Opcode::Test
        )
    }
}

/// Segment override for a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// FS segment; `fs:0x28` holds the thread-local secret.
    Fs,
    /// GS segment.
    Gs,
}

/// The base address of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseAddr {
    /// No base register (absolute or index-only addressing).
    None,
    /// A base register.
    Reg(Reg),
    /// A stack frame slot whose final displacement is assigned during frame
    /// layout, after this engine runs.
    Frame(FrameSlotId),
}

/// A memory operand: `segment:[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    /// Base address.
    pub base: BaseAddr,
    /// Optional index register.
    pub index: Option<Reg>,
    /// Index scale factor (1, 2, 4 or 8).
    pub scale: u8,
    /// Byte displacement.
    pub disp: i64,
    /// Optional segment override.
    pub segment: Option<Segment>,
}

impl MemOperand {
    /// A `[base]` operand with no displacement.
    #[must_use]
    pub fn base(reg: impl Into<Reg>) -> Self {
        Self::base_disp(reg, 0)
    }

    /// A `[base + disp]` operand.
    #[must_use]
    pub fn base_disp(reg: impl Into<Reg>, disp: i64) -> Self {
        MemOperand {
            base: BaseAddr::Reg(reg.into()),
            index: None,
            scale: 1,
            disp,
            segment: None,
        }
    }

    /// A frame-slot reference; displacement is resolved by frame layout.
    #[must_use]
    pub fn frame(slot: FrameSlotId) -> Self {
        MemOperand {
            base: BaseAddr::Frame(slot),
            index: None,
            scale: 1,
            disp: 0,
            segment: None,
        }
    }

    /// The thread-local secret: `fs:[disp]` with no base or index.
    #[must_use]
    pub fn fs(disp: i64) -> Self {
        MemOperand {
            base: BaseAddr::None,
            index: None,
            scale: 1,
            disp,
            segment: Some(Segment::Fs),
        }
    }
}

/// A single instruction operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// A register.
    Reg(Reg),
    /// An immediate value, sign-extended to 64 bits.
    Imm(i64),
    /// A memory reference.
    Mem(MemOperand),
    /// A control-flow target inside the function.
    Label(BlockId),
    /// An external symbol (direct call or tail-call target).
    Sym(String),
}

impl Operand {
    /// Shorthand for a register operand.
    #[must_use]
    pub fn reg(reg: impl Into<Reg>) -> Self {
        Operand::Reg(reg.into())
    }
}

/// One machine instruction: opcode, operand width and ordered operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The operation.
    pub opcode: Opcode,
    /// Operand width of the data operation.
    pub width: Width,
    /// Ordered operand list. Two-operand forms put the destination (or the
    /// compared left-hand side) first.
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// Creates an instruction from parts.
    #[must_use]
    pub fn new(opcode: Opcode, width: Width, operands: Vec<Operand>) -> Self {
        Instruction {
            opcode,
            width,
            operands,
        }
    }

    /// A no-operand instruction (`ret`, `nop`, `hlt`, `pushf`, ...).
    #[must_use]
    pub fn nullary(opcode: Opcode) -> Self {
        Instruction::new(opcode, Width::B8, Vec::new())
    }

    /// A register-register two-operand form.
    #[must_use]
    pub fn rr(opcode: Opcode, width: Width, dst: impl Into<Reg>, src: impl Into<Reg>) -> Self {
        Instruction::new(opcode, width, vec![Operand::reg(dst), Operand::reg(src)])
    }

    /// A register-immediate two-operand form.
    #[must_use]
    pub fn ri(opcode: Opcode, width: Width, dst: impl Into<Reg>, imm: i64) -> Self {
        Instruction::new(opcode, width, vec![Operand::reg(dst), Operand::Imm(imm)])
    }

    /// A memory-immediate form.
    #[must_use]
    pub fn mi(opcode: Opcode, width: Width, mem: MemOperand, imm: i64) -> Self {
        Instruction::new(opcode, width, vec![Operand::Mem(mem), Operand::Imm(imm)])
    }

    /// A memory-register form (store).
    #[must_use]
    pub fn mr(opcode: Opcode, width: Width, mem: MemOperand, src: impl Into<Reg>) -> Self {
        Instruction::new(opcode, width, vec![Operand::Mem(mem), Operand::reg(src)])
    }

    /// A register-memory form (load).
    #[must_use]
    pub fn rm(opcode: Opcode, width: Width, dst: impl Into<Reg>, mem: MemOperand) -> Self {
        Instruction::new(opcode, width, vec![Operand::reg(dst), Operand::Mem(mem)])
    }

    /// A `push reg` of the full 64-bit register.
    #[must_use]
    pub fn push(reg: impl Into<Reg>) -> Self {
        Instruction::new(Opcode::Push, Width::B8, vec![Operand::reg(reg)])
    }

    /// A `pop reg` into the full 64-bit register.
    #[must_use]
    pub fn pop(reg: impl Into<Reg>) -> Self {
        Instruction::new(Opcode::Pop, Width::B8, vec![Operand::reg(reg)])
    }

    /// Whether this instruction returns from the function.
    #[must_use]
    pub fn is_return(&self) -> bool {
        matches!(self.opcode, Opcode::Ret | Opcode::RetImm)
    }

    /// Whether this instruction is any kind of call.
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(self.opcode, Opcode::Call | Opcode::CallInd)
    }

    /// Whether this is a call through a register or memory operand.
    #[must_use]
    pub fn is_indirect_call(&self) -> bool {
        self.opcode == Opcode::CallInd
    }

    /// Whether this is a jump through a register or memory operand.
    #[must_use]
    pub fn is_indirect_branch(&self) -> bool {
        self.opcode == Opcode::JmpInd
    }

    /// Whether this is a direct branch (conditional or not).
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self.opcode, Opcode::Jmp | Opcode::Je)
    }

    /// Whether this is a direct jump that leaves the function (tail call).
    #[must_use]
    pub fn is_tail_jump(&self) -> bool {
        self.opcode == Opcode::Jmp && matches!(self.operands.first(), Some(Operand::Sym(_)))
    }

    /// The instruction's flags interaction.
    #[must_use]
    pub fn flags_effect(&self) -> FlagsEffect {
        self.opcode.flags_effect()
    }

    /// Every register referenced by any operand, including memory base and
    /// index registers.
    #[must_use]
    pub fn regs(&self) -> Vec<Reg> {
        let mut out = Vec::new();
        for operand in &self.operands {
            match operand {
                Operand::Reg(r) => out.push(*r),
                Operand::Mem(mem) => {
                    if let BaseAddr::Reg(r) = mem.base {
                        out.push(r);
                    }
                    if let Some(r) = mem.index {
                        out.push(r);
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Replaces every occurrence of `from` (as a direct operand or inside a
    /// memory operand) with `to`. Returns how many occurrences changed.
    pub fn replace_reg(&mut self, from: Reg, to: Reg) -> usize {
        let mut replaced = 0;
        for operand in &mut self.operands {
            match operand {
                Operand::Reg(r) if *r == from => {
                    *r = to;
                    replaced += 1;
                }
                Operand::Mem(mem) => {
                    if mem.base == BaseAddr::Reg(from) {
                        mem.base = BaseAddr::Reg(to);
                        replaced += 1;
                    }
                    if mem.index == Some(from) {
                        mem.index = Some(to);
                        replaced += 1;
                    }
                }
                _ => {}
            }
        }
        replaced
    }

    /// Whether any operand references a frame slot.
    #[must_use]
    pub fn references_frame(&self) -> bool {
        self.operands.iter().any(|op| {
            matches!(
                op,
                Operand::Mem(MemOperand {
                    base: BaseAddr::Frame(_),
                    ..
                })
            )
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.opcode, self.width.bits())?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match operand {
                Operand::Reg(r) => write!(f, "{sep}{r}")?,
                Operand::Imm(v) => write!(f, "{sep}{v:#x}")?,
                Operand::Mem(m) => {
                    write!(f, "{sep}[")?;
                    match m.base {
                        BaseAddr::None => write!(f, "abs")?,
                        BaseAddr::Reg(r) => write!(f, "{r}")?,
                        BaseAddr::Frame(slot) => write!(f, "{slot}")?,
                    }
                    if let Some(idx) = m.index {
                        write!(f, "+{idx}*{}", m.scale)?;
                    }
                    write!(f, "{:+#x}]", m.disp)?;
                }
                Operand::Label(b) => write!(f, "{sep}{b}")?,
                Operand::Sym(s) => write!(f, "{sep}{s}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::PhysReg;

    use super::*;

    #[test]
    fn flags_classification() {
        assert_eq!(
            Opcode::Adc.flags_effect(),
            FlagsEffect::READS | FlagsEffect::WRITES
        );
        assert_eq!(Opcode::Cmp.flags_effect(), FlagsEffect::WRITES);
        assert_eq!(Opcode::Lea.flags_effect(), FlagsEffect::empty());
        assert_eq!(Opcode::Mov.flags_effect(), FlagsEffect::empty());
    }

    #[test]
    fn regs_includes_memory_registers() {
        let mut mem = MemOperand::base_disp(PhysReg::Rbx, 0x10);
        mem.index = Some(Reg::Phys(PhysReg::Rcx));
        let instr = Instruction::mr(Opcode::Mov, Width::B8, mem, PhysReg::Rax);
        let regs = instr.regs();
        assert_eq!(regs.len(), 3);
        assert!(regs.contains(&Reg::Phys(PhysReg::Rbx)));
        assert!(regs.contains(&Reg::Phys(PhysReg::Rcx)));
        assert!(regs.contains(&Reg::Phys(PhysReg::Rax)));
    }

    #[test]
    fn replace_reg_rewrites_base_and_index() {
        let mut mem = MemOperand::base_disp(PhysReg::R10, 0x48);
        mem.index = Some(Reg::Phys(PhysReg::R10));
        let mut instr = Instruction::rm(Opcode::Lea, Width::B8, PhysReg::R10, mem);
        let replaced = instr.replace_reg(Reg::Phys(PhysReg::R10), Reg::Phys(PhysReg::R13));
        assert_eq!(replaced, 3);
        assert!(instr.regs().iter().all(|&r| r == Reg::Phys(PhysReg::R13)));
    }

    #[test]
    fn tail_jump_detection() {
        let tail = Instruction::new(
            Opcode::Jmp,
            Width::B8,
            vec![Operand::Sym("memcpy".into())],
        );
        assert!(tail.is_tail_jump());
        let local = Instruction::new(
            Opcode::Jmp,
            Width::B8,
            vec![Operand::Label(crate::ir::BlockId(1))],
        );
        assert!(!local.is_tail_jump());
    }
}
