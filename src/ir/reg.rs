//! Register and operand-width types for the machine IR.
//!
//! Physical registers cover the sixteen x86-64 general-purpose registers.
//! Sub-register views (eax, ax, al, ...) are not modeled as separate names;
//! an [`Instruction`](crate::ir::Instruction) carries a [`Width`] instead,
//! and the encoder derives prefixes and register codes from it.

use std::fmt;

use strum::EnumIter;

/// Operand width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    /// 8-bit operand.
    B1,
    /// 16-bit operand.
    B2,
    /// 32-bit operand.
    B4,
    /// 64-bit operand.
    B8,
}

impl Width {
    /// Width in bits.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Width::B1 => 8,
            Width::B2 => 16,
            Width::B4 => 32,
            Width::B8 => 64,
        }
    }

    /// Width in bytes.
    #[must_use]
    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }
}

/// An x86-64 general-purpose physical register.
///
/// The declaration order is the architecture-preferred allocation order
/// (caller-saved argument registers first, reserved scratch registers last),
/// which [`strum::IntoEnumIterator`] exposes for candidate enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum PhysReg {
    /// RAX - accumulator, return value.
    Rax,
    /// RCX - fourth argument.
    Rcx,
    /// RDX - third argument.
    Rdx,
    /// RSI - second argument.
    Rsi,
    /// RDI - first argument.
    Rdi,
    /// R8 - fifth argument.
    R8,
    /// R9 - sixth argument.
    R9,
    /// R10 - caller-saved scratch.
    R10,
    /// R11 - caller-saved scratch; reserved by the CFI instrumenter.
    R11,
    /// RBX - callee-saved.
    Rbx,
    /// R12 - callee-saved.
    R12,
    /// R13 - callee-saved; member of the resolver's safe scratch pool.
    R13,
    /// R14 - callee-saved; member of the resolver's safe scratch pool.
    R14,
    /// R15 - callee-saved; member of the resolver's safe scratch pool.
    R15,
    /// RBP - frame pointer.
    Rbp,
    /// RSP - stack pointer.
    Rsp,
}

impl PhysReg {
    /// The 4-bit register number used in ModR/M, SIB and opcode fields.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            PhysReg::Rax => 0,
            PhysReg::Rcx => 1,
            PhysReg::Rdx => 2,
            PhysReg::Rbx => 3,
            PhysReg::Rsp => 4,
            PhysReg::Rbp => 5,
            PhysReg::Rsi => 6,
            PhysReg::Rdi => 7,
            PhysReg::R8 => 8,
            PhysReg::R9 => 9,
            PhysReg::R10 => 10,
            PhysReg::R11 => 11,
            PhysReg::R12 => 12,
            PhysReg::R13 => 13,
            PhysReg::R14 => 14,
            PhysReg::R15 => 15,
        }
    }

    /// The low three bits of the register number (the ModR/M field value).
    #[must_use]
    pub fn base_code(self) -> u8 {
        self.code() & 7
    }

    /// Whether the register needs a REX extension bit (R8-R15).
    #[must_use]
    pub fn is_extended(self) -> bool {
        self.code() >= 8
    }

    /// Name of the full 64-bit register.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PhysReg::Rax => "rax",
            PhysReg::Rcx => "rcx",
            PhysReg::Rdx => "rdx",
            PhysReg::Rbx => "rbx",
            PhysReg::Rsp => "rsp",
            PhysReg::Rbp => "rbp",
            PhysReg::Rsi => "rsi",
            PhysReg::Rdi => "rdi",
            PhysReg::R8 => "r8",
            PhysReg::R9 => "r9",
            PhysReg::R10 => "r10",
            PhysReg::R11 => "r11",
            PhysReg::R12 => "r12",
            PhysReg::R13 => "r13",
            PhysReg::R14 => "r14",
            PhysReg::R15 => "r15",
        }
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A virtual register name, valid within one [`Function`](crate::ir::Function).
///
/// Maps to exactly one physical register at any time through the
/// [`Allocator`](crate::regalloc::Allocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtReg(pub u32);

impl fmt::Display for VirtReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%v{}", self.0)
    }
}

/// A register operand: either still virtual or already physical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// A virtual register resolved through the allocator's mapping.
    Virt(VirtReg),
    /// A fixed physical register.
    Phys(PhysReg),
}

impl Reg {
    /// Returns the virtual register, if this operand is virtual.
    #[must_use]
    pub fn as_virt(self) -> Option<VirtReg> {
        match self {
            Reg::Virt(v) => Some(v),
            Reg::Phys(_) => None,
        }
    }

    /// Returns the physical register, if this operand is already physical.
    #[must_use]
    pub fn as_phys(self) -> Option<PhysReg> {
        match self {
            Reg::Phys(p) => Some(p),
            Reg::Virt(_) => None,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Virt(v) => v.fmt(f),
            Reg::Phys(p) => p.fmt(f),
        }
    }
}

impl From<PhysReg> for Reg {
    fn from(reg: PhysReg) -> Self {
        Reg::Phys(reg)
    }
}

impl From<VirtReg> for Reg {
    fn from(reg: VirtReg) -> Self {
        Reg::Virt(reg)
    }
}
