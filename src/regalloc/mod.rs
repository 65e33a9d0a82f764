//! Register assignment queries and updates.
//!
//! The hardening engine runs after register allocation: every virtual
//! register already has a physical home, and the [`Allocator`] trait is the
//! engine's window into (and lever over) that mapping. The conflict resolver
//! asks for candidate registers and interference verdicts, then commits a
//! rebinding once a hazard-free assignment is found. Instrumentation passes
//! that materialize new values register them through [`Allocator::bind_fresh`].

use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::{
    encoder::RegResolver,
    ir::{BlockId, Function, PhysReg, Reg, VirtReg},
    Result,
};

/// The register-assignment oracle the hardening engine works against.
pub trait Allocator {
    /// The physical register currently assigned to `vreg`, if any.
    fn physical_of(&self, vreg: VirtReg) -> Option<PhysReg>;

    /// Binds a freshly created virtual register to a fixed physical home.
    /// Used by rewrites that introduce values after allocation has run.
    fn bind_fresh(&mut self, vreg: VirtReg, reg: PhysReg);

    /// Moves an existing virtual register to a different physical register.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnmappedRegister`] if `vreg` has no current
    /// assignment.
    fn rebind(&mut self, vreg: VirtReg, reg: PhysReg) -> Result<()>;

    /// Candidate physical registers for reassigning `vreg`, in preference
    /// order. Never includes the stack or frame pointer.
    fn candidates(&self, vreg: VirtReg) -> Vec<PhysReg>;

    /// Whether assigning `vreg` to `reg` would clash with another value that
    /// is live inside `block`.
    fn interferes(&self, func: &Function, block: BlockId, vreg: VirtReg, reg: PhysReg) -> bool;
}

/// Adapts an [`Allocator`] to the encoder's [`RegResolver`] view.
pub struct Resolve<'a>(pub &'a dyn Allocator);

impl RegResolver for Resolve<'_> {
    fn resolve(&self, vreg: VirtReg) -> Option<PhysReg> {
        self.0.physical_of(vreg)
    }
}

/// A map-backed allocator with conservative block-local interference.
///
/// Interference is judged per block: a candidate register clashes if it is
/// live on block entry, referenced as a fixed physical operand anywhere in
/// the block, or currently home to a different virtual register that the
/// block touches. This over-approximates liveness but never clears a
/// reassignment that could break the program.
#[derive(Debug, Default)]
pub struct LinearAllocator {
    map: HashMap<VirtReg, PhysReg>,
    reserved: Vec<PhysReg>,
}

impl LinearAllocator {
    /// Creates an empty allocator with no reserved registers.
    #[must_use]
    pub fn new() -> Self {
        LinearAllocator::default()
    }

    /// Creates an allocator that never offers `reserved` as candidates.
    #[must_use]
    pub fn with_reserved(reserved: Vec<PhysReg>) -> Self {
        LinearAllocator {
            map: HashMap::new(),
            reserved,
        }
    }

    /// Sets the initial assignment of a virtual register.
    pub fn assign(&mut self, vreg: VirtReg, reg: PhysReg) {
        self.map.insert(vreg, reg);
    }

    /// Virtual registers with a current assignment.
    pub fn assigned(&self) -> impl Iterator<Item = (VirtReg, PhysReg)> + '_ {
        self.map.iter().map(|(&v, &p)| (v, p))
    }
}

impl Allocator for LinearAllocator {
    fn physical_of(&self, vreg: VirtReg) -> Option<PhysReg> {
        self.map.get(&vreg).copied()
    }

    fn bind_fresh(&mut self, vreg: VirtReg, reg: PhysReg) {
        self.map.insert(vreg, reg);
    }

    fn rebind(&mut self, vreg: VirtReg, reg: PhysReg) -> Result<()> {
        match self.map.get_mut(&vreg) {
            Some(slot) => {
                *slot = reg;
                Ok(())
            }
            None => Err(crate::Error::UnmappedRegister(vreg)),
        }
    }

    fn candidates(&self, vreg: VirtReg) -> Vec<PhysReg> {
        let current = self.physical_of(vreg);
        PhysReg::iter()
            .filter(|reg| !matches!(reg, PhysReg::Rsp | PhysReg::Rbp))
            .filter(|reg| !self.reserved.contains(reg))
            .filter(|reg| Some(*reg) != current)
            .collect()
    }

    fn interferes(&self, func: &Function, block: BlockId, vreg: VirtReg, reg: PhysReg) -> bool {
        let Ok(block) = func.block(block) else {
            return true;
        };
        if block.live_in().contains(&reg) {
            return true;
        }
        for &iid in block.instrs() {
            let Ok(instr) = func.instr(iid) else {
                return true;
            };
            for operand_reg in instr.regs() {
                match operand_reg {
                    Reg::Phys(p) if p == reg => return true,
                    Reg::Virt(v) if v != vreg && self.physical_of(v) == Some(reg) => {
                        return true;
                    }
                    _ => {}
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{Instruction, Opcode, Width};

    use super::*;

    #[test]
    fn rebind_requires_existing_assignment() {
        let mut alloc = LinearAllocator::new();
        assert!(alloc.rebind(VirtReg(0), PhysReg::Rax).is_err());
        alloc.assign(VirtReg(0), PhysReg::Rbx);
        alloc.rebind(VirtReg(0), PhysReg::Rax).unwrap();
        assert_eq!(alloc.physical_of(VirtReg(0)), Some(PhysReg::Rax));
    }

    #[test]
    fn candidates_exclude_pointers_and_reserved() {
        let alloc = LinearAllocator::with_reserved(vec![PhysReg::R11]);
        let candidates = alloc.candidates(VirtReg(0));
        assert!(!candidates.contains(&PhysReg::Rsp));
        assert!(!candidates.contains(&PhysReg::Rbp));
        assert!(!candidates.contains(&PhysReg::R11));
        assert_eq!(candidates[0], PhysReg::Rax);
    }

    #[test]
    fn interference_sees_fixed_physical_uses() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(
            entry,
            Instruction::rr(Opcode::Add, Width::B8, PhysReg::Rcx, VirtReg(0)),
        )
        .unwrap();

        let mut alloc = LinearAllocator::new();
        alloc.assign(VirtReg(0), PhysReg::Rbx);
        // rcx is taken by a fixed operand; rdx is free.
        assert!(alloc.interferes(&func, entry, VirtReg(0), PhysReg::Rcx));
        assert!(!alloc.interferes(&func, entry, VirtReg(0), PhysReg::Rdx));
    }

    #[test]
    fn interference_sees_other_vregs_sharing_a_home() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(
            entry,
            Instruction::rr(Opcode::Mov, Width::B8, VirtReg(0), VirtReg(1)),
        )
        .unwrap();

        let mut alloc = LinearAllocator::new();
        alloc.assign(VirtReg(0), PhysReg::Rbx);
        alloc.assign(VirtReg(1), PhysReg::Rsi);
        assert!(alloc.interferes(&func, entry, VirtReg(0), PhysReg::Rsi));
        assert!(!alloc.interferes(&func, entry, VirtReg(0), PhysReg::R8));
    }

    #[test]
    fn live_in_registers_interfere() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.block_mut(entry).unwrap().add_live_in(PhysReg::Rdi);
        let alloc = LinearAllocator::new();
        assert!(alloc.interferes(&func, entry, VirtReg(0), PhysReg::Rdi));
    }
}
