//! Condition-flags liveness: deciding whether a rewrite must preserve the
//! flags register around inserted arithmetic.
//!
//! The split and re-basing rewrites insert `or`/`add` instructions, which
//! clobber the flags. Whether that matters depends on what executes next, so
//! the analyzer walks forward from the rewrite point until something reads
//! the flags (must save), redefines them (safe), or control flow becomes
//! ambiguous (assume live).

use std::collections::HashSet;

use crate::ir::{BlockId, FlagsEffect, Function, Instruction};

/// Where flag save/restore instructions go around an inserted sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsPlacement {
    /// No preservation needed.
    NotNeeded,
    /// `pushf` before the inserted sequence, `popf` right before the
    /// rewritten instruction.
    SaveRestore,
}

/// Decides flag preservation for a sequence inserted directly before
/// `instr`.
///
/// An instruction that reads the flags must see them unclobbered. One that
/// only defines them makes any intermediate clobber dead. One that does
/// neither defers to whether the flags are live downstream.
#[must_use]
pub fn placement_for(instr: &Instruction, flags_live_after: bool) -> FlagsPlacement {
    let effect = instr.flags_effect();
    if effect.contains(FlagsEffect::READS) {
        FlagsPlacement::SaveRestore
    } else if effect.contains(FlagsEffect::WRITES) {
        FlagsPlacement::NotNeeded
    } else if flags_live_after {
        FlagsPlacement::SaveRestore
    } else {
        FlagsPlacement::NotNeeded
    }
}

/// Whether the flags register is live at position `start` of `block`
/// (i.e. some reachable instruction reads it before any redefinition).
///
/// The walk follows unique successors only; a block with several successors
/// leaves liveness unresolved and the conservative answer is `true`.
/// Returns and calls kill the flags by convention.
#[must_use]
pub fn needs_flags_save(func: &Function, block: BlockId, start: usize) -> bool {
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut current = block;
    let mut index = start;

    loop {
        let Ok(blk) = func.block(current) else {
            return true;
        };
        for &iid in &blk.instrs()[index.min(blk.instrs().len())..] {
            let Ok(instr) = func.instr(iid) else {
                return true;
            };
            if instr.is_return() || instr.is_call() {
                return false;
            }
            let effect = instr.flags_effect();
            if effect.contains(FlagsEffect::READS) {
                return true;
            }
            if effect.contains(FlagsEffect::WRITES) {
                return false;
            }
        }
        match blk.successors() {
            [next] if visited.insert(current) => {
                current = *next;
                index = 0;
            }
            [] => return false,
            _ => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{Instruction, Opcode, PhysReg, Width};

    use super::*;

    fn mov() -> Instruction {
        Instruction::rr(Opcode::Mov, Width::B8, PhysReg::Rax, PhysReg::Rbx)
    }

    fn cmp() -> Instruction {
        Instruction::rr(Opcode::Cmp, Width::B8, PhysReg::Rax, PhysReg::Rbx)
    }

    fn adc() -> Instruction {
        Instruction::rr(Opcode::Adc, Width::B8, PhysReg::Rax, PhysReg::Rbx)
    }

    #[test]
    fn reader_downstream_means_live() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(entry, mov()).unwrap();
        func.push_instr(entry, Instruction::nullary(Opcode::Pushf))
            .unwrap();
        assert!(needs_flags_save(&func, entry, 0));
    }

    #[test]
    fn writer_downstream_means_dead() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(entry, mov()).unwrap();
        func.push_instr(entry, cmp()).unwrap();
        func.push_instr(entry, Instruction::nullary(Opcode::Pushf))
            .unwrap();
        assert!(!needs_flags_save(&func, entry, 0));
    }

    #[test]
    fn return_kills_flags() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(entry, Instruction::nullary(Opcode::Ret))
            .unwrap();
        assert!(!needs_flags_save(&func, entry, 0));
    }

    #[test]
    fn walk_follows_unique_successor() {
        let mut func = Function::new("f");
        let entry = func.entry();
        let next = func.add_block();
        func.add_edge(entry, next).unwrap();
        func.push_instr(next, adc()).unwrap();
        assert!(needs_flags_save(&func, entry, 0));
    }

    #[test]
    fn branchy_flow_is_conservative() {
        let mut func = Function::new("f");
        let entry = func.entry();
        let a = func.add_block();
        let b = func.add_block();
        func.add_edge(entry, a).unwrap();
        func.add_edge(entry, b).unwrap();
        assert!(needs_flags_save(&func, entry, 0));
    }

    #[test]
    fn self_loop_terminates() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(entry, mov()).unwrap();
        func.add_edge(entry, entry).unwrap();
        // The walk revisits the entry once and gives the conservative answer.
        assert!(needs_flags_save(&func, entry, 0));
    }

    #[test]
    fn placement_patterns() {
        assert_eq!(placement_for(&adc(), false), FlagsPlacement::SaveRestore);
        assert_eq!(placement_for(&cmp(), true), FlagsPlacement::NotNeeded);
        assert_eq!(placement_for(&mov(), true), FlagsPlacement::SaveRestore);
        assert_eq!(placement_for(&mov(), false), FlagsPlacement::NotNeeded);
    }
}
