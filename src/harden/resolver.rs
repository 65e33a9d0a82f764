//! Encoding-conflict resolution: removing hazards from register-selection
//! bytes (ModR/M and SIB).
//!
//! Two strategies, tried in order. *Reassignment* moves a virtual register
//! to a different physical home so the selection bytes change; a register
//! moved this way is locked and never moved again, which bounds the
//! fixpoint. *Transformation* routes one register operand through a scratch
//! register from the safe pool (`r13`, `r15`, `r14` never place the hazard
//! pattern in the reg field) with a push/copy/copy-back/pop bracket.
//!
//! The whole function is re-walked until a pass makes no change, because a
//! reassignment can flip the bytes of other instructions using the same
//! virtual register.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    encoder::{InstructionEncoder, Remap},
    harden::{
        scanner::{scan, scan_encoding, HazardKind},
        HardenContext,
    },
    ir::{BaseAddr, BlockId, Function, Instruction, InstrId, Opcode, PhysReg, Reg, VirtReg, Width},
    regalloc::{Allocator, Resolve},
    Result,
};

/// Reassignment state of a virtual register.
///
/// Locking on commit is what guarantees termination: a register can move at
/// most once, so the number of productive fixpoint iterations is bounded by
/// the number of virtual registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VregState {
    /// The register may still be moved to a new physical home.
    Unlocked,
    /// The register has been moved once and is now pinned.
    Locked,
}

enum Outcome {
    Reassigned,
    Transformed,
    Unresolved,
}

/// Resolves register-selection hazards across the function.
pub(crate) fn run(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
) -> Result<()> {
    let mut states: HashMap<VirtReg, VregState> = HashMap::new();
    let mut loops = 0u32;

    loop {
        loops += 1;
        let mut changed = false;
        let mut unresolved: Vec<InstrId> = Vec::new();

        let worklist: Vec<(BlockId, InstrId)> = func.iter_instrs().collect();
        for (block, iid) in worklist {
            let instr = func.instr(iid)?.clone();
            if skip(&instr) {
                continue;
            }
            let encoding = encoder.encode(&instr, &Resolve(&*alloc));
            if !scan_encoding(&encoding)
                .iter()
                .any(|h| h.kind == HazardKind::ModRmSib)
            {
                continue;
            }
            match resolve_one(func, alloc, encoder, ctx, &mut states, block, iid, &instr)? {
                Outcome::Reassigned | Outcome::Transformed => {
                    changed = true;
                    ctx.stats.evil_encodings += 1;
                }
                Outcome::Unresolved => unresolved.push(iid),
            }
        }

        if !changed {
            for &iid in &unresolved {
                warn!(instr = %func.instr(iid)?, "register-selection hazard left unresolved");
            }
            ctx.stats.unhandled += unresolved.len() as u64;
            break;
        }
    }

    debug!(function = %func.name, loops, "conflict resolution converged");
    Ok(())
}

/// Control transfers never get their selection bytes rewritten; the
/// hazardous bytes of a return or an indirect transfer *are* the transfer.
fn skip(instr: &Instruction) -> bool {
    instr.is_return()
        || instr.is_call()
        || instr.is_branch()
        || instr.is_indirect_branch()
}

#[allow(clippy::too_many_arguments)]
fn resolve_one(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
    states: &mut HashMap<VirtReg, VregState>,
    block: BlockId,
    iid: InstrId,
    instr: &Instruction,
) -> Result<Outcome> {
    let mut vregs: Vec<VirtReg> = instr.regs().iter().filter_map(|r| r.as_virt()).collect();
    vregs.dedup();

    for vreg in vregs {
        if states.get(&vreg) == Some(&VregState::Locked) {
            continue;
        }
        let mut attempts = 0;
        for candidate in alloc.candidates(vreg) {
            if attempts >= ctx.config.reassign_attempt_limit {
                break;
            }
            if alloc.interferes(func, block, vreg, candidate) {
                continue;
            }
            attempts += 1;
            let base = Resolve(&*alloc);
            let remap = Remap::new(&base, vreg, candidate);
            let encoding = encoder.encode(instr, &remap);
            if !encoding.is_empty() && scan(encoding.bytes()).is_empty() {
                alloc.rebind(vreg, candidate)?;
                states.insert(vreg, VregState::Locked);
                debug!(instr = %instr, vreg = %vreg, home = %candidate, "reassigned register");
                return Ok(Outcome::Reassigned);
            }
        }
    }

    transform(func, alloc, encoder, ctx, states, block, iid, instr)
}

/// The fallback: detour one operand through a scratch register.
#[allow(clippy::too_many_arguments)]
fn transform(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
    states: &mut HashMap<VirtReg, VregState>,
    block: BlockId,
    iid: InstrId,
    instr: &Instruction,
) -> Result<Outcome> {
    let referenced: Vec<PhysReg> = {
        let mut regs = Vec::new();
        for reg in instr.regs() {
            if let Some(p) = resolve(alloc, reg) {
                if !regs.contains(&p) {
                    regs.push(p);
                }
            }
        }
        regs
    };
    // The push/pop bracket shifts the stack pointer; anything addressed
    // through it would read the wrong slot.
    if referenced.contains(&PhysReg::Rsp) {
        return Ok(Outcome::Unresolved);
    }

    let Some(scratch) = ctx
        .config
        .scratch_pool
        .iter()
        .copied()
        .find(|s| !referenced.contains(s))
    else {
        return Ok(Outcome::Unresolved);
    };

    for &target in &referenced {
        let mut trial = instr.clone();
        substitute(&mut trial, alloc, target, scratch);
        let encoding = encoder.encode(&trial, &Resolve(&*alloc));
        if encoding.is_empty() || !scan(encoding.bytes()).is_empty() {
            continue;
        }

        let Some(pos) = func.position_of(block, iid) else {
            return Err(crate::Error::InvalidInstr(iid));
        };
        func.insert_instr(block, pos, Instruction::push(scratch))?;
        func.insert_instr(
            block,
            pos + 1,
            Instruction::rr(Opcode::Mov, Width::B8, scratch, target),
        )?;
        substitute(func.instr_mut(iid)?, alloc, target, scratch);
        func.insert_instr(
            block,
            pos + 3,
            Instruction::rr(Opcode::Mov, Width::B8, target, scratch),
        )?;
        func.insert_instr(block, pos + 4, Instruction::pop(scratch))?;
        // The bracket hard-codes `target`; a virtual register living there
        // must never move again or the detour reads a stale home.
        for vreg in instr.regs().iter().filter_map(|r| r.as_virt()) {
            if alloc.physical_of(vreg) == Some(target) {
                states.insert(vreg, VregState::Locked);
            }
        }
        debug!(instr = %instr, target = %target, scratch = %scratch, "detoured register through scratch");
        return Ok(Outcome::Transformed);
    }

    Ok(Outcome::Unresolved)
}

fn resolve(alloc: &dyn Allocator, reg: Reg) -> Option<PhysReg> {
    match reg {
        Reg::Phys(p) => Some(p),
        Reg::Virt(v) => alloc.physical_of(v),
    }
}

/// Replaces every operand register that resolves to `target` with the
/// scratch register, including memory base and index registers and virtual
/// registers sharing the physical home.
fn substitute(instr: &mut Instruction, alloc: &dyn Allocator, target: PhysReg, scratch: PhysReg) {
    for operand in &mut instr.operands {
        match operand {
            crate::ir::Operand::Reg(r) => {
                if resolve(alloc, *r) == Some(target) {
                    *r = Reg::Phys(scratch);
                }
            }
            crate::ir::Operand::Mem(mem) => {
                if let BaseAddr::Reg(r) = mem.base {
                    if resolve(alloc, r) == Some(target) {
                        mem.base = BaseAddr::Reg(Reg::Phys(scratch));
                    }
                }
                if let Some(r) = mem.index {
                    if resolve(alloc, r) == Some(target) {
                        mem.index = Some(Reg::Phys(scratch));
                    }
                }
            }
            _ => {}
        }
    }
}
