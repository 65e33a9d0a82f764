//! Operand reconstruction: removing hazards from immediate and
//! displacement fields.
//!
//! Immediates are either split in place (`mov dst, large; or dst, small`)
//! or materialized into a fresh register so the instruction can switch to
//! its register-register form. Hazardous displacements are removed by
//! computing the effective base (`base + disp`) into a fresh register and
//! re-basing the memory operand on it with a zero displacement; the
//! original base register is never modified, so nothing needs restoring.
//!
//! Inserted `or`/`add` instructions clobber the condition flags, so every
//! sequence is bracketed with `pushf`/`popf` when the flags are live at the
//! rewrite point.

use tracing::{debug, warn};

use crate::{
    encoder::InstructionEncoder,
    harden::{
        flags::{needs_flags_save, placement_for, FlagsPlacement},
        scanner::{has_hazard, scan_encoding, HazardKind},
        split::split_value,
        HardenContext,
    },
    ir::{
        BaseAddr, BlockId, Function, Instruction, InstrId, Opcode, Operand, PhysReg, Reg,
        VirtReg, Width,
    },
    regalloc::{Allocator, Resolve},
    Result,
};

/// Rewrites every immediate and displacement hazard in the function.
pub(crate) fn run(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
) -> Result<()> {
    let worklist: Vec<(BlockId, InstrId)> = func.iter_instrs().collect();
    for (block, iid) in worklist {
        let instr = func.instr(iid)?.clone();
        if skip(&instr) {
            continue;
        }
        if instr.references_frame() {
            // Frame slots have no bytes until frame layout runs, so the
            // encoder cannot vouch for them. A hazardous displacement on
            // one is reported and left in place.
            if frame_disp_hazard(&instr) {
                warn!(instr = %instr, "hazardous displacement on a frame-relative operand, left in place");
                ctx.stats.unhandled += 1;
            }
            continue;
        }
        let encoding = encoder.encode(&instr, &Resolve(alloc));
        let hazards = scan_encoding(&encoding);
        if hazards.iter().any(|h| h.kind == HazardKind::Immediate) {
            rewrite_immediate(func, alloc, encoder, ctx, block, iid, &instr)?;
        } else if hazards.iter().any(|h| h.kind == HazardKind::Displacement) {
            rewrite_displacement(func, alloc, encoder, ctx, block, iid, &instr)?;
        }
    }
    Ok(())
}

/// Control transfers are never reconstructed; their hazardous bytes are
/// either the transfer itself or protected elsewhere.
fn skip(instr: &Instruction) -> bool {
    instr.is_return()
        || instr.is_call()
        || instr.is_branch()
        || instr.is_indirect_branch()
}

/// Whether a frame-based memory operand carries a hazard in the bytes of
/// its displacement (judged on the disp32 form the encoder would emit).
fn frame_disp_hazard(instr: &Instruction) -> bool {
    instr.operands.iter().any(|op| match op {
        Operand::Mem(m) => {
            matches!(m.base, BaseAddr::Frame(_)) && has_hazard(&(m.disp as i32).to_le_bytes())
        }
        _ => false,
    })
}

fn rewrite_immediate(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
    block: BlockId,
    iid: InstrId,
    instr: &Instruction,
) -> Result<()> {
    let imm = match instr.operands.iter().find_map(|op| match op {
        Operand::Imm(v) => Some(*v),
        _ => None,
    }) {
        Some(v) => v,
        None => {
            return Err(invariant_error!(
                "immediate hazard in {} without an immediate operand",
                instr
            ))
        }
    };
    let Some(pos) = func.position_of(block, iid) else {
        return Err(crate::Error::InvalidInstr(iid));
    };
    let placement = placement_for(instr, needs_flags_save(func, block, pos + 1));

    if let (Opcode::Mov, Some(&Operand::Reg(dst))) = (instr.opcode, instr.operands.first()) {
        // Register destination: load the constant in place and drop the
        // original move.
        let mut at = pos;
        if placement == FlagsPlacement::SaveRestore {
            func.insert_instr(block, at, Instruction::nullary(Opcode::Pushf))?;
            at += 1;
        }
        let inserted = emit_constant(func, alloc, encoder, ctx, block, at, dst, imm)?;
        if placement == FlagsPlacement::SaveRestore {
            func.insert_instr(block, at + inserted, Instruction::nullary(Opcode::Popf))?;
        }
        func.remove_instr(block, iid)?;
        ctx.stats.evil_immediates += 1;
        debug!(instr = %instr, "split hazardous move immediate");
        return Ok(());
    }

    if !instr.opcode.has_rr_form() {
        warn!(instr = %instr, "immediate hazard with no register form, left in place");
        ctx.stats.unhandled += 1;
        return Ok(());
    }

    // Materialize the constant and switch the instruction to its
    // register form.
    let Some(vreg) = fresh_vreg(func, alloc, block, ctx) else {
        warn!(instr = %instr, "no free register to materialize immediate, left in place");
        ctx.stats.unhandled += 1;
        return Ok(());
    };
    let mut at = pos;
    if placement == FlagsPlacement::SaveRestore {
        func.insert_instr(block, at, Instruction::nullary(Opcode::Pushf))?;
        at += 1;
    }
    let inserted = emit_constant(func, alloc, encoder, ctx, block, at, Reg::Virt(vreg), imm)?;
    if placement == FlagsPlacement::SaveRestore {
        func.insert_instr(block, at + inserted, Instruction::nullary(Opcode::Popf))?;
    }
    for operand in &mut func.instr_mut(iid)?.operands {
        if matches!(operand, Operand::Imm(_)) {
            *operand = Operand::Reg(Reg::Virt(vreg));
        }
    }
    ctx.stats.evil_immediates += 1;
    debug!(instr = %instr, vreg = %vreg, "materialized hazardous immediate");
    Ok(())
}

fn rewrite_displacement(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
    block: BlockId,
    iid: InstrId,
    instr: &Instruction,
) -> Result<()> {
    let Some((mem_index, mem)) = instr.operands.iter().enumerate().find_map(|(i, op)| match op
    {
        Operand::Mem(m) => Some((i, *m)),
        _ => None,
    }) else {
        return Err(invariant_error!(
            "displacement hazard in {} without a memory operand",
            instr
        ));
    };
    let BaseAddr::Reg(base) = mem.base else {
        warn!(instr = %instr, "hazardous displacement without a base register, left in place");
        ctx.stats.unhandled += 1;
        return Ok(());
    };

    let Some(pos) = func.position_of(block, iid) else {
        return Err(crate::Error::InvalidInstr(iid));
    };
    let placement = placement_for(instr, needs_flags_save(func, block, pos + 1));
    let rsp_based = base == Reg::Phys(PhysReg::Rsp);
    if rsp_based && placement == FlagsPlacement::SaveRestore {
        // pushf would shift the stack pointer under the rewrite.
        warn!(instr = %instr, "stack-relative hazardous displacement with live flags, left in place");
        ctx.stats.unhandled += 1;
        return Ok(());
    }

    let Some(sum) = fresh_vreg(func, alloc, block, ctx) else {
        warn!(instr = %instr, "no free register to re-base displacement, left in place");
        ctx.stats.unhandled += 1;
        return Ok(());
    };

    let mut at = pos;
    if placement == FlagsPlacement::SaveRestore {
        func.insert_instr(block, at, Instruction::nullary(Opcode::Pushf))?;
        at += 1;
    }
    let inserted = emit_constant(
        func,
        alloc,
        encoder,
        ctx,
        block,
        at,
        Reg::Virt(sum),
        mem.disp,
    )?;
    func.insert_instr(
        block,
        at + inserted,
        Instruction::rr(Opcode::Add, Width::B8, Reg::Virt(sum), base),
    )?;
    if placement == FlagsPlacement::SaveRestore {
        func.insert_instr(block, at + inserted + 1, Instruction::nullary(Opcode::Popf))?;
    }

    let rewritten = func.instr_mut(iid)?;
    if let Operand::Mem(m) = &mut rewritten.operands[mem_index] {
        m.base = BaseAddr::Reg(Reg::Virt(sum));
        m.disp = 0;
    }
    ctx.stats.evil_immediates += 1;
    debug!(instr = %instr, sum = %sum, "re-based hazardous displacement");
    Ok(())
}

/// Loads `value` into `dst` at `at`, splitting it when its bytes are
/// hazardous. Returns the number of instructions inserted.
fn emit_constant(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    encoder: &dyn InstructionEncoder,
    ctx: &mut HardenContext,
    block: BlockId,
    at: usize,
    dst: Reg,
    value: i64,
) -> Result<usize> {
    let mov = Instruction::ri(Opcode::Mov, Width::B8, dst, value);
    let encoding = encoder.encode(&mov, &Resolve(alloc));
    if scan_encoding(&encoding).is_empty() {
        func.insert_instr(block, at, mov)?;
        return Ok(1);
    }

    let Some(split) = split_value(value, Width::B8) else {
        warn!(value = format_args!("{value:#x}"), "constant does not split cleanly, left in place");
        ctx.stats.unhandled += 1;
        func.insert_instr(block, at, mov)?;
        return Ok(1);
    };

    func.insert_instr(
        block,
        at,
        Instruction::ri(Opcode::Mov, Width::B8, dst, split.large),
    )?;
    if split.small_fits_or_imm(Width::B8) {
        func.insert_instr(
            block,
            at + 1,
            Instruction::ri(Opcode::Or, Width::B8, dst, split.small),
        )?;
        Ok(2)
    } else {
        let Some(aux) = fresh_vreg(func, alloc, block, ctx) else {
            warn!("no free register for wide split half, constant left in place");
            ctx.stats.unhandled += 1;
            // Back out the partial load.
            let partial = func.block(block)?.instrs()[at];
            func.remove_instr(block, partial)?;
            func.insert_instr(block, at, mov)?;
            return Ok(1);
        };
        func.insert_instr(
            block,
            at + 1,
            Instruction::ri(Opcode::Mov, Width::B8, Reg::Virt(aux), split.small),
        )?;
        func.insert_instr(
            block,
            at + 2,
            Instruction::rr(Opcode::Or, Width::B8, dst, Reg::Virt(aux)),
        )?;
        Ok(3)
    }
}

/// Creates a virtual register and binds it to a non-interfering physical
/// home, or `None` when the block leaves no register free.
fn fresh_vreg(
    func: &mut Function,
    alloc: &mut dyn Allocator,
    block: BlockId,
    _ctx: &mut HardenContext,
) -> Option<VirtReg> {
    let vreg = func.new_vreg();
    let home = alloc
        .candidates(vreg)
        .into_iter()
        .find(|&reg| !alloc.interferes(func, block, vreg, reg))?;
    alloc.bind_fresh(vreg, home);
    Some(vreg)
}
