//! Control-flow-integrity instrumentation.
//!
//! Indirect calls and jumps are guarded by a per-function cookie: the entry
//! block stores `cookie ^ secret` into a dedicated frame slot, and a
//! five-instruction check recomputes the secret from the slot right before
//! every indirect transfer, trapping on mismatch. Return addresses are
//! obfuscated by XOR-ing the stack slot with the thread-local secret both
//! at entry and immediately before every return or function-leaving tail
//! jump, so a raw return address never sits on the stack mid-function.
//!
//! The instrumenter is an explicit four-phase machine: `Scan` collects the
//! transfer sites, `InsertChecks` plants the check idiom, `InsertCookie`
//! builds the entry store, and `Splice` relocates each idiom next to its
//! transfer and wires the `je ok / hlt` diamond. Phases run strictly in
//! that order.

use rand::{rngs::StdRng, Rng};
use tracing::debug;

use crate::{
    harden::{scanner::has_hazard, HardenContext},
    ir::{
        BaseAddr, BlockId, FrameSlotId, Function, Instruction, InstrId, MemOperand, Opcode,
        Operand, PhysReg, Reg, Width,
    },
    Result,
};

/// The instrumentation phase currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiPhase {
    /// Collecting indirect transfers and return sites.
    Scan,
    /// Planting the check idiom ahead of each indirect transfer.
    InsertChecks,
    /// Building the cookie store in the entry block.
    InsertCookie,
    /// Relocating idioms and wiring the trap diamond.
    Splice,
}

const IDIOM_LEN: usize = 5;

/// Draws cookie values until one encodes without hazardous bytes.
pub(crate) fn generate_safe_cookie(rng: &mut StdRng) -> i64 {
    loop {
        let value: i64 = rng.gen();
        if !has_hazard(&value.to_le_bytes()) {
            return value;
        }
    }
}

/// Runs the full instrumentation over one function.
pub(crate) fn run(func: &mut Function, ctx: &mut HardenContext) -> Result<()> {
    let mut phase = CfiPhase::Scan;
    debug!(function = %func.name, ?phase, "instrumenting");

    let transfers: Vec<(BlockId, InstrId)> = func
        .iter_instrs()
        .filter(|&(_, iid)| {
            func.instr(iid)
                .map(|i| i.is_indirect_call() || i.is_indirect_branch())
                .unwrap_or(false)
        })
        .collect();

    if !transfers.is_empty() {
        let slot = func.create_frame_slot(8, 8);
        let cookie = generate_safe_cookie(&mut ctx.rng);

        phase = CfiPhase::InsertChecks;
        debug!(function = %func.name, ?phase, sites = transfers.len(), "planting checks");
        for &(block, iid) in &transfers {
            insert_check(func, block, iid, cookie, slot, ctx.config.secret_offset)?;
            ctx.stats.cookie_checks += 1;
        }

        phase = CfiPhase::InsertCookie;
        debug!(function = %func.name, ?phase, "storing cookie");
        insert_cookie_store(func, cookie, slot, ctx.config.secret_offset)?;

        phase = CfiPhase::Splice;
        debug!(function = %func.name, ?phase, "wiring traps");
        for &(_, iid) in &transfers {
            splice(func, iid)?;
        }
    }

    protect_returns(func, ctx)?;
    Ok(())
}

/// The five-instruction check: recompute the secret from the slot and
/// compare against the live thread-local value. `r11` is preserved around
/// the check because the transfer may carry arguments in it.
fn check_idiom(cookie: i64, slot: FrameSlotId, secret_offset: i64) -> [Instruction; IDIOM_LEN] {
    [
        Instruction::push(PhysReg::R11),
        Instruction::ri(Opcode::Mov, Width::B8, PhysReg::R11, cookie),
        Instruction::rm(
            Opcode::Xor,
            Width::B8,
            PhysReg::R11,
            bracket_adjust(MemOperand::frame(slot)),
        ),
        Instruction::rm(
            Opcode::Cmp,
            Width::B8,
            PhysReg::R11,
            MemOperand::fs(secret_offset),
        ),
        Instruction::pop(PhysReg::R11),
    ]
}

/// Compensates a stack-pointer-relative slot address for the `push r11`
/// that precedes it inside the check.
fn bracket_adjust(mut mem: MemOperand) -> MemOperand {
    if mem.base == BaseAddr::Reg(Reg::Phys(PhysReg::Rsp)) {
        mem.disp += 8;
    }
    mem
}

fn insert_check(
    func: &mut Function,
    block: BlockId,
    transfer: InstrId,
    cookie: i64,
    slot: FrameSlotId,
    secret_offset: i64,
) -> Result<()> {
    let Some(pos) = func.position_of(block, transfer) else {
        return Err(crate::Error::InvalidInstr(transfer));
    };
    let idiom = check_idiom(cookie, slot, secret_offset);
    for (i, instr) in idiom.into_iter().enumerate() {
        func.insert_instr(block, pos + i, instr)?;
    }
    Ok(())
}

fn insert_cookie_store(
    func: &mut Function,
    cookie: i64,
    slot: FrameSlotId,
    secret_offset: i64,
) -> Result<()> {
    let entry = func.entry();
    let store = [
        Instruction::ri(Opcode::Mov, Width::B8, PhysReg::R11, cookie),
        Instruction::rm(
            Opcode::Xor,
            Width::B8,
            PhysReg::R11,
            MemOperand::fs(secret_offset),
        ),
        Instruction::mr(
            Opcode::Mov,
            Width::B8,
            MemOperand::frame(slot),
            PhysReg::R11,
        ),
        // Wipe the scratch so the masked cookie never leaks into a
        // caller-visible register.
        Instruction::rr(Opcode::Xor, Width::B8, PhysReg::R11, PhysReg::R11),
    ];
    for (i, instr) in store.into_iter().enumerate() {
        func.insert_instr(entry, i, instr)?;
    }
    Ok(())
}

/// Whether the `count` instructions ending at `end` (exclusive) form the
/// check idiom.
fn is_idiom_at(func: &Function, instrs: &[InstrId], end: usize) -> bool {
    if end < IDIOM_LEN {
        return false;
    }
    let window = &instrs[end - IDIOM_LEN..end];
    let opcode = |i: usize| func.instr(window[i]).map(|ins| ins.opcode);
    matches!(opcode(0), Ok(Opcode::Push))
        && matches!(opcode(1), Ok(Opcode::Mov))
        && matches!(opcode(2), Ok(Opcode::Xor))
        && matches!(opcode(3), Ok(Opcode::Cmp))
        && matches!(opcode(4), Ok(Opcode::Pop))
}

/// Finds the check idiom guarding the transfer at `pos` in `block`:
/// backward through the block, then one hop into a unique predecessor.
/// Returns the owning block and the idiom's start index.
pub(crate) fn find_idiom(
    func: &Function,
    block: BlockId,
    pos: usize,
) -> Result<Option<(BlockId, usize)>> {
    let instrs = func.block(block)?.instrs();
    for end in (IDIOM_LEN..=pos.min(instrs.len())).rev() {
        if is_idiom_at(func, instrs, end) {
            return Ok(Some((block, end - IDIOM_LEN)));
        }
    }

    let preds: Vec<BlockId> = func
        .layout()
        .iter()
        .copied()
        .filter(|&b| {
            func.block(b)
                .map(|blk| blk.successors().contains(&block))
                .unwrap_or(false)
        })
        .collect();
    if let [pred] = preds.as_slice() {
        let instrs = func.block(*pred)?.instrs();
        for end in (IDIOM_LEN..=instrs.len()).rev() {
            if is_idiom_at(func, instrs, end) {
                return Ok(Some((*pred, end - IDIOM_LEN)));
            }
        }
    }
    Ok(None)
}

/// The block currently holding a linked instruction. Earlier splices may
/// have moved the transfer out of the block it was scanned in.
fn locate(func: &Function, iid: InstrId) -> Option<(BlockId, usize)> {
    func.layout().iter().find_map(|&block| {
        func.position_of(block, iid).map(|pos| (block, pos))
    })
}

/// Moves the idiom adjacent to its transfer (when needed), splits the block
/// ahead of the transfer and wires `je ok / hlt`.
fn splice(func: &mut Function, transfer: InstrId) -> Result<()> {
    let Some((block, pos)) = locate(func, transfer) else {
        return Err(crate::Error::InvalidInstr(transfer));
    };
    let Some((idiom_block, start)) = find_idiom(func, block, pos)? else {
        return Err(invariant_error!(
            "no check idiom found for guarded transfer at {block}"
        ));
    };

    let adjacent = idiom_block == block && start + IDIOM_LEN == pos;
    if !adjacent {
        let ids = func.take_range(idiom_block, start, start + IDIOM_LEN)?;
        let Some(pos) = func.position_of(block, transfer) else {
            return Err(crate::Error::InvalidInstr(transfer));
        };
        func.block_mut(block)?.instrs.splice(pos..pos, ids);
    }

    let Some(pos) = func.position_of(block, transfer) else {
        return Err(crate::Error::InvalidInstr(transfer));
    };
    let ok_block = func.split_block(block, pos)?;
    let trap = func.add_block_after(block)?;
    func.push_instr(
        block,
        Instruction::new(Opcode::Je, Width::B8, vec![Operand::Label(ok_block)]),
    )?;
    func.push_instr(trap, Instruction::nullary(Opcode::Hlt))?;
    func.add_edge(block, ok_block)?;
    func.add_edge(block, trap)?;
    Ok(())
}

/// Inserts the return-address obfuscation ahead of every return and
/// function-leaving tail jump, plus the matching entry sequence.
fn protect_returns(func: &mut Function, ctx: &mut HardenContext) -> Result<()> {
    let sites: Vec<(BlockId, InstrId)> = func
        .iter_instrs()
        .filter(|&(_, iid)| {
            func.instr(iid)
                .map(|i| i.is_return() || i.is_tail_jump())
                .unwrap_or(false)
        })
        .collect();
    if sites.is_empty() {
        return Ok(());
    }

    let secret = ctx.config.secret_offset;
    for (block, iid) in sites {
        let Some(pos) = func.position_of(block, iid) else {
            return Err(crate::Error::InvalidInstr(iid));
        };
        let mut at = pos;
        for _ in 0..ctx.config.nop_sled_len {
            func.insert_instr(block, at, Instruction::nullary(Opcode::Nop))?;
            at += 1;
        }
        func.insert_instr(
            block,
            at,
            Instruction::rm(Opcode::Mov, Width::B8, PhysReg::R11, MemOperand::fs(secret)),
        )?;
        func.insert_instr(
            block,
            at + 1,
            Instruction::mr(
                Opcode::Xor,
                Width::B8,
                MemOperand::base(PhysReg::Rsp),
                PhysReg::R11,
            ),
        )?;
        ctx.stats.ret_protections += 1;
    }

    // The entry decodes what the epilogues encode. No sled here; the
    // function's own entry is already a valid jump target.
    let old_entry = func.entry();
    let prologue = func.add_block_before(old_entry)?;
    func.push_instr(
        prologue,
        Instruction::rm(Opcode::Mov, Width::B8, PhysReg::R11, MemOperand::fs(secret)),
    )?;
    func.push_instr(
        prologue,
        Instruction::mr(
            Opcode::Xor,
            Width::B8,
            MemOperand::base(PhysReg::Rsp),
            PhysReg::R11,
        ),
    )?;
    func.add_edge(prologue, old_entry)?;
    func.set_entry(prologue);
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use crate::harden::HardenConfig;

    use super::*;

    fn instrument(func: &mut Function) -> HardenContext {
        let mut ctx = HardenContext::with_seed(HardenConfig::default(), 42);
        run(func, &mut ctx).unwrap();
        ctx
    }

    fn opcodes_of(func: &Function, block: BlockId) -> Vec<Opcode> {
        func.block(block)
            .unwrap()
            .instrs()
            .iter()
            .map(|&iid| func.instr(iid).unwrap().opcode)
            .collect()
    }

    #[test]
    fn cookies_never_carry_hazard_bytes() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..256 {
            let cookie = generate_safe_cookie(&mut rng);
            assert!(!has_hazard(&cookie.to_le_bytes()));
        }
    }

    #[test]
    fn guards_indirect_call_with_trap_diamond() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(
            entry,
            Instruction::new(
                Opcode::CallInd,
                Width::B8,
                vec![Operand::reg(PhysReg::Rax)],
            ),
        )
        .unwrap();
        func.push_instr(entry, Instruction::nullary(Opcode::Ret))
            .unwrap();

        let ctx = instrument(&mut func);
        assert_eq!(ctx.stats.cookie_checks, 1);
        assert_eq!(ctx.stats.ret_protections, 1);
        assert_eq!(func.frame_slots().len(), 1);

        // entry block: cookie store, idiom, then je into the ok block.
        let ops = opcodes_of(&func, entry);
        assert_eq!(
            ops,
            vec![
                Opcode::Mov,
                Opcode::Xor,
                Opcode::Mov,
                Opcode::Xor,
                Opcode::Push,
                Opcode::Mov,
                Opcode::Xor,
                Opcode::Cmp,
                Opcode::Pop,
                Opcode::Je,
            ]
        );

        // The je target holds the transfer; the fallthrough traps.
        let je = *func.block(entry).unwrap().instrs().last().unwrap();
        let Operand::Label(ok_block) = func.instr(je).unwrap().operands[0] else {
            panic!("je lost its label");
        };
        assert_eq!(opcodes_of(&func, ok_block)[0], Opcode::CallInd);
        let layout_pos = func
            .layout()
            .iter()
            .position(|&b| b == entry)
            .unwrap();
        let trap = func.layout()[layout_pos + 1];
        assert_eq!(opcodes_of(&func, trap), vec![Opcode::Hlt]);
        assert!(func.block(entry).unwrap().successors().contains(&trap));
        assert!(func.block(entry).unwrap().successors().contains(&ok_block));
    }

    #[test]
    fn plain_function_only_gets_return_protection() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(
            entry,
            Instruction::rr(Opcode::Mov, Width::B8, PhysReg::Rax, PhysReg::Rdi),
        )
        .unwrap();
        func.push_instr(entry, Instruction::nullary(Opcode::Ret))
            .unwrap();

        let ctx = instrument(&mut func);
        assert_eq!(ctx.stats.cookie_checks, 0);
        assert_eq!(ctx.stats.ret_protections, 1);
        assert!(func.frame_slots().is_empty());

        // Sled + decode sequence sits right before the return.
        let ops = opcodes_of(&func, entry);
        let ret_at = ops.len() - 1;
        assert_eq!(ops[ret_at], Opcode::Ret);
        assert_eq!(ops[ret_at - 1], Opcode::Xor);
        assert_eq!(ops[ret_at - 2], Opcode::Mov);
        assert_eq!(
            ops[ret_at - 11..ret_at - 2],
            [Opcode::Nop; 9]
        );

        // The prologue block decodes the return address on entry.
        let prologue = func.entry();
        assert_ne!(prologue, entry);
        assert_eq!(func.layout()[0], prologue);
        assert_eq!(
            opcodes_of(&func, prologue),
            vec![Opcode::Mov, Opcode::Xor]
        );
    }

    #[test]
    fn tail_jump_out_is_protected() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(
            entry,
            Instruction::new(Opcode::Jmp, Width::B8, vec![Operand::Sym("memcpy".into())]),
        )
        .unwrap();

        let ctx = instrument(&mut func);
        assert_eq!(ctx.stats.ret_protections, 1);
    }

    #[test]
    fn functions_without_returns_get_no_prologue() {
        let mut func = Function::new("f");
        let entry = func.entry();
        func.push_instr(
            entry,
            Instruction::new(
                Opcode::Jmp,
                Width::B8,
                vec![Operand::Label(entry)],
            ),
        )
        .unwrap();

        let ctx = instrument(&mut func);
        assert_eq!(ctx.stats.ret_protections, 0);
        assert_eq!(func.entry(), entry);
    }

    #[test]
    fn idiom_found_one_predecessor_away() {
        let mut func = Function::new("f");
        let entry = func.entry();
        let next = func.add_block();
        func.add_edge(entry, next).unwrap();
        for instr in check_idiom(0x1111, FrameSlotId(0), 0x28) {
            func.push_instr(entry, instr).unwrap();
        }
        func.push_instr(
            next,
            Instruction::new(
                Opcode::CallInd,
                Width::B8,
                vec![Operand::reg(PhysReg::Rax)],
            ),
        )
        .unwrap();

        let found = find_idiom(&func, next, 0).unwrap();
        assert_eq!(found, Some((entry, 0)));
    }

    #[test]
    fn stack_relative_slot_is_bumped_past_the_push() {
        let mem = bracket_adjust(MemOperand::base_disp(PhysReg::Rsp, 0x10));
        assert_eq!(mem.disp, 0x18);
        let frame = bracket_adjust(MemOperand::frame(FrameSlotId(0)));
        assert_eq!(frame.disp, 0);
    }
}
