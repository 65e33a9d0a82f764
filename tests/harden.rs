//! End-to-end tests driving the full hardening pipeline over
//! hand-constructed functions.

use ropfree::{
    encoder::{InstructionEncoder, X64Encoder},
    harden::{scan, HardenConfig, HardenContext, HardenEngine},
    ir::{
        Function, Instruction, MemOperand, Opcode, Operand, PhysReg, Reg, VirtReg, Width,
    },
    regalloc::{Allocator, LinearAllocator, Resolve},
};

fn process(func: &mut Function, alloc: &mut LinearAllocator) -> HardenContext {
    let engine = HardenEngine::new();
    let mut ctx = HardenContext::with_seed(HardenConfig::default(), 0xDEAD_BEEF);
    engine
        .process_function(func, alloc, &mut ctx)
        .expect("hardening should succeed");
    assert!(
        engine
            .residual_hazards(func, alloc)
            .unwrap()
            .is_empty(),
        "pipeline left residual hazards"
    );
    ctx
}

/// All linked instructions in layout order.
fn all_instrs(func: &Function) -> Vec<Instruction> {
    func.iter_instrs()
        .map(|(_, iid)| func.instr(iid).unwrap().clone())
        .collect()
}

#[test]
fn hazardous_immediate_is_split_and_recombined() {
    let mut func = Function::new("imm");
    let entry = func.entry();
    func.push_instr(
        entry,
        Instruction::ri(Opcode::Mov, Width::B8, PhysReg::Rax, 0x11C3_2244),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    let ctx = process(&mut func, &mut alloc);
    assert_eq!(ctx.stats.evil_immediates, 1);

    // The split halves must reconstruct the original constant.
    let instrs = all_instrs(&func);
    let mov_imm = instrs
        .iter()
        .find_map(|i| match (i.opcode, i.operands.get(1)) {
            (Opcode::Mov, Some(&Operand::Imm(v))) => Some(v),
            _ => None,
        })
        .expect("split lost its load");
    let or_imm = instrs
        .iter()
        .find_map(|i| match (i.opcode, i.operands.get(1)) {
            (Opcode::Or, Some(&Operand::Imm(v))) => Some(v),
            _ => None,
        })
        .expect("split lost its or");
    assert_eq!(mov_imm | or_imm, 0x11C3_2244);
    assert_eq!(mov_imm & or_imm, 0);
}

#[test]
fn hazardous_displacement_is_rebased() {
    let mut func = Function::new("disp");
    let entry = func.entry();
    func.push_instr(
        entry,
        Instruction::rm(
            Opcode::Mov,
            Width::B8,
            PhysReg::Rax,
            MemOperand::base_disp(PhysReg::Rbx, 0xC2),
        ),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    let ctx = process(&mut func, &mut alloc);
    assert_eq!(ctx.stats.evil_immediates, 1);

    // The load now goes through a zero-displacement operand, and the
    // original base register is untouched by the arithmetic.
    let load = all_instrs(&func)
        .into_iter()
        .find(|i| matches!(i.operands.get(1), Some(Operand::Mem(_))))
        .unwrap();
    let Some(Operand::Mem(mem)) = load.operands.get(1) else {
        panic!("load lost its memory operand");
    };
    assert_eq!(mem.disp, 0);
    let writes_rbx = all_instrs(&func).iter().any(|i| {
        !i.is_return()
            && matches!(i.operands.first(), Some(&Operand::Reg(Reg::Phys(PhysReg::Rbx))))
            && !i.opcode.is_compare_like()
    });
    assert!(!writes_rbx, "displacement rewrite must not clobber the base");
}

#[test]
fn register_selection_hazard_is_reassigned() {
    // add %v0, rax with %v0 in rbx encodes 48 01 C3 until %v0 moves.
    let mut func = Function::new("modrm");
    let entry = func.entry();
    let v0 = func.new_vreg();
    func.push_instr(
        entry,
        Instruction::rr(Opcode::Add, Width::B8, v0, PhysReg::Rax),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    alloc.assign(v0, PhysReg::Rbx);
    let ctx = process(&mut func, &mut alloc);

    assert_eq!(ctx.stats.evil_encodings, 1);
    assert_ne!(alloc.physical_of(v0), Some(PhysReg::Rbx));
}

#[test]
fn indirect_call_gets_cookie_check_and_trap() {
    let mut func = Function::new("cfi");
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

    let mut alloc = LinearAllocator::new();
    let ctx = process(&mut func, &mut alloc);

    assert_eq!(ctx.stats.cookie_checks, 1);
    assert_eq!(ctx.stats.ret_protections, 1);
    assert_eq!(func.frame_slots().len(), 1);

    let instrs = all_instrs(&func);
    assert!(instrs.iter().any(|i| i.opcode == Opcode::Hlt));
    assert!(instrs.iter().any(|i| i.opcode == Opcode::Je));
    // The cookie immediate itself scans clean.
    let cookie = instrs
        .iter()
        .find_map(|i| match (i.opcode, i.operands.get(1)) {
            (Opcode::Mov, Some(&Operand::Imm(v))) => Some(v),
            _ => None,
        })
        .expect("cookie load missing");
    assert!(scan(&cookie.to_le_bytes()).is_empty());
}

#[test]
fn mixed_hazards_all_resolve_in_one_run() {
    let mut func = Function::new("mixed");
    let entry = func.entry();
    let v0 = func.new_vreg();
    func.push_instr(
        entry,
        Instruction::ri(Opcode::Mov, Width::B8, PhysReg::Rax, 0xCB00_11C2),
    )
    .unwrap();
    func.push_instr(
        entry,
        Instruction::rr(Opcode::Add, Width::B8, v0, PhysReg::Rax),
    )
    .unwrap();
    func.push_instr(
        entry,
        Instruction::mr(
            Opcode::Movnt,
            Width::B8,
            MemOperand::base(PhysReg::Rdi),
            PhysReg::Rax,
        ),
    )
    .unwrap();
    func.push_instr(
        entry,
        Instruction::new(
            Opcode::CallInd,
            Width::B8,
            vec![Operand::reg(PhysReg::Rsi)],
        ),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    alloc.assign(v0, PhysReg::Rbx);
    let ctx = process(&mut func, &mut alloc);

    assert_eq!(ctx.stats.unhandled, 0);
    assert!(ctx.stats.evil_immediates >= 1);
    assert!(ctx.stats.evil_encodings >= 2);
    assert_eq!(ctx.stats.cookie_checks, 1);
    assert_eq!(ctx.stats.ret_protections, 1);
}

#[test]
fn whole_function_byte_stream_scans_clean() {
    let mut func = Function::new("stream");
    let entry = func.entry();
    func.push_instr(
        entry,
        Instruction::ri(Opcode::Add, Width::B4, PhysReg::Rcx, 0xC3),
    )
    .unwrap();
    func.push_instr(
        entry,
        Instruction::mr(
            Opcode::Mov,
            Width::B8,
            MemOperand::base_disp(PhysReg::Rbx, -0x3D),
            PhysReg::Rax,
        ),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    process(&mut func, &mut alloc);

    // Concatenate every encodable non-transfer instruction and scan the
    // stream as a whole.
    let encoder = X64Encoder::new();
    let mut stream = Vec::new();
    for (_, iid) in func.iter_instrs() {
        let instr = func.instr(iid).unwrap();
        if instr.is_return() || instr.is_call() || instr.is_branch() || instr.is_indirect_branch()
        {
            // A transfer's own bytes are the boundary; flush the stream.
            assert!(scan(&stream).is_empty(), "hazard across instruction seam");
            stream.clear();
            continue;
        }
        stream.extend_from_slice(encoder.encode(instr, &Resolve(&alloc)).bytes());
    }
    assert!(scan(&stream).is_empty());
}

#[test]
fn shared_register_keeps_its_home_after_a_detour() {
    // Block 1 pins every candidate via live-ins, so %v0's hazard is fixed
    // with the scratch detour (which hard-codes rbx); block 2 uses the same
    // %v0 where reassignment would be possible. The mapping must not move.
    let mut func = Function::new("pinned");
    let entry = func.entry();
    let second = func.add_block();
    func.add_edge(entry, second).unwrap();
    let v0 = func.new_vreg();
    func.push_instr(
        entry,
        Instruction::rr(Opcode::Add, Width::B8, v0, PhysReg::Rax),
    )
    .unwrap();
    func.push_instr(
        second,
        Instruction::rr(Opcode::Add, Width::B8, v0, PhysReg::Rax),
    )
    .unwrap();
    func.push_instr(second, Instruction::nullary(Opcode::Ret))
        .unwrap();
    for reg in [
        PhysReg::Rax,
        PhysReg::Rcx,
        PhysReg::Rdx,
        PhysReg::Rsi,
        PhysReg::Rdi,
        PhysReg::R8,
        PhysReg::R9,
        PhysReg::R10,
        PhysReg::R11,
        PhysReg::R12,
        PhysReg::R13,
        PhysReg::R14,
        PhysReg::R15,
    ] {
        func.block_mut(entry).unwrap().add_live_in(reg);
    }

    let mut alloc = LinearAllocator::new();
    alloc.assign(v0, PhysReg::Rbx);
    let ctx = process(&mut func, &mut alloc);

    assert_eq!(alloc.physical_of(v0), Some(PhysReg::Rbx));
    assert_eq!(ctx.stats.unhandled, 0);
}

#[test]
fn frame_relative_displacement_hazard_is_counted() {
    let mut func = Function::new("frame");
    let entry = func.entry();
    let slot = func.create_frame_slot(8, 8);
    let mut mem = MemOperand::frame(slot);
    mem.disp = 0xC3;
    func.push_instr(
        entry,
        Instruction::rm(Opcode::Mov, Width::B8, PhysReg::Rax, mem),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    let ctx = process(&mut func, &mut alloc);
    assert_eq!(ctx.stats.unhandled, 1);
}

#[test]
fn disabled_config_changes_nothing() {
    let mut func = Function::new("off");
    let entry = func.entry();
    func.push_instr(
        entry,
        Instruction::ri(Opcode::Mov, Width::B8, PhysReg::Rax, 0xC3),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();
    let before = all_instrs(&func);

    let mut alloc = LinearAllocator::new();
    let mut ctx = HardenContext::with_seed(HardenConfig::disabled(), 0);
    HardenEngine::new()
        .process_function(&mut func, &mut alloc, &mut ctx)
        .unwrap();

    assert_eq!(all_instrs(&func), before);
    assert_eq!(ctx.stats.total_rewrites(), 0);
}

#[test]
fn same_seed_gives_same_cookie() {
    let build = || {
        let mut func = Function::new("det");
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
        func
    };
    let cookie_of = |func: &Function| {
        all_instrs(func)
            .iter()
            .find_map(|i| match (i.opcode, i.operands.get(1)) {
                (Opcode::Mov, Some(&Operand::Imm(v))) => Some(v),
                _ => None,
            })
            .unwrap()
    };

    let mut a = build();
    let mut b = build();
    let mut alloc = LinearAllocator::new();
    let mut ctx_a = HardenContext::with_seed(HardenConfig::default(), 7);
    let mut ctx_b = HardenContext::with_seed(HardenConfig::default(), 7);
    HardenEngine::new()
        .process_function(&mut a, &mut alloc, &mut ctx_a)
        .unwrap();
    HardenEngine::new()
        .process_function(&mut b, &mut alloc, &mut ctx_b)
        .unwrap();
    assert_eq!(cookie_of(&a), cookie_of(&b));
}

#[test]
fn unmapped_virtual_register_is_tolerated_until_needed() {
    // An unmapped vreg makes the instruction unencodable; policy says
    // unencodable scans clean, so the engine passes it through.
    let mut func = Function::new("unmapped");
    let entry = func.entry();
    func.push_instr(
        entry,
        Instruction::rr(Opcode::Add, Width::B8, VirtReg(0), PhysReg::Rax),
    )
    .unwrap();
    func.push_instr(entry, Instruction::nullary(Opcode::Ret))
        .unwrap();

    let mut alloc = LinearAllocator::new();
    let ctx = process(&mut func, &mut alloc);
    assert_eq!(ctx.stats.evil_encodings, 0);
    assert_eq!(ctx.stats.unhandled, 0);
}
