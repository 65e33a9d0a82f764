//! x86-64 instruction encoder.
//!
//! Table-free, match-driven encoding with manual REX / ModR/M / SIB
//! construction. Only the integer and memory operand classes the hardening
//! engine reasons about are covered; anything else encodes as empty.
//!
//! Relative branch targets (labels, direct call symbols) are emitted with a
//! zeroed placeholder displacement - layout happens after this engine runs,
//! and a zero placeholder keeps encoding deterministic.

use crate::{
    encoder::{Encoding, InstructionEncoder, RegResolver},
    ir::{BaseAddr, Instruction, MemOperand, Opcode, Operand, PhysReg, Reg, Segment, Width},
};

/// The concrete encoder for x86-64 long mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Encoder;

impl X64Encoder {
    /// Creates an encoder.
    #[must_use]
    pub fn new() -> Self {
        X64Encoder
    }
}

impl InstructionEncoder for X64Encoder {
    fn encode(&self, instr: &Instruction, regs: &dyn RegResolver) -> Encoding {
        encode_instr(instr, regs).unwrap_or_default()
    }
}

/// Build a REX prefix byte.
#[inline]
fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    let mut val: u8 = 0x40;
    if w {
        val |= 0x08;
    }
    if r {
        val |= 0x04;
    }
    if x {
        val |= 0x02;
    }
    if b {
        val |= 0x01;
    }
    val
}

/// Build a ModR/M byte.
#[inline]
fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Build a SIB byte.
#[inline]
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    let ss = match scale {
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 0,
    };
    (ss << 6) | ((index & 7) << 3) | (base & 7)
}

/// A memory operand with every register resolved to a physical one.
struct ResolvedMem {
    base: Option<PhysReg>,
    index: Option<PhysReg>,
    scale: u8,
    disp: i64,
    segment: Option<Segment>,
}

fn phys(reg: Reg, regs: &dyn RegResolver) -> Option<PhysReg> {
    match reg {
        Reg::Phys(p) => Some(p),
        Reg::Virt(v) => regs.resolve(v),
    }
}

fn resolve_mem(mem: &MemOperand, regs: &dyn RegResolver) -> Option<ResolvedMem> {
    let base = match mem.base {
        BaseAddr::None => None,
        BaseAddr::Reg(r) => Some(phys(r, regs)?),
        // Frame slots have no displacement until frame layout runs.
        BaseAddr::Frame(_) => return None,
    };
    let index = match mem.index {
        Some(r) => Some(phys(r, regs)?),
        None => None,
    };
    Some(ResolvedMem {
        base,
        index,
        scale: mem.scale,
        disp: mem.disp,
        segment: mem.segment,
    })
}

fn fits_i8(value: i64) -> bool {
    i8::try_from(value).is_ok()
}

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

/// Emit segment, operand-size and REX prefixes for a reg/mem operation.
fn emit_prefixes(
    enc: &mut Encoding,
    width: Width,
    reg_ext: bool,
    mem: Option<&ResolvedMem>,
    rm_reg: Option<PhysReg>,
) {
    if let Some(seg) = mem.and_then(|m| m.segment) {
        enc.push(match seg {
            Segment::Fs => 0x64,
            Segment::Gs => 0x65,
        });
    }
    if width == Width::B2 {
        enc.push(0x66);
    }
    let w = width == Width::B8;
    let x = mem.and_then(|m| m.index).is_some_and(PhysReg::is_extended);
    let b = mem
        .and_then(|m| m.base)
        .or(rm_reg)
        .is_some_and(PhysReg::is_extended);
    if w || reg_ext || x || b {
        enc.push(rex(w, reg_ext, x, b));
    }
}

/// Emit ModR/M + SIB + displacement for a memory operand.
fn emit_mem_modrm(enc: &mut Encoding, reg_field: u8, mem: &ResolvedMem) -> Option<()> {
    if !fits_i32(mem.disp) {
        return None;
    }
    let disp32 = mem.disp as i32;

    match (mem.base, mem.index) {
        // Absolute: [disp32] needs a SIB with no base, no index.
        (None, None) => {
            enc.push(modrm(0b00, reg_field, 0b100));
            enc.push(sib(1, 0b100, 0b101));
            enc.extend(&disp32.to_le_bytes());
            enc.mark_disp(4);
        }
        // Index-only: mod=00, SIB base=101 means "disp32 follows".
        (None, Some(idx)) => {
            enc.push(modrm(0b00, reg_field, 0b100));
            enc.push(sib(mem.scale, idx.base_code(), 0b101));
            enc.extend(&disp32.to_le_bytes());
            enc.mark_disp(4);
        }
        (Some(base), index) => {
            // RSP/R12 as base always require a SIB byte.
            let need_sib = index.is_some() || base.base_code() == 4;
            // RBP/R13 as base cannot use mod=00.
            let (mod_bits, disp_size) = if mem.disp == 0 && base.base_code() != 5 {
                (0b00, 0)
            } else if fits_i8(mem.disp) {
                (0b01, 1)
            } else {
                (0b10, 4)
            };
            if need_sib {
                let idx_code = index.map_or(0b100, PhysReg::base_code);
                enc.push(modrm(mod_bits, reg_field, 0b100));
                enc.push(sib(mem.scale, idx_code, base.base_code()));
            } else {
                enc.push(modrm(mod_bits, reg_field, base.base_code()));
            }
            match disp_size {
                1 => {
                    enc.push(disp32 as i8 as u8);
                    enc.mark_disp(1);
                }
                4 => {
                    enc.extend(&disp32.to_le_bytes());
                    enc.mark_disp(4);
                }
                _ => {}
            }
        }
    }
    Some(())
}

/// Emit an immediate of the data width (capped at imm32 for 64-bit ops).
fn emit_imm(enc: &mut Encoding, width: Width, imm: i64) -> Option<()> {
    match width {
        Width::B1 => {
            enc.push(i8::try_from(imm).ok()? as u8);
            enc.mark_imm(1);
        }
        Width::B2 => {
            enc.extend(&i16::try_from(imm).ok()?.to_le_bytes());
            enc.mark_imm(2);
        }
        Width::B4 | Width::B8 => {
            enc.extend(&i32::try_from(imm).ok()?.to_le_bytes());
            enc.mark_imm(4);
        }
    }
    Some(())
}

/// ALU opcode table: (memory-register opcode byte, /digit for immediates).
fn alu_codes(opcode: Opcode) -> Option<(u8, u8)> {
    Some(match opcode {
        Opcode::Add => (0x01, 0),
        Opcode::Or => (0x09, 1),
        Opcode::Adc => (0x11, 2),
        Opcode::Sbb => (0x19, 3),
        Opcode::And => (0x21, 4),
        Opcode::Sub => (0x29, 5),
        Opcode::Xor => (0x31, 6),
        Opcode::Cmp => (0x39, 7),
        _ => return None,
    })
}

#[allow(clippy::too_many_lines)]
fn encode_instr(instr: &Instruction, regs: &dyn RegResolver) -> Option<Encoding> {
    let mut enc = Encoding::default();
    let width = instr.width;
    let ops = instr.operands.as_slice();

    match instr.opcode {
        Opcode::Nop => enc.push(0x90),
        Opcode::Hlt => enc.push(0xF4),
        Opcode::Pushf => enc.push(0x9C),
        Opcode::Popf => enc.push(0x9D),
        Opcode::Ret => enc.push(0xC3),
        Opcode::RetImm => {
            let Some(Operand::Imm(imm)) = ops.first() else {
                return None;
            };
            enc.push(0xC2);
            enc.extend(&u16::try_from(*imm).ok()?.to_le_bytes());
            enc.mark_imm(2);
        }
        Opcode::Push | Opcode::Pop => {
            let Some(Operand::Reg(r)) = ops.first() else {
                return None;
            };
            let reg = phys(*r, regs)?;
            if reg.is_extended() {
                enc.push(rex(false, false, false, true));
            }
            let base = if instr.opcode == Opcode::Push {
                0x50
            } else {
                0x58
            };
            enc.push(base + reg.base_code());
        }
        Opcode::Call => {
            enc.push(0xE8);
            enc.extend(&[0, 0, 0, 0]);
        }
        Opcode::Jmp => {
            enc.push(0xE9);
            enc.extend(&[0, 0, 0, 0]);
        }
        Opcode::Je => {
            enc.extend(&[0x0F, 0x84, 0, 0, 0, 0]);
        }
        Opcode::CallInd | Opcode::JmpInd => {
            let digit = if instr.opcode == Opcode::CallInd { 2 } else { 4 };
            match ops.first()? {
                Operand::Reg(r) => {
                    let reg = phys(*r, regs)?;
                    if reg.is_extended() {
                        enc.push(rex(false, false, false, true));
                    }
                    enc.push(0xFF);
                    enc.push(modrm(0b11, digit, reg.base_code()));
                }
                Operand::Mem(mem) => {
                    let mem = resolve_mem(mem, regs)?;
                    emit_prefixes(&mut enc, Width::B4, false, Some(&mem), None);
                    enc.push(0xFF);
                    emit_mem_modrm(&mut enc, digit, &mem)?;
                }
                _ => return None,
            }
        }
        Opcode::Bswap => {
            let Some(Operand::Reg(r)) = ops.first() else {
                return None;
            };
            let reg = phys(*r, regs)?;
            let w = width == Width::B8;
            if w || reg.is_extended() {
                enc.push(rex(w, false, false, reg.is_extended()));
            }
            enc.push(0x0F);
            enc.push(0xC8 + reg.base_code());
        }
        Opcode::Lea => {
            let (Some(Operand::Reg(dst)), Some(Operand::Mem(mem))) = (ops.first(), ops.get(1))
            else {
                return None;
            };
            let dst = phys(*dst, regs)?;
            let mem = resolve_mem(mem, regs)?;
            emit_prefixes(&mut enc, width, dst.is_extended(), Some(&mem), None);
            enc.push(0x8D);
            emit_mem_modrm(&mut enc, dst.base_code(), &mem)?;
        }
        Opcode::Movnt => {
            let (Some(Operand::Mem(mem)), Some(Operand::Reg(src))) = (ops.first(), ops.get(1))
            else {
                return None;
            };
            let src = phys(*src, regs)?;
            let mem = resolve_mem(mem, regs)?;
            emit_prefixes(&mut enc, width, src.is_extended(), Some(&mem), None);
            enc.push(0x0F);
            enc.push(0xC3);
            emit_mem_modrm(&mut enc, src.base_code(), &mem)?;
        }
        Opcode::Mov => match (ops.first()?, ops.get(1)?) {
            (Operand::Reg(dst), Operand::Imm(imm)) => {
                let dst = phys(*dst, regs)?;
                emit_prefixes(&mut enc, width, false, None, Some(dst));
                match width {
                    Width::B1 => {
                        enc.push(0xB0 + dst.base_code());
                        enc.push(i8::try_from(*imm).ok()? as u8);
                        enc.mark_imm(1);
                    }
                    Width::B2 => {
                        enc.push(0xB8 + dst.base_code());
                        enc.extend(&i16::try_from(*imm).ok()?.to_le_bytes());
                        enc.mark_imm(2);
                    }
                    Width::B4 => {
                        enc.push(0xB8 + dst.base_code());
                        enc.extend(&i32::try_from(*imm).ok()?.to_le_bytes());
                        enc.mark_imm(4);
                    }
                    Width::B8 => {
                        enc.push(0xB8 + dst.base_code());
                        enc.extend(&imm.to_le_bytes());
                        enc.mark_imm(8);
                    }
                }
            }
            (Operand::Reg(dst), Operand::Reg(src)) => {
                let dst = phys(*dst, regs)?;
                let src = phys(*src, regs)?;
                emit_prefixes(&mut enc, width, src.is_extended(), None, Some(dst));
                enc.push(if width == Width::B1 { 0x88 } else { 0x89 });
                enc.push(modrm(0b11, src.base_code(), dst.base_code()));
            }
            (Operand::Mem(mem), Operand::Reg(src)) => {
                let src = phys(*src, regs)?;
                let mem = resolve_mem(mem, regs)?;
                emit_prefixes(&mut enc, width, src.is_extended(), Some(&mem), None);
                enc.push(if width == Width::B1 { 0x88 } else { 0x89 });
                emit_mem_modrm(&mut enc, src.base_code(), &mem)?;
            }
            (Operand::Reg(dst), Operand::Mem(mem)) => {
                let dst = phys(*dst, regs)?;
                let mem = resolve_mem(mem, regs)?;
                emit_prefixes(&mut enc, width, dst.is_extended(), Some(&mem), None);
                enc.push(if width == Width::B1 { 0x8A } else { 0x8B });
                emit_mem_modrm(&mut enc, dst.base_code(), &mem)?;
            }
            (Operand::Mem(mem), Operand::Imm(imm)) => {
                let mem = resolve_mem(mem, regs)?;
                emit_prefixes(&mut enc, width, false, Some(&mem), None);
                enc.push(if width == Width::B1 { 0xC6 } else { 0xC7 });
                emit_mem_modrm(&mut enc, 0, &mem)?;
                emit_imm(&mut enc, width, *imm)?;
            }
            _ => return None,
        },
        Opcode::Test => match (ops.first()?, ops.get(1)?) {
            (Operand::Reg(dst), Operand::Reg(src)) => {
                let dst = phys(*dst, regs)?;
                let src = phys(*src, regs)?;
                emit_prefixes(&mut enc, width, src.is_extended(), None, Some(dst));
                enc.push(if width == Width::B1 { 0x84 } else { 0x85 });
                enc.push(modrm(0b11, src.base_code(), dst.base_code()));
            }
            (Operand::Reg(dst), Operand::Imm(imm)) => {
                let dst = phys(*dst, regs)?;
                emit_prefixes(&mut enc, width, false, None, Some(dst));
                enc.push(if width == Width::B1 { 0xF6 } else { 0xF7 });
                enc.push(modrm(0b11, 0, dst.base_code()));
                emit_imm(&mut enc, width, *imm)?;
            }
            (Operand::Mem(mem), Operand::Imm(imm)) => {
                let mem = resolve_mem(mem, regs)?;
                emit_prefixes(&mut enc, width, false, Some(&mem), None);
                enc.push(if width == Width::B1 { 0xF6 } else { 0xF7 });
                emit_mem_modrm(&mut enc, 0, &mem)?;
                emit_imm(&mut enc, width, *imm)?;
            }
            (Operand::Mem(mem), Operand::Reg(src)) => {
                let src = phys(*src, regs)?;
                let mem = resolve_mem(mem, regs)?;
                emit_prefixes(&mut enc, width, src.is_extended(), Some(&mem), None);
                enc.push(if width == Width::B1 { 0x84 } else { 0x85 });
                emit_mem_modrm(&mut enc, src.base_code(), &mem)?;
            }
            _ => return None,
        },
        _ => {
            let (mr_op, digit) = alu_codes(instr.opcode)?;
            match (ops.first()?, ops.get(1)?) {
                (Operand::Reg(dst), Operand::Reg(src)) => {
                    let dst = phys(*dst, regs)?;
                    let src = phys(*src, regs)?;
                    emit_prefixes(&mut enc, width, src.is_extended(), None, Some(dst));
                    enc.push(if width == Width::B1 { mr_op - 1 } else { mr_op });
                    enc.push(modrm(0b11, src.base_code(), dst.base_code()));
                }
                (Operand::Reg(dst), Operand::Imm(imm)) => {
                    let dst = phys(*dst, regs)?;
                    emit_prefixes(&mut enc, width, false, None, Some(dst));
                    emit_alu_imm(&mut enc, width, *imm, |enc| {
                        enc.push(modrm(0b11, digit, dst.base_code()));
                        Some(())
                    })?;
                }
                (Operand::Mem(mem), Operand::Imm(imm)) => {
                    let mem = resolve_mem(mem, regs)?;
                    emit_prefixes(&mut enc, width, false, Some(&mem), None);
                    emit_alu_imm(&mut enc, width, *imm, |enc| {
                        emit_mem_modrm(enc, digit, &mem)
                    })?;
                }
                (Operand::Mem(mem), Operand::Reg(src)) => {
                    let src = phys(*src, regs)?;
                    let mem = resolve_mem(mem, regs)?;
                    emit_prefixes(&mut enc, width, src.is_extended(), Some(&mem), None);
                    enc.push(if width == Width::B1 { mr_op - 1 } else { mr_op });
                    emit_mem_modrm(&mut enc, src.base_code(), &mem)?;
                }
                (Operand::Reg(dst), Operand::Mem(mem)) => {
                    let dst = phys(*dst, regs)?;
                    let mem = resolve_mem(mem, regs)?;
                    emit_prefixes(&mut enc, width, dst.is_extended(), Some(&mem), None);
                    enc.push(if width == Width::B1 { mr_op + 1 } else { mr_op + 2 });
                    emit_mem_modrm(&mut enc, dst.base_code(), &mem)?;
                }
                _ => return None,
            }
        }
    }

    Some(enc)
}

/// Emit opcode + ModR/M + immediate for an ALU immediate form, preferring
/// the sign-extended imm8 encoding (`0x83 /digit`) when the value fits.
fn emit_alu_imm(
    enc: &mut Encoding,
    width: Width,
    imm: i64,
    emit_rm: impl FnOnce(&mut Encoding) -> Option<()>,
) -> Option<()> {
    if width == Width::B1 {
        enc.push(0x80);
        emit_rm(enc)?;
        enc.push(i8::try_from(imm).ok()? as u8);
        enc.mark_imm(1);
    } else if fits_i8(imm) {
        enc.push(0x83);
        emit_rm(enc)?;
        enc.push(imm as i8 as u8);
        enc.mark_imm(1);
    } else {
        enc.push(0x81);
        emit_rm(enc)?;
        match width {
            Width::B2 => {
                enc.extend(&i16::try_from(imm).ok()?.to_le_bytes());
                enc.mark_imm(2);
            }
            _ => {
                enc.extend(&i32::try_from(imm).ok()?.to_le_bytes());
                enc.mark_imm(4);
            }
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use crate::ir::{Instruction, MemOperand, Opcode, PhysReg, VirtReg, Width};

    use super::*;

    fn no_virt(_v: VirtReg) -> Option<PhysReg> {
        None
    }

    fn enc(instr: &Instruction) -> Vec<u8> {
        X64Encoder::new().encode(instr, &no_virt).bytes().to_vec()
    }

    #[test]
    fn simple_opcodes() {
        assert_eq!(enc(&Instruction::nullary(Opcode::Ret)), vec![0xC3]);
        assert_eq!(enc(&Instruction::nullary(Opcode::Nop)), vec![0x90]);
        assert_eq!(enc(&Instruction::nullary(Opcode::Hlt)), vec![0xF4]);
    }

    #[test]
    fn mov_r64_imm64() {
        let instr = Instruction::ri(Opcode::Mov, Width::B8, PhysReg::Rax, 0x1122_3344_5566_7788);
        assert_eq!(
            enc(&instr),
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn add_rbx_rax_encodes_modrm_c3() {
        // The canonical register-selection hazard: 48 01 C3.
        let instr = Instruction::rr(Opcode::Add, Width::B8, PhysReg::Rbx, PhysReg::Rax);
        assert_eq!(enc(&instr), vec![0x48, 0x01, 0xC3]);
    }

    #[test]
    fn alu_prefers_imm8() {
        let instr = Instruction::ri(Opcode::Add, Width::B4, PhysReg::Rcx, 5);
        assert_eq!(enc(&instr), vec![0x83, 0xC1, 0x05]);
        let wide = Instruction::ri(Opcode::Add, Width::B4, PhysReg::Rcx, 0x1234);
        assert_eq!(enc(&wide), vec![0x81, 0xC1, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn store_with_disp8() {
        let instr = Instruction::mr(
            Opcode::Mov,
            Width::B8,
            MemOperand::base_disp(PhysReg::Rbx, -0x3D),
            PhysReg::Rax,
        );
        // mov [rbx-0x3d], rax => 48 89 43 C3 (the disp8 byte is a hazard).
        assert_eq!(enc(&instr), vec![0x48, 0x89, 0x43, 0xC3]);
        let encoding = X64Encoder::new().encode(&instr, &no_virt);
        assert_eq!(encoding.disp_range(), Some(3..4));
    }

    #[test]
    fn fs_segment_load() {
        let instr = Instruction::rm(
            Opcode::Mov,
            Width::B8,
            PhysReg::R11,
            MemOperand::fs(0x28),
        );
        // mov r11, fs:[0x28] => 64 4C 8B 1C 25 28 00 00 00
        assert_eq!(
            enc(&instr),
            vec![0x64, 0x4C, 0x8B, 0x1C, 0x25, 0x28, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn rsp_base_needs_sib() {
        let instr = Instruction::mr(
            Opcode::Xor,
            Width::B8,
            MemOperand::base(PhysReg::Rsp),
            PhysReg::R11,
        );
        // xor [rsp], r11 => 4C 31 1C 24
        assert_eq!(enc(&instr), vec![0x4C, 0x31, 0x1C, 0x24]);
    }

    #[test]
    fn push_pop_extended() {
        assert_eq!(enc(&Instruction::push(PhysReg::R13)), vec![0x41, 0x55]);
        assert_eq!(enc(&Instruction::pop(PhysReg::R13)), vec![0x41, 0x5D]);
    }

    #[test]
    fn indirect_call_reg() {
        let instr = Instruction::new(
            Opcode::CallInd,
            Width::B8,
            vec![crate::ir::Operand::reg(PhysReg::Rax)],
        );
        assert_eq!(enc(&instr), vec![0xFF, 0xD0]);
    }

    #[test]
    fn movnt_carries_inherent_hazard() {
        let instr = Instruction::mr(
            Opcode::Movnt,
            Width::B8,
            MemOperand::base(PhysReg::Rdi),
            PhysReg::Rax,
        );
        let bytes = enc(&instr);
        assert!(bytes.windows(2).any(|w| w == [0x0F, 0xC3]));
    }

    #[test]
    fn unmapped_vreg_encodes_empty() {
        let instr = Instruction::rr(Opcode::Add, Width::B8, VirtReg(3), PhysReg::Rax);
        let encoding = X64Encoder::new().encode(&instr, &no_virt);
        assert!(encoding.is_empty());
    }

    #[test]
    fn frame_slot_encodes_empty() {
        let instr = Instruction::mi(
            Opcode::Mov,
            Width::B8,
            MemOperand::frame(crate::ir::FrameSlotId(0)),
            0xC3,
        );
        assert!(X64Encoder::new().encode(&instr, &no_virt).is_empty());
    }

    #[test]
    fn remap_overrides_one_register() {
        let instr = Instruction::rr(Opcode::Add, Width::B8, VirtReg(0), PhysReg::Rax);
        let base = |_v: VirtReg| Some(PhysReg::Rbx);
        let plain = X64Encoder::new().encode(&instr, &base);
        assert_eq!(plain.bytes(), &[0x48, 0x01, 0xC3]);
        let remap = crate::encoder::Remap::new(&base, VirtReg(0), PhysReg::Rcx);
        let moved = X64Encoder::new().encode(&instr, &remap);
        assert_eq!(moved.bytes(), &[0x48, 0x01, 0xC1]);
    }
}
