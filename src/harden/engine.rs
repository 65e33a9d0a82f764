//! The hardening pipeline.
//!
//! Stage order matters: special opcodes are lowered first so later stages
//! see only the core operand classes, the reconstructor commits every
//! immediate/displacement rewrite before the resolver fixpoint starts, and
//! CFI instrumentation runs last so its own instructions (built hazard-free
//! by construction) are never churned by the rewrite stages.

use tracing::debug;

use crate::{
    encoder::{InstructionEncoder, X64Encoder},
    harden::{cfi, recon, resolver, scanner::scan, HardenContext},
    ir::{Function, Instruction, InstrId, Opcode, Operand, PhysReg, Reg, Width},
    regalloc::{Allocator, Resolve},
    Result,
};

/// Drives the rewrite stages and the CFI instrumenter over functions.
#[derive(Debug, Clone, Default)]
pub struct HardenEngine<E = X64Encoder> {
    encoder: E,
}

impl HardenEngine<X64Encoder> {
    /// An engine using the built-in x86-64 encoder.
    #[must_use]
    pub fn new() -> Self {
        HardenEngine::with_encoder(X64Encoder::new())
    }
}

impl<E: InstructionEncoder> HardenEngine<E> {
    /// An engine over a caller-supplied encoder.
    #[must_use]
    pub fn with_encoder(encoder: E) -> Self {
        HardenEngine { encoder }
    }

    /// Hardens one function in place.
    ///
    /// A disabled configuration makes this a no-op. Hazards the engine
    /// cannot remove are counted in the context's stats and logged, not
    /// reported as errors.
    ///
    /// # Errors
    ///
    /// Returns an error when the input breaks a structural contract: stale
    /// arena indices, malformed operand shapes, or a virtual register the
    /// allocator cannot resolve.
    pub fn process_function(
        &self,
        func: &mut Function,
        alloc: &mut dyn Allocator,
        ctx: &mut HardenContext,
    ) -> Result<()> {
        if !ctx.config.enabled {
            return Ok(());
        }
        debug!(function = %func.name, "hardening");
        self.lower_special(func, alloc, ctx)?;
        recon::run(func, alloc, &self.encoder, ctx)?;
        resolver::run(func, alloc, &self.encoder, ctx)?;
        cfi::run(func, ctx)?;
        debug!(function = %func.name, stats = ?ctx.stats, "hardened");
        Ok(())
    }

    /// Re-encodes every instruction and reports remaining hazardous bytes
    /// as `(instruction, offset)` pairs.
    ///
    /// Control transfers are exempt: a return's bytes *are* a return.
    ///
    /// # Errors
    ///
    /// Returns an error for stale arena indices.
    pub fn residual_hazards(
        &self,
        func: &Function,
        alloc: &dyn Allocator,
    ) -> Result<Vec<(InstrId, usize)>> {
        let mut residual = Vec::new();
        for (_, iid) in func.iter_instrs() {
            let instr = func.instr(iid)?;
            if instr.is_return()
                || instr.is_call()
                || instr.is_branch()
                || instr.is_indirect_branch()
            {
                continue;
            }
            let encoding = self.encoder.encode(instr, &Resolve(alloc));
            for offset in scan(encoding.bytes()) {
                residual.push((iid, offset));
            }
        }
        Ok(residual)
    }

    /// Lowers opcodes whose encodings are hazardous by nature: non-temporal
    /// stores become plain stores, and byte swaps of unlucky registers are
    /// routed through `rcx` (whose swap encoding is always clean).
    fn lower_special(
        &self,
        func: &mut Function,
        alloc: &mut dyn Allocator,
        ctx: &mut HardenContext,
    ) -> Result<()> {
        let worklist: Vec<_> = func.iter_instrs().collect();
        for (block, iid) in worklist {
            let instr = func.instr(iid)?.clone();
            match instr.opcode {
                Opcode::Movnt => {
                    func.instr_mut(iid)?.opcode = Opcode::Mov;
                    ctx.stats.evil_encodings += 1;
                    debug!(instr = %instr, "lowered non-temporal store");
                }
                Opcode::Bswap => {
                    let encoding = self.encoder.encode(&instr, &Resolve(&*alloc));
                    if scan(encoding.bytes()).is_empty() {
                        continue;
                    }
                    let Some(&Operand::Reg(reg)) = instr.operands.first() else {
                        return Err(invariant_error!(
                            "byte swap without a register operand: {}",
                            instr
                        ));
                    };
                    let Some(pos) = func.position_of(block, iid) else {
                        return Err(crate::Error::InvalidInstr(iid));
                    };
                    func.insert_instr(block, pos, Instruction::push(PhysReg::Rcx))?;
                    func.insert_instr(
                        block,
                        pos + 1,
                        Instruction::rr(Opcode::Mov, Width::B8, PhysReg::Rcx, reg),
                    )?;
                    func.instr_mut(iid)?
                        .replace_reg(reg, Reg::Phys(PhysReg::Rcx));
                    func.insert_instr(
                        block,
                        pos + 3,
                        Instruction::rr(Opcode::Mov, Width::B8, reg, PhysReg::Rcx),
                    )?;
                    func.insert_instr(block, pos + 4, Instruction::pop(PhysReg::Rcx))?;
                    ctx.stats.evil_encodings += 1;
                    debug!(instr = %instr, "routed byte swap through rcx");
                }
                _ => {}
            }
        }
        Ok(())
    }
}
