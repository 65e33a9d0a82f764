//! Instruction encoding: the byte-level oracle the hardening engine queries.
//!
//! The engine never assumes what bytes an instruction produces; it asks an
//! [`InstructionEncoder`] for an [`Encoding`] under a concrete
//! virtual-to-physical register mapping and scans the result. Encoding is
//! deterministic for fixed inputs. An instruction the encoder cannot encode
//! (frame-relative operand, unresolved label, unmapped register) yields an
//! *empty* encoding, which downstream policy treats as "not hazardous" - a
//! hazard cannot be asserted on bytes that do not exist yet.

mod x64;

use std::ops::Range;

pub use x64::X64Encoder;

use crate::ir::{Instruction, PhysReg, VirtReg};

/// Resolves virtual registers to their current physical assignment during
/// encoding.
pub trait RegResolver {
    /// The physical register currently backing `vreg`, if any.
    fn resolve(&self, vreg: VirtReg) -> Option<PhysReg>;
}

impl<F> RegResolver for F
where
    F: Fn(VirtReg) -> Option<PhysReg>,
{
    fn resolve(&self, vreg: VirtReg) -> Option<PhysReg> {
        self(vreg)
    }
}

/// A [`RegResolver`] view with a single virtual register rebound.
///
/// The conflict resolver uses this to ask "what would the bytes be if this
/// vreg lived in that register?" without touching the allocator's state.
pub struct Remap<'a> {
    inner: &'a dyn RegResolver,
    vreg: VirtReg,
    reg: PhysReg,
}

impl<'a> Remap<'a> {
    /// Wraps `inner`, answering `reg` for `vreg` and delegating the rest.
    #[must_use]
    pub fn new(inner: &'a dyn RegResolver, vreg: VirtReg, reg: PhysReg) -> Self {
        Remap { inner, vreg, reg }
    }
}

impl RegResolver for Remap<'_> {
    fn resolve(&self, vreg: VirtReg) -> Option<PhysReg> {
        if vreg == self.vreg {
            Some(self.reg)
        } else {
            self.inner.resolve(vreg)
        }
    }
}

/// Encoded instruction bytes plus the positions of value-carrying fields.
///
/// The field ranges let the hazard scanner classify a flagged byte as
/// belonging to an immediate, a displacement, or the ModRM/SIB register
/// selection - the classification decides which rewrite strategy applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoding {
    bytes: Vec<u8>,
    imm: Option<Range<usize>>,
    disp: Option<Range<usize>>,
}

impl Encoding {
    /// An empty encoding: the instruction could not be encoded.
    #[must_use]
    pub fn empty() -> Self {
        Encoding::default()
    }

    pub(crate) fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub(crate) fn mark_imm(&mut self, len: usize) {
        let start = self.bytes.len() - len;
        self.imm = Some(start..self.bytes.len());
    }

    pub(crate) fn mark_disp(&mut self, len: usize) {
        let start = self.bytes.len() - len;
        self.disp = Some(start..self.bytes.len());
    }

    /// The raw encoded bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether encoding failed (or produced a zero-length instruction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of encoded bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Byte range of the immediate field, if present.
    #[must_use]
    pub fn imm_range(&self) -> Option<Range<usize>> {
        self.imm.clone()
    }

    /// Byte range of the displacement field, if present.
    #[must_use]
    pub fn disp_range(&self) -> Option<Range<usize>> {
        self.disp.clone()
    }
}

/// Turns a fully register-resolved instruction into bytes.
pub trait InstructionEncoder {
    /// Encodes `instr`, resolving virtual registers through `regs`.
    ///
    /// Must be deterministic for fixed inputs. Returns [`Encoding::empty`]
    /// when the instruction cannot be encoded.
    fn encode(&self, instr: &Instruction, regs: &dyn RegResolver) -> Encoding;
}
