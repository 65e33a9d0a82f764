//! Hazard scanning: finding return-gadget byte patterns in encoded bytes.
//!
//! A byte sequence is hazardous when it contains a near-return opcode
//! (`C2`, `C3`, `CA`, `CB`) or an `FF` byte followed by a ModR/M value that
//! turns the pair into an indirect call or jump. An attacker who lands
//! control flow mid-instruction on such a byte gets a usable gadget, so the
//! engine rewrites the instruction until its encoding is clean.

use crate::encoder::Encoding;

/// ModR/M values that make a preceding `FF` byte decode as `call`/`jmp`
/// through a register or memory operand (the /2 and /4 digit groups).
pub const FF_MODRM_BLACKLIST: [u8; 40] = [
    0x10, 0x11, 0x12, 0x13, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1e, 0x1f, 0x20, 0x21, 0x22,
    0x23, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x2b, 0x2e, 0x2f, 0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5,
    0xd6, 0xd7, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
];

/// Whether a single byte is a near-return opcode.
#[must_use]
pub fn is_ret_byte(byte: u8) -> bool {
    matches!(byte, 0xC2 | 0xC3 | 0xCA | 0xCB)
}

/// Whether the byte pair `FF modrm` decodes as an indirect transfer.
#[must_use]
pub fn is_indirect_pair(first: u8, second: u8) -> bool {
    first == 0xFF && FF_MODRM_BLACKLIST.contains(&second)
}

/// Which field of an encoding a hazardous byte landed in. The field decides
/// the rewrite strategy: immediates are split, displacements re-based, and
/// register-selection bytes handed to the conflict resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardKind {
    /// The byte sits in the immediate field.
    Immediate,
    /// The byte sits in the displacement field.
    Displacement,
    /// The byte comes from opcode, REX, ModR/M or SIB material.
    ModRmSib,
}

/// A hazardous byte found in an encoding. Transient: recomputed on every
/// query, never stored across rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HazardByte {
    /// Offset of the byte within the encoding.
    pub offset: usize,
    /// The byte value.
    pub value: u8,
    /// The field it belongs to.
    pub kind: HazardKind,
}

/// Offsets of hazardous bytes in a raw byte stream.
///
/// For an `FF modrm` pair the offset of the `FF` byte is reported.
#[must_use]
pub fn scan(bytes: &[u8]) -> Vec<usize> {
    let mut found = Vec::new();
    for (i, &byte) in bytes.iter().enumerate() {
        if is_ret_byte(byte) {
            found.push(i);
        } else if i + 1 < bytes.len() && is_indirect_pair(byte, bytes[i + 1]) {
            found.push(i);
        }
    }
    found
}

/// Whether a raw byte stream contains any hazard.
#[must_use]
pub fn has_hazard(bytes: &[u8]) -> bool {
    !scan(bytes).is_empty()
}

/// Scans an encoding and classifies each hazardous byte by field.
///
/// An `FF modrm` pair is classified by the *most rewritable* field either of
/// its two bytes touches: immediate, then displacement, then register
/// selection. An empty encoding scans clean by definition.
#[must_use]
pub fn scan_encoding(encoding: &Encoding) -> Vec<HazardByte> {
    let bytes = encoding.bytes();
    scan(bytes)
        .into_iter()
        .map(|offset| {
            let value = bytes[offset];
            let span_end = if value == 0xFF { offset + 2 } else { offset + 1 };
            let kind = classify(encoding, offset, span_end);
            HazardByte {
                offset,
                value,
                kind,
            }
        })
        .collect()
}

fn classify(encoding: &Encoding, start: usize, end: usize) -> HazardKind {
    let overlaps = |range: Option<std::ops::Range<usize>>| {
        range.is_some_and(|r| start < r.end && end > r.start)
    };
    if overlaps(encoding.imm_range()) {
        HazardKind::Immediate
    } else if overlaps(encoding.disp_range()) {
        HazardKind::Displacement
    } else {
        HazardKind::ModRmSib
    }
}
