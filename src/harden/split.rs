//! Immediate splitting: decomposing a hazardous constant into two clean
//! halves recombined with `or`.
//!
//! Every hazardous byte of the constant donates its low nibble to one half;
//! the other half keeps the remaining bits. The halves are disjoint, so
//! `large | small` reproduces the original value, and stripping the high
//! nibble turns `C2..CB` bytes into `02..0B` and `FF` into `0F`, which scan
//! clean.

use crate::harden::scanner::{has_hazard, is_indirect_pair, is_ret_byte};
use crate::ir::Width;

/// The two hazard-free halves of a split constant, as width-sign-extended
/// immediates. `small` is the half with the smaller magnitude; it is the
/// preferred `or` immediate because it usually fits the sign-extended
/// 32-bit immediate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitValue {
    /// The smaller half.
    pub small: i64,
    /// The larger half.
    pub large: i64,
}

impl SplitValue {
    /// Whether `small` can be used directly as an `or` immediate at the
    /// given width (64-bit `or` only takes a sign-extended imm32).
    #[must_use]
    pub fn small_fits_or_imm(&self, width: Width) -> bool {
        width != Width::B8 || i32::try_from(self.small).is_ok()
    }
}

fn sign_extend(raw: u64, width: Width) -> i64 {
    match width {
        Width::B1 => raw as u8 as i8 as i64,
        Width::B2 => raw as u16 as i16 as i64,
        Width::B4 => raw as u32 as i32 as i64,
        Width::B8 => raw as i64,
    }
}

/// Splits `value` into two hazard-free halves, or `None` when the value has
/// no hazardous byte within `width` or a clean split does not exist.
#[must_use]
pub fn split_value(value: i64, width: Width) -> Option<SplitValue> {
    let n = width.bytes() as usize;
    let bytes = (value as u64).to_le_bytes();

    let mut small: u64 = 0;
    for i in 0..n {
        let byte = bytes[i];
        let hazardous =
            is_ret_byte(byte) || (i + 1 < n && is_indirect_pair(byte, bytes[i + 1]));
        if hazardous {
            small |= u64::from(byte & 0x0F) << (8 * i);
        }
    }
    if small == 0 {
        return None;
    }

    let large = (value as u64) & !small;
    let (small, large) = if small <= large {
        (small, large)
    } else {
        (large, small)
    };

    // A nibble-stripped half can still form a hazard with untouched
    // neighbors; such values stay with the caller as unresolved.
    if has_hazard(&small.to_le_bytes()[..n]) || has_hazard(&large.to_le_bytes()[..n]) {
        return None;
    }

    Some(SplitValue {
        small: sign_extend(small, width),
        large: sign_extend(large, width),
    })
}
