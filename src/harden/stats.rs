//! Rewrite counters.

/// Counts of the rewrites and instrumentation the engine performed.
///
/// Counters accumulate across functions when the same context is reused,
/// giving a per-unit summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardenStats {
    /// Return-address obfuscation sequences inserted (returns and
    /// function-leaving tail jumps).
    pub ret_protections: u64,
    /// Cookie checks attached to indirect calls and jumps.
    pub cookie_checks: u64,
    /// Hazardous immediates and displacements rewritten.
    pub evil_immediates: u64,
    /// Hazardous register selections fixed by reassignment or the scratch
    /// transformation (including lowered non-temporal stores and byte
    /// swaps).
    pub evil_encodings: u64,
    /// Hazards the engine could not remove and left in place.
    pub unhandled: u64,
}

impl HardenStats {
    /// Total number of successful rewrites.
    #[must_use]
    pub fn total_rewrites(&self) -> u64 {
        self.ret_protections + self.cookie_checks + self.evil_immediates + self.evil_encodings
    }
}
