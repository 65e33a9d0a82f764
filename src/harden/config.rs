//! Engine configuration.

use crate::ir::PhysReg;

/// Tunable knobs for the hardening engine.
///
/// The defaults reproduce the standard policy; callers override individual
/// fields for experiments or to disable the engine outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardenConfig {
    /// Master switch. When `false` the engine leaves every function
    /// untouched.
    pub enabled: bool,
    /// Candidate registers the conflict resolver will try per operand
    /// before giving up on reassignment and falling back to a code
    /// transformation.
    pub reassign_attempt_limit: usize,
    /// Scratch registers for the fallback transformation, in preference
    /// order. The first one not referenced by the instruction is used.
    pub scratch_pool: Vec<PhysReg>,
    /// Number of no-op bytes padded ahead of each return-address
    /// obfuscation sequence.
    pub nop_sled_len: usize,
    /// Displacement of the thread-local secret within the FS segment.
    pub secret_offset: i64,
}

impl Default for HardenConfig {
    fn default() -> Self {
        HardenConfig {
            enabled: true,
            reassign_attempt_limit: 4,
            scratch_pool: vec![PhysReg::R13, PhysReg::R15, PhysReg::R14],
            nop_sled_len: 9,
            secret_offset: 0x28,
        }
    }
}

impl HardenConfig {
    /// The default configuration with the engine enabled.
    #[must_use]
    pub fn new() -> Self {
        HardenConfig::default()
    }

    /// A configuration that makes the engine a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        HardenConfig {
            enabled: false,
            ..HardenConfig::default()
        }
    }
}
