//! Per-run engine state: configuration, counters and the random source.

use rand::{rngs::StdRng, SeedableRng};

use crate::harden::{HardenConfig, HardenStats};

/// Everything the engine threads through a run.
///
/// The random source is owned here rather than drawn from a global so runs
/// are reproducible under a fixed seed; production callers seed from
/// entropy, tests from a constant.
#[derive(Debug)]
pub struct HardenContext {
    /// Engine configuration.
    pub config: HardenConfig,
    /// Accumulated rewrite counters.
    pub stats: HardenStats,
    /// Source of cookie values.
    pub rng: StdRng,
}

impl HardenContext {
    /// Creates a context seeded from operating-system entropy.
    #[must_use]
    pub fn new(config: HardenConfig) -> Self {
        HardenContext {
            config,
            stats: HardenStats::default(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates a context with a fixed seed for reproducible runs.
    #[must_use]
    pub fn with_seed(config: HardenConfig, seed: u64) -> Self {
        HardenContext {
            config,
            stats: HardenStats::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for HardenContext {
    fn default() -> Self {
        HardenContext::new(HardenConfig::default())
    }
}
