//! Return-gadget elimination and control-flow-integrity instrumentation.
//!
//! The engine walks post-allocation machine code, asks the encoder for the
//! exact bytes of every instruction, and removes return-gadget material
//! from three places it can hide: immediate fields (split into clean
//! halves), displacement fields (re-based through a fresh register), and
//! ModR/M / SIB register selections (register reassignment or a scratch
//! detour). On top of that it guards every indirect transfer with a cookie
//! check and obfuscates return addresses on the stack.
//!
//! Entry point: [`HardenEngine::process_function`] with a
//! [`HardenContext`] carrying configuration, counters and the random
//! source.

mod cfi;
mod config;
mod context;
mod engine;
mod flags;
mod recon;
mod resolver;
mod scanner;
mod split;
mod stats;

pub use cfi::CfiPhase;
pub use config::HardenConfig;
pub use context::HardenContext;
pub use engine::HardenEngine;
pub use flags::{needs_flags_save, placement_for, FlagsPlacement};
pub use resolver::VregState;
pub use scanner::{
    has_hazard, scan, scan_encoding, HazardByte, HazardKind, FF_MODRM_BLACKLIST,
};
pub use split::{split_value, SplitValue};
pub use stats::HardenStats;
