// Copyright 2025 The ropfree Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![allow(dead_code)]

//! # ropfree
//!
//! A post-codegen hardening engine for x86-64 machine code that eliminates
//! return-gadget byte patterns and instruments control flow against
//! return-oriented programming.
//!
//! Compiled code is full of accidental gadgets: a `ret` opcode byte hiding
//! inside an immediate, a displacement, or a ModR/M register selection is
//! enough for an attacker who can redirect control mid-instruction.
//! `ropfree` rewrites such instructions into semantically equivalent
//! hazard-free sequences and adds cookie checks and return-address
//! obfuscation on top.
//!
//! ## Features
//!
//! - **Immediate splitting** - hazardous constants are decomposed into two
//!   clean halves recombined with `or`, preserving the condition flags when
//!   they are live
//! - **Displacement re-basing** - hazardous memory offsets are folded into
//!   a fresh base register
//! - **Register reassignment** - hazardous ModR/M and SIB bytes are removed
//!   by moving virtual registers to different physical homes, with a
//!   scratch-register detour as the fallback
//! - **Cookie checks** - every indirect call and jump is guarded by a
//!   per-function cookie validated against a thread-local secret, trapping
//!   on mismatch
//! - **Return-address obfuscation** - return addresses are XOR-masked on
//!   the stack between function entry and every exit
//!
//! ## Quick Start
//!
//! ```rust
//! use ropfree::{
//!     harden::{HardenConfig, HardenContext, HardenEngine},
//!     ir::{Function, Instruction, Opcode, PhysReg, Width},
//!     regalloc::LinearAllocator,
//! };
//!
//! fn main() -> ropfree::Result<()> {
//!     // mov rax, 0xC3 carries a `ret` byte in its immediate.
//!     let mut func = Function::new("example");
//!     let entry = func.entry();
//!     func.push_instr(
//!         entry,
//!         Instruction::ri(Opcode::Mov, Width::B8, PhysReg::Rax, 0xC3),
//!     )?;
//!     func.push_instr(entry, Instruction::nullary(Opcode::Ret))?;
//!
//!     let engine = HardenEngine::new();
//!     let mut alloc = LinearAllocator::new();
//!     let mut ctx = HardenContext::with_seed(HardenConfig::default(), 1);
//!     engine.process_function(&mut func, &mut alloc, &mut ctx)?;
//!
//!     assert_eq!(ctx.stats.evil_immediates, 1);
//!     assert!(engine.residual_hazards(&func, &alloc)?.is_empty());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`ir`] - the machine representation: arena-indexed functions, blocks
//!   and instructions over the integer/memory operand classes
//! - [`encoder`] - the byte oracle: [`encoder::X64Encoder`] produces exact
//!   encodings with immediate/displacement field positions
//! - [`regalloc`] - the register-assignment seam the engine queries and
//!   mutates through the [`regalloc::Allocator`] trait
//! - [`harden`] - the rewrite stages and the CFI instrumenter, driven by
//!   [`harden::HardenEngine`]
//!
//! ## Error Handling
//!
//! Operations return [`Result<T, Error>`](Result). Errors signal broken
//! structural contracts in the input; hazards the engine cannot remove are
//! *not* errors - they are logged, counted in
//! [`harden::HardenStats::unhandled`] and left in place.

#[macro_use]
mod error;

pub mod encoder;
pub mod harden;
pub mod ir;
pub mod regalloc;

pub use error::Error;

/// `ropfree` Result type
///
/// A type alias for [`std::result::Result<T, E>`] where the error type is
/// always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
