use thiserror::Error;

use crate::ir::{BlockId, InstrId, VirtReg};

macro_rules! invariant_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, covering every failure this library can return.
///
/// Hazard-handling failures are deliberately *not* errors: an operand the
/// engine cannot rewrite is reported through counters and logs and left in
/// place (see [`crate::harden::HardenStats`]). Errors of this type signal
/// contract violations in the input representation - continuing past one
/// would risk silently emitting incorrect machine code, so callers are
/// expected to abort processing of the whole unit.
///
/// # Error Categories
///
/// ## Structural invariant violations
/// - [`Error::Malformed`] - an instruction does not have the operand shape
///   its opcode requires
/// - [`Error::InvalidInstr`] / [`Error::InvalidBlock`] - a stale arena index
///   was dereferenced
///
/// ## Register mapping
/// - [`Error::UnmappedRegister`] - the allocator has no physical register
///   for a virtual register the engine needed to resolve
#[derive(Error, Debug)]
pub enum Error {
    /// The instruction stream is structurally malformed.
    ///
    /// Raised when a rewrite step finds an operand kind that the opcode
    /// contract rules out (e.g. a register-immediate form without an
    /// immediate operand). The source location where the violation was
    /// detected is carried for debugging.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An instruction index did not resolve inside the function arena.
    #[error("Instruction {0} does not exist in this function")]
    InvalidInstr(InstrId),

    /// A block index did not resolve inside the function arena.
    #[error("Block {0} does not exist in this function")]
    InvalidBlock(BlockId),

    /// The allocator returned no physical register for a virtual register.
    ///
    /// Every virtual register reaching this engine must already be mapped;
    /// an unmapped one means the caller handed over a function before
    /// register allocation finished.
    #[error("Virtual register {0} has no physical mapping")]
    UnmappedRegister(VirtReg),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
