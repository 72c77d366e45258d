// This module defines the error taxonomy of the engine using the thiserror crate. VmError
// is the single error type returned by both execution backends and the memory manager:
// MalformedProgram covers producer bugs (missing or misplaced block terminators, empty
// programs, jump targets that do not name a block, displacements that cannot be encoded),
// IndexOutOfRange reports a register or local index beyond the capacity the program runs
// against, and AllocationFailed / ProtectionChangeFailed / ReleaseFailed report failures of
// the executable-memory lifecycle. ObjectEmission reports relocatable-object writing errors.
// Encoder and text-format failures are wrapped so callers only ever match on one enum. VmResult<T> is the usual alias.

//! Error types for the engine.

use std::fmt;
use thiserror::Error;

use crate::text::ParseError;
use crate::x64::{ConventionError, EncodingError};

/// Which index space an out-of-range index belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpace {
    Register,
    Local,
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSpace::Register => write!(f, "register"),
            IndexSpace::Local => write!(f, "local"),
        }
    }
}

/// Main error type for building, compiling and running programs.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("Malformed program: {reason}")]
    MalformedProgram { reason: String },

    #[error("{space} index {index} out of range (capacity {capacity})")]
    IndexOutOfRange {
        space: IndexSpace,
        index: u64,
        capacity: usize,
    },

    #[error("Executable memory allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    #[error("Changing executable memory protection failed: {reason}")]
    ProtectionChangeFailed { reason: String },

    #[error("Releasing executable memory failed: {reason}")]
    ReleaseFailed { reason: String },

    #[error("Object file emission failed: {reason}")]
    ObjectEmission { reason: String },

    #[error("Invalid register convention: {0}")]
    Convention(#[from] ConventionError),

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl VmError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        VmError::MalformedProgram {
            reason: reason.into(),
        }
    }

    /// Whether the error comes from the executable-memory lifecycle.
    ///
    /// These are the failures a caller may choose to recover from by running
    /// the same program through the interpreter.
    pub fn is_memory_failure(&self) -> bool {
        matches!(
            self,
            VmError::AllocationFailed { .. }
                | VmError::ProtectionChangeFailed { .. }
                | VmError::ReleaseFailed { .. }
        )
    }
}

/// Result type alias for engine operations.
pub type VmResult<T> = Result<T, VmError>;
