//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - General-purpose register identifiers
//! - Byte-exact instruction encoding with rel32 patching
//! - The fixed register convention compiled programs run under
//! - Disassembly of emitted code for diagnostics

pub mod calling_convention;
pub mod disasm;
pub mod encoder;
pub mod registers;

pub use calling_convention::{ConventionError, FixedConvention};
pub use disasm::{disassemble, disassemble_with_labels};
pub use encoder::{read_rel32, EncodingError, JumpCondition, X64Encoder, REL32_SIZE};
pub use registers::AsmReg;
