// This module serves as the hub for the architecture-independent building blocks shared by
// both execution backends: the bytecode IR (Program, BasicBlock, Instruction, BlockId and the
// Layout a program is validated against), the error taxonomy (VmError / VmResult), and the
// arena-backed compilation session with its statistics. Nothing here knows about x86-64 or
// executable memory; the interpreter, the JIT and the text producer all build on these types.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Program model (`program`)
//! - Arena of basic blocks addressed by stable [`BlockId`] handles
//! - Closed [`Instruction`] enum dispatched by exhaustive matching
//! - Structural validation against a [`Layout`]
//!
//! ## Errors (`error`)
//! - [`VmError`] taxonomy shared by every component
//!
//! ## Session management (`session`)
//! - Arena allocation using `bumpalo`
//! - Compilation statistics

pub mod error;
pub mod program;
pub mod session;

pub use error::{IndexSpace, VmError, VmResult};

pub use program::{
    BasicBlock, BlockId, Instruction, Layout, Local, Program, Reg, Value, ACCUMULATOR,
};

pub use session::{CompilationSession, SessionStats};
