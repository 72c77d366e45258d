//! jitvm - an accumulator bytecode VM with an x86-64 JIT.
//!
//! Programs are graphs of basic blocks over a small closed instruction set.
//! The same [`Program`] runs either through the [`Interpreter`] or through
//! the [`JitCompiler`], which lowers it to native code, seals that code in
//! write-xor-execute memory and calls it in place. Both backends read and
//! write the register file and locals owned by a [`Vm`].
//!
//! # Primary Usage
//!
//! ```ignore
//! use jitvm::{parse_program, Vm};
//!
//! let program = parse_program(source)?;
//! let mut vm = Vm::new(4, 1);
//! vm.run_jit(&program)?;
//! println!("{}", vm.dump());
//! ```
//!
//! Lower-level access goes through a compilation session:
//!
//! ```ignore
//! use bumpalo::Bump;
//! use jitvm::core::{CompilationSession, Layout};
//! use jitvm::jit::JitCompiler;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let compiled = JitCompiler::new(&session).compile(&program, Layout::new(4, 1))?;
//! println!("{}", compiled.disassemble());
//! let executable = compiled.load()?;
//! executable.invoke(&mut registers, &mut locals)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Program model, errors, compilation session
//! - [`x64`] - x86-64 encoder, registers, calling convention, disassembly
//! - [`jit`] - Lowering, executable memory, object emission
//! - [`interpreter`] - Reference backend
//! - [`vm`] - State owner and backend selection
//! - [`text`] - Textual program format

pub mod core;
pub mod interpreter;
pub mod jit;
pub mod text;
pub mod vm;
pub mod x64;

pub use core::{
    BasicBlock, BlockId, CompilationSession, IndexSpace, Instruction, Layout, Program,
    SessionStats, VmError, VmResult,
};
pub use interpreter::{Interpreter, InterpreterStats};
pub use jit::{CompiledProgram, Executable, JitCompiler};
pub use text::{parse_program, ParseError};
pub use vm::{Backend, Vm};
