//! Native execution backend.
//!
//! - [`JitCompiler`] lowers a validated [`Program`](crate::core::Program)
//!   into x86-64 code and resolves every jump in a single patch pass.
//! - [`WritableRegion`] / [`ExecutableRegion`] manage write-xor-execute
//!   memory; [`Executable`] is the loaded, callable result.
//! - [`write_object`] emits the same code as an ELF relocatable.

pub mod compiler;
pub mod executable;
pub mod object;

pub use compiler::{CompiledProgram, JitCompiler, Relocation};
pub use executable::{
    Executable, ExecutableRegion, Protection, WritableRegion, MAX_CODE_SIZE,
};
pub use object::write_object;
