// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena that JIT compilations allocate their
// short-lived bookkeeping in (the per-block relocation lists) and accumulates statistics
// across every program compiled through it. SessionStats tracks how many programs, blocks
// and instructions were lowered, the total emitted code size, how many jump placeholders
// were patched, and a per-opcode breakdown kept in a hashbrown map. The session uses
// interior mutability so a compiler can borrow it immutably for the arena lifetime while
// still recording statistics.

//! Arena-based compilation session management.
//!
//! All per-compilation data structures are allocated in the arena and share
//! the session lifetime, so relocation lists never need to be freed one by one.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Allocate an empty vector in the session arena.
    pub fn new_vec<T>(&self) -> BumpVec<'arena, T> {
        BumpVec::new_in(self.arena)
    }

    /// Bytes currently allocated in the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Record that a program was compiled.
    pub fn record_program_compiled(&self, blocks: usize, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.programs_compiled += 1;
        stats.blocks_compiled += blocks;
        stats.total_code_size += code_size;
        stats.largest_program_size = stats.largest_program_size.max(code_size);
    }

    /// Record an instruction compilation.
    pub fn record_instruction_compiled(&self, mnemonic: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_compiled += 1;
        *stats.instruction_counts.entry(mnemonic).or_insert(0) += 1;
    }

    /// Record resolved jump placeholders.
    pub fn record_patches_resolved(&self, count: usize) {
        self.stats.borrow_mut().patches_resolved += count;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of programs compiled.
    pub programs_compiled: usize,

    /// Number of basic blocks lowered.
    pub blocks_compiled: usize,

    /// Number of bytecode instructions lowered.
    pub instructions_compiled: usize,

    /// Count of each opcode lowered.
    pub instruction_counts: HashMap<&'static str, usize>,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    /// Largest single program (bytes).
    pub largest_program_size: usize,

    /// Jump displacements patched.
    pub patches_resolved: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Programs compiled: {}", self.programs_compiled)?;
        writeln!(f, "  Blocks compiled: {}", self.blocks_compiled)?;
        writeln!(f, "  Instructions compiled: {}", self.instructions_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Largest program: {} bytes", self.largest_program_size)?;
        writeln!(f, "  Jump patches resolved: {}", self.patches_resolved)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (mnemonic, count) in sorted {
                writeln!(f, "    {}: {}", mnemonic, count)?;
            }
        }

        Ok(())
    }
}
