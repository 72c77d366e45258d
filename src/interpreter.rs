// This module implements the reference execution backend: a straightforward dispatch loop
// over the bytecode that reads and writes the caller's register file and locals in place.
// The loop keeps a (current block, cursor) pair, executes one instruction per iteration with
// an exhaustive match on Instruction, and on any control transfer switches to the target
// block and resets the cursor to zero. Exit stops the loop. The accumulator is simply
// registers[0]. Every register and local access is bounds checked at the point of use, so
// the interpreter is safe even on programs that were never validated; running off the end of
// a block or jumping to a block that does not exist is reported as a malformed program. The
// loop has no step limit, so a program that never reaches Exit does not return. Execution
// counters are collected in InterpreterStats and logged at debug level when the run ends.

//! Bytecode interpreter.

use std::fmt;

use crate::core::{BlockId, Instruction, Layout, Program, VmError, VmResult, ACCUMULATOR};

/// Counters for one interpreted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpreterStats {
    pub instructions_executed: u64,
    /// Control transfers taken, conditional or not.
    pub jumps_taken: u64,
    pub blocks_entered: u64,
}

impl fmt::Display for InterpreterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Interpreter Statistics:")?;
        writeln!(f, "  Instructions executed: {}", self.instructions_executed)?;
        writeln!(f, "  Jumps taken: {}", self.jumps_taken)?;
        writeln!(f, "  Blocks entered: {}", self.blocks_entered)
    }
}

/// Executes programs one instruction at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Interpreter
    }

    /// Run `program` from its entry block until `Exit`.
    ///
    /// `registers[0]` is the accumulator. On error the state reflects every
    /// instruction executed before the failing one.
    pub fn run(
        &self,
        program: &Program,
        registers: &mut [u64],
        locals: &mut [u64],
    ) -> VmResult<InterpreterStats> {
        let layout = Layout::new(registers.len(), locals.len());
        let acc = layout.check_register(ACCUMULATOR)?;

        let mut stats = InterpreterStats::default();
        let mut current = program.entry();
        let mut cursor = 0usize;
        let mut block = enter(program, current)?;
        stats.blocks_entered += 1;

        loop {
            let Some(inst) = block.get(cursor) else {
                return Err(VmError::malformed(format!(
                    "fell off the end of {current} without a control transfer"
                )));
            };
            stats.instructions_executed += 1;
            cursor += 1;

            let next = match *inst {
                Instruction::LoadImmediate(value) => {
                    registers[acc] = value;
                    None
                }
                Instruction::Load(reg) => {
                    registers[acc] = registers[layout.check_register(reg)?];
                    None
                }
                Instruction::Store(reg) => {
                    registers[layout.check_register(reg)?] = registers[acc];
                    None
                }
                Instruction::SetLocal(local) => {
                    locals[layout.check_local(local)?] = registers[acc];
                    None
                }
                Instruction::GetLocal(local) => {
                    registers[acc] = locals[layout.check_local(local)?];
                    None
                }
                Instruction::Increment => {
                    registers[acc] = registers[acc].wrapping_add(1);
                    None
                }
                Instruction::LessThan(reg) => {
                    let lhs = registers[layout.check_register(reg)?];
                    registers[acc] = u64::from(lhs < registers[acc]);
                    None
                }
                Instruction::Jump(target) => Some(target),
                Instruction::JumpConditional { if_true, if_false } => {
                    Some(if registers[acc] != 0 { if_true } else { if_false })
                }
                Instruction::Exit => break,
            };

            if let Some(target) = next {
                log::trace!("{current} -> {target}");
                block = enter(program, target)?;
                current = target;
                cursor = 0;
                stats.jumps_taken += 1;
                stats.blocks_entered += 1;
            }
        }

        log::debug!(
            "interpreted {} instructions ({} jumps)",
            stats.instructions_executed,
            stats.jumps_taken
        );
        Ok(stats)
    }
}

fn enter(program: &Program, id: BlockId) -> VmResult<&[Instruction]> {
    program
        .block(id)
        .map(|block| block.instructions())
        .ok_or_else(|| VmError::malformed(format!("jump to {id}, which does not exist")))
}
