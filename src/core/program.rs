// This module defines the bytecode IR shared by both execution backends. A Program is an
// arena of BasicBlocks addressed by BlockId handles, so a block can be referenced as a jump
// target before its own instructions exist (forward jumps, loop back-edges). Instruction is
// a closed enum over the ten opcodes, each variant carrying only its operands; both the
// interpreter and the JIT dispatch on it with exhaustive matches. All non-control opcodes
// work through the accumulator, which is register 0 of the register file. The block
// terminator rule (exactly one control transfer, at the end) is not encoded in the types,
// so Program::validate checks it together with jump targets and index bounds against a
// Layout before either backend touches VM state. The Display impls form the diagnostic
// dump, whose syntax the text module parses back.

//! Program / basic block / instruction model.

use std::fmt;

use super::error::{IndexSpace, VmError, VmResult};

/// A 64-bit machine value.
pub type Value = u64;

/// Index into the VM register file. Register 0 is the accumulator.
pub type Reg = u64;

/// Index into the VM locals array.
pub type Local = u64;

/// Register that holds the accumulator.
pub const ACCUMULATOR: Reg = 0;

/// Stable handle of a block inside its [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// Handle of the entry block.
    pub const ENTRY: BlockId = BlockId(0);

    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// One bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// acc = value
    LoadImmediate(Value),
    /// acc = regs[r]
    Load(Reg),
    /// regs[r] = acc
    Store(Reg),
    /// locals[l] = acc
    SetLocal(Local),
    /// acc = locals[l]
    GetLocal(Local),
    /// acc = acc + 1
    Increment,
    /// acc = regs[r] < acc
    LessThan(Reg),
    Jump(BlockId),
    /// Continue at `if_true` when acc is nonzero, `if_false` otherwise.
    JumpConditional { if_true: BlockId, if_false: BlockId },
    Exit,
}

impl Instruction {
    /// Whether this instruction transfers control and so must end a block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump(_) | Instruction::JumpConditional { .. } | Instruction::Exit
        )
    }

    /// Mnemonic used by the dump and the text format.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::LoadImmediate(_) => "LoadImmediate",
            Instruction::Load(_) => "Load",
            Instruction::Store(_) => "Store",
            Instruction::SetLocal(_) => "SetLocal",
            Instruction::GetLocal(_) => "GetLocal",
            Instruction::Increment => "Increment",
            Instruction::LessThan(_) => "LessThan",
            Instruction::Jump(_) => "Jump",
            Instruction::JumpConditional { .. } => "JumpConditional",
            Instruction::Exit => "Exit",
        }
    }

    /// Blocks this instruction may transfer control to.
    pub fn successors(&self) -> impl Iterator<Item = BlockId> {
        let (a, b) = match *self {
            Instruction::Jump(target) => (Some(target), None),
            Instruction::JumpConditional { if_true, if_false } => (Some(if_true), Some(if_false)),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// The register operand, if the instruction has one.
    pub fn register_operand(&self) -> Option<Reg> {
        match *self {
            Instruction::Load(r) | Instruction::Store(r) | Instruction::LessThan(r) => Some(r),
            _ => None,
        }
    }

    /// The local operand, if the instruction has one.
    pub fn local_operand(&self) -> Option<Local> {
        match *self {
            Instruction::SetLocal(l) | Instruction::GetLocal(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::LoadImmediate(v) => write!(f, "LoadImmediate {v}"),
            Instruction::Load(r) => write!(f, "Load r{r}"),
            Instruction::Store(r) => write!(f, "Store r{r}"),
            Instruction::SetLocal(l) => write!(f, "SetLocal {l}"),
            Instruction::GetLocal(l) => write!(f, "GetLocal {l}"),
            Instruction::Increment => write!(f, "Increment"),
            Instruction::LessThan(r) => write!(f, "LessThan r{r}"),
            Instruction::Jump(target) => write!(f, "Jump {target}"),
            Instruction::JumpConditional { if_true, if_false } => {
                write!(f, "JumpConditional {if_true} {if_false}")
            }
            Instruction::Exit => write!(f, "Exit"),
        }
    }
}

/// Straight-line instruction sequence ending in one control transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlock {
    instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The final instruction if it is a control transfer.
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|inst| inst.is_terminator())
    }
}

/// Capacities a program is validated and compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub registers: usize,
    pub locals: usize,
}

impl Layout {
    pub const fn new(registers: usize, locals: usize) -> Self {
        Self { registers, locals }
    }

    /// Check a register index against the register capacity.
    pub fn check_register(&self, reg: Reg) -> VmResult<usize> {
        check_index(IndexSpace::Register, reg, self.registers)
    }

    /// Check a local index against the locals capacity.
    pub fn check_local(&self, local: Local) -> VmResult<usize> {
        check_index(IndexSpace::Local, local, self.locals)
    }
}

fn check_index(space: IndexSpace, index: u64, capacity: usize) -> VmResult<usize> {
    match usize::try_from(index) {
        Ok(i) if i < capacity => Ok(i),
        _ => Err(VmError::IndexOutOfRange {
            space,
            index,
            capacity,
        }),
    }
}

/// A set of basic blocks; block 0 is the entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    blocks: Vec<BasicBlock>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty block and return its handle.
    ///
    /// The first block created is the entry block.
    pub fn make_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        id
    }

    /// Append an instruction to `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` was not created by this program.
    pub fn append(&mut self, block: BlockId, instruction: Instruction) {
        self.blocks[block.index()].instructions.push(instruction);
    }

    /// Append several instructions to `block`.
    pub fn extend(&mut self, block: BlockId, instructions: impl IntoIterator<Item = Instruction>) {
        self.blocks[block.index()].instructions.extend(instructions);
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    /// Iterate over `(handle, block)` pairs in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, block)| (BlockId(i as u32), block))
    }

    pub fn entry(&self) -> BlockId {
        BlockId::ENTRY
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of instructions over all blocks.
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(BasicBlock::len).sum()
    }

    /// Check the structural invariants both backends rely on.
    ///
    /// Every block must end in exactly one control transfer, every jump must
    /// name a block of this program, and every register and local operand
    /// must fit `layout`. The register file must hold the accumulator.
    pub fn validate(&self, layout: &Layout) -> VmResult<()> {
        if self.blocks.is_empty() {
            return Err(VmError::malformed("program has no blocks"));
        }
        layout.check_register(ACCUMULATOR)?;

        for (id, block) in self.blocks() {
            let Some((last, body)) = block.instructions.split_last() else {
                return Err(VmError::malformed(format!("{id} is empty")));
            };
            if !last.is_terminator() {
                return Err(VmError::malformed(format!(
                    "{id} does not end in a control transfer (last instruction: {last})"
                )));
            }
            if let Some(pos) = body.iter().position(Instruction::is_terminator) {
                return Err(VmError::malformed(format!(
                    "{id} has control transfer `{}` at position {pos} before its end",
                    body[pos]
                )));
            }

            for inst in &block.instructions {
                for target in inst.successors() {
                    if target.index() >= self.blocks.len() {
                        return Err(VmError::malformed(format!(
                            "{id} jumps to {target}, which does not exist"
                        )));
                    }
                }
                if let Some(reg) = inst.register_operand() {
                    layout.check_register(reg)?;
                }
                if let Some(local) = inst.local_operand() {
                    layout.check_local(local)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, block) in self.blocks() {
            writeln!(f, "{id}:")?;
            for inst in block.instructions() {
                writeln!(f, "    {inst}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_loop() -> Program {
        let mut program = Program::new();
        let entry = program.make_block();
        let check = program.make_block();
        let body = program.make_block();
        let done = program.make_block();

        program.extend(
            entry,
            [
                Instruction::LoadImmediate(0),
                Instruction::SetLocal(0),
                Instruction::Jump(check),
            ],
        );
        program.extend(
            check,
            [
                Instruction::GetLocal(0),
                Instruction::Store(1),
                Instruction::LoadImmediate(10),
                Instruction::LessThan(1),
                Instruction::JumpConditional {
                    if_true: body,
                    if_false: done,
                },
            ],
        );
        program.extend(
            body,
            [
                Instruction::GetLocal(0),
                Instruction::Increment,
                Instruction::SetLocal(0),
                Instruction::Jump(check),
            ],
        );
        program.extend(done, [Instruction::Exit]);
        program
    }

    #[test]
    fn test_blocks_are_addressed_by_handle() {
        let mut program = Program::new();
        let a = program.make_block();
        let b = program.make_block();
        // Reference b before it has any instructions.
        program.append(a, Instruction::Jump(b));
        program.append(b, Instruction::Exit);

        assert_eq!(program.entry(), a);
        assert_eq!(program.len(), 2);
        assert_eq!(program.block(a).unwrap().terminator(), Some(&Instruction::Jump(b)));
        assert!(program.validate(&Layout::new(1, 0)).is_ok());
    }

    #[test]
    fn test_validate_counting_loop() {
        let program = counting_loop();
        assert_eq!(program.instruction_count(), 13);
        assert!(program.validate(&Layout::new(2, 1)).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_terminator() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.append(entry, Instruction::Increment);

        let err = program.validate(&Layout::new(1, 0)).unwrap_err();
        assert!(matches!(err, VmError::MalformedProgram { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_program_and_block() {
        let program = Program::new();
        assert!(matches!(
            program.validate(&Layout::new(1, 0)),
            Err(VmError::MalformedProgram { .. })
        ));

        let mut program = Program::new();
        let entry = program.make_block();
        let _empty = program.make_block();
        program.append(entry, Instruction::Exit);
        assert!(matches!(
            program.validate(&Layout::new(1, 0)),
            Err(VmError::MalformedProgram { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_early_terminator() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.extend(entry, [Instruction::Exit, Instruction::Increment, Instruction::Exit]);
        assert!(matches!(
            program.validate(&Layout::new(1, 0)),
            Err(VmError::MalformedProgram { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_dangling_target() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.append(entry, Instruction::Jump(BlockId::new(7)));
        assert!(matches!(
            program.validate(&Layout::new(1, 0)),
            Err(VmError::MalformedProgram { .. })
        ));
    }

    #[test]
    fn test_validate_checks_indices() {
        let program = counting_loop();
        let err = program.validate(&Layout::new(1, 1)).unwrap_err();
        assert!(matches!(
            err,
            VmError::IndexOutOfRange {
                space: IndexSpace::Register,
                index: 1,
                capacity: 1
            }
        ));

        let err = program.validate(&Layout::new(2, 0)).unwrap_err();
        assert!(matches!(
            err,
            VmError::IndexOutOfRange {
                space: IndexSpace::Local,
                ..
            }
        ));

        // The accumulator needs a register even if nothing names it.
        let mut program = Program::new();
        let entry = program.make_block();
        program.append(entry, Instruction::Exit);
        assert!(program.validate(&Layout::new(0, 0)).is_err());
    }

    #[test]
    fn test_successors() {
        let t = BlockId::new(1);
        let f = BlockId::new(2);
        let inst = Instruction::JumpConditional {
            if_true: t,
            if_false: f,
        };
        assert_eq!(inst.successors().collect::<Vec<_>>(), vec![t, f]);
        assert_eq!(Instruction::Exit.successors().count(), 0);
    }

    #[test]
    fn test_dump_format() {
        let dump = counting_loop().to_string();
        assert!(dump.starts_with("block0:\n    LoadImmediate 0\n"));
        assert!(dump.contains("    JumpConditional block2 block3\n"));
        assert!(dump.contains("    LessThan r1\n"));
        assert!(dump.ends_with("block3:\n    Exit\n"));
    }
}
