// This module lowers a validated Program into x86-64 machine code. JitCompiler walks blocks in
// program order and, for every instruction, emits the encoder calls that mirror the
// interpreter's semantics for that opcode under the fixed register convention (accumulator in
// RAX, scratch RCX, register file base RSI, locals base RDX). The accumulator is VM register 0
// cached in RAX: it is loaded once on entry and written back by Exit, so Load/Store of
// register 0 emit nothing and LessThan of register 0 compares RAX with itself. Each block
// records its start offset when its first instruction begins; each jump emits a zeroed rel32
// placeholder whose offset is appended to the target block's patch list. Those lists live in
// the compilation session's bumpalo arena. Once every block is emitted, a single patch pass
// rewrites all placeholders. CompiledProgram keeps the code together with block offsets,
// patch sites and the Layout it was compiled against, and is the only way to obtain an
// Executable.

//! Bytecode to x86-64 lowering.

use bumpalo::collections::Vec as BumpVec;

use super::executable::{Executable, WritableRegion};
use crate::core::{
    BlockId, CompilationSession, Instruction, Layout, Program, VmError, VmResult, ACCUMULATOR,
};
use crate::x64::{
    disassemble_with_labels, read_rel32, FixedConvention, JumpCondition, X64Encoder, REL32_SIZE,
};

/// Width of one register-file or locals slot.
const SLOT_SIZE: u64 = 8;

/// A resolved jump: the rel32 field at `site` targets `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub site: usize,
    pub target: BlockId,
}

/// Compiles programs into native code.
pub struct JitCompiler<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    convention: FixedConvention,
}

impl<'s, 'arena> JitCompiler<'s, 'arena> {
    /// Create a compiler using the System V register convention.
    pub fn new(session: &'s CompilationSession<'arena>) -> Self {
        Self {
            session,
            convention: FixedConvention::SYSV,
        }
    }

    /// Create a compiler using explicit accumulator and scratch registers.
    pub fn with_convention(
        session: &'s CompilationSession<'arena>,
        convention: FixedConvention,
    ) -> VmResult<Self> {
        convention.validate()?;
        Ok(Self {
            session,
            convention,
        })
    }

    pub fn convention(&self) -> &FixedConvention {
        &self.convention
    }

    /// Compile `program` for a VM with the given register/locals capacities.
    pub fn compile(&self, program: &Program, layout: Layout) -> VmResult<CompiledProgram> {
        program.validate(&layout)?;

        let cc = self.convention;
        let mut encoder = X64Encoder::with_capacity(program.instruction_count() * 10 + 16);
        let mut block_offsets = vec![0usize; program.len()];
        let mut patch_lists: Vec<BumpVec<'arena, usize>> =
            (0..program.len()).map(|_| self.session.new_vec()).collect();

        // Entry: cache VM register 0 in the accumulator.
        encoder.mov_reg_mem(cc.accumulator, cc.registers_base, 0)?;

        for (id, block) in program.blocks() {
            block_offsets[id.index()] = encoder.position();
            log::trace!("{id} starts at offset {:#x}", encoder.position());

            for inst in block.instructions() {
                self.lower(&mut encoder, inst, &mut patch_lists)?;
                self.session.record_instruction_compiled(inst.mnemonic());
            }
        }

        let mut relocations = Vec::new();
        for (index, sites) in patch_lists.iter().enumerate() {
            let target = BlockId::new(index as u32);
            let target_offset = block_offsets[index];
            for &site in sites.iter() {
                encoder.patch_rel32(site, target_offset)?;
                log::trace!("patched site {site:#x} -> {target} ({target_offset:#x})");
                relocations.push(Relocation { site, target });
            }
        }
        relocations.sort_by_key(|r| r.site);

        let patch_sites: Vec<Vec<usize>> = patch_lists.iter().map(|l| l.to_vec()).collect();
        let code = encoder.finalize();

        self.session.record_patches_resolved(relocations.len());
        self.session.record_program_compiled(program.len(), code.len());
        log::debug!(
            "compiled {} blocks / {} instructions into {} bytes ({} jump patches)",
            program.len(),
            program.instruction_count(),
            code.len(),
            relocations.len()
        );

        Ok(CompiledProgram {
            code,
            block_offsets,
            patch_sites,
            relocations,
            layout,
        })
    }

    fn lower(
        &self,
        enc: &mut X64Encoder,
        inst: &Instruction,
        patch_lists: &mut [BumpVec<'arena, usize>],
    ) -> VmResult<()> {
        let cc = &self.convention;
        let acc = cc.accumulator;

        match *inst {
            Instruction::LoadImmediate(value) => enc.mov_reg_imm64(acc, value)?,
            Instruction::Load(reg) => {
                if reg != ACCUMULATOR {
                    enc.mov_reg_mem(acc, cc.registers_base, slot_displacement(reg)?)?;
                }
            }
            Instruction::Store(reg) => {
                if reg != ACCUMULATOR {
                    enc.mov_mem_reg(cc.registers_base, slot_displacement(reg)?, acc)?;
                }
            }
            Instruction::SetLocal(local) => {
                enc.mov_mem_reg(cc.locals_base, slot_displacement(local)?, acc)?
            }
            Instruction::GetLocal(local) => {
                enc.mov_reg_mem(acc, cc.locals_base, slot_displacement(local)?)?
            }
            Instruction::Increment => enc.inc_reg(acc)?,
            Instruction::LessThan(reg) => {
                let lhs = if reg == ACCUMULATOR {
                    acc
                } else {
                    enc.mov_reg_mem(cc.scratch, cc.registers_base, slot_displacement(reg)?)?;
                    cc.scratch
                };
                enc.less_than(acc, lhs, acc)?;
            }
            Instruction::Jump(target) => {
                let site = enc.jmp_rel32();
                patch_lists[target.index()].push(site);
            }
            Instruction::JumpConditional { if_true, if_false } => {
                enc.test_reg_reg(acc, acc)?;
                let site = enc.jcc_rel32(JumpCondition::Zero);
                patch_lists[if_false.index()].push(site);
                let site = enc.jmp_rel32();
                patch_lists[if_true.index()].push(site);
            }
            Instruction::Exit => {
                enc.mov_mem_reg(cc.registers_base, 0, acc)?;
                enc.ret();
            }
        }
        Ok(())
    }
}

/// Byte displacement of slot `index` from its array base.
fn slot_displacement(index: u64) -> VmResult<i32> {
    index
        .checked_mul(SLOT_SIZE)
        .and_then(|disp| i32::try_from(disp).ok())
        .ok_or_else(|| {
            VmError::malformed(format!(
                "slot {index} is beyond the reach of a 32-bit displacement"
            ))
        })
}

/// Native code for one program, not yet mapped executable.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    code: Vec<u8>,
    block_offsets: Vec<usize>,
    patch_sites: Vec<Vec<usize>>,
    relocations: Vec<Relocation>,
    layout: Layout,
}

impl CompiledProgram {
    /// The emitted machine code; execution starts at offset 0.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Offset of the first byte of `block`.
    pub fn block_offset(&self, block: BlockId) -> Option<usize> {
        self.block_offsets.get(block.index()).copied()
    }

    /// Offsets of every rel32 field that jumps to `block`.
    pub fn patch_sites(&self, block: BlockId) -> &[usize] {
        self.patch_sites
            .get(block.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All jumps, ordered by patch site.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// The displacement currently stored at `site`.
    pub fn displacement_at(&self, site: usize) -> Option<i32> {
        read_rel32(&self.code, site)
    }

    /// Check that every jump lands on its target block's first byte.
    pub fn verify_relocations(&self) -> VmResult<()> {
        for reloc in &self.relocations {
            let target = self.block_offsets[reloc.target.index()] as i64;
            let expected = target - (reloc.site + REL32_SIZE) as i64;
            let found = self.displacement_at(reloc.site).map(i64::from);
            if found != Some(expected) {
                return Err(VmError::malformed(format!(
                    "jump at {:#x} to {} holds {found:?}, expected {expected}",
                    reloc.site, reloc.target
                )));
            }
        }
        Ok(())
    }

    /// Capacities the code was compiled against.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Disassembly with `blockN:` labels at block boundaries.
    pub fn disassemble(&self) -> String {
        let mut labels = vec![(0, "entry".to_string())];
        labels.extend(
            self.block_offsets
                .iter()
                .enumerate()
                .map(|(i, &offset)| (offset, BlockId::new(i as u32).to_string())),
        );
        disassemble_with_labels(&self.code, &labels)
    }

    /// Copy the code into a fresh region, seal it and return the entry point.
    pub fn load(&self) -> VmResult<Executable> {
        let mut region = WritableRegion::allocate(self.code.len())?;
        region.write(&self.code)?;
        let region = region.finalize()?;
        Ok(Executable::new(region, self.layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn compile(program: &Program, layout: Layout) -> VmResult<CompiledProgram> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        JitCompiler::new(&session).compile(program, layout)
    }

    #[test]
    fn test_exit_only_program() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.append(entry, Instruction::Exit);

        let compiled = compile(&program, Layout::new(1, 0)).unwrap();
        assert_eq!(
            compiled.code(),
            [
                0x48, 0x8B, 0x86, 0, 0, 0, 0, // mov rax, [rsi+0]
                0x48, 0x89, 0x86, 0, 0, 0, 0, // mov [rsi+0], rax
                0xC3, // ret
            ]
        );
        assert_eq!(compiled.block_offset(entry), Some(7));
        assert!(compiled.relocations().is_empty());
    }

    #[test]
    fn test_accumulator_register_needs_no_code() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.extend(
            entry,
            [
                Instruction::Load(0),
                Instruction::Store(0),
                Instruction::Exit,
            ],
        );
        let with_noops = compile(&program, Layout::new(1, 0)).unwrap();

        let mut program = Program::new();
        let entry = program.make_block();
        program.append(entry, Instruction::Exit);
        let bare = compile(&program, Layout::new(1, 0)).unwrap();

        assert_eq!(with_noops.code(), bare.code());
    }

    #[test]
    fn test_less_than_lowering() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.extend(entry, [Instruction::LessThan(2), Instruction::Exit]);

        let compiled = compile(&program, Layout::new(3, 0)).unwrap();
        let body = &compiled.code()[7..7 + 16];
        assert_eq!(
            body,
            [
                0x48, 0x8B, 0x8E, 0x10, 0, 0, 0, // mov rcx, [rsi+16]
                0x48, 0x39, 0xC1, // cmp rcx, rax
                0x0F, 0x92, 0xC0, // setb al
                0x0F, 0xB6, 0xC0, // movzx eax, al
            ]
        );
    }

    #[test]
    fn test_custom_convention() {
        use crate::x64::registers::{R11, R8, RAX, RBX};

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let convention = FixedConvention::new(RAX, R11).unwrap();
        let compiler = JitCompiler::with_convention(&session, convention).unwrap();

        let mut program = Program::new();
        let entry = program.make_block();
        program.extend(entry, [Instruction::LessThan(1), Instruction::Exit]);
        let compiled = compiler.compile(&program, Layout::new(2, 0)).unwrap();
        // mov r11, [rsi+8]; cmp r11, rax
        assert_eq!(
            &compiled.code()[7..17],
            [0x4C, 0x8B, 0x9E, 0x08, 0, 0, 0, 0x49, 0x39, 0xC3]
        );

        let callee_saved = FixedConvention {
            scratch: RBX,
            ..FixedConvention::SYSV
        };
        assert!(matches!(
            JitCompiler::with_convention(&session, callee_saved),
            Err(VmError::Convention(_))
        ));

        // Invoke always passes the register file in rsi.
        let moved_base = FixedConvention {
            registers_base: R8,
            ..FixedConvention::SYSV
        };
        assert!(matches!(
            JitCompiler::with_convention(&session, moved_base),
            Err(VmError::Convention(
                crate::x64::ConventionError::ParameterMismatch { .. }
            ))
        ));
    }

    #[test]
    fn test_conditional_branch_polarity() {
        let mut program = Program::new();
        let entry = program.make_block();
        let yes = program.make_block();
        let no = program.make_block();
        program.append(
            entry,
            Instruction::JumpConditional {
                if_true: yes,
                if_false: no,
            },
        );
        program.append(yes, Instruction::Exit);
        program.append(no, Instruction::Exit);

        let compiled = compile(&program, Layout::new(1, 0)).unwrap();
        let code = compiled.code();
        // test rax, rax; jz <no>; jmp <yes>
        assert_eq!(&code[7..10], [0x48, 0x85, 0xC0]);
        assert_eq!(&code[10..12], [0x0F, 0x84]);
        assert_eq!(code[16], 0xE9);

        assert_eq!(compiled.patch_sites(no), [12]);
        assert_eq!(compiled.patch_sites(yes), [17]);
        assert!(compiled.patch_sites(entry).is_empty());
        compiled.verify_relocations().unwrap();
    }

    #[test]
    fn test_self_loop_relocation() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.extend(entry, [Instruction::Increment, Instruction::Jump(entry)]);

        let compiled = compile(&program, Layout::new(1, 0)).unwrap();
        let site = compiled.patch_sites(entry)[0];
        let start = compiled.block_offset(entry).unwrap() as i64;
        assert_eq!(
            compiled.displacement_at(site).map(i64::from),
            Some(start - (site as i64 + 4))
        );
        assert!(compiled.displacement_at(site).unwrap() < 0);
    }

    #[test]
    fn test_compile_rejects_malformed_program() {
        let mut program = Program::new();
        let entry = program.make_block();
        program.append(entry, Instruction::Increment);
        assert!(matches!(
            compile(&program, Layout::new(1, 0)),
            Err(VmError::MalformedProgram { .. })
        ));

        let mut program = Program::new();
        let entry = program.make_block();
        program.extend(entry, [Instruction::GetLocal(4), Instruction::Exit]);
        assert!(matches!(
            compile(&program, Layout::new(1, 4)),
            Err(VmError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_slot_displacement_limits() {
        assert_eq!(slot_displacement(0).unwrap(), 0);
        assert_eq!(slot_displacement(3).unwrap(), 24);
        assert!(slot_displacement((i32::MAX as u64) / 8 + 1).is_err());
        assert!(slot_displacement(u64::MAX).is_err());
    }

    #[test]
    fn test_session_records_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut program = Program::new();
        let a = program.make_block();
        let b = program.make_block();
        program.extend(a, [Instruction::LoadImmediate(1), Instruction::Jump(b)]);
        program.append(b, Instruction::Exit);

        let compiled = JitCompiler::new(&session).compile(&program, Layout::new(1, 0)).unwrap();
        let stats = session.stats();
        assert_eq!(stats.programs_compiled, 1);
        assert_eq!(stats.blocks_compiled, 2);
        assert_eq!(stats.instructions_compiled, 3);
        assert_eq!(stats.patches_resolved, 1);
        assert_eq!(stats.total_code_size, compiled.len());
        assert_eq!(stats.instruction_counts["Jump"], 1);
    }

    #[test]
    fn test_disassembly_has_block_labels() {
        let mut program = Program::new();
        let a = program.make_block();
        let b = program.make_block();
        program.append(a, Instruction::Jump(b));
        program.append(b, Instruction::Exit);

        let text = compile(&program, Layout::new(1, 0)).unwrap().disassemble();
        let labels: Vec<_> = text.lines().filter(|l| l.ends_with(':')).collect();
        assert_eq!(labels, ["entry:", "block0:", "block1:"]);
        assert!(text.contains("jmp"));
    }
}
