// This module is the machine-code emitter of the JIT. X64Encoder appends byte-exact x86-64
// encodings to an owned buffer for the small instruction set the bytecode lowers to: 64-bit
// moves between registers, immediates and [base + disp32] memory operands, INC, the
// CMP/SETB/MOVZX sequence that materialises an unsigned less-than, TEST, near relative JMP
// and Jcc with 32-bit displacements, and RET. Memory operands always use the mod=10 (disp32)
// form, with the mandatory SIB byte when rsp or r12 is the base. Jumps are emitted with a
// zeroed 4-byte placeholder and return the placeholder's offset; patch_rel32 later rewrites it
// to target - (site + 4) once block offsets are known. The encoding table lives entirely in
// this file, so porting to another architecture means replacing it.

//! Byte-exact x86-64 instruction encoding.

use thiserror::Error;

use super::registers::AsmReg;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Register id outside rax..r15.
    #[error("Invalid register id {0}")]
    InvalidRegister(u8),

    /// Patch site does not name a 4-byte field inside the buffer.
    #[error("Patch site {site} outside of {len}-byte buffer")]
    PatchSiteOutOfRange { site: usize, len: usize },

    /// Jump distance does not fit a signed 32-bit displacement.
    #[error("Displacement from patch site {site} to offset {target} overflows rel32")]
    DisplacementOverflow { site: usize, target: usize },
}

/// Condition tested by a conditional jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    /// ZF = 1 (`jz` / `je`).
    Zero,
    /// ZF = 0 (`jnz` / `jne`).
    NotZero,
}

impl JumpCondition {
    fn opcode(self) -> u8 {
        match self {
            JumpCondition::Zero => 0x84,
            JumpCondition::NotZero => 0x85,
        }
    }
}

const REX: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_B: u8 = 0x01;

const MOD_DISP32: u8 = 0b10;
const MOD_REG: u8 = 0b11;

/// SIB byte for `[rsp/r12 + disp]`: no index, base from ModRM.rm.
const SIB_NO_INDEX: u8 = 0x24;

/// Size of every jump displacement field.
pub const REL32_SIZE: usize = 4;

/// x86-64 machine-code emitter.
#[derive(Debug, Default, Clone)]
pub struct X64Encoder {
    code: Vec<u8>,
}

impl X64Encoder {
    /// Create a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Current buffer length, i.e. the offset of the next emitted byte.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Hand out the finished buffer.
    pub fn finalize(self) -> Vec<u8> {
        self.code
    }

    fn check(reg: AsmReg) -> Result<AsmReg, EncodingError> {
        if reg.is_valid() {
            Ok(reg)
        } else {
            Err(EncodingError::InvalidRegister(reg.id))
        }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        (mode << 6) | ((reg & 0b111) << 3) | (rm & 0b111)
    }

    /// REX prefix for an instruction whose ModRM.reg is `reg` and ModRM.rm
    /// (or opcode register) is `rm`.
    fn rex(wide: bool, reg: Option<AsmReg>, rm: AsmReg) -> u8 {
        let mut rex = REX;
        if wide {
            rex |= REX_W;
        }
        if reg.is_some_and(AsmReg::is_extended) {
            rex |= REX_R;
        }
        if rm.is_extended() {
            rex |= REX_B;
        }
        rex
    }

    fn emit_mem_operand(&mut self, reg: AsmReg, base: AsmReg, disp: i32) {
        self.code
            .push(Self::modrm(MOD_DISP32, reg.low_bits(), base.low_bits()));
        if base.base_needs_sib() {
            self.code.push(SIB_NO_INDEX);
        }
        self.code.extend_from_slice(&disp.to_le_bytes());
    }

    /// `mov dst, imm64` (REX.W B8+rd io).
    pub fn mov_reg_imm64(&mut self, dst: AsmReg, imm: u64) -> Result<(), EncodingError> {
        let dst = Self::check(dst)?;
        self.code.push(Self::rex(true, None, dst));
        self.code.push(0xB8 + dst.low_bits());
        self.code.extend_from_slice(&imm.to_le_bytes());
        Ok(())
    }

    /// `mov dst, src` (REX.W 89 /r).
    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst = Self::check(dst)?;
        let src = Self::check(src)?;
        self.code.push(Self::rex(true, Some(src), dst));
        self.code.push(0x89);
        self.code
            .push(Self::modrm(MOD_REG, src.low_bits(), dst.low_bits()));
        Ok(())
    }

    /// `mov qword [base + disp32], src` (REX.W 89 /r).
    pub fn mov_mem_reg(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<(), EncodingError> {
        let base = Self::check(base)?;
        let src = Self::check(src)?;
        self.code.push(Self::rex(true, Some(src), base));
        self.code.push(0x89);
        self.emit_mem_operand(src, base, disp);
        Ok(())
    }

    /// `mov dst, qword [base + disp32]` (REX.W 8B /r).
    pub fn mov_reg_mem(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<(), EncodingError> {
        let dst = Self::check(dst)?;
        let base = Self::check(base)?;
        self.code.push(Self::rex(true, Some(dst), base));
        self.code.push(0x8B);
        self.emit_mem_operand(dst, base, disp);
        Ok(())
    }

    /// `inc reg` (REX.W FF /0).
    pub fn inc_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg = Self::check(reg)?;
        self.code.push(Self::rex(true, None, reg));
        self.code.push(0xFF);
        self.code.push(Self::modrm(MOD_REG, 0, reg.low_bits()));
        Ok(())
    }

    /// `cmp lhs, rhs` (REX.W 39 /r), setting flags for `lhs - rhs`.
    pub fn cmp_reg_reg(&mut self, lhs: AsmReg, rhs: AsmReg) -> Result<(), EncodingError> {
        let lhs = Self::check(lhs)?;
        let rhs = Self::check(rhs)?;
        self.code.push(Self::rex(true, Some(rhs), lhs));
        self.code.push(0x39);
        self.code
            .push(Self::modrm(MOD_REG, rhs.low_bits(), lhs.low_bits()));
        Ok(())
    }

    /// `test a, b` (REX.W 85 /r).
    pub fn test_reg_reg(&mut self, a: AsmReg, b: AsmReg) -> Result<(), EncodingError> {
        let a = Self::check(a)?;
        let b = Self::check(b)?;
        self.code.push(Self::rex(true, Some(b), a));
        self.code.push(0x85);
        self.code.push(Self::modrm(MOD_REG, b.low_bits(), a.low_bits()));
        Ok(())
    }

    /// `setb dst8` (0F 92 /0): low byte = CF.
    pub fn setb_reg(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let dst = Self::check(dst)?;
        if dst.is_extended() || dst.byte_form_needs_rex() {
            self.code.push(Self::rex(false, None, dst));
        }
        self.code.extend_from_slice(&[0x0F, 0x92]);
        self.code.push(Self::modrm(MOD_REG, 0, dst.low_bits()));
        Ok(())
    }

    /// `movzx dst32, src8` (0F B6 /r); writing the 32-bit register clears
    /// the upper half of the 64-bit one.
    pub fn movzx_reg32_reg8(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst = Self::check(dst)?;
        let src = Self::check(src)?;
        if dst.is_extended() || src.is_extended() || src.byte_form_needs_rex() {
            self.code.push(Self::rex(false, Some(dst), src));
        }
        self.code.extend_from_slice(&[0x0F, 0xB6]);
        self.code
            .push(Self::modrm(MOD_REG, dst.low_bits(), src.low_bits()));
        Ok(())
    }

    /// `dst = (lhs < rhs) ? 1 : 0`, unsigned.
    ///
    /// Emits `cmp lhs, rhs; setb dst8; movzx dst32, dst8`. `dst` may be
    /// either operand since the comparison happens first.
    pub fn less_than(&mut self, dst: AsmReg, lhs: AsmReg, rhs: AsmReg) -> Result<(), EncodingError> {
        self.cmp_reg_reg(lhs, rhs)?;
        self.setb_reg(dst)?;
        self.movzx_reg32_reg8(dst, dst)
    }

    fn emit_placeholder(&mut self) -> usize {
        let site = self.code.len();
        self.code.extend_from_slice(&[0; REL32_SIZE]);
        site
    }

    /// `jmp rel32` (E9 cd) with a zero placeholder.
    ///
    /// Returns the offset of the displacement field.
    pub fn jmp_rel32(&mut self) -> usize {
        self.code.push(0xE9);
        self.emit_placeholder()
    }

    /// `jcc rel32` (0F 8x cd) with a zero placeholder.
    ///
    /// Returns the offset of the displacement field.
    pub fn jcc_rel32(&mut self, condition: JumpCondition) -> usize {
        self.code.extend_from_slice(&[0x0F, condition.opcode()]);
        self.emit_placeholder()
    }

    /// `ret` (C3).
    pub fn ret(&mut self) {
        self.code.push(0xC3);
    }

    /// Point the placeholder at `site` to buffer offset `target`.
    ///
    /// The displacement is relative to the byte after the 4-byte field.
    pub fn patch_rel32(&mut self, site: usize, target: usize) -> Result<(), EncodingError> {
        let len = self.code.len();
        let field = site
            .checked_add(REL32_SIZE)
            .filter(|&end| end <= len)
            .map(|end| site..end)
            .ok_or(EncodingError::PatchSiteOutOfRange { site, len })?;

        let rel = (target as i64) - ((site + REL32_SIZE) as i64);
        let rel = i32::try_from(rel)
            .map_err(|_| EncodingError::DisplacementOverflow { site, target })?;
        self.code[field].copy_from_slice(&rel.to_le_bytes());
        Ok(())
    }

    /// Read back the displacement stored at `site`.
    pub fn read_rel32(&self, site: usize) -> Option<i32> {
        read_rel32(&self.code, site)
    }
}

/// Read a little-endian rel32 field out of finished code.
pub fn read_rel32(code: &[u8], site: usize) -> Option<i32> {
    let bytes = code.get(site..site.checked_add(REL32_SIZE)?)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::registers::*;
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};

    fn decode_one(code: &[u8]) -> Instruction {
        let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let inst = decoder.decode();
        assert!(!inst.is_invalid(), "invalid encoding {code:02X?}");
        assert_eq!(inst.len(), code.len(), "trailing bytes in {code:02X?}");
        inst
    }

    fn emit(f: impl FnOnce(&mut X64Encoder)) -> Vec<u8> {
        let mut encoder = X64Encoder::new();
        f(&mut encoder);
        encoder.finalize()
    }

    #[test]
    fn test_mov_imm64() {
        let code = emit(|e| e.mov_reg_imm64(RAX, 0x1122_3344_5566_7788).unwrap());
        assert_eq!(
            code,
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );

        let code = emit(|e| e.mov_reg_imm64(R9, u64::MAX).unwrap());
        let inst = decode_one(&code);
        assert_eq!(inst.mnemonic(), Mnemonic::Mov);
        assert_eq!(inst.op0_register(), Register::R9);
        assert_eq!(inst.immediate64(), u64::MAX);
    }

    #[test]
    fn test_mov_reg_reg() {
        let code = emit(|e| e.mov_reg_reg(RCX, RAX).unwrap());
        assert_eq!(code, [0x48, 0x89, 0xC1]);

        let code = emit(|e| e.mov_reg_reg(R10, R11).unwrap());
        let inst = decode_one(&code);
        assert_eq!(inst.op0_register(), Register::R10);
        assert_eq!(inst.op1_register(), Register::R11);
    }

    #[test]
    fn test_memory_moves_use_disp32() {
        let code = emit(|e| e.mov_reg_mem(RAX, RSI, 0x10).unwrap());
        assert_eq!(code, [0x48, 0x8B, 0x86, 0x10, 0x00, 0x00, 0x00]);

        let code = emit(|e| e.mov_mem_reg(RDX, 8, RAX).unwrap());
        assert_eq!(code, [0x48, 0x89, 0x82, 0x08, 0x00, 0x00, 0x00]);

        // Zero displacement still takes the disp32 form.
        let code = emit(|e| e.mov_mem_reg(RSI, 0, RAX).unwrap());
        assert_eq!(code, [0x48, 0x89, 0x86, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_memory_operand_needs_sib_for_rsp_and_r12() {
        let code = emit(|e| e.mov_reg_mem(RAX, R12, 8).unwrap());
        assert_eq!(code, [0x49, 0x8B, 0x84, 0x24, 0x08, 0x00, 0x00, 0x00]);

        let code = emit(|e| e.mov_mem_reg(RSP, -16, R15).unwrap());
        let inst = decode_one(&code);
        assert_eq!(inst.mnemonic(), Mnemonic::Mov);
        assert_eq!(inst.memory_base(), Register::RSP);
        assert_eq!(inst.memory_displacement64(), (-16i64) as u64);
        assert_eq!(inst.op1_register(), Register::R15);

        let code = emit(|e| e.mov_reg_mem(R13, RBP, 0x7FFF_FFF8).unwrap());
        let inst = decode_one(&code);
        assert_eq!(inst.op0_register(), Register::R13);
        assert_eq!(inst.memory_base(), Register::RBP);
        assert_eq!(inst.memory_displacement64(), 0x7FFF_FFF8);
    }

    #[test]
    fn test_inc_and_compare() {
        assert_eq!(emit(|e| e.inc_reg(RAX).unwrap()), [0x48, 0xFF, 0xC0]);
        assert_eq!(emit(|e| e.cmp_reg_reg(RCX, RAX).unwrap()), [0x48, 0x39, 0xC1]);
        assert_eq!(emit(|e| e.test_reg_reg(RAX, RAX).unwrap()), [0x48, 0x85, 0xC0]);
        assert_eq!(emit(|e| e.setb_reg(RAX).unwrap()), [0x0F, 0x92, 0xC0]);
        assert_eq!(emit(|e| e.movzx_reg32_reg8(RAX, RAX).unwrap()), [0x0F, 0xB6, 0xC0]);

        let inst = decode_one(&emit(|e| e.inc_reg(R14).unwrap()));
        assert_eq!(inst.mnemonic(), Mnemonic::Inc);
        assert_eq!(inst.op0_register(), Register::R14);
    }

    #[test]
    fn test_byte_registers_get_rex() {
        let inst = decode_one(&emit(|e| e.setb_reg(RSI).unwrap()));
        assert_eq!(inst.mnemonic(), Mnemonic::Setb);
        assert_eq!(inst.op0_register(), Register::SIL);

        let inst = decode_one(&emit(|e| e.movzx_reg32_reg8(R8, RDI).unwrap()));
        assert_eq!(inst.mnemonic(), Mnemonic::Movzx);
        assert_eq!(inst.op0_register(), Register::R8D);
        assert_eq!(inst.op1_register(), Register::DIL);
    }

    #[test]
    fn test_less_than_sequence() {
        let code = emit(|e| e.less_than(RAX, RCX, RAX).unwrap());
        assert_eq!(
            code,
            [0x48, 0x39, 0xC1, 0x0F, 0x92, 0xC0, 0x0F, 0xB6, 0xC0]
        );

        let mut decoder = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let mnemonics: Vec<_> = decoder.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(mnemonics, [Mnemonic::Cmp, Mnemonic::Setb, Mnemonic::Movzx]);
    }

    #[test]
    fn test_jumps_and_ret() {
        let mut encoder = X64Encoder::new();
        let jmp_site = encoder.jmp_rel32();
        let jz_site = encoder.jcc_rel32(JumpCondition::Zero);
        let jnz_site = encoder.jcc_rel32(JumpCondition::NotZero);
        encoder.ret();

        assert_eq!(jmp_site, 1);
        assert_eq!(jz_site, 7);
        assert_eq!(jnz_site, 13);
        assert_eq!(
            encoder.code(),
            [
                0xE9, 0, 0, 0, 0, //
                0x0F, 0x84, 0, 0, 0, 0, //
                0x0F, 0x85, 0, 0, 0, 0, //
                0xC3,
            ]
        );
    }

    #[test]
    fn test_patch_forward_and_backward() {
        let mut encoder = X64Encoder::new();
        encoder.ret(); // offset 0: backward target
        let back = encoder.jmp_rel32(); // E9 at 1, site 2
        let fwd = encoder.jcc_rel32(JumpCondition::Zero); // 0F 84 at 6, site 8
        encoder.ret(); // offset 12: forward target

        encoder.patch_rel32(back, 0).unwrap();
        encoder.patch_rel32(fwd, 12).unwrap();

        assert_eq!(encoder.read_rel32(back), Some(-6));
        assert_eq!(encoder.read_rel32(fwd), Some(0));

        let code = encoder.finalize();
        let mut decoder = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let insts: Vec<_> = decoder.iter().collect();
        assert_eq!(insts[1].mnemonic(), Mnemonic::Jmp);
        assert_eq!(insts[1].near_branch64(), 0);
        assert_eq!(insts[2].mnemonic(), Mnemonic::Je);
        assert_eq!(insts[2].near_branch64(), 12);
    }

    #[test]
    fn test_patch_errors() {
        let mut encoder = X64Encoder::new();
        let site = encoder.jmp_rel32();
        assert_eq!(
            encoder.patch_rel32(site + 1, 0),
            Err(EncodingError::PatchSiteOutOfRange { site: site + 1, len: 5 })
        );
        assert_eq!(
            encoder.patch_rel32(site, usize::MAX / 2),
            Err(EncodingError::DisplacementOverflow {
                site,
                target: usize::MAX / 2
            })
        );
    }

    #[test]
    fn test_invalid_register() {
        let mut encoder = X64Encoder::new();
        assert_eq!(
            encoder.inc_reg(AsmReg::new(16)),
            Err(EncodingError::InvalidRegister(16))
        );
        assert!(encoder.code().is_empty());
    }
}
