//! x86-64 general-purpose register identifiers.
//!
//! Registers are numbered by their hardware encoding (0 = rax ... 15 = r15).
//! The low three bits go into ModRM/opcode fields, bit 3 into a REX prefix.

use std::fmt;

/// Register id type.
pub type RegId = u8;

/// Number of general-purpose registers.
pub const GP_REGISTER_COUNT: u8 = 16;

/// A 64-bit general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub id: RegId,
}

pub const RAX: AsmReg = AsmReg::new(0);
pub const RCX: AsmReg = AsmReg::new(1);
pub const RDX: AsmReg = AsmReg::new(2);
pub const RBX: AsmReg = AsmReg::new(3);
pub const RSP: AsmReg = AsmReg::new(4);
pub const RBP: AsmReg = AsmReg::new(5);
pub const RSI: AsmReg = AsmReg::new(6);
pub const RDI: AsmReg = AsmReg::new(7);
pub const R8: AsmReg = AsmReg::new(8);
pub const R9: AsmReg = AsmReg::new(9);
pub const R10: AsmReg = AsmReg::new(10);
pub const R11: AsmReg = AsmReg::new(11);
pub const R12: AsmReg = AsmReg::new(12);
pub const R13: AsmReg = AsmReg::new(13);
pub const R14: AsmReg = AsmReg::new(14);
pub const R15: AsmReg = AsmReg::new(15);

const NAMES64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl AsmReg {
    pub const fn new(id: RegId) -> Self {
        Self { id }
    }

    /// Whether the id names an existing register.
    pub fn is_valid(self) -> bool {
        self.id < GP_REGISTER_COUNT
    }

    /// Bits 0..3 of the encoding.
    pub fn low_bits(self) -> u8 {
        self.id & 0b111
    }

    /// Whether the register needs a REX extension bit (r8..r15).
    pub fn is_extended(self) -> bool {
        self.id >= 8
    }

    /// Whether the 8-bit form needs a REX prefix to mean spl/bpl/sil/dil
    /// rather than ah/ch/dh/bh.
    pub fn byte_form_needs_rex(self) -> bool {
        (4..8).contains(&self.id)
    }

    /// Whether `[reg + disp]` needs a SIB byte (rsp and r12 as base).
    pub fn base_needs_sib(self) -> bool {
        self.low_bits() == 0b100
    }

    pub fn name(self) -> &'static str {
        NAMES64.get(self.id as usize).copied().unwrap_or("<invalid>")
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
