// This module fixes the register convention compiled programs run under. Generated code is
// entered through the System V AMD64 ABI with three integer parameters: an opaque VM-state
// pointer in RDI, the base of the VM register file in RSI and the base of the locals array
// in RDX. On top of that the JIT reserves one accumulator register (RAX) and one scratch
// register (RCX). All five are caller-saved under System V, so compiled code needs no
// prologue beyond loading the accumulator and no callee-saved spills. FixedConvention is
// established once per compilation and validated: the three parameter roles must sit in the
// registers the entry trampoline fills, and neither the accumulator nor the scratch register
// may alias a parameter register or each other. The base pointers are never reassigned while
// a program runs.

//! Register convention for compiled programs.

use thiserror::Error;

use super::registers::{AsmReg, RAX, RCX, RDI, RDX, RSI};

/// System V integer argument registers, in order.
pub const SYSV_ARG_REGS: [AsmReg; 6] = [
    RDI,
    RSI,
    RDX,
    RCX,
    AsmReg::new(8),
    AsmReg::new(9),
];

/// System V caller-saved general-purpose registers.
pub const SYSV_CALLER_SAVED: [AsmReg; 9] = [
    RAX,
    RCX,
    RDX,
    RSI,
    RDI,
    AsmReg::new(8),
    AsmReg::new(9),
    AsmReg::new(10),
    AsmReg::new(11),
];

/// Error raised when a convention cannot be used by compiled code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConventionError {
    #[error("Registers {first} and {second} alias")]
    Alias { first: AsmReg, second: AsmReg },

    #[error("Register {0} is callee-saved")]
    CalleeSaved(AsmReg),

    #[error("{role} must be passed in {expected}, not {found}")]
    ParameterMismatch {
        role: &'static str,
        expected: AsmReg,
        found: AsmReg,
    },
}

/// Register roles held for the duration of one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedConvention {
    /// Holds the accumulator (VM register 0) while compiled code runs.
    pub accumulator: AsmReg,
    /// Temporary for operands loaded from the register file.
    pub scratch: AsmReg,
    /// First parameter: opaque VM-state pointer (unused by current opcodes).
    pub vm_state: AsmReg,
    /// Second parameter: base of the VM register file.
    pub registers_base: AsmReg,
    /// Third parameter: base of the locals array.
    pub locals_base: AsmReg,
}

impl FixedConvention {
    /// The System V convention: rax/rcx for work, rdi/rsi/rdx for parameters.
    pub const SYSV: FixedConvention = FixedConvention {
        accumulator: RAX,
        scratch: RCX,
        vm_state: SYSV_ARG_REGS[0],
        registers_base: SYSV_ARG_REGS[1],
        locals_base: SYSV_ARG_REGS[2],
    };

    /// Build a convention from explicit roles.
    ///
    /// Rejects aliasing between any two roles and registers compiled code
    /// would have to preserve.
    pub fn new(accumulator: AsmReg, scratch: AsmReg) -> Result<Self, ConventionError> {
        let convention = FixedConvention {
            accumulator,
            scratch,
            ..Self::SYSV
        };
        convention.validate()?;
        Ok(convention)
    }

    fn roles(&self) -> [AsmReg; 5] {
        [
            self.accumulator,
            self.scratch,
            self.vm_state,
            self.registers_base,
            self.locals_base,
        ]
    }

    /// Check that the parameters sit in their System V argument registers and
    /// that all five roles name distinct, caller-saved registers.
    pub fn validate(&self) -> Result<(), ConventionError> {
        let parameters = [
            ("vm_state", self.vm_state),
            ("registers_base", self.registers_base),
            ("locals_base", self.locals_base),
        ];
        for ((role, found), expected) in parameters.into_iter().zip(SYSV_ARG_REGS) {
            if found != expected {
                return Err(ConventionError::ParameterMismatch {
                    role,
                    expected,
                    found,
                });
            }
        }

        let roles = self.roles();
        for (i, &first) in roles.iter().enumerate() {
            for &second in &roles[i + 1..] {
                if first == second {
                    return Err(ConventionError::Alias { first, second });
                }
            }
        }
        if let Some(&reg) = roles.iter().find(|&&r| !SYSV_CALLER_SAVED.contains(&r)) {
            return Err(ConventionError::CalleeSaved(reg));
        }
        Ok(())
    }
}

impl Default for FixedConvention {
    fn default() -> Self {
        Self::SYSV
    }
}
