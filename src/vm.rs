// This module provides the VM shell that owns the mutable state a program runs against: the
// register file (register 0 is the accumulator) and the locals array, both sized once at
// construction. The shell offers the two execution strategies over that same state.
// run_interpreted drives the Interpreter directly on the arrays; run_jit compiles the program
// in a fresh bumpalo-backed CompilationSession, loads it into write-xor-execute memory,
// invokes it on the arrays and releases the region. Both paths validate the program against
// the VM's Layout before touching any state, so a structurally bad program fails without
// side effects. run_with_fallback is the one explicit recovery strategy: when compiling or
// loading fails for lack of executable memory, it logs a warning and runs the interpreter on
// the untouched state instead. Every other error is returned as-is.

//! The VM shell.

use std::fmt;

use bumpalo::Bump;

use crate::core::{CompilationSession, Layout, Program, Reg, Value, VmResult};
use crate::interpreter::{Interpreter, InterpreterStats};
use crate::jit::{Executable, JitCompiler};

/// Which backend executed a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Interpreter,
    Jit,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Interpreter => write!(f, "interpreter"),
            Backend::Jit => write!(f, "jit"),
        }
    }
}

/// Register file and locals for one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    registers: Vec<Value>,
    locals: Vec<Value>,
}

impl Vm {
    /// A VM with zeroed `registers` and `locals` slots.
    pub fn new(registers: usize, locals: usize) -> Self {
        Self {
            registers: vec![0; registers],
            locals: vec![0; locals],
        }
    }

    /// A VM starting from existing state.
    pub fn from_state(registers: Vec<Value>, locals: Vec<Value>) -> Self {
        Self { registers, locals }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.registers.len(), self.locals.len())
    }

    pub fn registers(&self) -> &[Value] {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut [Value] {
        &mut self.registers
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut [Value] {
        &mut self.locals
    }

    /// The accumulator, or `None` for a VM without registers.
    pub fn accumulator(&self) -> Option<Value> {
        self.registers.first().copied()
    }

    /// Set one register, checking the index.
    pub fn set_register(&mut self, reg: Reg, value: Value) -> VmResult<()> {
        let index = self.layout().check_register(reg)?;
        self.registers[index] = value;
        Ok(())
    }

    /// Zero every register and local.
    pub fn reset(&mut self) {
        self.registers.fill(0);
        self.locals.fill(0);
    }

    /// Execute `program` with the interpreter.
    pub fn run_interpreted(&mut self, program: &Program) -> VmResult<InterpreterStats> {
        program.validate(&self.layout())?;
        Interpreter::new().run(program, &mut self.registers, &mut self.locals)
    }

    /// Compile `program` to native code and execute it.
    pub fn run_jit(&mut self, program: &Program) -> VmResult<()> {
        let executable = self.load(program)?;
        self.run_compiled(&executable)?;
        executable.release()
    }

    /// Execute already loaded code against this VM's state.
    pub fn run_compiled(&mut self, executable: &Executable) -> VmResult<()> {
        executable.invoke(&mut self.registers, &mut self.locals)
    }

    /// Compile with the JIT, falling back to the interpreter when
    /// executable memory cannot be obtained.
    pub fn run_with_fallback(&mut self, program: &Program) -> VmResult<Backend> {
        match self.load(program) {
            Ok(executable) => {
                self.run_compiled(&executable)?;
                executable.release()?;
                Ok(Backend::Jit)
            }
            Err(err) if err.is_memory_failure() => {
                log::warn!("JIT unavailable ({err}), falling back to the interpreter");
                self.run_interpreted(program)?;
                Ok(Backend::Interpreter)
            }
            Err(err) => Err(err),
        }
    }

    /// Validate, compile and load `program` for this VM's layout.
    pub fn load(&self, program: &Program) -> VmResult<Executable> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiled = JitCompiler::new(&session).compile(program, self.layout())?;
        compiled.load()
    }

    /// Diagnostic dump of registers and locals.
    pub fn dump(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Registers:")?;
        for (i, value) in self.registers.iter().enumerate() {
            writeln!(f, "  {i}: {value}")?;
        }
        writeln!(f, "Locals:")?;
        for (i, value) in self.locals.iter().enumerate() {
            writeln!(f, "  {i}: {value}")?;
        }
        Ok(())
    }
}
