//! Command-line driver: parse a program file and run it.

use std::error::Error;
use std::fs;
use std::path::PathBuf;

use bumpalo::Bump;
use clap::{Parser, ValueEnum};

use jitvm::core::{CompilationSession, Program, Reg, Value};
use jitvm::jit::{write_object, JitCompiler};
use jitvm::{parse_program, Vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// Bytecode interpreter.
    Interp,
    /// Native code.
    Jit,
    /// Run both on fresh state and compare the results.
    Both,
    /// Native code, interpreter if executable memory is unavailable.
    Fallback,
}

#[derive(Debug, Parser)]
#[command(name = "jitvm", version, about = "Run accumulator bytecode programs")]
struct Args {
    /// Program in the textual format.
    file: PathBuf,

    #[arg(short, long, value_enum, default_value = "jit")]
    backend: BackendArg,

    /// Register file size, accumulator included.
    #[arg(long, default_value_t = 8)]
    registers: usize,

    #[arg(long, default_value_t = 8)]
    locals: usize,

    /// Initial register value, as INDEX=VALUE. Repeatable.
    #[arg(long = "set-register", value_parser = parse_assignment)]
    set_register: Vec<(Reg, Value)>,

    /// Print the parsed program before running.
    #[arg(long)]
    dump_program: bool,

    /// Print the disassembly of the compiled code.
    #[arg(long)]
    disassemble: bool,

    /// Write the compiled code as an ELF object.
    #[arg(long, value_name = "PATH")]
    emit_object: Option<PathBuf>,

    /// Print compilation and interpreter statistics.
    #[arg(long)]
    stats: bool,
}

fn parse_assignment(s: &str) -> Result<(Reg, Value), String> {
    let (index, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected INDEX=VALUE, got `{s}`"))?;
    let index = index
        .trim()
        .trim_start_matches('r')
        .parse::<Reg>()
        .map_err(|e| format!("bad register index `{index}`: {e}"))?;
    let value = value
        .trim()
        .parse::<Value>()
        .map_err(|e| format!("bad value `{value}`: {e}"))?;
    Ok((index, value))
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let source = fs::read_to_string(&args.file)?;
    let program = parse_program(&source)?;
    if args.dump_program {
        print!("{program}");
    }

    let mut vm = Vm::new(args.registers, args.locals);
    for &(reg, value) in &args.set_register {
        vm.set_register(reg, value)?;
    }

    if args.disassemble || args.emit_object.is_some() || args.stats {
        inspect(args, &program, &vm)?;
    }

    match args.backend {
        BackendArg::Interp => {
            let stats = vm.run_interpreted(&program)?;
            if args.stats {
                print!("{stats}");
            }
        }
        BackendArg::Jit => vm.run_jit(&program)?,
        BackendArg::Fallback => {
            let backend = vm.run_with_fallback(&program)?;
            log::info!("ran on the {backend}");
        }
        BackendArg::Both => {
            let mut jitted = vm.clone();
            vm.run_interpreted(&program)?;
            jitted.run_jit(&program)?;
            if vm != jitted {
                return Err(format!(
                    "backends disagree\ninterpreter:\n{}jit:\n{}",
                    vm.dump(),
                    jitted.dump()
                )
                .into());
            }
        }
    }

    print!("{}", vm.dump());
    Ok(())
}

/// Compile without running, for the diagnostic flags.
fn inspect(args: &Args, program: &Program, vm: &Vm) -> Result<(), Box<dyn Error>> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let compiled = JitCompiler::new(&session).compile(program, vm.layout())?;

    if args.disassemble {
        print!("{}", compiled.disassemble());
    }
    if let Some(path) = &args.emit_object {
        let symbol = args
            .file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.replace(|c: char| !c.is_ascii_alphanumeric(), "_"))
            .unwrap_or_else(|| "program".to_string());
        fs::write(path, write_object(&compiled, &symbol)?)?;
        log::info!("wrote {} (symbol `{symbol}`)", path.display());
    }
    if args.stats {
        print!("{}", session.stats());
    }
    Ok(())
}
