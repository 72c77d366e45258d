//! Textual program format.
//!
//! One instruction per line, grouped into blocks by `label:` lines. The first
//! label is the entry block and `;` starts a comment:
//!
//! ```text
//! entry:
//!     LoadImmediate 3
//!     Store r1
//!     Jump done
//! done:
//!     Exit
//! ```
//!
//! Mnemonics match the `Display` output of [`Instruction`](crate::core::Instruction),
//! so a program dump parses back into the same program.

mod parser;

use thiserror::Error;

pub use parser::parse_program;

/// A syntax or label-resolution error, with its 1-based line number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}
