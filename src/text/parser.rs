//! Parser for the textual program format.

use hashbrown::HashMap;

use super::ParseError;
use crate::core::{BlockId, Instruction, Program};

/// Parse a program; labels may be used before they are defined.
pub fn parse_program(text: &str) -> Result<Program, ParseError> {
    Parser::new(text).parse()
}

/// A non-empty line with its comment stripped.
#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    number: usize,
    text: &'a str,
}

struct Parser<'a> {
    lines: Vec<Line<'a>>,
    labels: HashMap<&'a str, BlockId>,
    program: Program,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .filter_map(|(i, raw)| {
                let code = raw.split(';').next().unwrap_or_default().trim();
                (!code.is_empty()).then_some(Line {
                    number: i + 1,
                    text: code,
                })
            })
            .collect();

        Self {
            lines,
            labels: HashMap::new(),
            program: Program::new(),
        }
    }

    fn parse(mut self) -> Result<Program, ParseError> {
        // First pass: every label gets its block, in order of definition.
        for line in &self.lines {
            if let Some(name) = label_definition(line)? {
                if self.labels.contains_key(name) {
                    return Err(ParseError::new(
                        line.number,
                        format!("duplicate label `{name}`"),
                    ));
                }
                let id = self.program.make_block();
                self.labels.insert(name, id);
            }
        }

        // Second pass: instructions, with every reference now resolvable.
        let mut current: Option<BlockId> = None;
        for &line in &self.lines {
            if let Some(name) = label_definition(&line)? {
                current = self.labels.get(name).copied();
                continue;
            }
            let Some(block) = current else {
                return Err(ParseError::new(
                    line.number,
                    "instruction outside of a block (missing label?)",
                ));
            };
            let inst = self.parse_instruction(line)?;
            self.program.append(block, inst);
        }

        if self.program.is_empty() {
            return Err(ParseError::new(
                self.lines.last().map_or(1, |l| l.number),
                "program defines no blocks",
            ));
        }
        log::debug!(
            "parsed {} blocks / {} instructions",
            self.program.len(),
            self.program.instruction_count()
        );
        Ok(self.program)
    }

    fn parse_instruction(&self, line: Line<'a>) -> Result<Instruction, ParseError> {
        let mut words = line.text.split_whitespace();
        let Some(mnemonic) = words.next() else {
            return Err(ParseError::new(line.number, "expected an instruction"));
        };
        let operands: Vec<&str> = words.collect();

        let expect = |count: usize| -> Result<(), ParseError> {
            if operands.len() == count {
                Ok(())
            } else {
                Err(ParseError::new(
                    line.number,
                    format!(
                        "`{mnemonic}` takes {count} operand(s), found {}",
                        operands.len()
                    ),
                ))
            }
        };

        let inst = match mnemonic {
            "LoadImmediate" => {
                expect(1)?;
                Instruction::LoadImmediate(parse_number(line, operands[0])?)
            }
            "Load" => {
                expect(1)?;
                Instruction::Load(parse_register(line, operands[0])?)
            }
            "Store" => {
                expect(1)?;
                Instruction::Store(parse_register(line, operands[0])?)
            }
            "SetLocal" => {
                expect(1)?;
                Instruction::SetLocal(parse_number(line, operands[0])?)
            }
            "GetLocal" => {
                expect(1)?;
                Instruction::GetLocal(parse_number(line, operands[0])?)
            }
            "Increment" => {
                expect(0)?;
                Instruction::Increment
            }
            "LessThan" => {
                expect(1)?;
                Instruction::LessThan(parse_register(line, operands[0])?)
            }
            "Jump" => {
                expect(1)?;
                Instruction::Jump(self.resolve(line, operands[0])?)
            }
            "JumpConditional" => {
                expect(2)?;
                Instruction::JumpConditional {
                    if_true: self.resolve(line, operands[0])?,
                    if_false: self.resolve(line, operands[1])?,
                }
            }
            "Exit" => {
                expect(0)?;
                Instruction::Exit
            }
            other => {
                return Err(ParseError::new(
                    line.number,
                    format!("unknown instruction `{other}`"),
                ))
            }
        };
        Ok(inst)
    }

    fn resolve(&self, line: Line<'a>, name: &str) -> Result<BlockId, ParseError> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| ParseError::new(line.number, format!("undefined label `{name}`")))
    }
}

/// `Some(name)` if the line is a `name:` label.
fn label_definition<'a>(line: &Line<'a>) -> Result<Option<&'a str>, ParseError> {
    let Some(name) = line.text.strip_suffix(':') else {
        return Ok(None);
    };
    let name = name.trim_end();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(ParseError::new(
            line.number,
            format!("invalid label `{name}`"),
        ));
    }
    Ok(Some(name))
}

fn parse_number(line: Line<'_>, token: &str) -> Result<u64, ParseError> {
    let parsed = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| ParseError::new(line.number, format!("invalid number `{token}`")))
}

fn parse_register(line: Line<'_>, token: &str) -> Result<u64, ParseError> {
    parse_number(line, token.strip_prefix('r').unwrap_or(token))
}
