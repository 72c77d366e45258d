//! Disassembly of emitted code using iced-x86.
//!
//! Purely diagnostic: the output format carries no stability guarantee.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use std::fmt::Write;

/// Render `code` as one line per instruction, offsets relative to the start.
pub fn disassemble(code: &[u8]) -> String {
    disassemble_with_labels(code, &[])
}

/// Like [`disassemble`], printing `label:` before the instruction at each
/// given offset. `labels` must be sorted by offset.
pub fn disassemble_with_labels(code: &[u8], labels: &[(usize, String)]) -> String {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);

    let mut text = String::new();
    let mut output = String::new();
    let mut instruction = Instruction::default();
    let mut pending = labels.iter().peekable();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let start = instruction.ip() as usize;

        while let Some((_, label)) = pending.next_if(|(offset, _)| *offset <= start) {
            let _ = writeln!(text, "{label}:");
        }

        output.clear();
        formatter.format(&instruction, &mut output);

        let bytes = &code[start..start + instruction.len()];
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        let _ = writeln!(text, "  {start:04X}  {hex:<24} {output}");
    }
    for (_, label) in pending {
        let _ = writeln!(text, "{label}:");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_simple_sequence() {
        // mov rax, [rsi+0]; inc rax; ret
        let code = [
            0x48, 0x8B, 0x86, 0x00, 0x00, 0x00, 0x00, 0x48, 0xFF, 0xC0, 0xC3,
        ];
        let text = disassemble(&code);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("488B8600000000"));
        assert!(lines[0].contains("mov"));
        assert!(lines[1].contains("inc"));
        assert!(lines[2].trim_end().ends_with("ret"));
    }

    #[test]
    fn test_labels_are_interleaved() {
        let code = [0x48, 0xFF, 0xC0, 0xC3];
        let labels = vec![(0, "block0".to_string()), (3, "block1".to_string())];
        let text = disassemble_with_labels(&code, &labels);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "block0:");
        assert!(lines[1].contains("inc"));
        assert_eq!(lines[2], "block1:");
        assert!(lines[3].contains("ret"));
    }
}
