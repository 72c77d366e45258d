// This module writes a CompiledProgram out as an ELF64 x86-64 relocatable object using the
// object crate's writer. All jumps are already resolved against block offsets, so the code is
// position-independent and goes into .text verbatim with no relocation records. One global
// function symbol names the entry point (offset 0, covering the whole buffer) and one local
// label symbol per block, `<symbol>.blockN`, marks each block start so that objdump and
// debuggers show the block structure. The object is a diagnostic artifact: linking it and
// calling the symbol with the (vm_state, registers, locals) convention behaves like
// Executable::invoke, minus the layout checks.

//! ELF object emission for compiled programs.

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

use super::compiler::CompiledProgram;
use crate::core::{BlockId, VmError, VmResult};

/// Serialize `compiled` as an ELF relocatable exporting `symbol`.
pub fn write_object(compiled: &CompiledProgram, symbol: &str) -> VmResult<Vec<u8>> {
    if symbol.is_empty() {
        return Err(VmError::ObjectEmission {
            reason: "entry symbol name is empty".to_string(),
        });
    }

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let base = obj.append_section_data(text, compiled.code(), 16);

    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: base,
        size: compiled.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let mut index = 0u32;
    while let Some(offset) = compiled.block_offset(BlockId::new(index)) {
        obj.add_symbol(Symbol {
            name: format!("{symbol}.{}", BlockId::new(index)).into_bytes(),
            value: base + offset as u64,
            size: 0,
            kind: SymbolKind::Label,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        index += 1;
    }

    let bytes = obj.write().map_err(|err| VmError::ObjectEmission {
        reason: err.to_string(),
    })?;
    log::debug!(
        "wrote {} byte object for `{symbol}` ({} blocks)",
        bytes.len(),
        index
    );
    Ok(bytes)
}
