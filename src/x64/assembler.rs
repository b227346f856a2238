// This module owns the sections, symbols and relocations of a lowered module and writes them
// out either as an ELF relocatable object or as GNU assembler text. ElfAssembler keeps a flat
// symbol table whose indices match the relocation symbol indices produced by the code
// generator: functions first (defined or undefined), then globals. Defined functions point
// into the single text buffer, globals carry their initializer bytes (placed in .data) or
// only a size (placed in .bss), and declarations become undefined symbols. The object path
// uses object::write with R_X86_64_PLT32 for calls and R_X86_64_PC32 for RIP-relative
// addresses. The text path decodes the finished code with iced-x86 and prints it through
// GasFormatter; relocated displacements are patched to point at placeholder addresses beyond
// the code so a SymbolResolver can print symbol names instead of zero offsets.

//! ELF object and assembly text emission.

use super::encoder::{CodeReloc, RelocKind};
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::module::Linkage;
use hashbrown::HashMap;
use iced_x86::{
    Decoder, DecoderOptions, Formatter, GasFormatter, Instruction, OpKind, SymbolResolver,
    SymbolResult,
};
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags, SymbolKind,
    SymbolScope,
};
use std::fmt::Write as _;

/// Symbol reference handed out by the assembler.
pub type SymRef = usize;

/// Placeholder addresses for relocated operands start here when printing text.
const PLACEHOLDER_BASE: u64 = 0x4000_0000;
const PLACEHOLDER_STRIDE: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SymbolDef {
    /// Function code at `offset` in the text buffer.
    Function { offset: u64, size: u64 },
    /// Predefined function whose code has not been placed yet.
    PendingFunction,
    /// Data object; `init` is `None` for zero-initialized storage.
    Data {
        init: Option<Vec<u8>>,
        size: u64,
        align: u64,
    },
    /// Declared here, defined elsewhere.
    Undefined,
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    name: String,
    linkage: Linkage,
    def: SymbolDef,
}

/// Sections, symbols and relocations of one lowered module.
#[derive(Debug)]
pub struct ElfAssembler {
    module_name: String,
    code: Vec<u8>,
    relocs: Vec<CodeReloc>,
    symbols: Vec<SymbolEntry>,
    /// Local labels printed in assembly text, by code offset.
    labels: HashMap<u64, String>,
}

fn scope_for(linkage: Linkage) -> SymbolScope {
    if linkage.is_local() {
        SymbolScope::Compilation
    } else {
        SymbolScope::Linkage
    }
}

impl ElfAssembler {
    /// Create an empty assembler for `module_name`.
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            code: Vec::new(),
            relocs: Vec::new(),
            symbols: Vec::new(),
            labels: HashMap::new(),
        }
    }

    /// Reserve a symbol for a function defined in this module.
    pub fn sym_predef_func(&mut self, name: &str, linkage: Linkage) -> SymRef {
        self.push_symbol(name, linkage, SymbolDef::PendingFunction)
    }

    /// Add a symbol defined outside this module.
    pub fn sym_add_undef(&mut self, name: &str) -> SymRef {
        self.push_symbol(name, Linkage::External, SymbolDef::Undefined)
    }

    /// Add a data object. `init` of `None` places it in .bss.
    pub fn sym_def_data(
        &mut self,
        name: &str,
        linkage: Linkage,
        init: Option<Vec<u8>>,
        size: u64,
        align: u64,
    ) -> SymRef {
        let init = init.filter(|bytes| bytes.iter().any(|&b| b != 0));
        self.push_symbol(name, linkage, SymbolDef::Data { init, size, align })
    }

    fn push_symbol(&mut self, name: &str, linkage: Linkage, def: SymbolDef) -> SymRef {
        self.symbols.push(SymbolEntry {
            name: name.to_string(),
            linkage,
            def,
        });
        self.symbols.len() - 1
    }

    /// Install the finished text section.
    pub fn set_code(&mut self, code: Vec<u8>, relocs: Vec<CodeReloc>) {
        self.code = code;
        self.relocs = relocs;
    }

    /// Place a predefined function at `offset` with `size` bytes of code.
    pub fn define_func(&mut self, sym: SymRef, offset: u64, size: u64) -> LoweringResult<()> {
        let entry = self.symbols.get_mut(sym).ok_or_else(|| LoweringError::Object {
            reason: format!("unknown symbol index {sym}"),
        })?;
        entry.def = SymbolDef::Function { offset, size };
        Ok(())
    }

    /// Name a code offset in assembly output.
    pub fn label_place(&mut self, offset: u64, name: String) {
        self.labels.insert(offset, name);
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn symbol_name(&self, sym: SymRef) -> Option<&str> {
        self.symbols.get(sym).map(|entry| entry.name.as_str())
    }

    /// Write an ELF relocatable object.
    pub fn build_object_file(&self) -> LoweringResult<Vec<u8>> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        obj.add_file_symbol(self.module_name.as_bytes().to_vec());

        let text = obj.section_id(StandardSection::Text);
        let text_base = obj.append_section_data(text, &self.code, 16);
        // Empty marker: the code never needs an executable stack.
        obj.add_section(
            Vec::new(),
            b".note.GNU-stack".to_vec(),
            SectionKind::Elf(object::elf::SHT_PROGBITS),
        );

        let mut ids = Vec::with_capacity(self.symbols.len());
        for entry in &self.symbols {
            let symbol = match &entry.def {
                SymbolDef::Function { offset, size } => Symbol {
                    name: entry.name.as_bytes().to_vec(),
                    value: text_base + offset,
                    size: *size,
                    kind: SymbolKind::Text,
                    scope: scope_for(entry.linkage),
                    weak: false,
                    section: SymbolSection::Section(text),
                    flags: SymbolFlags::None,
                },
                SymbolDef::PendingFunction => {
                    return Err(LoweringError::Object {
                        reason: format!("function {} was never defined", entry.name),
                    })
                }
                SymbolDef::Data { init, size, align } => {
                    let (section, value) = match init {
                        Some(bytes) => {
                            let data = obj.section_id(StandardSection::Data);
                            (data, obj.append_section_data(data, bytes, *align))
                        }
                        None => {
                            let bss = obj.section_id(StandardSection::UninitializedData);
                            (bss, obj.append_section_bss(bss, *size, *align))
                        }
                    };
                    Symbol {
                        name: entry.name.as_bytes().to_vec(),
                        value,
                        size: *size,
                        kind: SymbolKind::Data,
                        scope: scope_for(entry.linkage),
                        weak: false,
                        section: SymbolSection::Section(section),
                        flags: SymbolFlags::None,
                    }
                }
                SymbolDef::Undefined => Symbol {
                    name: entry.name.as_bytes().to_vec(),
                    value: 0,
                    size: 0,
                    kind: SymbolKind::Text,
                    scope: SymbolScope::Dynamic,
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                },
            };
            ids.push(obj.add_symbol(symbol));
        }

        for reloc in &self.relocs {
            let symbol = *ids.get(reloc.symbol).ok_or_else(|| LoweringError::Object {
                reason: format!("relocation against unknown symbol {}", reloc.symbol),
            })?;
            let r_type = match reloc.kind {
                RelocKind::Call => object::elf::R_X86_64_PLT32,
                RelocKind::PcRel => object::elf::R_X86_64_PC32,
            };
            obj.add_relocation(
                text,
                Relocation {
                    offset: text_base + reloc.offset,
                    symbol,
                    addend: -4,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .map_err(|e| LoweringError::Object {
                reason: e.to_string(),
            })?;
        }

        let bytes = obj.write().map_err(|e| LoweringError::Object {
            reason: e.to_string(),
        })?;
        log::debug!(
            "wrote {} byte object for {} ({} symbols, {} relocations)",
            bytes.len(),
            self.module_name,
            self.symbols.len(),
            self.relocs.len()
        );
        Ok(bytes)
    }

    /// Render the module as GNU assembler text in AT&T syntax.
    pub fn build_assembly(&self) -> LoweringResult<String> {
        let mut names: HashMap<u64, String> = self.labels.clone();
        let mut starts: HashMap<u64, &SymbolEntry> = HashMap::new();
        for entry in &self.symbols {
            if let SymbolDef::Function { offset, .. } = entry.def {
                names.insert(offset, entry.name.clone());
                starts.insert(offset, entry);
            }
        }
        for (index, entry) in self.symbols.iter().enumerate() {
            names.insert(PLACEHOLDER_BASE + index as u64 * PLACEHOLDER_STRIDE, entry.name.clone());
        }

        let code = self.patched_code()?;
        let resolver: Box<dyn SymbolResolver> = Box::new(LabelResolver { names });
        let mut formatter = GasFormatter::with_options(Some(resolver), None);
        formatter.options_mut().set_rip_relative_addresses(true);

        let mut out = String::new();
        let _ = writeln!(out, "\t.file\t\"{}\"", self.module_name);
        let _ = writeln!(out, "\t.text");

        let mut decoder = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
        let mut instruction = Instruction::default();
        let mut line = String::new();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            let ip = instruction.ip();
            if let Some(entry) = starts.get(&ip) {
                let size = match entry.def {
                    SymbolDef::Function { size, .. } => size,
                    _ => 0,
                };
                let _ = writeln!(out);
                if !entry.linkage.is_local() {
                    let _ = writeln!(out, "\t.globl\t{}", entry.name);
                }
                let _ = writeln!(out, "\t.p2align\t4");
                let _ = writeln!(out, "\t.type\t{},@function", entry.name);
                let _ = writeln!(out, "{}:", entry.name);
                let _ = writeln!(out, "\t.size\t{}, {}", entry.name, size);
            } else if let Some(label) = self.labels.get(&ip) {
                let _ = writeln!(out, "{label}:");
            }
            line.clear();
            formatter.format(&instruction, &mut line);
            let _ = writeln!(out, "\t{line}");
        }

        self.write_data_sections(&mut out);
        let _ = writeln!(out, "\n\t.section\t.note.GNU-stack,\"\",@progbits");
        Ok(out)
    }

    fn write_data_sections(&self, out: &mut String) {
        let mut current = "";
        for entry in &self.symbols {
            let SymbolDef::Data { init, size, align } = &entry.def else {
                continue;
            };
            let section = if init.is_some() { "\t.data" } else { "\t.bss" };
            if section != current {
                let _ = writeln!(out, "\n{section}");
                current = section;
            }
            if !entry.linkage.is_local() {
                let _ = writeln!(out, "\t.globl\t{}", entry.name);
            }
            let _ = writeln!(out, "\t.p2align\t{}", align.trailing_zeros());
            let _ = writeln!(out, "\t.type\t{},@object", entry.name);
            let _ = writeln!(out, "\t.size\t{}, {}", entry.name, size);
            let _ = writeln!(out, "{}:", entry.name);
            match init {
                Some(bytes) => {
                    let rendered: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                    let _ = writeln!(out, "\t.byte\t{}", rendered.join(","));
                }
                None => {
                    let _ = writeln!(out, "\t.zero\t{size}");
                }
            }
        }
    }

    /// Copy of the code with every relocated displacement aimed at its placeholder.
    fn patched_code(&self) -> LoweringResult<Vec<u8>> {
        let mut code = self.code.clone();
        for reloc in &self.relocs {
            let start = reloc.offset as usize;
            let end = start + 4;
            if end > code.len() {
                return Err(LoweringError::Object {
                    reason: format!("relocation at {start} outside the code"),
                });
            }
            let target = PLACEHOLDER_BASE + reloc.symbol as u64 * PLACEHOLDER_STRIDE;
            let disp = target as i64 - end as i64;
            let disp = i32::try_from(disp).map_err(|_| LoweringError::Object {
                reason: "code too large for assembly listing".to_string(),
            })?;
            code[start..end].copy_from_slice(&disp.to_le_bytes());
        }
        Ok(code)
    }
}

/// Maps branch targets and RIP-relative addresses back to names. Immediates and
/// displacements off other registers are plain numbers even when they collide with an offset.
struct LabelResolver {
    names: HashMap<u64, String>,
}

impl SymbolResolver for LabelResolver {
    fn symbol(
        &mut self,
        instruction: &Instruction,
        _operand: u32,
        instruction_operand: Option<u32>,
        address: u64,
        _address_size: u32,
    ) -> Option<SymbolResult<'_>> {
        let index = instruction_operand?;
        let named = match instruction.op_kind(index) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => true,
            OpKind::Memory => instruction.is_ip_rel_memory_operand(),
            _ => false,
        };
        if !named {
            return None;
        }
        self.names
            .get(&address)
            .map(|name| SymbolResult::with_string(address, name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn sample() -> ElfAssembler {
        let mut asm = ElfAssembler::new("sample");
        let main = asm.sym_predef_func("main", Linkage::External);
        let puts = asm.sym_add_undef("puts");
        asm.sym_def_data("counter", Linkage::Internal, Some(vec![7, 0, 0, 0]), 4, 4);
        asm.sym_def_data("buffer", Linkage::External, None, 64, 16);
        // push rbp; call puts; pop rbp; ret
        let code = vec![0x55, 0xe8, 0, 0, 0, 0, 0x5d, 0xc3];
        asm.set_code(
            code,
            vec![CodeReloc {
                offset: 2,
                symbol: puts,
                kind: RelocKind::Call,
            }],
        );
        asm.define_func(main, 0, 8).unwrap();
        asm
    }

    #[test]
    fn test_object_file() {
        let bytes = sample().build_object_file().unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::X86_64);
        assert!(file.section_by_name(".text").is_some());
        assert!(file.section_by_name(".data").is_some());
        assert!(file.section_by_name(".bss").is_some());

        let main = file.symbol_by_name("main").unwrap();
        assert!(main.is_global());
        assert_eq!(main.size(), 8);
        assert!(file.symbol_by_name("puts").unwrap().is_undefined());
        assert!(file.symbol_by_name("counter").unwrap().is_local());

        let note = file.section_by_name(".note.GNU-stack").unwrap();
        assert_eq!(note.size(), 0);

        let text = file.section_by_name(".text").unwrap();
        let relocs: Vec<_> = text.relocations().collect();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].0, 2);
        assert_eq!(
            relocs[0].1.flags(),
            RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32
            }
        );
    }

    #[test]
    fn test_assembly_text() {
        let text = sample().build_assembly().unwrap();
        assert!(text.contains("\t.globl\tmain"));
        assert!(text.contains("main:"));
        assert!(text.contains("call"));
        assert!(text.contains("puts"));
        assert!(text.contains("\t.data"));
        assert!(text.contains("counter:"));
        assert!(text.contains("\t.byte\t7,0,0,0"));
        assert!(text.contains("\t.zero\t64"));
        assert!(text.contains("\t.section\t.note.GNU-stack,\"\",@progbits"));
    }

    #[test]
    fn test_only_branches_and_rip_operands_are_named() {
        let mut asm = ElfAssembler::new("operands");
        let main = asm.sym_predef_func("main", Linkage::External);
        let counter = asm.sym_def_data("counter", Linkage::Internal, Some(vec![1, 0, 0, 0]), 4, 4);
        // mov [r11], eax; lea r11, [rip+counter]; mov [r11+10], eax; ret
        let code = vec![
            0x41, 0x89, 0x03, //
            0x4c, 0x8d, 0x1d, 0, 0, 0, 0, //
            0x41, 0x89, 0x43, 0x0a, //
            0xc3,
        ];
        asm.set_code(
            code,
            vec![CodeReloc {
                offset: 6,
                symbol: counter,
                kind: RelocKind::PcRel,
            }],
        );
        asm.define_func(main, 0, 15).unwrap();
        asm.label_place(10, ".LBB0_1".to_string());

        let text = asm.build_assembly().unwrap();
        assert!(text.contains("counter(%rip),%r11"), "{text}");
        assert!(text.contains("%eax,(%r11)"), "{text}");
        assert!(!text.contains("main(%r11)"), "{text}");
        assert!(!text.contains(".LBB0_1(%r11)"), "{text}");
    }

    #[test]
    fn test_undefined_function_is_an_error() {
        let mut asm = ElfAssembler::new("broken");
        asm.sym_predef_func("f", Linkage::External);
        assert!(matches!(
            asm.build_object_file(),
            Err(LoweringError::Object { .. })
        ));
    }
}
