//! Lowering the sample programs to assembly text and ELF objects.

use irgen::backend::{CodeModel, MachineConfig, OutputKind, TargetLowering};
use irgen::samples::Sample;
use irgen::x64::X64Lowering;
use irgen::{LoweringError, StructuralVerifier, VerifiedModule};
use object::{
    File, Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SymbolKind,
};

const TRIPLE: &str = "x86_64-pc-linux-gnu";

fn emit(sample: Sample, kind: OutputKind) -> Vec<u8> {
    let verified = VerifiedModule::new(sample.build().unwrap(), &StructuralVerifier).unwrap();
    let mut lowering = X64Lowering::new();
    lowering.initialize_targets().unwrap();
    let target = lowering.select_target(TRIPLE).unwrap();
    let machine = lowering
        .create_machine(&target, TRIPLE, &MachineConfig::default())
        .unwrap();
    lowering.emit(&machine, &verified, kind).unwrap()
}

#[test]
fn assembly_names_every_defined_function() {
    let _ = env_logger::builder().is_test(true).try_init();

    let text = String::from_utf8(emit(Sample::A, OutputKind::AssemblyText)).unwrap();
    for name in ["foo2", "foo", "main"] {
        assert!(text.contains(&format!("\n{name}:")), "missing label {name}:\n{text}");
        assert!(text.contains(&format!("\t.globl\t{name}")));
    }
    assert!(text.contains("AAA"));

    let text = String::from_utf8(emit(Sample::C, OutputKind::AssemblyText)).unwrap();
    assert!(text.contains("main:"));
}

/// Text immediately before each `(` of a memory operand, back to the operand start.
fn displacements(line: &str) -> Vec<(&str, &str)> {
    let mut found = Vec::new();
    for (at, _) in line.match_indices("(%") {
        let start = line[..at]
            .rfind(|c: char| c == ',' || c.is_whitespace())
            .map_or(0, |i| i + 1);
        let base_end = line[at..].find(')').map_or(line.len(), |i| at + i + 1);
        found.push((&line[start..at], &line[at..base_end]));
    }
    found
}

#[test]
fn assembly_names_only_rip_relative_memory_operands() {
    let _ = env_logger::builder().is_test(true).try_init();

    for sample in Sample::ALL {
        let text = String::from_utf8(emit(sample, OutputKind::AssemblyText)).unwrap();
        let instructions = text
            .lines()
            .filter(|line| line.starts_with('\t') && !line.starts_with("\t."));
        for line in instructions {
            for (disp, base) in displacements(line) {
                let numeric = disp.is_empty()
                    || disp.trim_start_matches('-').starts_with(|c: char| c.is_ascii_digit());
                assert!(
                    numeric || base == "(%rip)",
                    "symbol {disp} used as displacement off {base} in `{line}` (sample {sample})"
                );
            }
        }
    }

    let text = String::from_utf8(emit(Sample::A, OutputKind::AssemblyText)).unwrap();
    assert!(text.contains("AAA(%rip)"), "{text}");
    assert!(text.contains("\t.section\t.note.GNU-stack,\"\",@progbits"));
}

#[test]
fn object_has_text_and_function_symbols() {
    let _ = env_logger::builder().is_test(true).try_init();

    let bytes = emit(Sample::A, OutputKind::ObjectBytes);
    let file = File::parse(&*bytes).unwrap();
    let text = file.section_by_name(".text").unwrap();
    assert!(text.size() > 0);

    for name in ["foo2", "foo", "main"] {
        let symbol = file.symbol_by_name(name).unwrap();
        assert_eq!(symbol.kind(), SymbolKind::Text);
        assert!(symbol.is_definition());
        assert!(symbol.is_global());
    }
    assert!(file.symbol_by_name("AAA").unwrap().is_definition());

    // AAA is reached through PC-relative relocations, as in the `AAA(%rip)` text
    let aaa = file.symbol_by_name("AAA").unwrap().index();
    let pc_relative = text
        .relocations()
        .filter(|(_, reloc)| reloc.target() == RelocationTarget::Symbol(aaa))
        .all(|(_, reloc)| {
            reloc.flags()
                == RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_PC32,
                }
        });
    assert!(pc_relative);
    assert!(text
        .relocations()
        .any(|(_, reloc)| reloc.target() == RelocationTarget::Symbol(aaa)));

    let note = file.section_by_name(".note.GNU-stack").unwrap();
    assert_eq!(note.size(), 0);
}

#[test]
fn every_sample_lowers() {
    for sample in Sample::ALL {
        let bytes = emit(sample, OutputKind::ObjectBytes);
        let file = File::parse(&*bytes).unwrap();
        assert!(file.symbol_by_name("main").is_some(), "sample {sample}");
    }
}

#[test]
fn target_selection_errors() {
    let mut lowering = X64Lowering::new();
    assert_eq!(
        lowering.select_target(TRIPLE),
        Err(LoweringError::TargetsNotInitialized)
    );
    lowering.initialize_targets().unwrap();
    assert!(matches!(
        lowering.select_target("nonsense-unknown-none"),
        Err(LoweringError::UnknownTarget { .. })
    ));

    let target = lowering.select_target(TRIPLE).unwrap();
    let config = MachineConfig {
        code_model: CodeModel::Large,
        ..MachineConfig::default()
    };
    assert!(matches!(
        lowering.create_machine(&target, TRIPLE, &config),
        Err(LoweringError::Unsupported { .. })
    ));
}

#[cfg(feature = "llvm")]
#[test]
fn llvm_lowering_emits_object() {
    use irgen::llvm::{LlvmLowering, LlvmVerifier};

    let verified = VerifiedModule::new(Sample::A.build().unwrap(), &LlvmVerifier).unwrap();
    let mut lowering = LlvmLowering::new();
    lowering.initialize_targets().unwrap();
    let target = lowering.select_target(TRIPLE).unwrap();
    let machine = lowering
        .create_machine(&target, TRIPLE, &MachineConfig::default())
        .unwrap();
    let bytes = lowering.emit(&machine, &verified, OutputKind::ObjectBytes).unwrap();
    let file = File::parse(&*bytes).unwrap();
    assert!(file.section_by_name(".text").is_some());
    assert!(file.symbol_by_name("foo2").is_some());
}
