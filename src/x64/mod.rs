//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - System V calling convention implementation
//! - Per-function code generation and the module driver
//! - ELF object and GNU assembler output
//! - [`X64Lowering`], the native [`TargetLowering`] implementation

pub mod assembler;
pub mod backend;
pub mod calling_convention;
pub mod encoder;
pub mod function_codegen;

pub use assembler::ElfAssembler;
pub use backend::X64Backend;
pub use calling_convention::{CCAssigner, CCAssignment, CallLayout, FunctionFrame, RegBank, SysVAssigner};
pub use encoder::{AsmReg, EncodingError, X64Encoder};

use crate::backend::{
    CodeModel, MachineConfig, OptLevel, OutputKind, TargetLowering, VerifiedModule,
};
use crate::core::error::{LoweringError, LoweringResult};

/// CPU names accepted by [`X64Lowering::create_machine`].
const KNOWN_CPUS: &[&str] = &[
    "",
    "generic",
    "native",
    "x86-64",
    "x86-64-v2",
    "x86-64-v3",
    "x86-64-v4",
    "core2",
    "nehalem",
    "westmere",
    "sandybridge",
    "ivybridge",
    "haswell",
    "broadwell",
    "skylake",
    "skylake-avx512",
    "cascadelake",
    "icelake-client",
    "icelake-server",
    "alderlake",
    "sapphirerapids",
    "btver2",
    "znver1",
    "znver2",
    "znver3",
    "znver4",
];

/// Whether `cpu` names an x86-64 processor.
pub(crate) fn is_known_cpu(cpu: &str) -> bool {
    KNOWN_CPUS.contains(&cpu)
}

/// Feature names understood without a warning.
const KNOWN_FEATURES: &[&str] = &[
    "sse", "sse2", "sse3", "ssse3", "sse4.1", "sse4.2", "avx", "avx2", "avx512f", "avx512bw",
    "avx512dq", "avx512vl", "fma", "f16c", "bmi", "bmi2", "lzcnt", "popcnt", "movbe", "cx16",
    "aes", "pclmul", "sahf", "xsave",
];

/// A selected x86-64 target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X64Target {
    /// Architecture component of the triple.
    pub arch: String,
}

/// A configured x86-64 target machine.
#[derive(Debug, Clone)]
pub struct X64Machine {
    pub triple: String,
    pub config: MachineConfig,
    /// SSE2 is part of the x86-64 baseline unless explicitly disabled.
    pub sse2: bool,
}

/// Native lowering to x86-64 ELF.
#[derive(Debug, Default)]
pub struct X64Lowering {
    initialized: bool,
}

impl X64Lowering {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unsupported(reason: impl Into<String>) -> LoweringError {
    LoweringError::Unsupported {
        target: "x86_64".to_string(),
        reason: reason.into(),
    }
}

/// Apply a `+feat,-feat` list to the baseline and report whether SSE2 remains.
fn parse_features(features: &str) -> LoweringResult<bool> {
    let mut sse2 = true;
    for item in features.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (enable, name) = if let Some(name) = item.strip_prefix('+') {
            (true, name)
        } else if let Some(name) = item.strip_prefix('-') {
            (false, name)
        } else {
            return Err(LoweringError::Backend {
                message: format!("feature '{item}' must start with '+' or '-'"),
            });
        };
        if !KNOWN_FEATURES.contains(&name) {
            log::warn!("'{name}' is not a recognized feature for this target (ignoring feature)");
        }
        if matches!(name, "sse" | "sse2") {
            sse2 = enable;
        }
    }
    Ok(sse2)
}

impl TargetLowering for X64Lowering {
    type Target = X64Target;
    type Machine = X64Machine;

    fn initialize_targets(&mut self) -> LoweringResult<()> {
        self.initialized = true;
        log::debug!("x86-64 target registered");
        Ok(())
    }

    fn select_target(&self, triple: &str) -> LoweringResult<X64Target> {
        if !self.initialized {
            return Err(LoweringError::TargetsNotInitialized);
        }
        let mut parts = triple.split('-');
        let arch = parts.next().unwrap_or_default();
        if !matches!(arch, "x86_64" | "amd64") {
            return Err(LoweringError::UnknownTarget {
                triple: triple.to_string(),
            });
        }
        let rest: Vec<&str> = parts.collect();
        if rest
            .iter()
            .any(|part| ["darwin", "macos", "ios", "windows", "win32", "mingw32", "cygwin"]
                .iter()
                .any(|os| part.starts_with(os)))
        {
            return Err(unsupported(format!("object format of {triple} (only ELF is emitted)")));
        }
        Ok(X64Target {
            arch: arch.to_string(),
        })
    }

    fn create_machine(
        &self,
        _target: &X64Target,
        triple: &str,
        config: &MachineConfig,
    ) -> LoweringResult<X64Machine> {
        if !is_known_cpu(&config.cpu) {
            return Err(LoweringError::UnsupportedCpu {
                cpu: config.cpu.clone(),
                target: triple.to_string(),
            });
        }
        if config.code_model == CodeModel::Large {
            return Err(unsupported("large code model"));
        }
        let sse2 = parse_features(&config.features)?;
        if config.opt_level != OptLevel::None {
            log::debug!("opt level {:?} has no effect on frame-slot code generation", config.opt_level);
        }
        Ok(X64Machine {
            triple: triple.to_string(),
            config: config.clone(),
            sse2,
        })
    }

    fn emit(
        &self,
        machine: &X64Machine,
        module: &VerifiedModule,
        kind: OutputKind,
    ) -> LoweringResult<Vec<u8>> {
        let asm = X64Backend::new(machine.sse2).compile_module(module.module())?;
        match kind {
            OutputKind::AssemblyText => Ok(asm.build_assembly()?.into_bytes()),
            OutputKind::ObjectBytes => asm.build_object_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lowering() -> X64Lowering {
        let mut lowering = X64Lowering::new();
        lowering.initialize_targets().unwrap();
        lowering
    }

    #[test]
    fn test_select_requires_initialization() {
        let lowering = X64Lowering::new();
        assert_eq!(
            lowering.select_target("x86_64-pc-linux-gnu"),
            Err(LoweringError::TargetsNotInitialized)
        );
    }

    #[test]
    fn test_select_target() {
        let lowering = lowering();
        assert!(lowering.select_target("x86_64-pc-linux-gnu").is_ok());
        assert!(lowering.select_target("amd64-unknown-freebsd").is_ok());
        assert!(matches!(
            lowering.select_target("riscv64-unknown-linux-gnu"),
            Err(LoweringError::UnknownTarget { .. })
        ));
        assert!(matches!(
            lowering.select_target("x86_64-apple-darwin"),
            Err(LoweringError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_machine_configuration() {
        let lowering = lowering();
        let target = lowering.select_target("x86_64-pc-linux-gnu").unwrap();
        let triple = "x86_64-pc-linux-gnu";

        let machine = lowering
            .create_machine(&target, triple, &MachineConfig::default())
            .unwrap();
        assert!(machine.sse2);

        let config = MachineConfig {
            cpu: "pentium-mmx-9000".to_string(),
            ..MachineConfig::default()
        };
        assert!(matches!(
            lowering.create_machine(&target, triple, &config),
            Err(LoweringError::UnsupportedCpu { .. })
        ));

        let config = MachineConfig {
            code_model: CodeModel::Large,
            ..MachineConfig::default()
        };
        assert!(matches!(
            lowering.create_machine(&target, triple, &config),
            Err(LoweringError::Unsupported { .. })
        ));

        let config = MachineConfig {
            cpu: "haswell".to_string(),
            features: "+avx2,-sse2,+made-up".to_string(),
            ..MachineConfig::default()
        };
        let machine = lowering.create_machine(&target, triple, &config).unwrap();
        assert!(!machine.sse2);
    }
}
