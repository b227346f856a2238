// This module provides the inkwell-backed adapters, compiled only with the `llvm` feature.
// LlvmVerifier runs the structural verifier and then LLVM's own module verifier over the
// translated module. LlvmLowering registers every LLVM target, resolves triples through the
// target registry and writes assembly or object code from a TargetMachine. LlvmExecution
// builds an MCJIT engine: each defined function gets an invoke thunk (see translate) so a
// call with arbitrary GenericValue arguments becomes a single `extern "C"` call passing a
// packed argument buffer and a result buffer laid out per core::layout.

//! LLVM adapters for verification, lowering and execution.
//!
//! # Example
//! ```ignore
//! use inkwell::context::Context;
//! use irgen::backend::{ExecutionBackend, ExecutionEngine, JitOptions, VerifiedModule};
//! use irgen::llvm::{LlvmExecution, LlvmVerifier};
//!
//! let verified = VerifiedModule::new(module, &LlvmVerifier)?;
//! let context = Context::create();
//! let mut engine = LlvmExecution::new(&context).create_jit(&verified, &JitOptions::default())?;
//! let result = engine.invoke("main", &[])?;
//! ```

pub mod translate;

pub use translate::{argument_offsets, TranslateError, Translator, THUNK_PREFIX};

use crate::backend::{
    check_arguments, CodeModel, ExecutionBackend, ExecutionEngine, GenericValue, JitOptions,
    MachineConfig, OptLevel, OutputKind, RelocModel, TargetLowering, Verification, VerifiedModule,
    Verifier,
};
use crate::core::error::{ExecutionError, ExecutionResult, LoweringError, LoweringResult, Violation};
use crate::core::layout;
use crate::core::verifier::StructuralVerifier;
use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine as LlvmJit;
use inkwell::module::Module as LlvmModule;
use inkwell::targets::{
    CodeModel as LlvmCodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine,
    TargetTriple,
};
use inkwell::OptimizationLevel;

type InvokeThunk = unsafe extern "C" fn(*const u8, *mut u8);

fn optimization_level(level: OptLevel) -> OptimizationLevel {
    match level {
        OptLevel::None => OptimizationLevel::None,
        OptLevel::Less => OptimizationLevel::Less,
        OptLevel::Default => OptimizationLevel::Default,
        OptLevel::Aggressive => OptimizationLevel::Aggressive,
    }
}

fn reloc_mode(model: RelocModel) -> RelocMode {
    match model {
        RelocModel::Default => RelocMode::Default,
        RelocModel::Static => RelocMode::Static,
        RelocModel::Pic => RelocMode::PIC,
        RelocModel::DynamicNoPic => RelocMode::DynamicNoPic,
    }
}

fn code_model(model: CodeModel) -> LlvmCodeModel {
    match model {
        CodeModel::Default => LlvmCodeModel::Default,
        CodeModel::Small => LlvmCodeModel::Small,
        CodeModel::Kernel => LlvmCodeModel::Kernel,
        CodeModel::Medium => LlvmCodeModel::Medium,
        CodeModel::Large => LlvmCodeModel::Large,
    }
}

// ==== VERIFIER ====

/// Structural checks followed by LLVM's module verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlvmVerifier;

impl Verifier for LlvmVerifier {
    fn verify(&self, module: &crate::core::module::Module) -> Verification {
        let structural = StructuralVerifier.verify(module);
        if !structural.is_valid() {
            return structural;
        }
        let context = Context::create();
        let llvm = match Translator::new(&context, module).translate(false) {
            Ok(llvm) => llvm,
            Err(e) => {
                return Verification::Invalid(Violation::Backend {
                    message: e.to_string(),
                })
            }
        };
        match llvm.verify() {
            Ok(()) => Verification::Valid,
            Err(message) => Verification::Invalid(Violation::Backend {
                message: message.to_string(),
            }),
        }
    }
}

// ==== LOWERING ====

/// A configured LLVM target machine and the triple it was created for.
#[derive(Debug)]
pub struct LlvmMachine {
    pub triple: String,
    machine: TargetMachine,
}

/// Lowering through LLVM's code generators.
#[derive(Debug, Default)]
pub struct LlvmLowering {
    initialized: bool,
}

impl LlvmLowering {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetLowering for LlvmLowering {
    type Target = Target;
    type Machine = LlvmMachine;

    fn initialize_targets(&mut self) -> LoweringResult<()> {
        Target::initialize_all(&InitializationConfig::default());
        self.initialized = true;
        log::debug!("LLVM targets registered");
        Ok(())
    }

    fn select_target(&self, triple: &str) -> LoweringResult<Target> {
        if !self.initialized {
            return Err(LoweringError::TargetsNotInitialized);
        }
        Target::from_triple(&TargetTriple::create(triple)).map_err(|e| {
            log::debug!("target lookup for {triple} failed: {e}");
            LoweringError::UnknownTarget {
                triple: triple.to_string(),
            }
        })
    }

    fn create_machine(
        &self,
        target: &Target,
        triple: &str,
        config: &MachineConfig,
    ) -> LoweringResult<LlvmMachine> {
        let is_x86 = triple.starts_with("x86_64") || triple.starts_with("amd64");
        if is_x86 && !crate::x64::is_known_cpu(&config.cpu) {
            return Err(LoweringError::UnsupportedCpu {
                cpu: config.cpu.clone(),
                target: triple.to_string(),
            });
        }
        let cpu = if config.cpu == "native" {
            TargetMachine::get_host_cpu_name().to_string()
        } else {
            config.cpu.clone()
        };
        let machine = target
            .create_target_machine(
                &TargetTriple::create(triple),
                &cpu,
                &config.features,
                optimization_level(config.opt_level),
                reloc_mode(config.reloc_model),
                code_model(config.code_model),
            )
            .ok_or_else(|| LoweringError::Backend {
                message: format!("could not create a target machine for {triple}"),
            })?;
        log::debug!("target machine for {triple} (cpu '{cpu}', features '{}')", config.features);
        Ok(LlvmMachine {
            triple: triple.to_string(),
            machine,
        })
    }

    fn emit(
        &self,
        machine: &LlvmMachine,
        module: &VerifiedModule,
        kind: OutputKind,
    ) -> LoweringResult<Vec<u8>> {
        let context = Context::create();
        let llvm = Translator::new(&context, module.module())
            .translate(false)
            .map_err(|e| LoweringError::Backend {
                message: e.to_string(),
            })?;
        llvm.set_triple(&machine.machine.get_triple());
        llvm.set_data_layout(&machine.machine.get_target_data().get_data_layout());

        let file_type = match kind {
            OutputKind::AssemblyText => FileType::Assembly,
            OutputKind::ObjectBytes => FileType::Object,
        };
        let buffer = machine
            .machine
            .write_to_memory_buffer(&llvm, file_type)
            .map_err(|e| LoweringError::Backend {
                message: e.to_string(),
            })?;
        Ok(buffer.as_slice().to_vec())
    }
}

// ==== EXECUTION ====

/// Creates MCJIT engines in a caller-owned LLVM context.
#[derive(Debug, Clone, Copy)]
pub struct LlvmExecution<'ctx> {
    context: &'ctx Context,
}

impl<'ctx> LlvmExecution<'ctx> {
    pub fn new(context: &'ctx Context) -> Self {
        Self { context }
    }
}

impl<'ctx> ExecutionBackend for LlvmExecution<'ctx> {
    type Engine = LlvmEngine<'ctx>;

    fn create_jit(
        &self,
        module: &VerifiedModule,
        options: &JitOptions,
    ) -> ExecutionResult<LlvmEngine<'ctx>> {
        Target::initialize_native(&InitializationConfig::default())
            .map_err(|reason| ExecutionError::JitInit { reason })?;
        if options.code_model != CodeModel::Default || options.fast_isel {
            log::warn!("MCJIT engine ignores the code model and fast-isel options");
        }

        let llvm = Translator::new(self.context, module.module())
            .translate(true)
            .map_err(|e| ExecutionError::JitInit {
                reason: e.to_string(),
            })?;
        let jit = llvm
            .create_jit_execution_engine(optimization_level(options.opt_level))
            .map_err(|e| ExecutionError::JitInit {
                reason: e.to_string(),
            })?;
        log::debug!("MCJIT engine for module {}", module.module().name());
        Ok(LlvmEngine {
            module: module.clone(),
            jit,
            _llvm: llvm,
        })
    }
}

/// MCJIT engine bound to one verified module.
///
/// Calls run natively: a faulting function takes the process down with it and
/// the call depth limit of [`JitOptions`] is not enforced.
pub struct LlvmEngine<'ctx> {
    module: VerifiedModule,
    jit: LlvmJit<'ctx>,
    _llvm: LlvmModule<'ctx>,
}

impl std::fmt::Debug for LlvmEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlvmEngine")
            .field("module", &self.module.module().name())
            .finish()
    }
}

fn unknown_symbol(name: &str) -> ExecutionError {
    ExecutionError::UnknownSymbol {
        name: name.to_string(),
    }
}

impl ExecutionEngine for LlvmEngine<'_> {
    fn invoke(&mut self, name: &str, args: &[GenericValue]) -> ExecutionResult<GenericValue> {
        let function = self
            .module
            .module()
            .named_function(name)
            .ok_or_else(|| unknown_symbol(name))?;
        check_arguments(function, args)?;
        if function.is_declaration() {
            return Err(ExecutionError::Fault {
                function: name.to_string(),
                detail: "function has no body".to_string(),
            });
        }
        let sig = function.signature();
        if args.len() > sig.params.len() {
            return Err(ExecutionError::ArgumentMismatch {
                function: name.to_string(),
                detail: "variadic arguments cannot be passed through the JIT".to_string(),
            });
        }

        let (offsets, size) = argument_offsets(&sig.params);
        let mut arg_buffer = vec![0u8; size.max(1)];
        for ((param, arg), offset) in sig.params.iter().zip(args).zip(offsets) {
            let bytes = arg.to_bytes(param);
            arg_buffer[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        let ret_size = if sig.ret.is_void() {
            0
        } else {
            layout::size_of(&sig.ret) as usize
        };
        let mut ret_buffer = vec![0u8; ret_size.max(1)];

        let thunk_name = format!("{THUNK_PREFIX}{name}");
        // SAFETY: every thunk is generated with the `InvokeThunk` signature.
        let thunk = unsafe { self.jit.get_function::<InvokeThunk>(&thunk_name) }.map_err(|e| {
            ExecutionError::Backend {
                message: format!("{thunk_name}: {e:?}"),
            }
        })?;
        log::debug!("invoke @{name} with {} arguments", args.len());
        // SAFETY: both buffers cover the sizes the thunk reads and writes.
        unsafe { thunk.call(arg_buffer.as_ptr(), ret_buffer.as_mut_ptr()) };

        if sig.ret.is_void() {
            Ok(GenericValue::Void)
        } else {
            Ok(GenericValue::from_bytes(&sig.ret, &ret_buffer[..ret_size]))
        }
    }

    fn read_global(&self, name: &str) -> ExecutionResult<GenericValue> {
        let id = self
            .module
            .module()
            .lookup_global(name)
            .map_err(|_| unknown_symbol(name))?;
        let ty = self
            .module
            .module()
            .global(id)
            .map(|global| global.value_type().clone())
            .ok_or_else(|| unknown_symbol(name))?;
        let address = self
            .jit
            .get_global_address(name)
            .map_err(|_| unknown_symbol(name))?;
        let size = layout::size_of(&ty) as usize;
        // SAFETY: the engine keeps the global alive and it spans `size` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, size) };
        Ok(GenericValue::from_bytes(&ty, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::Builder;
    use crate::core::module::Module;
    use crate::core::types::TypeRegistry;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn add_module() -> Module {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fn_ty = types
            .function_type(&i32_ty, &[i32_ty.clone(), i32_ty.clone()], false)
            .unwrap();
        let mut module = Module::new("add");
        let add = module.add_function(&fn_ty, "add").unwrap();
        let entry = module.append_block(add, "entry").unwrap();
        let a = module.param(add, 0).unwrap();
        let b = module.param(add, 1).unwrap();
        let mut builder = Builder::new(&mut module);
        builder.position_at_end(entry);
        let sum = builder.add(&a, &b, "sum").unwrap();
        builder.ret(&sum).unwrap();
        module
    }

    #[test]
    fn test_llvm_verifier_accepts_valid_module() {
        init();
        assert!(LlvmVerifier.verify(&add_module()).is_valid());
    }

    #[test]
    fn test_jit_invoke() {
        init();
        let verified = VerifiedModule::new(add_module(), &LlvmVerifier).unwrap();
        let context = Context::create();
        let mut engine = LlvmExecution::new(&context)
            .create_jit(&verified, &JitOptions::default())
            .unwrap();
        let result = engine
            .invoke("add", &[GenericValue::from_i32(40), GenericValue::from_i32(2)])
            .unwrap();
        assert_eq!(result.as_i32(), Some(42));
        assert!(matches!(
            engine.invoke("missing", &[]),
            Err(ExecutionError::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn test_lowering_unknown_triple() {
        let mut lowering = LlvmLowering::new();
        assert!(matches!(
            lowering.select_target("x86_64-pc-linux-gnu"),
            Err(LoweringError::TargetsNotInitialized)
        ));
        lowering.initialize_targets().unwrap();
        assert!(matches!(
            lowering.select_target("bogus-none-nothing"),
            Err(LoweringError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_emit_assembly() {
        init();
        let mut lowering = LlvmLowering::new();
        lowering.initialize_targets().unwrap();
        let triple = "x86_64-pc-linux-gnu";
        let target = lowering.select_target(triple).unwrap();
        let machine = lowering
            .create_machine(&target, triple, &MachineConfig::default())
            .unwrap();
        let verified = VerifiedModule::new(add_module(), &LlvmVerifier).unwrap();
        let asm = lowering
            .emit(&machine, &verified, OutputKind::AssemblyText)
            .unwrap();
        let text = String::from_utf8(asm).unwrap();
        assert!(text.contains("add:"));
    }
}
