//! x86-64 module compilation.
//!
//! [`X64Backend`] drives [`FunctionCodegen`] over every defined function of a
//! verified module, encodes the whole text section in one pass so that calls
//! and branches between functions bind to labels, and collects the result in an
//! [`ElfAssembler`] together with the symbol table and data objects.

use super::assembler::ElfAssembler;
use super::encoder::X64Encoder;
use super::function_codegen::{check_type, FunctionCodegen};
use crate::backend::GenericValue;
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::layout;
use crate::core::module::{Instruction, Module};
use crate::core::types::{Type, TypeKind};
use bumpalo::Bump;

fn mentions_vector(ty: &Type) -> bool {
    match ty.kind() {
        TypeKind::Vector { .. } => true,
        TypeKind::Pointer(pointee) => mentions_vector(pointee),
        TypeKind::Struct { fields, .. } => fields.iter().any(mentions_vector),
        TypeKind::Function(sig) => {
            mentions_vector(&sig.ret) || sig.params.iter().any(mentions_vector)
        }
        TypeKind::Int(_) | TypeKind::Void => false,
    }
}

fn module_uses_vectors(module: &Module) -> bool {
    let in_globals = module.globals().iter().any(|g| mentions_vector(g.value_type()));
    in_globals
        || module.functions().iter().any(|f| {
            mentions_vector(f.ty())
                || f.blocks().iter().flat_map(|block| block.instructions()).any(|&id| {
                    f.inst(id).is_some_and(|data| match data.instruction() {
                        Instruction::Alloca { allocated } => mentions_vector(allocated),
                        _ => mentions_vector(data.ty()),
                    })
                })
        })
}

/// x86-64 code generator for whole modules.
#[derive(Debug, Clone)]
pub struct X64Backend {
    /// Whether SSE2 is available for 128-bit vector moves.
    sse2: bool,
}

impl X64Backend {
    /// Create a new x86-64 backend.
    pub fn new(sse2: bool) -> Self {
        Self { sse2 }
    }

    /// Compile every function and global of `module`.
    pub fn compile_module(&self, module: &Module) -> LoweringResult<ElfAssembler> {
        if !self.sse2 && module_uses_vectors(module) {
            return Err(LoweringError::Unsupported {
                target: "x86_64".to_string(),
                reason: "vector types require sse2".to_string(),
            });
        }

        let mut asm = ElfAssembler::new(module.name());
        let mut symbols = Vec::with_capacity(module.functions().len());
        for function in module.functions() {
            let sym = if function.is_declaration() {
                asm.sym_add_undef(function.name())
            } else {
                asm.sym_predef_func(function.name(), function.linkage())
            };
            symbols.push(sym);
        }
        for global in module.globals() {
            let ty = global.value_type();
            check_type(ty)?;
            let init = global
                .initializer()
                .map(|constant| GenericValue::from_constant(ty, constant).to_bytes(ty));
            asm.sym_def_data(
                global.name(),
                global.linkage(),
                init,
                layout::size_of(ty),
                layout::align_of(ty),
            );
        }

        if module.functions().iter().all(|f| f.is_declaration()) {
            return Ok(asm);
        }

        let arena = Bump::new();
        let mut encoder = X64Encoder::new()?;
        for function in module.functions() {
            if function.is_declaration() {
                continue;
            }
            log::debug!("lowering function {}", function.name());
            FunctionCodegen::new(&mut encoder, module, function, &arena)?.compile()?;
        }
        log::trace!("encoded {} instructions", encoder.instruction_count());
        let assembled = encoder.finalize()?;

        let code_len = assembled.code.len() as u64;
        let mut starts: Vec<(u64, usize)> = assembled
            .functions
            .iter()
            .map(|(&func, &offset)| (offset, func as usize))
            .collect();
        starts.sort_unstable();
        for (i, &(offset, func)) in starts.iter().enumerate() {
            let end = starts.get(i + 1).map_or(code_len, |&(next, _)| next);
            asm.define_func(symbols[func], offset, end - offset)?;
        }
        for (&(func, block), &offset) in &assembled.blocks {
            asm.label_place(offset, format!(".LBB{func}_{block}"));
        }
        asm.set_code(assembled.code, assembled.relocs);
        Ok(asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::Builder;
    use crate::core::module::{CallConv, Value};
    use crate::core::types::TypeRegistry;

    fn caller_module() -> Module {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let callee_ty = types.function_type(&i32_ty, &[i32_ty.clone()], false).unwrap();
        let main_ty = types.function_type(&i32_ty, &[], false).unwrap();
        let mut module = Module::new("calls");
        let ext = module.add_function(&callee_ty, "ext").unwrap();
        let twice = module.add_function(&callee_ty, "twice").unwrap();
        module.set_call_conv(twice, CallConv::Stack).unwrap();
        let main = module.add_function(&main_ty, "main").unwrap();

        let entry = module.append_block(twice, "entry").unwrap();
        let x = module.param(twice, 0).unwrap();
        let mut builder = Builder::new(&mut module);
        builder.position_at_end(entry);
        let doubled = builder.add(&x, &x, "doubled").unwrap();
        builder.ret(&doubled).unwrap();

        let entry = module.append_block(main, "entry").unwrap();
        let mut builder = Builder::new(&mut module);
        builder.position_at_end(entry);
        let a = builder.call(twice, &[Value::const_i32(21)], "a").unwrap();
        let b = builder.call(ext, &[a.clone()], "b").unwrap();
        builder.ret(&b).unwrap();
        module
    }

    #[test]
    fn test_compile_module_symbols() {
        let module = caller_module();
        let asm = X64Backend::new(true).compile_module(&module).unwrap();
        assert_eq!(asm.symbol_name(0), Some("ext"));
        assert_eq!(asm.symbol_name(2), Some("main"));
        assert!(!asm.code().is_empty());

        let text = asm.build_assembly().unwrap();
        assert!(text.contains("twice:"));
        assert!(text.contains("main:"));
        assert!(text.contains("ext"));
    }

    #[test]
    fn test_vectors_need_sse2() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let v4 = types.vector_type(&i32_ty, 4).unwrap();
        let mut module = Module::new("vec");
        module.add_global(&v4, "lanes").unwrap();
        assert!(matches!(
            X64Backend::new(false).compile_module(&module),
            Err(LoweringError::Unsupported { .. })
        ));
        assert!(X64Backend::new(true).compile_module(&module).is_ok());
    }
}
