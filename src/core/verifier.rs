// This module implements StructuralVerifier, the built-in Verifier. It walks a module and
// reports the first violation it finds: duplicate symbols, conflicting function attributes
// (noinline together with alwaysinline), blocks that are empty or do not end in a
// terminator, terminators in the middle of a block, operands that belong to another
// function or do not exist, uses that are not dominated by their definition, branches
// to blocks of other functions, and instruction signatures that do not type-check
// (including return values that do not match the function's return type). The walk is
// read-only and deterministic, so verifying the same module twice yields the same answer.

use super::analyzer::Analyzer;
use super::error::Violation;
use super::module::{
    Attribute, BlockId, Constant, Function, InstData, Instruction, Module, Value, ValueKind,
};
use super::types::{Type, TypeKind};
use crate::backend::{Verification, Verifier};
use hashbrown::HashSet;

/// Verifier that checks the structural rules of the IR without any backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralVerifier;

impl Verifier for StructuralVerifier {
    fn verify(&self, module: &Module) -> Verification {
        match check_module(module) {
            Ok(()) => Verification::Valid,
            Err(violation) => {
                log::debug!("verification of {} failed: {violation}", module.name());
                Verification::Invalid(violation)
            }
        }
    }
}

fn check_module(module: &Module) -> Result<(), Violation> {
    let mut names = HashSet::new();
    let symbol_names = module
        .globals()
        .iter()
        .map(|g| g.name())
        .chain(module.functions().iter().map(|f| f.name()));
    for name in symbol_names {
        if !names.insert(name) {
            return Err(Violation::DuplicateSymbol {
                name: name.to_string(),
            });
        }
    }

    for global in module.globals() {
        if let Some(init) = global.initializer() {
            if !constant_conforms(init, global.value_type()) {
                return Err(Violation::TypeMismatch {
                    function: String::new(),
                    detail: format!("initializer of @{} does not match {}", global.name(), global.value_type()),
                });
            }
        }
    }

    for function in module.functions() {
        if function.has_attribute(Attribute::NoInline)
            && function.has_attribute(Attribute::AlwaysInline)
        {
            return Err(Violation::ConflictingAttributes {
                function: function.name().to_string(),
                first: Attribute::NoInline.name(),
                second: Attribute::AlwaysInline.name(),
            });
        }
        FunctionChecker::new(module, function).check()?;
    }
    Ok(())
}

/// Whether a constant payload has the shape of `ty`.
fn constant_conforms(constant: &Constant, ty: &Type) -> bool {
    match (constant, ty.kind()) {
        (Constant::Undef | Constant::Zero, _) => ty.is_first_class(),
        (Constant::Int(bits), TypeKind::Int(width)) => {
            *width >= 128 || *bits >> *width == 0
        }
        (Constant::Aggregate(elements), TypeKind::Vector { elem, count }) => {
            elements.len() == *count as usize && elements.iter().all(|e| constant_conforms(e, elem))
        }
        (Constant::Aggregate(elements), TypeKind::Struct { fields, .. }) => {
            elements.len() == fields.len()
                && elements.iter().zip(fields).all(|(e, f)| constant_conforms(e, f))
        }
        _ => false,
    }
}

struct FunctionChecker<'a> {
    module: &'a Module,
    function: &'a Function,
    /// Block index and position of every placed instruction.
    placement: Vec<Option<(usize, usize)>>,
}

impl<'a> FunctionChecker<'a> {
    fn new(module: &'a Module, function: &'a Function) -> Self {
        Self {
            module,
            function,
            placement: vec![None; function.inst_count()],
        }
    }

    fn dangling(&self, detail: impl Into<String>) -> Violation {
        Violation::DanglingReference {
            function: self.function.name().to_string(),
            detail: detail.into(),
        }
    }

    fn mismatch(&self, detail: impl Into<String>) -> Violation {
        Violation::TypeMismatch {
            function: self.function.name().to_string(),
            detail: detail.into(),
        }
    }

    fn check(mut self) -> Result<(), Violation> {
        let function = self.function;
        for (b, block) in function.blocks().iter().enumerate() {
            let Some(last) = block.instructions().last() else {
                return Err(Violation::MissingTerminator {
                    function: function.name().to_string(),
                    block: block.label().to_string(),
                });
            };
            for (pos, id) in block.instructions().iter().enumerate() {
                let data = function
                    .inst(*id)
                    .filter(|data| data.block_index() == b)
                    .ok_or_else(|| self.dangling(format!("block {} lists foreign instruction", block.label())))?;
                if self.placement[id.index()].is_some() {
                    return Err(self.dangling(format!("instruction placed twice in {}", block.label())));
                }
                self.placement[id.index()] = Some((b, pos));
                if data.instruction().is_terminator() && id != last {
                    return Err(Violation::MisplacedTerminator {
                        function: function.name().to_string(),
                        block: block.label().to_string(),
                    });
                }
            }
            let terminated = function
                .inst(*last)
                .is_some_and(|data| data.instruction().is_terminator());
            if !terminated {
                return Err(Violation::MissingTerminator {
                    function: function.name().to_string(),
                    block: block.label().to_string(),
                });
            }
        }

        let analyzer = Analyzer::new(function);
        for (b, block) in function.blocks().iter().enumerate() {
            for (pos, id) in block.instructions().iter().enumerate() {
                let Some(data) = function.inst(*id) else {
                    continue;
                };
                for operand in data.instruction().operands() {
                    self.check_operand(&analyzer, b, pos, operand)?;
                }
                for dest in data.instruction().successors() {
                    self.check_block_ref(dest)?;
                }
                self.check_types(data)?;
            }
        }
        Ok(())
    }

    fn check_block_ref(&self, dest: BlockId) -> Result<(), Violation> {
        if dest.func() != self.function.id() || dest.index() >= self.function.blocks().len() {
            return Err(self.dangling(format!("branch to block #{} outside the function", dest.index())));
        }
        Ok(())
    }

    fn check_operand(
        &self,
        analyzer: &Analyzer,
        use_block: usize,
        use_pos: usize,
        value: &Value,
    ) -> Result<(), Violation> {
        match value.kind() {
            ValueKind::Const(constant) => {
                if !constant_conforms(constant, value.ty()) {
                    return Err(self.mismatch(format!("malformed constant of type {}", value.ty())));
                }
            }
            ValueKind::Param { func, index } => {
                if *func != self.function.id() {
                    return Err(self.dangling(format!("parameter {index} of another function")));
                }
                let param = self
                    .function
                    .signature()
                    .params
                    .get(*index as usize)
                    .ok_or_else(|| self.dangling(format!("parameter {index} out of range")))?;
                if param != value.ty() {
                    return Err(self.mismatch(format!("parameter {index} used as {}", value.ty())));
                }
            }
            ValueKind::Inst(id) => {
                if id.func() != self.function.id() {
                    return Err(self.dangling("result of an instruction in another function"));
                }
                let data = self
                    .function
                    .inst(*id)
                    .ok_or_else(|| self.dangling(format!("unknown instruction %{}", id.index())))?;
                let (def_block, def_pos) = self.placement[id.index()]
                    .ok_or_else(|| self.dangling(format!("instruction %{} is not placed in a block", id.index())))?;
                if data.ty() != value.ty() || data.ty().is_void() {
                    return Err(self.mismatch(format!(
                        "{} result of type {} used as {}",
                        data.instruction().opcode(),
                        data.ty(),
                        value.ty()
                    )));
                }
                let dominated = if def_block == use_block {
                    def_pos < use_pos
                } else {
                    analyzer.dominates(def_block, use_block)
                };
                if !dominated {
                    return Err(self.dangling(format!(
                        "use of %{} not dominated by its definition",
                        id.index()
                    )));
                }
            }
            ValueKind::Global(id) => {
                let global = self
                    .module
                    .global(*id)
                    .ok_or_else(|| self.dangling(format!("unknown global #{}", id.index())))?;
                if value.ty() != &Type::pointer_to(global.value_type()) {
                    return Err(self.mismatch(format!("@{} used as {}", global.name(), value.ty())));
                }
            }
            ValueKind::Function(id) => {
                let callee = self
                    .module
                    .function(*id)
                    .ok_or_else(|| self.dangling(format!("unknown function #{}", id.index())))?;
                if value.ty() != &Type::pointer_to(callee.ty()) {
                    return Err(self.mismatch(format!("@{} used as {}", callee.name(), value.ty())));
                }
            }
        }
        Ok(())
    }

    fn check_types(&self, data: &InstData) -> Result<(), Violation> {
        let ret_ty = &self.function.signature().ret;
        let ok = match data.instruction() {
            Instruction::Alloca { allocated } => {
                allocated.is_first_class() && data.ty() == &Type::pointer_to(allocated)
            }
            Instruction::Load { ptr } => ptr.ty().pointee() == Some(data.ty()),
            Instruction::Store { value, ptr } => ptr.ty().pointee() == Some(value.ty()),
            Instruction::Binary { lhs, rhs, .. } => {
                lhs.ty().is_int_or_int_vector() && lhs.ty() == rhs.ty() && data.ty() == lhs.ty()
            }
            Instruction::ICmp { lhs, rhs, .. } => {
                (lhs.ty().is_int() || lhs.ty().is_pointer())
                    && lhs.ty() == rhs.ty()
                    && data.ty().int_width() == Some(1)
            }
            Instruction::Call { callee, args, .. } => {
                let callee = self
                    .module
                    .function(*callee)
                    .ok_or_else(|| self.dangling("call to unknown function"))?;
                let sig = callee.signature();
                let arity = if sig.variadic {
                    args.len() >= sig.params.len()
                } else {
                    args.len() == sig.params.len()
                };
                arity
                    && sig.params.iter().zip(args).all(|(p, a)| p == a.ty())
                    && &sig.ret == data.ty()
            }
            Instruction::InsertValue {
                aggregate,
                element,
                index,
            } => {
                aggregate
                    .ty()
                    .struct_fields()
                    .and_then(|fields| fields.get(*index as usize))
                    == Some(element.ty())
                    && data.ty() == aggregate.ty()
            }
            Instruction::ExtractValue { aggregate, index } => {
                aggregate
                    .ty()
                    .struct_fields()
                    .and_then(|fields| fields.get(*index as usize))
                    == Some(data.ty())
            }
            Instruction::InsertElement {
                vector,
                element,
                lane,
            } => {
                lane_ok(vector, lane)
                    && vector.ty().vector_parts().map(|(e, _)| e) == Some(element.ty())
                    && data.ty() == vector.ty()
            }
            Instruction::ExtractElement { vector, lane } => {
                lane_ok(vector, lane) && vector.ty().vector_parts().map(|(e, _)| e) == Some(data.ty())
            }
            Instruction::Ret { value } => match value {
                Some(value) => !ret_ty.is_void() && value.ty() == ret_ty,
                None => ret_ty.is_void(),
            },
            Instruction::CondBr { cond, .. } => cond.ty().int_width() == Some(1),
            Instruction::Br { .. } | Instruction::Unreachable => true,
        };
        if !ok {
            return Err(self.mismatch(format!(
                "ill-typed {} in block {}",
                data.instruction().opcode(),
                self.function
                    .blocks()
                    .get(data.block_index())
                    .map(|b| b.label())
                    .unwrap_or("?")
            )));
        }
        Ok(())
    }
}

fn lane_ok(vector: &Value, lane: &Value) -> bool {
    let Some((_, count)) = vector.ty().vector_parts() else {
        return false;
    };
    lane.ty().is_int() && lane.as_const_int().map_or(true, |index| index < u128::from(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VerifiedModule;
    use crate::core::builder::Builder;
    use crate::core::types::TypeRegistry;

    fn add_main(types: &mut TypeRegistry, module: &mut Module) -> (crate::core::module::FuncId, BlockId) {
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[], false).unwrap();
        let main = module.add_function(&fn_ty, "main").unwrap();
        let entry = module.append_block(main, "entry").unwrap();
        (main, entry)
    }

    #[test]
    fn test_missing_terminator_then_fixed() {
        let mut types = TypeRegistry::new();
        let mut module = Module::new("m");
        let (_, entry) = add_main(&mut types, &mut module);
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let sum = b.add(&Value::const_i32(32), &Value::const_i32(16), "sum").unwrap();

        let verdict = StructuralVerifier.verify(&module);
        assert!(matches!(
            verdict,
            Verification::Invalid(Violation::MissingTerminator { .. })
        ));
        // idempotent
        assert_eq!(StructuralVerifier.verify(&module), verdict);

        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.ret(&sum).unwrap();
        assert_eq!(StructuralVerifier.verify(&module), Verification::Valid);
        assert_eq!(StructuralVerifier.verify(&module), Verification::Valid);
    }

    #[test]
    fn test_empty_block_and_misplaced_terminator() {
        let mut types = TypeRegistry::new();
        let mut module = Module::new("m");
        let (main, entry) = add_main(&mut types, &mut module);
        module.append_block(main, "empty").unwrap();
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.ret(&Value::const_i32(0)).unwrap();
        assert!(matches!(
            StructuralVerifier.verify(&module),
            Verification::Invalid(Violation::MissingTerminator { ref block, .. }) if block == "empty"
        ));

        let mut module = Module::new("m2");
        let (_, entry) = add_main(&mut types, &mut module);
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.ret(&Value::const_i32(0)).unwrap();
        b.ret(&Value::const_i32(1)).unwrap();
        assert!(matches!(
            StructuralVerifier.verify(&module),
            Verification::Invalid(Violation::MisplacedTerminator { .. })
        ));
    }

    #[test]
    fn test_foreign_operand_is_dangling() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let mut module = Module::new("m");
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone()], false).unwrap();
        let other = module.add_function(&fn_ty, "other").unwrap();
        let foreign = module.param(other, 0).unwrap();
        let (_, entry) = add_main(&mut types, &mut module);
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.ret(&foreign).unwrap();
        assert!(matches!(
            StructuralVerifier.verify(&module),
            Verification::Invalid(Violation::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_use_before_definition() {
        let mut types = TypeRegistry::new();
        let mut module = Module::new("m");
        let (_, entry) = add_main(&mut types, &mut module);
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let ret = b.ret(&Value::const_i32(0)).unwrap();
        b.position_before(ret).unwrap();
        let late = b.add(&Value::const_i32(1), &Value::const_i32(2), "late").unwrap();
        b.position_before(late.as_inst().unwrap()).unwrap();
        b.add(&late, &Value::const_i32(1), "early").unwrap();
        assert!(matches!(
            StructuralVerifier.verify(&module),
            Verification::Invalid(Violation::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_conflicting_attributes() {
        let mut types = TypeRegistry::new();
        let mut module = Module::new("m");
        let (main, entry) = add_main(&mut types, &mut module);
        module.add_attribute(main, Attribute::NoInline).unwrap();
        module.add_attribute(main, Attribute::AlwaysInline).unwrap();
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.ret(&Value::const_i32(0)).unwrap();
        assert!(matches!(
            StructuralVerifier.verify(&module),
            Verification::Invalid(Violation::ConflictingAttributes { .. })
        ));
    }

    #[test]
    fn test_verified_module_seals() {
        let mut types = TypeRegistry::new();
        let mut module = Module::new("m");
        let (main, entry) = add_main(&mut types, &mut module);
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.ret(&Value::const_i32(0)).unwrap();
        let verified = VerifiedModule::new(module, &StructuralVerifier).unwrap();
        assert!(verified.module().is_sealed());
        assert_eq!(
            verified.module().function(main).unwrap().state(),
            crate::core::module::FunctionState::Sealed
        );

        let mut broken = Module::new("broken");
        add_main(&mut types, &mut broken);
        let rejected = VerifiedModule::new(broken, &StructuralVerifier).unwrap_err();
        assert!(matches!(rejected.violation, Violation::MissingTerminator { .. }));
        assert!(rejected.module.is_sealed());
    }
}
