// This module translates an irgen Module into an inkwell (LLVM) module. Types map one to one
// (integers of any width, opaque pointers, vectors, literal structs, function types), globals
// are always given an initializer (zero when none was set), functions carry their linkage,
// numbered calling convention and enum attributes, and call sites carry their own convention
// when one was recorded. Bodies are translated block by block in reverse post-order so every
// operand is available when its user is built; blocks not reachable from the entry are filled
// with a single `unreachable`. The translation also adds one invoke thunk per defined function:
// `void thunk(ptr args, ptr ret)` loads each parameter from a packed argument buffer, calls the
// function and stores the result, giving the JIT a single C signature to call through.

//! Translation of irgen modules to LLVM IR.

use crate::core::analyzer::Analyzer;
use crate::core::layout;
use crate::core::module::{
    BinaryOp, Constant, Function, Instruction, IntPredicate, Linkage, Module, Value, ValueKind,
};
use crate::core::types::{FunctionType, Type, TypeKind};
use hashbrown::HashMap;
use inkwell::attributes::{Attribute as LlvmAttribute, AttributeLoc};
use inkwell::basic_block::BasicBlock;
use inkwell::builder::{Builder, BuilderError};
use inkwell::context::Context;
use inkwell::module::{Linkage as LlvmLinkage, Module as LlvmModule};
use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType as LlvmFnType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValue, BasicValueEnum, FunctionValue, GlobalValue, IntMathValue,
};
use inkwell::AddressSpace;

/// Prefix of the generated invoke thunks.
pub const THUNK_PREFIX: &str = "__irgen_invoke.";

/// Errors raised while building the LLVM module.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("LLVM builder error: {0}")]
    Builder(#[from] BuilderError),

    #[error("cannot express in LLVM: {0}")]
    Unsupported(String),
}

type TranslateResult<T> = Result<T, TranslateError>;

fn missing(what: impl Into<String>) -> TranslateError {
    TranslateError::Unsupported(what.into())
}

/// Byte offsets of `params` in a packed invoke buffer, and its total size.
pub fn argument_offsets(params: &[Type]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(params.len());
    let mut offset = 0u64;
    for param in params {
        let align = layout::align_of(param);
        offset = offset.div_ceil(align) * align;
        offsets.push(offset as usize);
        offset += layout::size_of(param);
    }
    (offsets, offset as usize)
}

fn llvm_linkage(linkage: Linkage) -> LlvmLinkage {
    match linkage {
        Linkage::External => LlvmLinkage::External,
        Linkage::Internal => LlvmLinkage::Internal,
        Linkage::Private => LlvmLinkage::Private,
    }
}

fn llvm_predicate(pred: IntPredicate) -> inkwell::IntPredicate {
    match pred {
        IntPredicate::Eq => inkwell::IntPredicate::EQ,
        IntPredicate::Ne => inkwell::IntPredicate::NE,
        IntPredicate::Ugt => inkwell::IntPredicate::UGT,
        IntPredicate::Uge => inkwell::IntPredicate::UGE,
        IntPredicate::Ult => inkwell::IntPredicate::ULT,
        IntPredicate::Ule => inkwell::IntPredicate::ULE,
        IntPredicate::Sgt => inkwell::IntPredicate::SGT,
        IntPredicate::Sge => inkwell::IntPredicate::SGE,
        IntPredicate::Slt => inkwell::IntPredicate::SLT,
        IntPredicate::Sle => inkwell::IntPredicate::SLE,
    }
}

fn int_op<'ctx, T: IntMathValue<'ctx>>(
    builder: &Builder<'ctx>,
    op: BinaryOp,
    lhs: T,
    rhs: T,
    name: &str,
) -> Result<T, BuilderError> {
    match op {
        BinaryOp::Add => builder.build_int_add(lhs, rhs, name),
        BinaryOp::Sub => builder.build_int_sub(lhs, rhs, name),
        BinaryOp::Mul => builder.build_int_mul(lhs, rhs, name),
        BinaryOp::And => builder.build_and(lhs, rhs, name),
        BinaryOp::Or => builder.build_or(lhs, rhs, name),
        BinaryOp::Xor => builder.build_xor(lhs, rhs, name),
    }
}

/// Builds one LLVM module from one irgen module.
pub struct Translator<'ctx, 'm> {
    context: &'ctx Context,
    module: &'m Module,
    llvm: LlvmModule<'ctx>,
    builder: Builder<'ctx>,
    functions: Vec<FunctionValue<'ctx>>,
    globals: Vec<GlobalValue<'ctx>>,
}

impl<'ctx, 'm> Translator<'ctx, 'm> {
    pub fn new(context: &'ctx Context, module: &'m Module) -> Self {
        Self {
            context,
            module,
            llvm: context.create_module(module.name()),
            builder: context.create_builder(),
            functions: Vec::with_capacity(module.functions().len()),
            globals: Vec::with_capacity(module.globals().len()),
        }
    }

    /// Translate the whole module. With `thunks`, add an invoke thunk per defined function.
    pub fn translate(mut self, thunks: bool) -> TranslateResult<LlvmModule<'ctx>> {
        let module = self.module;
        for global in module.globals() {
            let ty = self.basic_type(global.value_type())?;
            let value = self.llvm.add_global(ty, Some(AddressSpace::default()), global.name());
            let init = match global.initializer() {
                Some(constant) => self.const_value(global.value_type(), constant)?,
                None => self.zero(global.value_type())?,
            };
            value.set_initializer(&init);
            value.set_linkage(llvm_linkage(global.linkage()));
            self.globals.push(value);
        }

        for function in module.functions() {
            let fn_type = self.fn_type(function.signature())?;
            let linkage = if function.is_declaration() {
                LlvmLinkage::External
            } else {
                llvm_linkage(function.linkage())
            };
            let value = self.llvm.add_function(function.name(), fn_type, Some(linkage));
            value.set_call_conventions(function.call_conv().llvm_id());
            for attribute in function.attributes() {
                let kind = LlvmAttribute::get_named_enum_kind_id(attribute.name());
                value.add_attribute(AttributeLoc::Function, self.context.create_enum_attribute(kind, 0));
            }
            self.functions.push(value);
        }

        for function in module.functions() {
            if !function.is_declaration() {
                self.translate_body(function)?;
            }
        }

        if thunks {
            for function in module.functions() {
                if !function.is_declaration() {
                    self.build_thunk(function)?;
                }
            }
        }

        log::debug!(
            "translated module {} to LLVM ({} functions)",
            module.name(),
            self.functions.len()
        );
        Ok(self.llvm)
    }

    // ==== TYPES ====

    fn basic_type(&self, ty: &Type) -> TranslateResult<BasicTypeEnum<'ctx>> {
        Ok(match ty.kind() {
            TypeKind::Int(width) => self.context.custom_width_int_type(*width).into(),
            TypeKind::Pointer(_) => self.context.ptr_type(AddressSpace::default()).into(),
            TypeKind::Vector { elem, count } => match self.basic_type(elem)? {
                BasicTypeEnum::IntType(int) => int.vec_type(*count).into(),
                BasicTypeEnum::PointerType(ptr) => ptr.vec_type(*count).into(),
                _ => return Err(missing(format!("vector element type {elem}"))),
            },
            TypeKind::Struct { fields, packed } => {
                let fields = fields
                    .iter()
                    .map(|field| self.basic_type(field))
                    .collect::<TranslateResult<Vec<_>>>()?;
                self.context.struct_type(&fields, *packed).into()
            }
            TypeKind::Void | TypeKind::Function(_) => {
                return Err(missing(format!("{ty} is not a value type")))
            }
        })
    }

    fn fn_type(&self, sig: &FunctionType) -> TranslateResult<LlvmFnType<'ctx>> {
        let params = sig
            .params
            .iter()
            .map(|param| self.basic_type(param).map(BasicMetadataTypeEnum::from))
            .collect::<TranslateResult<Vec<_>>>()?;
        Ok(if sig.ret.is_void() {
            self.context.void_type().fn_type(&params, sig.variadic)
        } else {
            self.basic_type(&sig.ret)?.fn_type(&params, sig.variadic)
        })
    }

    // ==== CONSTANTS ====

    fn zero(&self, ty: &Type) -> TranslateResult<BasicValueEnum<'ctx>> {
        let llvm_ty = self.basic_type(ty)?;
        Ok(match ty.kind() {
            TypeKind::Int(_) => llvm_ty.into_int_type().const_zero().into(),
            TypeKind::Pointer(_) => llvm_ty.into_pointer_type().const_null().into(),
            TypeKind::Vector { .. } => llvm_ty.into_vector_type().const_zero().into(),
            TypeKind::Struct { .. } => llvm_ty.into_struct_type().const_zero().into(),
            TypeKind::Void | TypeKind::Function(_) => return Err(missing(format!("zero of {ty}"))),
        })
    }

    fn undef(&self, ty: &Type) -> TranslateResult<BasicValueEnum<'ctx>> {
        let llvm_ty = self.basic_type(ty)?;
        Ok(match ty.kind() {
            TypeKind::Int(_) => llvm_ty.into_int_type().get_undef().into(),
            TypeKind::Pointer(_) => llvm_ty.into_pointer_type().get_undef().into(),
            TypeKind::Vector { .. } => llvm_ty.into_vector_type().get_undef().into(),
            TypeKind::Struct { .. } => llvm_ty.into_struct_type().get_undef().into(),
            TypeKind::Void | TypeKind::Function(_) => return Err(missing(format!("undef of {ty}"))),
        })
    }

    fn const_value(&self, ty: &Type, constant: &Constant) -> TranslateResult<BasicValueEnum<'ctx>> {
        match (constant, ty.kind()) {
            (Constant::Int(bits), TypeKind::Int(width)) => {
                let words = [*bits as u64, (*bits >> 64) as u64];
                Ok(self
                    .context
                    .custom_width_int_type(*width)
                    .const_int_arbitrary_precision(&words)
                    .into())
            }
            (Constant::Zero, _) => self.zero(ty),
            (Constant::Undef, _) => self.undef(ty),
            (Constant::Aggregate(elements), TypeKind::Struct { fields, .. }) => {
                let values = fields
                    .iter()
                    .zip(elements)
                    .map(|(field, element)| self.const_value(field, element))
                    .collect::<TranslateResult<Vec<_>>>()?;
                let struct_ty = self.basic_type(ty)?.into_struct_type();
                Ok(struct_ty.const_named_struct(&values).into())
            }
            (Constant::Aggregate(elements), TypeKind::Vector { elem, .. }) => {
                let values = elements
                    .iter()
                    .map(|element| self.const_value(elem, element))
                    .collect::<TranslateResult<Vec<_>>>()?;
                Ok(inkwell::types::VectorType::const_vector(&values).into())
            }
            _ => Err(missing(format!("constant {constant:?} of type {ty}"))),
        }
    }

    // ==== BODIES ====

    fn translate_body(&mut self, function: &Function) -> TranslateResult<()> {
        let llvm_fn = self.functions[function.id().index()];
        let blocks: Vec<BasicBlock<'ctx>> = function
            .blocks()
            .iter()
            .map(|block| self.context.append_basic_block(llvm_fn, block.label()))
            .collect();

        let analyzer = Analyzer::new(function);
        let mut values: HashMap<usize, BasicValueEnum<'ctx>> = HashMap::new();
        for &block_index in analyzer.order() {
            self.builder.position_at_end(blocks[block_index]);
            for &id in function.blocks()[block_index].instructions() {
                let Some(data) = function.inst(id) else {
                    continue;
                };
                let result = self.translate_inst(function, llvm_fn, &blocks, &values, data)?;
                if let Some(result) = result {
                    values.insert(id.index(), result);
                }
            }
        }
        for (block_index, block) in blocks.iter().enumerate() {
            if !analyzer.is_reachable(block_index) {
                self.builder.position_at_end(*block);
                self.builder.build_unreachable()?;
            }
        }
        Ok(())
    }

    fn operand(
        &self,
        llvm_fn: FunctionValue<'ctx>,
        values: &HashMap<usize, BasicValueEnum<'ctx>>,
        value: &Value,
    ) -> TranslateResult<BasicValueEnum<'ctx>> {
        match value.kind() {
            ValueKind::Const(constant) => self.const_value(value.ty(), constant),
            ValueKind::Param { index, .. } => llvm_fn
                .get_nth_param(*index)
                .ok_or_else(|| missing(format!("parameter {index}"))),
            ValueKind::Inst(id) => values
                .get(&id.index())
                .copied()
                .ok_or_else(|| missing(format!("instruction {} used before definition", id.index()))),
            ValueKind::Global(global) => Ok(self.globals[global.index()].as_pointer_value().into()),
            ValueKind::Function(func) => Ok(self.functions[func.index()]
                .as_global_value()
                .as_pointer_value()
                .into()),
        }
    }

    fn translate_inst(
        &self,
        function: &Function,
        llvm_fn: FunctionValue<'ctx>,
        blocks: &[BasicBlock<'ctx>],
        values: &HashMap<usize, BasicValueEnum<'ctx>>,
        data: &crate::core::module::InstData,
    ) -> TranslateResult<Option<BasicValueEnum<'ctx>>> {
        let b = &self.builder;
        let name = data.name();
        let op = |value: &Value| self.operand(llvm_fn, values, value);

        let result: BasicValueEnum<'ctx> = match data.instruction() {
            Instruction::Alloca { allocated } => b.build_alloca(self.basic_type(allocated)?, name)?.into(),
            Instruction::Load { ptr } => {
                let pointee = ptr
                    .ty()
                    .pointee()
                    .ok_or_else(|| missing("load through a non-pointer"))?;
                b.build_load(self.basic_type(pointee)?, op(ptr)?.into_pointer_value(), name)?
            }
            Instruction::Store { value, ptr } => {
                b.build_store(op(ptr)?.into_pointer_value(), op(value)?)?;
                return Ok(None);
            }
            Instruction::Binary { op: bin, lhs, rhs } => match (op(lhs)?, op(rhs)?) {
                (BasicValueEnum::IntValue(l), BasicValueEnum::IntValue(r)) => {
                    int_op(b, *bin, l, r, name)?.as_basic_value_enum()
                }
                (BasicValueEnum::VectorValue(l), BasicValueEnum::VectorValue(r)) => {
                    int_op(b, *bin, l, r, name)?.as_basic_value_enum()
                }
                _ => return Err(missing(format!("{} on {}", bin.keyword(), lhs.ty()))),
            },
            Instruction::ICmp { pred, lhs, rhs } => {
                let (l, r) = match (op(lhs)?, op(rhs)?) {
                    (BasicValueEnum::IntValue(l), BasicValueEnum::IntValue(r)) => (l, r),
                    (BasicValueEnum::PointerValue(l), BasicValueEnum::PointerValue(r)) => {
                        let i64_ty = self.context.i64_type();
                        (
                            b.build_ptr_to_int(l, i64_ty, "")?,
                            b.build_ptr_to_int(r, i64_ty, "")?,
                        )
                    }
                    _ => return Err(missing(format!("icmp on {}", lhs.ty()))),
                };
                b.build_int_compare(llvm_predicate(*pred), l, r, name)?.into()
            }
            Instruction::Call {
                callee,
                args,
                call_conv,
            } => {
                let target = self
                    .module
                    .function(*callee)
                    .ok_or_else(|| missing(format!("call to function #{}", callee.index())))?;
                let args = args
                    .iter()
                    .map(|arg| op(arg).map(BasicMetadataValueEnum::from))
                    .collect::<TranslateResult<Vec<_>>>()?;
                let call_name = if data.ty().is_void() { "" } else { name };
                let call = b.build_call(self.functions[callee.index()], &args, call_name)?;
                call.set_call_convention(call_conv.unwrap_or(target.call_conv()).llvm_id());
                match call.try_as_basic_value().left() {
                    Some(value) => value,
                    None => return Ok(None),
                }
            }
            Instruction::InsertValue {
                aggregate,
                element,
                index,
            } => b
                .build_insert_value(op(aggregate)?.into_struct_value(), op(element)?, *index, name)?
                .into_struct_value()
                .into(),
            Instruction::ExtractValue { aggregate, index } => {
                b.build_extract_value(op(aggregate)?.into_struct_value(), *index, name)?
            }
            Instruction::InsertElement {
                vector,
                element,
                lane,
            } => b
                .build_insert_element(
                    op(vector)?.into_vector_value(),
                    op(element)?,
                    op(lane)?.into_int_value(),
                    name,
                )?
                .into(),
            Instruction::ExtractElement { vector, lane } => b.build_extract_element(
                op(vector)?.into_vector_value(),
                op(lane)?.into_int_value(),
                name,
            )?,
            Instruction::Ret { value } => {
                match value {
                    Some(value) => b.build_return(Some(&op(value)?))?,
                    None => b.build_return(None)?,
                };
                return Ok(None);
            }
            Instruction::Br { dest } => {
                b.build_unconditional_branch(blocks[dest.index()])?;
                return Ok(None);
            }
            Instruction::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                b.build_conditional_branch(
                    op(cond)?.into_int_value(),
                    blocks[then_dest.index()],
                    blocks[else_dest.index()],
                )?;
                return Ok(None);
            }
            Instruction::Unreachable => {
                b.build_unreachable()?;
                return Ok(None);
            }
        };
        log::trace!("{}: translated {}", function.name(), data.instruction().opcode());
        Ok(Some(result))
    }

    // ==== INVOKE THUNKS ====

    fn build_thunk(&mut self, function: &Function) -> TranslateResult<()> {
        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let thunk_ty = self
            .context
            .void_type()
            .fn_type(&[ptr_ty.into(), ptr_ty.into()], false);
        let name = format!("{THUNK_PREFIX}{}", function.name());
        let thunk = self.llvm.add_function(&name, thunk_ty, Some(LlvmLinkage::External));
        let entry = self.context.append_basic_block(thunk, "entry");
        self.builder.position_at_end(entry);

        let (args_ptr, ret_ptr) = match (thunk.get_nth_param(0), thunk.get_nth_param(1)) {
            (Some(a), Some(r)) => (a.into_pointer_value(), r.into_pointer_value()),
            _ => return Err(missing("thunk parameters")),
        };
        let i8_ty = self.context.i8_type();
        let signature = function.signature();
        let (offsets, _) = argument_offsets(&signature.params);

        let mut args = Vec::with_capacity(signature.params.len());
        for (param, offset) in signature.params.iter().zip(offsets) {
            let index = self.context.i64_type().const_int(offset as u64, false);
            // SAFETY: the offset stays inside the buffer sized by argument_offsets.
            let slot = unsafe { self.builder.build_gep(i8_ty, args_ptr, &[index], "")? };
            let load = self.builder.build_load(self.basic_type(param)?, slot, "")?;
            if let Some(inst) = load.as_instruction_value() {
                inst.set_alignment(1).map_err(|e| missing(e.to_string()))?;
            }
            args.push(BasicMetadataValueEnum::from(load));
        }

        let callee = self.functions[function.id().index()];
        let call = self.builder.build_call(callee, &args, "")?;
        call.set_call_convention(function.call_conv().llvm_id());
        if let Some(result) = call.try_as_basic_value().left() {
            let store = self.builder.build_store(ret_ptr, result)?;
            store.set_alignment(1).map_err(|e| missing(e.to_string()))?;
        }
        self.builder.build_return(None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TypeRegistry;

    #[test]
    fn test_argument_offsets() {
        let mut types = TypeRegistry::new();
        let i8_ty = types.i8();
        let i64_ty = types.i64();
        let i32_ty = types.i32();
        let v4 = types.vector_type(&i32_ty, 4).unwrap();
        let (offsets, size) = argument_offsets(&[i8_ty, i64_ty, v4]);
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(size, 32);
    }

    #[test]
    fn test_translate_global_and_function() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[], false).unwrap();
        let mut module = Module::new("t");
        module
            .add_global_with_initializer("g", &Value::const_i32(5))
            .unwrap();
        module.add_function(&fn_ty, "ext").unwrap();

        let context = Context::create();
        let llvm = Translator::new(&context, &module).translate(true).unwrap();
        assert!(llvm.get_global("g").is_some());
        assert!(llvm.get_function("ext").is_some());
        assert!(llvm.verify().is_ok());
    }
}
