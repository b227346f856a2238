//! Cursor-based instruction builder.
//!
//! A [`Builder`] borrows a [`Module`] mutably and appends instructions at its
//! cursor: either at the end of a block or immediately before an existing
//! instruction. Every creation call checks its operand types eagerly and
//! fails with [`ConstructionError::TypeMismatch`] before anything is inserted,
//! so a failed call never leaves a partial instruction behind.
//!
//! Operands are not checked for ownership or dominance here; those are
//! properties of the finished function and belong to the verifier.

use super::error::{ConstructionError, ConstructionResult};
use super::module::{
    BinaryOp, BlockId, CallConv, FuncId, InstId, Instruction, IntPredicate, Module, Value,
    ValueKind,
};
use super::types::Type;

/// Where new instructions go within the cursor's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    End,
    Before(InstId),
}

/// Insertion position: a block of a function plus a point inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub block: BlockId,
    pub point: InsertPoint,
}

impl Cursor {
    pub fn func(&self) -> FuncId {
        self.block.func()
    }
}

/// Instruction builder with a movable cursor.
pub struct Builder<'m> {
    module: &'m mut Module,
    cursor: Option<Cursor>,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self {
            module,
            cursor: None,
        }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.cursor = Some(Cursor {
            block,
            point: InsertPoint::End,
        });
    }

    /// Place the cursor immediately before `inst`. Subsequent instructions are
    /// inserted in creation order ahead of it.
    pub fn position_before(&mut self, inst: InstId) -> ConstructionResult<()> {
        let data = self
            .module
            .function(inst.func())
            .and_then(|f| f.inst(inst))
            .ok_or_else(|| ConstructionError::unknown(format!("instruction %{}", inst.index)))?;
        let block = BlockId {
            func: inst.func(),
            index: data.block,
        };
        self.cursor = Some(Cursor {
            block,
            point: InsertPoint::Before(inst),
        });
        Ok(())
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    /// Point the cursor at `point` inside `block`. A `Before` anchor must live in `block`.
    pub fn set_insert_point(&mut self, block: BlockId, point: InsertPoint) -> ConstructionResult<()> {
        if let InsertPoint::Before(inst) = point {
            self.position_before(inst)?;
            if self.insert_block() != Some(block) {
                self.cursor = None;
                return Err(ConstructionError::unknown(format!(
                    "instruction %{} in block #{}",
                    inst.index, block.index
                )));
            }
            return Ok(());
        }
        self.position_at_end(block);
        Ok(())
    }

    pub fn clear_cursor(&mut self) {
        self.cursor = None;
    }

    /// Block the cursor currently points into.
    pub fn insert_block(&self) -> Option<BlockId> {
        self.cursor.map(|c| c.block)
    }

    /// Append a block to the function under the cursor.
    pub fn append_block(&mut self, label: &str) -> ConstructionResult<BlockId> {
        let cursor = self.cursor.ok_or(ConstructionError::NoInsertPoint)?;
        self.module.append_block(cursor.func(), label)
    }

    fn emit(&mut self, inst: Instruction, ty: Type, name: &str) -> ConstructionResult<InstId> {
        let cursor = self.cursor.ok_or(ConstructionError::NoInsertPoint)?;
        let position = match cursor.point {
            InsertPoint::End => None,
            InsertPoint::Before(anchor) => {
                let function = self
                    .module
                    .function(cursor.func())
                    .ok_or_else(|| ConstructionError::unknown(format!("function #{}", cursor.func().0)))?;
                let block = function
                    .block(cursor.block)
                    .ok_or_else(|| ConstructionError::unknown(format!("block #{}", cursor.block.index)))?;
                let at = block
                    .instructions()
                    .iter()
                    .position(|id| *id == anchor)
                    .ok_or_else(|| {
                        ConstructionError::unknown(format!("instruction %{} in cursor block", anchor.index))
                    })?;
                Some(at)
            }
        };
        log::trace!("emit {} into block #{}", inst.opcode(), cursor.block.index);
        self.module.insert_inst(cursor.block, position, inst, ty, name)
    }

    fn emit_value(&mut self, inst: Instruction, ty: Type, name: &str) -> ConstructionResult<Value> {
        let id = self.emit(inst, ty.clone(), name)?;
        Ok(Value::new(ValueKind::Inst(id), ty))
    }

    fn cursor_signature_ret(&self) -> ConstructionResult<Type> {
        let cursor = self.cursor.ok_or(ConstructionError::NoInsertPoint)?;
        let function = self
            .module
            .function(cursor.func())
            .ok_or_else(|| ConstructionError::unknown(format!("function #{}", cursor.func().0)))?;
        Ok(function.signature().ret.clone())
    }

    /// Reserve a stack slot for one value of type `ty`; yields a pointer to it.
    pub fn alloca(&mut self, ty: &Type, name: &str) -> ConstructionResult<Value> {
        if !ty.is_first_class() {
            return Err(ConstructionError::mismatch("alloca", "first-class type", ty));
        }
        let result = Type::pointer_to(ty);
        self.emit_value(Instruction::Alloca { allocated: ty.clone() }, result, name)
    }

    pub fn load(&mut self, ptr: &Value, name: &str) -> ConstructionResult<Value> {
        let pointee = ptr
            .ty()
            .pointee()
            .ok_or_else(|| ConstructionError::mismatch("load", "pointer", ptr.ty()))?
            .clone();
        if !pointee.is_first_class() {
            return Err(ConstructionError::mismatch("load", "pointer to first-class type", ptr.ty()));
        }
        self.emit_value(Instruction::Load { ptr: ptr.clone() }, pointee, name)
    }

    pub fn store(&mut self, value: &Value, ptr: &Value) -> ConstructionResult<InstId> {
        let expected = Type::pointer_to(value.ty());
        if ptr.ty() != &expected {
            return Err(ConstructionError::mismatch("store", expected, ptr.ty()));
        }
        self.emit(
            Instruction::Store {
                value: value.clone(),
                ptr: ptr.clone(),
            },
            Type::void(),
            "",
        )
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &Value,
        rhs: &Value,
        name: &str,
    ) -> ConstructionResult<Value> {
        if !lhs.ty().is_int_or_int_vector() {
            return Err(ConstructionError::mismatch(op.keyword(), "integer or integer vector", lhs.ty()));
        }
        if lhs.ty() != rhs.ty() {
            return Err(ConstructionError::mismatch(op.keyword(), lhs.ty(), rhs.ty()));
        }
        let ty = lhs.ty().clone();
        self.emit_value(
            Instruction::Binary {
                op,
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            ty,
            name,
        )
    }

    pub fn add(&mut self, lhs: &Value, rhs: &Value, name: &str) -> ConstructionResult<Value> {
        self.binary(BinaryOp::Add, lhs, rhs, name)
    }

    pub fn sub(&mut self, lhs: &Value, rhs: &Value, name: &str) -> ConstructionResult<Value> {
        self.binary(BinaryOp::Sub, lhs, rhs, name)
    }

    pub fn mul(&mut self, lhs: &Value, rhs: &Value, name: &str) -> ConstructionResult<Value> {
        self.binary(BinaryOp::Mul, lhs, rhs, name)
    }

    pub fn icmp(
        &mut self,
        pred: IntPredicate,
        lhs: &Value,
        rhs: &Value,
        name: &str,
    ) -> ConstructionResult<Value> {
        if !(lhs.ty().is_int() || lhs.ty().is_pointer()) {
            return Err(ConstructionError::mismatch("icmp", "integer or pointer", lhs.ty()));
        }
        if lhs.ty() != rhs.ty() {
            return Err(ConstructionError::mismatch("icmp", lhs.ty(), rhs.ty()));
        }
        self.emit_value(
            Instruction::ICmp {
                pred,
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Type::int(1),
            name,
        )
    }

    /// Call `callee` with `args`. A void call yields a value of void type that
    /// cannot be used as an operand.
    pub fn call(&mut self, callee: FuncId, args: &[Value], name: &str) -> ConstructionResult<Value> {
        self.call_with_conv(callee, args, None, name)
    }

    /// Call with an explicit call-site convention.
    pub fn call_with_conv(
        &mut self,
        callee: FuncId,
        args: &[Value],
        call_conv: Option<CallConv>,
        name: &str,
    ) -> ConstructionResult<Value> {
        let function = self
            .module
            .function(callee)
            .ok_or_else(|| ConstructionError::unknown(format!("function #{}", callee.0)))?;
        let sig = function.signature();
        let arity_ok = if sig.variadic {
            args.len() >= sig.params.len()
        } else {
            args.len() == sig.params.len()
        };
        if !arity_ok {
            return Err(ConstructionError::mismatch(
                "call",
                format!("{} arguments to {}", sig.params.len(), function.name()),
                format!("{} arguments", args.len()),
            ));
        }
        for (param, arg) in sig.params.iter().zip(args) {
            if param != arg.ty() {
                return Err(ConstructionError::mismatch("call", param, arg.ty()));
            }
        }
        if let Some(extra) = args[sig.params.len()..].iter().find(|a| !a.ty().is_first_class()) {
            return Err(ConstructionError::mismatch("call", "first-class variadic argument", extra.ty()));
        }
        let ret = sig.ret.clone();
        let name = if ret.is_void() { "" } else { name };
        self.emit_value(
            Instruction::Call {
                callee,
                args: args.to_vec(),
                call_conv,
            },
            ret,
            name,
        )
    }

    /// Copy of `aggregate` with field `index` replaced by `element`.
    pub fn insert_value(
        &mut self,
        aggregate: &Value,
        element: &Value,
        index: u32,
        name: &str,
    ) -> ConstructionResult<Value> {
        let fields = aggregate
            .ty()
            .struct_fields()
            .ok_or_else(|| ConstructionError::mismatch("insertvalue", "struct", aggregate.ty()))?;
        let field = fields.get(index as usize).ok_or_else(|| {
            ConstructionError::mismatch(
                "insertvalue",
                format!("field index below {}", fields.len()),
                index,
            )
        })?;
        if field != element.ty() {
            return Err(ConstructionError::mismatch("insertvalue", field, element.ty()));
        }
        let ty = aggregate.ty().clone();
        self.emit_value(
            Instruction::InsertValue {
                aggregate: aggregate.clone(),
                element: element.clone(),
                index,
            },
            ty,
            name,
        )
    }

    pub fn extract_value(
        &mut self,
        aggregate: &Value,
        index: u32,
        name: &str,
    ) -> ConstructionResult<Value> {
        let fields = aggregate
            .ty()
            .struct_fields()
            .ok_or_else(|| ConstructionError::mismatch("extractvalue", "struct", aggregate.ty()))?;
        let field = fields
            .get(index as usize)
            .ok_or_else(|| {
                ConstructionError::mismatch(
                    "extractvalue",
                    format!("field index below {}", fields.len()),
                    index,
                )
            })?
            .clone();
        self.emit_value(
            Instruction::ExtractValue {
                aggregate: aggregate.clone(),
                index,
            },
            field,
            name,
        )
    }

    fn check_lane(operation: &'static str, vector: &Value, lane: &Value) -> ConstructionResult<Type> {
        let (elem, count) = vector
            .ty()
            .vector_parts()
            .ok_or_else(|| ConstructionError::mismatch(operation, "vector", vector.ty()))?;
        if !lane.ty().is_int() {
            return Err(ConstructionError::mismatch(operation, "integer lane index", lane.ty()));
        }
        if let Some(index) = lane.as_const_int() {
            if index >= u128::from(count) {
                return Err(ConstructionError::mismatch(
                    operation,
                    format!("lane index below {count}"),
                    index,
                ));
            }
        }
        Ok(elem.clone())
    }

    /// Copy of `vector` with lane `lane` replaced by `element`.
    pub fn insert_element(
        &mut self,
        vector: &Value,
        element: &Value,
        lane: &Value,
        name: &str,
    ) -> ConstructionResult<Value> {
        let elem = Self::check_lane("insertelement", vector, lane)?;
        if &elem != element.ty() {
            return Err(ConstructionError::mismatch("insertelement", elem, element.ty()));
        }
        let ty = vector.ty().clone();
        self.emit_value(
            Instruction::InsertElement {
                vector: vector.clone(),
                element: element.clone(),
                lane: lane.clone(),
            },
            ty,
            name,
        )
    }

    pub fn extract_element(
        &mut self,
        vector: &Value,
        lane: &Value,
        name: &str,
    ) -> ConstructionResult<Value> {
        let elem = Self::check_lane("extractelement", vector, lane)?;
        self.emit_value(
            Instruction::ExtractElement {
                vector: vector.clone(),
                lane: lane.clone(),
            },
            elem,
            name,
        )
    }

    pub fn ret(&mut self, value: &Value) -> ConstructionResult<InstId> {
        let ret = self.cursor_signature_ret()?;
        if ret.is_void() || &ret != value.ty() {
            return Err(ConstructionError::mismatch("ret", ret, value.ty()));
        }
        self.emit(
            Instruction::Ret {
                value: Some(value.clone()),
            },
            Type::void(),
            "",
        )
    }

    pub fn ret_void(&mut self) -> ConstructionResult<InstId> {
        let ret = self.cursor_signature_ret()?;
        if !ret.is_void() {
            return Err(ConstructionError::mismatch("ret", ret, "void"));
        }
        self.emit(Instruction::Ret { value: None }, Type::void(), "")
    }

    pub fn br(&mut self, dest: BlockId) -> ConstructionResult<InstId> {
        self.emit(Instruction::Br { dest }, Type::void(), "")
    }

    pub fn cond_br(
        &mut self,
        cond: &Value,
        then_dest: BlockId,
        else_dest: BlockId,
    ) -> ConstructionResult<InstId> {
        if cond.ty().int_width() != Some(1) {
            return Err(ConstructionError::mismatch("br", "i1", cond.ty()));
        }
        self.emit(
            Instruction::CondBr {
                cond: cond.clone(),
                then_dest,
                else_dest,
            },
            Type::void(),
            "",
        )
    }

    pub fn unreachable(&mut self) -> ConstructionResult<InstId> {
        self.emit(Instruction::Unreachable, Type::void(), "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TypeRegistry;

    fn vector_function(types: &mut TypeRegistry) -> (Module, FuncId, BlockId, Type) {
        let i32_ty = types.i32();
        let v4 = types.vector_type(&i32_ty, 4).unwrap();
        let fn_ty = types.function_type(&v4, &[], false).unwrap();
        let mut module = Module::new("vectors");
        let f = module.add_function(&fn_ty, "f").unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        (module, f, entry, v4)
    }

    #[test]
    fn test_no_insert_point() {
        let mut types = TypeRegistry::new();
        let (mut module, _, _, _) = vector_function(&mut types);
        let mut b = Builder::new(&mut module);
        assert_eq!(
            b.add(&Value::const_i32(1), &Value::const_i32(2), "x"),
            Err(ConstructionError::NoInsertPoint)
        );
        assert_eq!(b.unreachable(), Err(ConstructionError::NoInsertPoint));
    }

    #[test]
    fn test_insert_element_lane_bounds() {
        let mut types = TypeRegistry::new();
        let (mut module, f, entry, v4) = vector_function(&mut types);
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let undef = Value::undef(&v4).unwrap();
        let twelve = Value::const_i32(12);
        for lane in 0..4 {
            assert!(b.insert_element(&undef, &twelve, &Value::const_i32(lane), "v").is_ok());
        }
        assert!(matches!(
            b.insert_element(&undef, &twelve, &Value::const_i32(4), "v"),
            Err(ConstructionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            b.insert_element(&undef, &Value::const_i64(12), &Value::const_i32(0), "v"),
            Err(ConstructionError::TypeMismatch { .. })
        ));
        // failed calls insert nothing
        assert_eq!(module.function(f).unwrap().blocks()[0].instructions().len(), 4);
    }

    #[test]
    fn test_insert_value_index_bounds() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let ptr = types.pointer_type(&i32_ty).unwrap();
        let record = types.struct_type(&[ptr.clone(), i32_ty.clone(), i32_ty.clone()], false).unwrap();
        let fn_ty = types.function_type(&record, &[ptr], false).unwrap();
        let mut module = Module::new("records");
        let f = module.add_function(&fn_ty, "f").unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        let p = module.param(f, 0).unwrap();

        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let undef = Value::undef(&record).unwrap();
        let s0 = b.insert_value(&undef, &p, 0, "s0").unwrap();
        assert_eq!(s0.ty(), &record);
        assert!(matches!(
            b.insert_value(&s0, &Value::const_i32(1), 3, "bad"),
            Err(ConstructionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            b.insert_value(&s0, &Value::const_i32(1), 0, "bad"),
            Err(ConstructionError::TypeMismatch { .. })
        ));
        let len = b.extract_value(&s0, 1, "len").unwrap();
        assert_eq!(len.ty(), &i32_ty);
    }

    #[test]
    fn test_position_before_keeps_creation_order() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[], false).unwrap();
        let mut module = Module::new("order");
        let f = module.add_function(&fn_ty, "f").unwrap();
        let entry = module.append_block(f, "entry").unwrap();

        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let ret = b.ret(&Value::const_i32(0)).unwrap();
        b.position_before(ret).unwrap();
        let first = b.add(&Value::const_i32(1), &Value::const_i32(2), "first").unwrap();
        let second = b.add(&first, &Value::const_i32(3), "second").unwrap();

        let insts = module.function(f).unwrap().blocks()[0].instructions().to_vec();
        assert_eq!(insts, vec![first.as_inst().unwrap(), second.as_inst().unwrap(), ret]);
    }

    #[test]
    fn test_operand_checks() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let i64_ty = types.i64();
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone()], false).unwrap();
        let mut module = Module::new("checks");
        let f = module.add_function(&fn_ty, "f").unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        let x = module.param(f, 0).unwrap();

        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let slot = b.alloca(&i64_ty, "slot").unwrap();
        assert!(b.store(&x, &slot).is_err());
        assert!(b.load(&x, "bad").is_err());
        assert!(b.call(f, &[], "r").is_err());
        assert!(b.call(f, &[Value::const_i64(1)], "r").is_err());
        assert!(b.call(f, &[x.clone()], "r").is_ok());
        assert!(b.ret(&Value::const_i64(0)).is_err());
        assert!(b.ret_void().is_err());
        assert!(b.cond_br(&x, entry, entry).is_err());
        assert!(b.ret(&x).is_ok());
    }
}
