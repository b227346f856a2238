// This module lowers one IR function to x86-64 machine code through a shared X64Encoder.
// FunctionCodegen gives every SSA value (parameters and instruction results) an rbp-relative
// stack slot and evaluates each instruction by loading its operands into scratch registers
// (RAX, RCX; R11 for pointer bases), computing, and storing the result back to the slot.
// Aggregates (structs and vectors) live in memory and are moved with chunked copies; lane-wise
// vector arithmetic runs element by element through memory. Arguments and return values follow
// the System V assignment from calling_convention: register parameters are spilled to their
// slots in the prologue, stack parameters are read in place above the return address, and
// aggregate results larger than 16 bytes are written through the hidden sret pointer. Calls
// reserve an aligned outgoing argument area, copy stack arguments, load register arguments
// and bind either to a function label (definitions in this module) or to a relocated symbol
// (declarations). The frame layout is computed in a pre-pass so the prologue knows its size.

//! Per-function code generation.

use super::calling_convention::{ArgAttribute, CallLayout, CCAssignment, FunctionFrame, RegBank};
use super::encoder::{AluOp, AsmReg, Condition, Extend, X64Encoder};
use crate::backend::GenericValue;
use crate::core::analyzer::Analyzer;
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::layout;
use crate::core::module::{
    BinaryOp, CallConv, Constant, FuncId, Function, GlobalId, InstId, Instruction, IntPredicate, Module,
    Value, ValueKind,
};
use crate::core::types::{Type, TypeKind};
use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::HashMap;

/// Symbol index of a function in the module symbol table.
pub fn function_symbol(func: FuncId) -> usize {
    func.index()
}

/// Symbol index of a global; globals follow the functions.
pub fn global_symbol(module: &Module, global: GlobalId) -> usize {
    module.functions().len() + global.index()
}

fn unsupported(reason: impl Into<String>) -> LoweringError {
    LoweringError::Unsupported {
        target: "x86_64".to_string(),
        reason: reason.into(),
    }
}

fn condition_for(pred: IntPredicate) -> Condition {
    match pred {
        IntPredicate::Eq => Condition::Equal,
        IntPredicate::Ne => Condition::NotEqual,
        IntPredicate::Ugt => Condition::Above,
        IntPredicate::Uge => Condition::AboveEqual,
        IntPredicate::Ult => Condition::Below,
        IntPredicate::Ule => Condition::BelowEqual,
        IntPredicate::Sgt => Condition::Greater,
        IntPredicate::Sge => Condition::GreaterEqual,
        IntPredicate::Slt => Condition::Less,
        IntPredicate::Sle => Condition::LessEqual,
    }
}

fn alu_op(op: BinaryOp) -> AluOp {
    match op {
        BinaryOp::Add => AluOp::Add,
        BinaryOp::Sub => AluOp::Sub,
        BinaryOp::Mul => AluOp::Imul,
        BinaryOp::And => AluOp::And,
        BinaryOp::Or => AluOp::Or,
        BinaryOp::Xor => AluOp::Xor,
    }
}

/// Byte size of a scalar (integer or pointer) as it is held in a register.
fn scalar_size(ty: &Type) -> u32 {
    layout::size_of(ty) as u32
}

fn is_aggregate(ty: &Type) -> bool {
    ty.is_struct() || ty.is_vector()
}

/// Reject integer widths without a native register form.
pub fn check_type(ty: &Type) -> LoweringResult<()> {
    match ty.kind() {
        TypeKind::Int(width) if !matches!(width, 1 | 8 | 16 | 32 | 64) => {
            Err(unsupported(format!("integer width {width}")))
        }
        TypeKind::Int(_) | TypeKind::Void => Ok(()),
        TypeKind::Pointer(_) => Ok(()),
        TypeKind::Vector { elem, .. } => check_type(elem),
        TypeKind::Struct { fields, .. } => fields.iter().try_for_each(check_type),
        TypeKind::Function(sig) => {
            check_type(&sig.ret)?;
            sig.params.iter().try_for_each(check_type)
        }
    }
}

/// Generates the body of one function into a module-wide encoder.
pub struct FunctionCodegen<'a, 'e> {
    /// Machine code encoder shared by all functions of the module.
    encoder: &'e mut X64Encoder,
    module: &'a Module,
    function: &'a Function,
    func_index: u32,
    arena: &'a Bump,
    /// Stack frame management.
    frame: FunctionFrame<'a>,
    /// Argument and return placement of this function.
    layout: CallLayout<'a>,
    /// rbp offset of each parameter.
    param_slots: BumpVec<'a, i32>,
    /// rbp offset of each instruction result.
    value_slots: BumpVec<'a, Option<i32>>,
    /// Storage behind each alloca, keyed by instruction index.
    alloca_areas: HashMap<usize, i32>,
    /// Scratch for constant aggregate operands, keyed by (instruction, operand).
    temp_slots: HashMap<(usize, usize), i32>,
    /// Where the incoming sret pointer is saved.
    sret_slot: Option<i32>,
}

impl<'a, 'e> FunctionCodegen<'a, 'e> {
    /// Lay out the frame of `function`.
    pub fn new(
        encoder: &'e mut X64Encoder,
        module: &'a Module,
        function: &'a Function,
        arena: &'a Bump,
    ) -> LoweringResult<Self> {
        let signature = function.signature();
        check_type(function.ty())?;
        let layout =
            CallLayout::compute(arena, function.call_conv(), &signature.ret, &signature.params)?;

        let mut codegen = Self {
            encoder,
            module,
            function,
            func_index: function.id().index() as u32,
            arena,
            frame: FunctionFrame::new(arena),
            layout,
            param_slots: BumpVec::with_capacity_in(signature.params.len(), arena),
            value_slots: BumpVec::with_capacity_in(function.inst_count(), arena),
            alloca_areas: HashMap::new(),
            temp_slots: HashMap::new(),
            sret_slot: None,
        };
        codegen.compute_frame()?;
        Ok(codegen)
    }

    fn allocate_value_slot(&mut self, ty: &Type) -> i32 {
        let mut size = layout::size_of(ty) as u32;
        let mut align = layout::align_of(ty) as u32;
        if ty.is_vector() {
            // Whole XMM moves touch 16 bytes.
            size = size.max(16);
            align = 16;
        }
        self.frame.allocate_slot(size, align)
    }

    fn compute_frame(&mut self) -> LoweringResult<()> {
        if self.layout.sret.is_some() {
            self.sret_slot = Some(self.frame.allocate_slot(8, 8));
        }

        let function = self.function;
        for (index, ty) in function.signature().params.iter().enumerate() {
            let assignment = self.layout.args[index];
            let slot = match (assignment.reg, assignment.stack_off) {
                (Some(_), _) => self.allocate_value_slot(ty),
                // 16 = return address + saved rbp
                (None, Some(stack_off)) => 16 + stack_off,
                (None, None) => {
                    return Err(LoweringError::Backend {
                        message: format!("parameter {index} of {} has no location", function.name()),
                    })
                }
            };
            self.param_slots.push(slot);
        }

        for _ in 0..function.inst_count() {
            self.value_slots.push(None);
        }
        for block in function.blocks() {
            for &id in block.instructions() {
                let Some(data) = function.inst(id) else {
                    continue;
                };
                let index = id.index();
                check_type(data.ty())?;
                if let Instruction::Alloca { allocated } = data.instruction() {
                    check_type(allocated)?;
                    let size = layout::size_of(allocated) as u32;
                    let align = layout::align_of(allocated) as u32;
                    let area = self.frame.allocate_slot(size, align);
                    self.alloca_areas.insert(index, area);
                }
                if !data.ty().is_void() {
                    let slot = self.allocate_value_slot(data.ty());
                    self.value_slots[index] = Some(slot);
                }
                for (operand, value) in data.instruction().operands().into_iter().enumerate() {
                    if matches!(value.kind(), ValueKind::Const(_)) && is_aggregate(value.ty()) {
                        let temp = self.allocate_value_slot(value.ty());
                        self.temp_slots.insert((index, operand), temp);
                    }
                }
            }
        }

        self.frame.calculate_frame_size();
        log::trace!(
            "frame of {}: {} bytes, {} slots",
            self.function.name(),
            self.frame.frame_size,
            self.frame.slots.len()
        );
        Ok(())
    }

    /// Emit the function: label, prologue, parameter spills and every block.
    pub fn compile(mut self) -> LoweringResult<()> {
        self.encoder.place_label_for_function(self.func_index)?;
        self.encoder.emit_prologue(self.frame.frame_size)?;
        self.spill_parameters()?;

        let function = self.function;
        let analyzer = Analyzer::new(function);
        for (block_index, block) in function.blocks().iter().enumerate() {
            // Unreachable blocks are never branched to from emitted code.
            if !analyzer.is_reachable(block_index) {
                continue;
            }
            self.encoder
                .place_label_for_block(self.func_index, block_index as u32)?;
            for &id in block.instructions() {
                self.compile_inst(id)?;
            }
        }
        Ok(())
    }

    fn spill_parameters(&mut self) -> LoweringResult<()> {
        if let (Some(sret), Some(slot)) = (self.layout.sret, self.sret_slot) {
            if let Some(reg) = sret.reg {
                self.encoder.store(8, AsmReg::RBP, slot, reg)?;
            }
        }
        let function = self.function;
        for (index, ty) in function.signature().params.iter().enumerate() {
            let assignment = self.layout.args[index];
            let slot = self.param_slots[index];
            let Some(reg) = assignment.reg else {
                continue;
            };
            match assignment.bank {
                RegBank::Xmm => self.encoder.movdqu_store(AsmReg::RBP, slot, reg)?,
                RegBank::GeneralPurpose if is_aggregate(ty) => {
                    self.encoder.store(8, AsmReg::RBP, slot, reg)?;
                    if let Some(hi) = assignment.reg_hi {
                        self.encoder.store(8, AsmReg::RBP, slot + 8, hi)?;
                    }
                }
                RegBank::GeneralPurpose => {
                    self.encoder.store(scalar_size(ty), AsmReg::RBP, slot, reg)?
                }
            }
        }
        Ok(())
    }

    fn result_slot(&self, id: InstId) -> LoweringResult<i32> {
        self.value_slots
            .get(id.index())
            .copied()
            .flatten()
            .ok_or_else(|| LoweringError::Backend {
                message: format!("instruction {} has no result slot", id.index()),
            })
    }

    // ==== OPERANDS ====

    /// Load a scalar operand into `dst`. Narrow integers are extended to 32 bits.
    fn load_scalar(&mut self, dst: AsmReg, value: &Value, extend: Extend) -> LoweringResult<()> {
        let ty = value.ty();
        match value.kind() {
            ValueKind::Const(constant) => {
                let generic = GenericValue::from_constant(ty, constant);
                let imm = match extend {
                    Extend::Sign => generic.as_i128().unwrap_or(0) as i64,
                    Extend::Zero => match generic {
                        GenericValue::Int { bits, .. } => bits as i64,
                        _ => 0,
                    },
                };
                let size = if scalar_size(ty) == 8 { 8 } else { 4 };
                self.encoder.mov_reg_imm(dst, size, imm)?;
            }
            ValueKind::Param { index, .. } => {
                let slot = self.param_slots[*index as usize];
                self.load_slot(dst, ty, slot, extend)?;
            }
            ValueKind::Inst(id) => {
                let slot = self.result_slot(*id)?;
                self.load_slot(dst, ty, slot, extend)?;
            }
            ValueKind::Global(global) => {
                let symbol = global_symbol(self.module, *global);
                self.encoder.lea_symbol(dst, self.func_index, symbol)?;
            }
            ValueKind::Function(func) => self.load_function_address(dst, *func)?,
        }
        Ok(())
    }

    fn load_function_address(&mut self, dst: AsmReg, func: FuncId) -> LoweringResult<()> {
        let declaration = self
            .module
            .function(func)
            .map_or(true, |callee| callee.is_declaration());
        if declaration {
            self.encoder
                .lea_symbol(dst, self.func_index, function_symbol(func))?;
        } else {
            self.encoder.lea_function(dst, func.index() as u32)?;
        }
        Ok(())
    }

    fn load_slot(&mut self, dst: AsmReg, ty: &Type, slot: i32, extend: Extend) -> LoweringResult<()> {
        let size = scalar_size(ty);
        self.encoder.load(dst, size, AsmReg::RBP, slot, extend)?;
        if extend == Extend::Sign && ty.int_width() == Some(1) {
            // i1 true is -1 when read as signed.
            self.encoder.neg32(dst)?;
        }
        Ok(())
    }

    /// rbp offset of an aggregate operand, materializing constants into their scratch slot.
    fn aggregate_slot(&mut self, value: &Value, inst: usize, operand: usize) -> LoweringResult<i32> {
        match value.kind() {
            ValueKind::Param { index, .. } => Ok(self.param_slots[*index as usize]),
            ValueKind::Inst(id) => self.result_slot(*id),
            ValueKind::Const(constant) => {
                let slot = self.temp_slots.get(&(inst, operand)).copied().ok_or_else(|| {
                    LoweringError::Backend {
                        message: format!("no scratch slot for operand {operand} of instruction {inst}"),
                    }
                })?;
                self.materialize(value.ty(), constant, slot)?;
                Ok(slot)
            }
            ValueKind::Global(_) | ValueKind::Function(_) => Err(LoweringError::Backend {
                message: "symbol address used as aggregate".to_string(),
            }),
        }
    }

    fn materialize(&mut self, ty: &Type, constant: &Constant, slot: i32) -> LoweringResult<()> {
        let bytes = GenericValue::from_constant(ty, constant).to_bytes(ty);
        let mut offset = 0usize;
        while offset < bytes.len() {
            let chunk = chunk_size(bytes.len() - offset);
            let mut buf = [0u8; 8];
            buf[..chunk].copy_from_slice(&bytes[offset..offset + chunk]);
            let imm = i64::from_le_bytes(buf);
            self.encoder
                .mov_reg_imm(AsmReg::RAX, if chunk == 8 { 8 } else { 4 }, imm)?;
            self.encoder
                .store(chunk as u32, AsmReg::RBP, slot + offset as i32, AsmReg::RAX)?;
            offset += chunk;
        }
        Ok(())
    }

    /// Copy `size` bytes between two base-relative locations through RAX.
    fn copy_memory(
        &mut self,
        dst_base: AsmReg,
        dst_off: i32,
        src_base: AsmReg,
        src_off: i32,
        size: u32,
    ) -> LoweringResult<()> {
        let mut offset = 0u32;
        while offset < size {
            let chunk = chunk_size((size - offset) as usize) as u32;
            let delta = offset as i32;
            self.encoder
                .load(AsmReg::RAX, chunk, src_base, src_off + delta, Extend::Zero)?;
            self.encoder
                .store(chunk, dst_base, dst_off + delta, AsmReg::RAX)?;
            offset += chunk;
        }
        Ok(())
    }

    /// Write a scalar or aggregate operand to `[base + offset]`.
    fn store_operand(
        &mut self,
        value: &Value,
        inst: usize,
        operand: usize,
        base: AsmReg,
        offset: i32,
    ) -> LoweringResult<()> {
        let ty = value.ty();
        if is_aggregate(ty) {
            let src = self.aggregate_slot(value, inst, operand)?;
            self.copy_memory(base, offset, AsmReg::RBP, src, layout::size_of(ty) as u32)
        } else {
            self.load_scalar(AsmReg::RAX, value, Extend::Zero)?;
            self.encoder.store(scalar_size(ty), base, offset, AsmReg::RAX)?;
            Ok(())
        }
    }

    fn const_lane(&self, lane: &Value, count: u32) -> LoweringResult<u32> {
        let index = lane
            .as_const_int()
            .ok_or_else(|| unsupported("vector lane index must be a constant"))?;
        if index >= u128::from(count) {
            return Err(unsupported(format!("vector lane {index} out of range")));
        }
        Ok(index as u32)
    }

    // ==== INSTRUCTIONS ====

    fn compile_inst(&mut self, id: InstId) -> LoweringResult<()> {
        let function = self.function;
        let Some(data) = function.inst(id) else {
            return Ok(());
        };
        let index = id.index();
        let ty = data.ty();

        match data.instruction() {
            Instruction::Alloca { .. } => {
                let area = self.alloca_areas.get(&index).copied().unwrap_or_default();
                let slot = self.result_slot(id)?;
                self.encoder.lea(AsmReg::RAX, AsmReg::RBP, area)?;
                self.encoder.store(8, AsmReg::RBP, slot, AsmReg::RAX)?;
            }
            Instruction::Load { ptr } => {
                let slot = self.result_slot(id)?;
                self.load_scalar(AsmReg::R11, ptr, Extend::Zero)?;
                if is_aggregate(ty) {
                    self.copy_memory(AsmReg::RBP, slot, AsmReg::R11, 0, layout::size_of(ty) as u32)?;
                } else {
                    let size = scalar_size(ty);
                    self.encoder.load(AsmReg::RAX, size, AsmReg::R11, 0, Extend::Zero)?;
                    self.encoder.store(size, AsmReg::RBP, slot, AsmReg::RAX)?;
                }
            }
            Instruction::Store { value, ptr } => {
                if is_aggregate(value.ty()) {
                    // Materialize before R11 is loaded; the copy clobbers only RAX.
                    let src = self.aggregate_slot(value, index, 0)?;
                    self.load_scalar(AsmReg::R11, ptr, Extend::Zero)?;
                    let size = layout::size_of(value.ty()) as u32;
                    self.copy_memory(AsmReg::R11, 0, AsmReg::RBP, src, size)?;
                } else {
                    self.load_scalar(AsmReg::R11, ptr, Extend::Zero)?;
                    self.load_scalar(AsmReg::RAX, value, Extend::Zero)?;
                    self.encoder
                        .store(scalar_size(value.ty()), AsmReg::R11, 0, AsmReg::RAX)?;
                }
            }
            Instruction::Binary { op, lhs, rhs } => self.compile_binary(id, *op, lhs, rhs)?,
            Instruction::ICmp { pred, lhs, rhs } => {
                let slot = self.result_slot(id)?;
                let extend = if pred.is_signed() { Extend::Sign } else { Extend::Zero };
                self.load_scalar(AsmReg::RAX, lhs, extend)?;
                self.load_scalar(AsmReg::RCX, rhs, extend)?;
                let wide = scalar_size(lhs.ty()) == 8;
                self.encoder.cmp_reg_reg(wide, AsmReg::RAX, AsmReg::RCX)?;
                self.encoder.setcc(condition_for(*pred), AsmReg::RAX)?;
                self.encoder.store(1, AsmReg::RBP, slot, AsmReg::RAX)?;
            }
            Instruction::Call {
                callee,
                args,
                call_conv,
            } => self.compile_call(id, *callee, args, *call_conv)?,
            Instruction::InsertValue {
                aggregate,
                element,
                index: field,
            } => {
                let slot = self.result_slot(id)?;
                let src = self.aggregate_slot(aggregate, index, 0)?;
                self.copy_memory(AsmReg::RBP, slot, AsmReg::RBP, src, layout::size_of(ty) as u32)?;
                let offset = self.field_offset(ty, *field)?;
                self.store_operand(element, index, 1, AsmReg::RBP, slot + offset)?;
            }
            Instruction::ExtractValue {
                aggregate,
                index: field,
            } => {
                let slot = self.result_slot(id)?;
                let src = self.aggregate_slot(aggregate, index, 0)?;
                let offset = self.field_offset(aggregate.ty(), *field)?;
                self.copy_memory(AsmReg::RBP, slot, AsmReg::RBP, src + offset, layout::size_of(ty) as u32)?;
            }
            Instruction::InsertElement {
                vector,
                element,
                lane,
            } => {
                let Some((_, count)) = ty.vector_parts() else {
                    return Err(unsupported(format!("insertelement into {ty}")));
                };
                let lane = self.const_lane(lane, count)?;
                let slot = self.result_slot(id)?;
                let src = self.aggregate_slot(vector, index, 0)?;
                self.copy_memory(AsmReg::RBP, slot, AsmReg::RBP, src, layout::size_of(ty) as u32)?;
                let offset = self.field_offset(ty, lane)?;
                self.store_operand(element, index, 1, AsmReg::RBP, slot + offset)?;
            }
            Instruction::ExtractElement { vector, lane } => {
                let Some((_, count)) = vector.ty().vector_parts() else {
                    return Err(unsupported(format!("extractelement from {}", vector.ty())));
                };
                let lane = self.const_lane(lane, count)?;
                let slot = self.result_slot(id)?;
                let src = self.aggregate_slot(vector, index, 0)?;
                let offset = self.field_offset(vector.ty(), lane)?;
                self.copy_memory(AsmReg::RBP, slot, AsmReg::RBP, src + offset, layout::size_of(ty) as u32)?;
            }
            Instruction::Ret { value } => self.compile_ret(index, value.as_ref())?,
            Instruction::Br { dest } => {
                self.encoder
                    .jmp_unconditional_to_block(self.func_index, dest.index() as u32)?;
            }
            Instruction::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                self.load_scalar(AsmReg::RAX, cond, Extend::Zero)?;
                self.encoder.test8_reg_reg(AsmReg::RAX)?;
                self.encoder.jmp_conditional_to_block(
                    Condition::NotEqual,
                    self.func_index,
                    then_dest.index() as u32,
                )?;
                self.encoder
                    .jmp_unconditional_to_block(self.func_index, else_dest.index() as u32)?;
            }
            Instruction::Unreachable => self.encoder.ud2()?,
        }
        Ok(())
    }

    fn field_offset(&self, ty: &Type, index: u32) -> LoweringResult<i32> {
        layout::element_offset(ty, index)
            .map(|offset| offset as i32)
            .ok_or_else(|| LoweringError::Backend {
                message: format!("element {index} out of range for {ty}"),
            })
    }

    fn compile_binary(&mut self, id: InstId, op: BinaryOp, lhs: &Value, rhs: &Value) -> LoweringResult<()> {
        let index = id.index();
        let slot = self.result_slot(id)?;
        let ty = lhs.ty().clone();

        if let Some((elem, count)) = ty.vector_parts() {
            let elem = elem.clone();
            let esize = scalar_size(&elem);
            let left = self.aggregate_slot(lhs, index, 0)?;
            let right = self.aggregate_slot(rhs, index, 1)?;
            for lane in 0..count {
                let delta = (lane * esize) as i32;
                self.encoder
                    .load(AsmReg::RAX, esize, AsmReg::RBP, left + delta, Extend::Zero)?;
                self.encoder
                    .load(AsmReg::RCX, esize, AsmReg::RBP, right + delta, Extend::Zero)?;
                self.emit_alu(op, &elem)?;
                self.encoder.store(esize, AsmReg::RBP, slot + delta, AsmReg::RAX)?;
            }
            return Ok(());
        }

        self.load_scalar(AsmReg::RAX, lhs, Extend::Zero)?;
        self.load_scalar(AsmReg::RCX, rhs, Extend::Zero)?;
        self.emit_alu(op, &ty)?;
        self.encoder.store(scalar_size(&ty), AsmReg::RBP, slot, AsmReg::RAX)?;
        Ok(())
    }

    fn emit_alu(&mut self, op: BinaryOp, ty: &Type) -> LoweringResult<()> {
        let wide = scalar_size(ty) == 8;
        self.encoder.alu(alu_op(op), wide, AsmReg::RAX, AsmReg::RCX)?;
        if ty.int_width() == Some(1) {
            self.encoder.and32_reg_imm(AsmReg::RAX, 1)?;
        }
        Ok(())
    }

    fn compile_call(
        &mut self,
        id: InstId,
        callee: FuncId,
        args: &[Value],
        call_conv: Option<CallConv>,
    ) -> LoweringResult<()> {
        let index = id.index();
        let module = self.module;
        let target = module.function(callee).ok_or_else(|| LoweringError::Backend {
            message: format!("call to unknown function #{}", callee.index()),
        })?;
        let signature = target.signature();
        let conv = call_conv.unwrap_or(target.call_conv());
        let arg_types: Vec<Type> = args.iter().map(|arg| arg.ty().clone()).collect();
        let call = CallLayout::compute(self.arena, conv, &signature.ret, &arg_types)?;
        let result = self.value_slots.get(index).copied().flatten();

        // Constant aggregates are rbp-relative scratch and can be filled first.
        let mut sources: Vec<Option<i32>> = Vec::with_capacity(args.len());
        for (operand, arg) in args.iter().enumerate() {
            if is_aggregate(arg.ty()) {
                sources.push(Some(self.aggregate_slot(arg, index, operand)?));
            } else {
                sources.push(None);
            }
        }

        if call.stack_size > 0 {
            self.encoder.sub64_reg_imm(AsmReg::RSP, call.stack_size as i32)?;
        }

        for ((arg, assignment), source) in args.iter().zip(call.args.iter()).zip(&sources) {
            let Some(stack_off) = assignment.stack_off else {
                continue;
            };
            match source {
                Some(src) => {
                    let size = layout::size_of(arg.ty()) as u32;
                    self.copy_memory(AsmReg::RSP, stack_off, AsmReg::RBP, *src, size)?;
                }
                None => {
                    self.load_scalar(AsmReg::RAX, arg, Extend::Zero)?;
                    self.encoder
                        .store(scalar_size(arg.ty()), AsmReg::RSP, stack_off, AsmReg::RAX)?;
                }
            }
        }

        if let Some(sret) = call.sret {
            let (Some(reg), Some(slot)) = (sret.reg, result) else {
                return Err(LoweringError::Backend {
                    message: format!("call to {} has no result storage", target.name()),
                });
            };
            self.encoder.lea(reg, AsmReg::RBP, slot)?;
        }

        for ((arg, assignment), source) in args.iter().zip(call.args.iter()).zip(&sources) {
            self.load_argument(arg, assignment, *source)?;
        }

        if signature.variadic {
            self.encoder
                .mov_reg_imm(AsmReg::RAX, 4, i64::from(call.xmm_used))?;
        }

        if target.is_declaration() {
            self.encoder.call_symbol(function_symbol(callee))?;
        } else {
            self.encoder.call_function(callee.index() as u32)?;
        }

        if call.stack_size > 0 {
            self.encoder.add64_reg_imm(AsmReg::RSP, call.stack_size as i32)?;
        }

        if let (Some(ret), Some(slot)) = (call.ret, result) {
            self.store_return_value(&signature.ret, &ret, slot)?;
        }
        Ok(())
    }

    fn load_argument(
        &mut self,
        arg: &Value,
        assignment: &CCAssignment,
        source: Option<i32>,
    ) -> LoweringResult<()> {
        let Some(reg) = assignment.reg else {
            return Ok(());
        };
        match (assignment.bank, source) {
            (RegBank::Xmm, Some(src)) => self.encoder.movdqu_load(reg, AsmReg::RBP, src)?,
            (RegBank::GeneralPurpose, Some(src)) => {
                self.encoder.load(reg, 8, AsmReg::RBP, src, Extend::Zero)?;
                if let Some(hi) = assignment.reg_hi {
                    self.encoder.load(hi, 8, AsmReg::RBP, src + 8, Extend::Zero)?;
                }
            }
            (_, None) => self.load_scalar(reg, arg, Extend::Zero)?,
        }
        Ok(())
    }

    /// Store a value returned in registers into `slot`.
    fn store_return_value(&mut self, ty: &Type, ret: &CCAssignment, slot: i32) -> LoweringResult<()> {
        let Some(reg) = ret.reg else {
            // Written by the callee through the sret pointer.
            return Ok(());
        };
        match ret.bank {
            RegBank::Xmm => self.encoder.movdqu_store(AsmReg::RBP, slot, reg)?,
            RegBank::GeneralPurpose if is_aggregate(ty) => {
                self.encoder.store(8, AsmReg::RBP, slot, reg)?;
                if let Some(hi) = ret.reg_hi {
                    self.encoder.store(8, AsmReg::RBP, slot + 8, hi)?;
                }
            }
            RegBank::GeneralPurpose => self.encoder.store(scalar_size(ty), AsmReg::RBP, slot, reg)?,
        }
        Ok(())
    }

    fn compile_ret(&mut self, index: usize, value: Option<&Value>) -> LoweringResult<()> {
        if let (Some(value), Some(ret)) = (value, self.layout.ret) {
            let ty = value.ty();
            match (ret.attribute, self.sret_slot) {
                (ArgAttribute::ByVal { size, .. }, Some(sret_slot)) => {
                    let src = self.aggregate_slot(value, index, 0)?;
                    self.encoder
                        .load(AsmReg::R11, 8, AsmReg::RBP, sret_slot, Extend::Zero)?;
                    self.copy_memory(AsmReg::R11, 0, AsmReg::RBP, src, size)?;
                    self.encoder.mov_reg_reg(AsmReg::RAX, AsmReg::R11)?;
                }
                _ => {
                    let reg = ret.reg.unwrap_or(AsmReg::RAX);
                    if is_aggregate(ty) {
                        let src = self.aggregate_slot(value, index, 0)?;
                        if ret.bank == RegBank::Xmm {
                            self.encoder.movdqu_load(reg, AsmReg::RBP, src)?;
                        } else {
                            self.encoder.load(reg, 8, AsmReg::RBP, src, Extend::Zero)?;
                            if let Some(hi) = ret.reg_hi {
                                self.encoder.load(hi, 8, AsmReg::RBP, src + 8, Extend::Zero)?;
                            }
                        }
                    } else {
                        self.load_scalar(reg, value, Extend::Zero)?;
                    }
                }
            }
        }
        self.encoder.emit_epilogue(self.frame.frame_size)?;
        Ok(())
    }

    /// Total frame size below the saved rbp.
    pub fn frame_size(&self) -> u32 {
        self.frame.frame_size
    }
}

/// Largest power-of-two access not exceeding `remaining`, capped at 8.
fn chunk_size(remaining: usize) -> usize {
    match remaining {
        8.. => 8,
        4..=7 => 4,
        2..=3 => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::Builder;
    use crate::core::module::Module;
    use crate::core::types::TypeRegistry;

    fn add_module() -> Module {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone(), i32_ty.clone()], false).unwrap();
        let mut module = Module::new("add");
        let func = module.add_function(&fn_ty, "add").unwrap();
        let entry = module.append_block(func, "entry").unwrap();
        let a = module.param(func, 0).unwrap();
        let b = module.param(func, 1).unwrap();
        let mut builder = Builder::new(&mut module);
        builder.position_at_end(entry);
        let sum = builder.add(&a, &b, "sum").unwrap();
        builder.ret(&sum).unwrap();
        module
    }

    #[test]
    fn test_frame_layout() {
        let module = add_module();
        let arena = Bump::new();
        let mut encoder = X64Encoder::new().unwrap();
        let function = &module.functions()[0];
        let codegen = FunctionCodegen::new(&mut encoder, &module, function, &arena).unwrap();
        // Two spilled parameters and one result, each in an 8-byte slot.
        assert_eq!(codegen.frame_size(), 32);
        assert_eq!(&codegen.param_slots[..], &[-8, -16]);
        assert_eq!(codegen.value_slots[0], Some(-24));
    }

    #[test]
    fn test_compile_emits_prologue() {
        let module = add_module();
        let arena = Bump::new();
        let mut encoder = X64Encoder::new().unwrap();
        let function = &module.functions()[0];
        FunctionCodegen::new(&mut encoder, &module, function, &arena)
            .unwrap()
            .compile()
            .unwrap();
        let assembled = encoder.finalize().unwrap();
        // push rbp; mov rbp, rsp
        assert_eq!(&assembled.code[..4], &[0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(assembled.code.last(), Some(&0xc3));
        assert_eq!(assembled.functions.get(&0), Some(&0));
        assert!(assembled.relocs.is_empty());
    }

    #[test]
    fn test_odd_integer_width_is_unsupported() {
        let mut types = TypeRegistry::new();
        let i7 = types.integer_type(7).unwrap();
        assert!(matches!(check_type(&i7), Err(LoweringError::Unsupported { .. })));
        let i64_ty = types.i64();
        assert!(check_type(&i64_ty).is_ok());
    }

    #[test]
    fn test_chunking() {
        assert_eq!(chunk_size(20), 8);
        assert_eq!(chunk_size(4), 4);
        assert_eq!(chunk_size(3), 2);
        assert_eq!(chunk_size(1), 1);
    }
}
