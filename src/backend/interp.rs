// This module provides the native execution engine: a direct interpreter over verified IR.
// It stands in for a JIT on hosts where no native code generator is linked and doubles as the
// reference backend in tests. Memory is a list of byte regions; a pointer packs the region
// number into the high 32 bits and the byte offset into the low 32 bits. Null (region 0) and
// accesses past the end of a region are detected on access. Released region numbers are
// handed out again by the next allocation, so a stale pointer may alias new storage. Globals are
// allocated once when the engine is created and keep their contents across invocations;
// allocas live in regions released when their function returns. Values are GenericValues laid
// out in memory per core::layout, the same layout the x86-64 lowering uses. Calling
// conventions are honored semantically: every convention passes the same values, and only the
// native lowering gives them a concrete register assignment.

//! Interpreter-backed [`ExecutionBackend`].

use super::{check_arguments, ExecutionBackend, ExecutionEngine, GenericValue, JitOptions, VerifiedModule};
use crate::core::error::{ExecutionError, ExecutionResult};
use crate::core::layout;
use crate::core::module::{
    BinaryOp, BlockId, Function, Instruction, IntPredicate, Module, Value, ValueKind,
};
use crate::core::types::Type;
use std::cmp::Ordering;

/// Tag bit marking a function address; such pointers cannot be dereferenced.
const FUNCTION_TAG: u64 = 1 << 63;
const OFFSET_BITS: u32 = 32;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Creates [`Interpreter`] engines.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterBackend;

impl ExecutionBackend for InterpreterBackend {
    type Engine = Interpreter;

    fn create_jit(
        &self,
        module: &VerifiedModule,
        options: &JitOptions,
    ) -> ExecutionResult<Interpreter> {
        if options.max_call_depth == 0 {
            return Err(ExecutionError::JitInit {
                reason: "call depth limit must be at least 1".to_string(),
            });
        }
        let mut memory = Memory::default();
        let mut globals = Vec::with_capacity(module.module().globals().len());
        for global in module.module().globals() {
            let ty = global.value_type();
            let addr = memory.allocate(layout::size_of(ty)).map_err(|reason| {
                ExecutionError::JitInit {
                    reason: format!("@{}: {reason}", global.name()),
                }
            })?;
            if let Some(init) = global.initializer() {
                let bytes = GenericValue::from_constant(ty, init).to_bytes(ty);
                memory.write(addr, &bytes).map_err(|reason| ExecutionError::JitInit {
                    reason: format!("@{}: {reason}", global.name()),
                })?;
            }
            globals.push(addr);
        }
        log::debug!(
            "interpreter for module {}: {} globals, {} functions",
            module.module().name(),
            globals.len(),
            module.module().functions().len()
        );
        Ok(Interpreter {
            module: module.clone(),
            max_call_depth: options.max_call_depth,
            state: State { memory, globals },
        })
    }
}

/// Execution engine bound to one verified module.
#[derive(Debug)]
pub struct Interpreter {
    module: VerifiedModule,
    max_call_depth: usize,
    state: State,
}

#[derive(Debug)]
struct State {
    memory: Memory,
    /// Address of each global, indexed by global id.
    globals: Vec<u64>,
}

impl Interpreter {
    /// Address of a global variable, usable as a pointer argument.
    pub fn global_address(&self, name: &str) -> ExecutionResult<GenericValue> {
        let id = self
            .module
            .module()
            .lookup_global(name)
            .map_err(|_| unknown_symbol(name))?;
        Ok(GenericValue::Pointer(self.state.globals[id.index()]))
    }
}

impl ExecutionEngine for Interpreter {
    fn invoke(&mut self, name: &str, args: &[GenericValue]) -> ExecutionResult<GenericValue> {
        let handle = self.module.clone();
        let module = handle.module();
        let function = module
            .named_function(name)
            .ok_or_else(|| unknown_symbol(name))?;
        check_arguments(function, args)?;
        log::debug!("invoke @{name} with {} arguments", args.len());
        let mut machine = Machine {
            module,
            state: &mut self.state,
            max_call_depth: self.max_call_depth,
        };
        let result = machine.call(function, args.to_vec(), 1)?;
        log::trace!("@{name} returned {result}");
        Ok(result)
    }

    fn read_global(&self, name: &str) -> ExecutionResult<GenericValue> {
        let module = self.module.module();
        let id = module.lookup_global(name).map_err(|_| unknown_symbol(name))?;
        let global = module.global(id).ok_or_else(|| unknown_symbol(name))?;
        let ty = global.value_type();
        let bytes = self
            .state
            .memory
            .read(self.state.globals[id.index()], layout::size_of(ty))
            .map_err(|detail| ExecutionError::Fault {
                function: format!("@{name}"),
                detail,
            })?;
        Ok(GenericValue::from_bytes(ty, bytes))
    }
}

fn unknown_symbol(name: &str) -> ExecutionError {
    ExecutionError::UnknownSymbol {
        name: name.to_string(),
    }
}

/// Byte regions addressed by `region << 32 | offset`. Region 0 is null.
#[derive(Debug, Default)]
struct Memory {
    regions: Vec<Vec<u8>>,
}

impl Memory {
    fn allocate(&mut self, size: u64) -> Result<u64, String> {
        if size > OFFSET_MASK {
            return Err(format!("allocation of {size} bytes exceeds region size"));
        }
        self.regions.push(vec![0; size as usize]);
        Ok((self.regions.len() as u64) << OFFSET_BITS)
    }

    fn mark(&self) -> usize {
        self.regions.len()
    }

    /// Free every region allocated after `mark`.
    fn release(&mut self, mark: usize) {
        self.regions.truncate(mark);
    }

    fn locate(&self, addr: u64, len: u64) -> Result<(usize, usize), String> {
        if addr & FUNCTION_TAG != 0 {
            return Err(format!("access through function address {addr:#x}"));
        }
        let region = (addr >> OFFSET_BITS) as usize;
        let offset = addr & OFFSET_MASK;
        if region == 0 {
            return Err(format!("null pointer access at {addr:#x}"));
        }
        let bytes = self
            .regions
            .get(region - 1)
            .ok_or_else(|| format!("access to unallocated region at {addr:#x}"))?;
        if offset + len > bytes.len() as u64 {
            return Err(format!(
                "out-of-bounds access of {len} bytes at {addr:#x} (region of {} bytes)",
                bytes.len()
            ));
        }
        Ok((region - 1, offset as usize))
    }

    fn read(&self, addr: u64, len: u64) -> Result<&[u8], String> {
        let (region, offset) = self.locate(addr, len)?;
        Ok(&self.regions[region][offset..offset + len as usize])
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), String> {
        let (region, offset) = self.locate(addr, bytes.len() as u64)?;
        self.regions[region][offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Activation record of one function call.
struct Frame<'m> {
    function: &'m Function,
    args: Vec<GenericValue>,
    /// Result of each instruction, indexed by instruction id.
    values: Vec<Option<GenericValue>>,
}

impl Frame<'_> {
    fn fault(&self, detail: impl Into<String>) -> ExecutionError {
        ExecutionError::Fault {
            function: self.function.name().to_string(),
            detail: detail.into(),
        }
    }
}

/// Evaluates one invocation against the engine state.
struct Machine<'m, 's> {
    module: &'m Module,
    state: &'s mut State,
    max_call_depth: usize,
}

impl<'m> Machine<'m, '_> {
    fn call(
        &mut self,
        function: &'m Function,
        args: Vec<GenericValue>,
        depth: usize,
    ) -> ExecutionResult<GenericValue> {
        let frame = Frame {
            function,
            args,
            values: vec![None; function.inst_count()],
        };
        if depth > self.max_call_depth {
            return Err(frame.fault(format!("call depth limit of {} exceeded", self.max_call_depth)));
        }
        let Some(entry) = function.entry_block() else {
            return Err(frame.fault(format!("call to undefined external @{}", function.name())));
        };
        let mark = self.state.memory.mark();
        let result = self.run(frame, entry, depth);
        self.state.memory.release(mark);
        result
    }

    fn run(
        &mut self,
        mut frame: Frame<'m>,
        entry: BlockId,
        depth: usize,
    ) -> ExecutionResult<GenericValue> {
        let function = frame.function;
        let mut block = entry;
        'blocks: loop {
            let bb = function
                .block(block)
                .ok_or_else(|| frame.fault(format!("branch to missing block #{}", block.index())))?;
            log::trace!("@{}: enter {}", function.name(), bb.label());
            for &id in bb.instructions() {
                let data = function
                    .inst(id)
                    .ok_or_else(|| frame.fault(format!("missing instruction %{}", id.index())))?;
                match data.instruction() {
                    Instruction::Ret { value } => {
                        return match value {
                            Some(value) => self.operand(&frame, value),
                            None => Ok(GenericValue::Void),
                        };
                    }
                    Instruction::Br { dest } => {
                        block = *dest;
                        continue 'blocks;
                    }
                    Instruction::CondBr {
                        cond,
                        then_dest,
                        else_dest,
                    } => {
                        let taken = match self.operand(&frame, cond)? {
                            GenericValue::Int { bits, .. } => bits != 0,
                            other => return Err(frame.fault(format!("branch on {other}"))),
                        };
                        block = if taken { *then_dest } else { *else_dest };
                        continue 'blocks;
                    }
                    Instruction::Unreachable => {
                        return Err(frame.fault("unreachable executed"));
                    }
                    inst => {
                        let value = self.execute(&frame, inst, data.ty(), depth)?;
                        frame.values[id.index()] = Some(value);
                    }
                }
            }
            return Err(frame.fault(format!("block {} has no terminator", bb.label())));
        }
    }

    fn operand(&self, frame: &Frame<'m>, value: &Value) -> ExecutionResult<GenericValue> {
        match value.kind() {
            ValueKind::Const(constant) => Ok(GenericValue::from_constant(value.ty(), constant)),
            ValueKind::Param { index, .. } => frame
                .args
                .get(*index as usize)
                .cloned()
                .ok_or_else(|| frame.fault(format!("missing argument {index}"))),
            ValueKind::Inst(id) => frame
                .values
                .get(id.index())
                .cloned()
                .flatten()
                .ok_or_else(|| frame.fault(format!("use of unevaluated %{}", id.index()))),
            ValueKind::Global(id) => self
                .state
                .globals
                .get(id.index())
                .map(|addr| GenericValue::Pointer(*addr))
                .ok_or_else(|| frame.fault(format!("unknown global #{}", id.index()))),
            ValueKind::Function(id) => Ok(GenericValue::Pointer(FUNCTION_TAG | u64::from(id.0))),
        }
    }

    fn address(&self, frame: &Frame<'m>, ptr: &Value) -> ExecutionResult<u64> {
        match self.operand(frame, ptr)? {
            GenericValue::Pointer(addr) => Ok(addr),
            other => Err(frame.fault(format!("{other} used as an address"))),
        }
    }

    fn execute(
        &mut self,
        frame: &Frame<'m>,
        inst: &Instruction,
        ty: &Type,
        depth: usize,
    ) -> ExecutionResult<GenericValue> {
        match inst {
            Instruction::Alloca { allocated } => self
                .state
                .memory
                .allocate(layout::size_of(allocated))
                .map(GenericValue::Pointer)
                .map_err(|detail| frame.fault(detail)),
            Instruction::Load { ptr } => {
                let addr = self.address(frame, ptr)?;
                let bytes = self
                    .state
                    .memory
                    .read(addr, layout::size_of(ty))
                    .map_err(|detail| frame.fault(detail))?;
                Ok(GenericValue::from_bytes(ty, bytes))
            }
            Instruction::Store { value, ptr } => {
                let bytes = self.operand(frame, value)?.to_bytes(value.ty());
                let addr = self.address(frame, ptr)?;
                self.state
                    .memory
                    .write(addr, &bytes)
                    .map_err(|detail| frame.fault(detail))?;
                Ok(GenericValue::Void)
            }
            Instruction::Binary { op, lhs, rhs } => {
                let lhs = self.operand(frame, lhs)?;
                let rhs = self.operand(frame, rhs)?;
                binary(*op, &lhs, &rhs).ok_or_else(|| {
                    frame.fault(format!("{} on {lhs} and {rhs}", op.keyword()))
                })
            }
            Instruction::ICmp { pred, lhs, rhs } => {
                let lhs = self.operand(frame, lhs)?;
                let rhs = self.operand(frame, rhs)?;
                let result = compare(*pred, &lhs, &rhs).ok_or_else(|| {
                    frame.fault(format!("icmp {} on {lhs} and {rhs}", pred.keyword()))
                })?;
                Ok(GenericValue::int(1, i128::from(result)))
            }
            Instruction::Call {
                callee,
                args,
                call_conv,
            } => {
                let function = self
                    .module
                    .function(*callee)
                    .ok_or_else(|| frame.fault(format!("unknown callee #{}", callee.0)))?;
                if let Some(conv) = call_conv.filter(|conv| *conv != function.call_conv()) {
                    log::trace!(
                        "call to @{} with {conv} at the call site, callee uses {}",
                        function.name(),
                        function.call_conv()
                    );
                }
                let args = args
                    .iter()
                    .map(|arg| self.operand(frame, arg))
                    .collect::<ExecutionResult<Vec<_>>>()?;
                self.call(function, args, depth + 1)
            }
            Instruction::InsertValue {
                aggregate,
                element,
                index,
            } => {
                let aggregate = self.operand(frame, aggregate)?;
                let element = self.operand(frame, element)?;
                replace(aggregate, *index as usize, element)
                    .ok_or_else(|| frame.fault(format!("insertvalue index {index} out of range")))
            }
            Instruction::ExtractValue { aggregate, index } => self
                .operand(frame, aggregate)?
                .elements()
                .and_then(|elements| elements.get(*index as usize))
                .cloned()
                .ok_or_else(|| frame.fault(format!("extractvalue index {index} out of range"))),
            Instruction::InsertElement {
                vector,
                element,
                lane,
            } => {
                let vector = self.operand(frame, vector)?;
                let element = self.operand(frame, element)?;
                let lane = self.lane(frame, lane)?;
                replace(vector, lane, element)
                    .ok_or_else(|| frame.fault(format!("insertelement lane {lane} out of range")))
            }
            Instruction::ExtractElement { vector, lane } => {
                let vector = self.operand(frame, vector)?;
                let lane = self.lane(frame, lane)?;
                vector
                    .elements()
                    .and_then(|elements| elements.get(lane))
                    .cloned()
                    .ok_or_else(|| frame.fault(format!("extractelement lane {lane} out of range")))
            }
            Instruction::Ret { .. }
            | Instruction::Br { .. }
            | Instruction::CondBr { .. }
            | Instruction::Unreachable => Err(frame.fault(format!(
                "terminator {} in the middle of a block",
                inst.opcode()
            ))),
        }
    }

    fn lane(&self, frame: &Frame<'m>, lane: &Value) -> ExecutionResult<usize> {
        match self.operand(frame, lane)? {
            GenericValue::Int { bits, .. } => Ok(usize::try_from(bits).unwrap_or(usize::MAX)),
            other => Err(frame.fault(format!("lane index {other}"))),
        }
    }
}

fn replace(aggregate: GenericValue, index: usize, element: GenericValue) -> Option<GenericValue> {
    let GenericValue::Aggregate(mut elements) = aggregate else {
        return None;
    };
    *elements.get_mut(index)? = element;
    Some(GenericValue::Aggregate(elements))
}

fn binary(op: BinaryOp, lhs: &GenericValue, rhs: &GenericValue) -> Option<GenericValue> {
    match (lhs, rhs) {
        (
            GenericValue::Int { width, bits: a },
            GenericValue::Int {
                width: rhs_width,
                bits: b,
            },
        ) if width == rhs_width => {
            let bits = match op {
                BinaryOp::Add => a.wrapping_add(*b),
                BinaryOp::Sub => a.wrapping_sub(*b),
                BinaryOp::Mul => a.wrapping_mul(*b),
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
            };
            Some(GenericValue::int(*width, bits as i128))
        }
        (GenericValue::Aggregate(a), GenericValue::Aggregate(b)) if a.len() == b.len() => a
            .iter()
            .zip(b)
            .map(|(x, y)| binary(op, x, y))
            .collect::<Option<Vec<_>>>()
            .map(GenericValue::Aggregate),
        _ => None,
    }
}

fn compare(pred: IntPredicate, lhs: &GenericValue, rhs: &GenericValue) -> Option<bool> {
    let ordering = match (lhs, rhs) {
        (GenericValue::Pointer(a), GenericValue::Pointer(b)) => a.cmp(b),
        (GenericValue::Int { .. }, GenericValue::Int { .. }) if pred.is_signed() => {
            lhs.as_i128()?.cmp(&rhs.as_i128()?)
        }
        (GenericValue::Int { bits: a, .. }, GenericValue::Int { bits: b, .. }) => a.cmp(b),
        _ => return None,
    };
    Some(match pred {
        IntPredicate::Eq => ordering == Ordering::Equal,
        IntPredicate::Ne => ordering != Ordering::Equal,
        IntPredicate::Ugt | IntPredicate::Sgt => ordering == Ordering::Greater,
        IntPredicate::Uge | IntPredicate::Sge => ordering != Ordering::Less,
        IntPredicate::Ult | IntPredicate::Slt => ordering == Ordering::Less,
        IntPredicate::Ule | IntPredicate::Sle => ordering != Ordering::Greater,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::Builder;
    use crate::core::module::FuncId;
    use crate::core::types::TypeRegistry;
    use crate::core::verifier::StructuralVerifier;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn engine(module: Module) -> Interpreter {
        let verified = VerifiedModule::new(module, &StructuralVerifier).unwrap();
        let options = JitOptions {
            max_call_depth: 64,
            ..JitOptions::default()
        };
        InterpreterBackend.create_jit(&verified, &options).unwrap()
    }

    /// `i32 bump()` adds its argument to @counter and returns the new value.
    fn counter_module(types: &mut TypeRegistry) -> Module {
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone()], false).unwrap();
        let mut module = Module::new("counter");
        let counter = module
            .add_global_with_initializer("counter", &Value::const_i32(10))
            .unwrap();
        let bump = module.add_function(&fn_ty, "bump").unwrap();
        let entry = module.append_block(bump, "entry").unwrap();
        let counter_ptr = module.global_value(counter).unwrap();
        let step = module.param(bump, 0).unwrap();
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let old = b.load(&counter_ptr, "old").unwrap();
        let new = b.add(&old, &step, "new").unwrap();
        b.store(&new, &counter_ptr).unwrap();
        b.ret(&new).unwrap();
        module
    }

    #[test]
    fn test_memory_region_reuse() {
        let mut memory = Memory::default();
        let global = memory.allocate(4).unwrap();
        let mark = memory.mark();
        let slot = memory.allocate(8).unwrap();
        memory.write(slot, &[9; 8]).unwrap();

        assert!(memory.read(0, 1).unwrap_err().contains("null"));
        assert!(memory.read(global, 8).unwrap_err().contains("out-of-bounds"));

        memory.release(mark);
        assert!(memory.read(slot, 8).is_err());
        let reused = memory.allocate(8).unwrap();
        assert_eq!(reused, slot);
        assert_eq!(memory.read(slot, 8).unwrap(), &[0; 8]);
    }

    #[test]
    fn test_globals_persist_across_invocations() {
        init_logging();
        let mut types = TypeRegistry::new();
        let mut jit = engine(counter_module(&mut types));
        assert_eq!(jit.read_global("counter").unwrap().as_i32(), Some(10));
        let first = jit.invoke("bump", &[GenericValue::from_i32(5)]).unwrap();
        assert_eq!(first.as_i32(), Some(15));
        let second = jit.invoke("bump", &[GenericValue::from_i32(-20)]).unwrap();
        assert_eq!(second.as_i32(), Some(-5));
        assert_eq!(jit.read_global("counter").unwrap().as_i32(), Some(-5));
    }

    #[test]
    fn test_argument_mismatch_and_unknown_symbol() {
        init_logging();
        let mut types = TypeRegistry::new();
        let mut jit = engine(counter_module(&mut types));
        assert!(matches!(
            jit.invoke("bump", &[]),
            Err(ExecutionError::ArgumentMismatch { .. })
        ));
        assert!(matches!(
            jit.invoke("bump", &[GenericValue::from_i64(1)]),
            Err(ExecutionError::ArgumentMismatch { .. })
        ));
        assert!(matches!(
            jit.invoke("missing", &[]),
            Err(ExecutionError::UnknownSymbol { .. })
        ));
        assert!(matches!(
            jit.read_global("missing"),
            Err(ExecutionError::UnknownSymbol { .. })
        ));
    }

    fn void_function(types: &mut TypeRegistry, module: &mut Module, name: &str) -> (FuncId, BlockId) {
        let void = types.void_type();
        let fn_ty = types.function_type(&void, &[], false).unwrap();
        let f = module.add_function(&fn_ty, name).unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        (f, entry)
    }

    #[test]
    fn test_runtime_faults() {
        init_logging();
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let ptr_ty = types.pointer_type(&i32_ty).unwrap();
        let mut module = Module::new("faults");

        let (_, trap_entry) = void_function(&mut types, &mut module, "trap");
        let (recurse, recurse_entry) = void_function(&mut types, &mut module, "recurse");
        let (external, _) = {
            let void = types.void_type();
            let fn_ty = types.function_type(&void, &[], false).unwrap();
            (module.add_function(&fn_ty, "external").unwrap(), ())
        };
        let (_, ext_entry) = void_function(&mut types, &mut module, "call_external");
        let (_, null_entry) = void_function(&mut types, &mut module, "null_store");

        let mut b = Builder::new(&mut module);
        b.position_at_end(trap_entry);
        b.unreachable().unwrap();
        b.position_at_end(recurse_entry);
        b.call(recurse, &[], "").unwrap();
        b.ret_void().unwrap();
        b.position_at_end(ext_entry);
        b.call(external, &[], "").unwrap();
        b.ret_void().unwrap();
        b.position_at_end(null_entry);
        let null = Value::zero(&ptr_ty).unwrap();
        b.store(&Value::const_i32(1), &null).unwrap();
        b.ret_void().unwrap();

        let mut jit = engine(module);
        for name in ["trap", "recurse", "call_external", "null_store", "external"] {
            match jit.invoke(name, &[]) {
                Err(ExecutionError::Fault { detail, .. }) => log::debug!("{name}: {detail}"),
                other => panic!("{name}: expected a fault, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_stack_slots_and_vectors() {
        init_logging();
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let v4 = types.vector_type(&i32_ty, 4).unwrap();
        let fn_ty = types.function_type(&v4, &[v4.clone()], false).unwrap();
        let mut module = Module::new("vectors");
        let f = module.add_function(&fn_ty, "double_lane1").unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        let input = module.param(f, 0).unwrap();
        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let slot = b.alloca(&v4, "slot").unwrap();
        b.store(&input, &slot).unwrap();
        let v = b.load(&slot, "v").unwrap();
        let lane = b.extract_element(&v, &Value::const_i32(1), "lane").unwrap();
        let twice = b.mul(&lane, &Value::const_i32(2), "twice").unwrap();
        let out = b.insert_element(&v, &twice, &Value::const_i32(1), "out").unwrap();
        let sum = b.add(&out, &v, "sum").unwrap();
        b.ret(&sum).unwrap();

        let mut jit = engine(module);
        let result = jit
            .invoke("double_lane1", &[GenericValue::vector_i32(&[1, 2, 3, 4])])
            .unwrap();
        assert_eq!(result.as_i32_lanes(), Some(vec![2, 6, 6, 8]));
    }

    #[test]
    fn test_signed_and_unsigned_compare() {
        let minus_one = GenericValue::from_i32(-1);
        let one = GenericValue::from_i32(1);
        assert_eq!(compare(IntPredicate::Slt, &minus_one, &one), Some(true));
        assert_eq!(compare(IntPredicate::Ult, &minus_one, &one), Some(false));
        assert_eq!(compare(IntPredicate::Eq, &one, &one), Some(true));
        assert_eq!(
            binary(BinaryOp::Add, &GenericValue::int(8, 127), &GenericValue::int(8, 1)),
            Some(GenericValue::int(8, -128))
        );
    }

    #[test]
    fn test_zero_call_depth_rejected() {
        let mut types = TypeRegistry::new();
        let verified = VerifiedModule::new(counter_module(&mut types), &StructuralVerifier).unwrap();
        let options = JitOptions {
            max_call_depth: 0,
            ..JitOptions::default()
        };
        assert!(matches!(
            InterpreterBackend.create_jit(&verified, &options),
            Err(ExecutionError::JitInit { .. })
        ));
    }
}
