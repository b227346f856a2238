// This module holds the in-memory program representation. A Module owns an ordered list of
// globals and functions plus one symbol table shared by both (names are unique within a
// module). Functions own their basic blocks and an instruction arena; blocks hold ordered
// handles into that arena so instructions can be inserted before an existing instruction
// without renumbering. Values are small typed handles (constants, parameters, instruction
// results, global and function addresses) that carry their Type, which lets the builder
// validate operand signatures without looking anything up. The module enforces the
// Declared -> Assembling -> Sealed lifecycle: once sealed, every mutating entry point
// fails with SealedFunction or SealedModule.

//! Module, function, block and value representation.

use super::error::{ConstructionError, ConstructionResult};
use super::types::{FunctionType, Type};
use hashbrown::HashMap;
use std::fmt;

/// Handle to a function inside a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

/// Handle to a global variable inside a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub(crate) u32);

/// Handle to a basic block; blocks belong to exactly one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub(crate) func: FuncId,
    pub(crate) index: u32,
}

/// Handle to an instruction in a function's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId {
    pub(crate) func: FuncId,
    pub(crate) index: u32,
}

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl GlobalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn func(self) -> FuncId {
        self.func
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl InstId {
    pub fn func(self) -> FuncId {
        self.func
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Symbol linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Linkage {
    /// Visible outside the module.
    #[default]
    External,
    /// Local to the module but present in the symbol table.
    Internal,
    /// Local to the module and omitted from the symbol table.
    Private,
}

impl Linkage {
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            Linkage::External => None,
            Linkage::Internal => Some("internal"),
            Linkage::Private => Some("private"),
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "external" => Some(Linkage::External),
            "internal" => Some(Linkage::Internal),
            "private" => Some(Linkage::Private),
            _ => None,
        }
    }

    pub fn is_local(self) -> bool {
        !matches!(self, Linkage::External)
    }
}

/// LLVM numbering used for [`CallConv::Stack`].
pub const STACK_CALL_CONV_ID: u32 = 1023;

/// Calling convention tag of a function or call site.
///
/// `Stack` is an opaque, non-standard convention. Nothing may assume the
/// standard ABI for it; each backend decides how to lower it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConv {
    #[default]
    C,
    Fast,
    Cold,
    Stack,
    Numbered(u32),
}

impl CallConv {
    /// Numeric calling convention id as understood by LLVM.
    pub fn llvm_id(self) -> u32 {
        match self {
            CallConv::C => 0,
            CallConv::Fast => 8,
            CallConv::Cold => 9,
            CallConv::Stack => STACK_CALL_CONV_ID,
            CallConv::Numbered(id) => id,
        }
    }

    pub fn from_llvm_id(id: u32) -> Self {
        match id {
            0 => CallConv::C,
            8 => CallConv::Fast,
            9 => CallConv::Cold,
            STACK_CALL_CONV_ID => CallConv::Stack,
            other => CallConv::Numbered(other),
        }
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallConv::C => write!(f, "ccc"),
            CallConv::Fast => write!(f, "fastcc"),
            CallConv::Cold => write!(f, "coldcc"),
            other => write!(f, "cc {}", other.llvm_id()),
        }
    }
}

/// Function attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    NoInline,
    AlwaysInline,
    NoUnwind,
    Cold,
}

impl Attribute {
    pub fn name(self) -> &'static str {
        match self {
            Attribute::NoInline => "noinline",
            Attribute::AlwaysInline => "alwaysinline",
            Attribute::NoUnwind => "nounwind",
            Attribute::Cold => "cold",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "noinline" => Some(Attribute::NoInline),
            "alwaysinline" => Some(Attribute::AlwaysInline),
            "nounwind" => Some(Attribute::NoUnwind),
            "cold" => Some(Attribute::Cold),
            _ => None,
        }
    }
}

/// Compile-time constant payload. The owning [`Value`] carries the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Integer bits, truncated to the type width.
    Int(u128),
    Undef,
    Zero,
    /// Struct fields or vector lanes, in order.
    Aggregate(Vec<Constant>),
}

/// What a [`Value`] refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Const(Constant),
    Param { func: FuncId, index: u32 },
    Inst(InstId),
    /// Address of a global variable.
    Global(GlobalId),
    /// Address of a function.
    Function(FuncId),
}

/// A typed operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value {
    kind: ValueKind,
    ty: Type,
}

fn truncate(bits: u128, width: u32) -> u128 {
    if width >= 128 {
        bits
    } else {
        bits & ((1u128 << width) - 1)
    }
}

impl Value {
    pub(crate) fn new(kind: ValueKind, ty: Type) -> Self {
        Self { kind, ty }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    /// Integer constant of type `ty`; `value` is truncated to the type width.
    pub fn const_int(ty: &Type, value: i128) -> ConstructionResult<Self> {
        let width = ty
            .int_width()
            .ok_or_else(|| ConstructionError::mismatch("const_int", "integer type", ty))?;
        Ok(Self::new(
            ValueKind::Const(Constant::Int(truncate(value as u128, width))),
            ty.clone(),
        ))
    }

    pub fn const_i32(value: i32) -> Self {
        Self::new(
            ValueKind::Const(Constant::Int(u128::from(value as u32))),
            Type::int(32),
        )
    }

    pub fn const_i64(value: i64) -> Self {
        Self::new(
            ValueKind::Const(Constant::Int(u128::from(value as u64))),
            Type::int(64),
        )
    }

    pub fn const_bool(value: bool) -> Self {
        Self::new(ValueKind::Const(Constant::Int(u128::from(value))), Type::int(1))
    }

    pub fn undef(ty: &Type) -> ConstructionResult<Self> {
        if !ty.is_first_class() {
            return Err(ConstructionError::mismatch("undef", "first-class type", ty));
        }
        Ok(Self::new(ValueKind::Const(Constant::Undef), ty.clone()))
    }

    pub fn zero(ty: &Type) -> ConstructionResult<Self> {
        if !ty.is_first_class() {
            return Err(ConstructionError::mismatch("zeroinitializer", "first-class type", ty));
        }
        Ok(Self::new(ValueKind::Const(Constant::Zero), ty.clone()))
    }

    /// Constant struct or vector built from constant elements.
    pub fn const_aggregate(ty: &Type, elements: &[Value]) -> ConstructionResult<Self> {
        let expected: Vec<Type> = if let Some(fields) = ty.struct_fields() {
            fields.to_vec()
        } else if let Some((elem, count)) = ty.vector_parts() {
            vec![elem.clone(); count as usize]
        } else {
            return Err(ConstructionError::mismatch(
                "const_aggregate",
                "struct or vector type",
                ty,
            ));
        };
        if expected.len() != elements.len() {
            return Err(ConstructionError::mismatch(
                "const_aggregate",
                format!("{} elements", expected.len()),
                format!("{} elements", elements.len()),
            ));
        }
        let mut constants = Vec::with_capacity(elements.len());
        for (want, element) in expected.iter().zip(elements) {
            if element.ty() != want {
                return Err(ConstructionError::mismatch("const_aggregate", want, element.ty()));
            }
            match element.as_const() {
                Some(constant) => constants.push(constant.clone()),
                None => {
                    return Err(ConstructionError::mismatch(
                        "const_aggregate",
                        "constant element",
                        "non-constant value",
                    ))
                }
            }
        }
        Ok(Self::new(
            ValueKind::Const(Constant::Aggregate(constants)),
            ty.clone(),
        ))
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match &self.kind {
            ValueKind::Const(constant) => Some(constant),
            _ => None,
        }
    }

    /// Zero-extended value of an integer constant.
    pub fn as_const_int(&self) -> Option<u128> {
        match &self.kind {
            ValueKind::Const(Constant::Int(bits)) => Some(*bits),
            ValueKind::Const(Constant::Zero) if self.ty.is_int() => Some(0),
            _ => None,
        }
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match self.kind {
            ValueKind::Inst(id) => Some(id),
            _ => None,
        }
    }

    /// Function the value is local to, if any.
    pub fn owner(&self) -> Option<FuncId> {
        match self.kind {
            ValueKind::Param { func, .. } => Some(func),
            ValueKind::Inst(id) => Some(id.func),
            _ => None,
        }
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl IntPredicate {
    pub fn keyword(self) -> &'static str {
        match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "eq" => IntPredicate::Eq,
            "ne" => IntPredicate::Ne,
            "ugt" => IntPredicate::Ugt,
            "uge" => IntPredicate::Uge,
            "ult" => IntPredicate::Ult,
            "ule" => IntPredicate::Ule,
            "sgt" => IntPredicate::Sgt,
            "sge" => IntPredicate::Sge,
            "slt" => IntPredicate::Slt,
            "sle" => IntPredicate::Sle,
            _ => return None,
        })
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            IntPredicate::Sgt | IntPredicate::Sge | IntPredicate::Slt | IntPredicate::Sle
        )
    }
}

/// Two-operand integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn keyword(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            "xor" => BinaryOp::Xor,
            _ => return None,
        })
    }
}

/// One IR operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Alloca { allocated: Type },
    Load { ptr: Value },
    Store { value: Value, ptr: Value },
    Binary { op: BinaryOp, lhs: Value, rhs: Value },
    ICmp { pred: IntPredicate, lhs: Value, rhs: Value },
    Call {
        callee: FuncId,
        args: Vec<Value>,
        /// Call-site convention override; `None` uses the callee's convention.
        call_conv: Option<CallConv>,
    },
    InsertValue { aggregate: Value, element: Value, index: u32 },
    ExtractValue { aggregate: Value, index: u32 },
    InsertElement { vector: Value, element: Value, lane: Value },
    ExtractElement { vector: Value, lane: Value },
    Ret { value: Option<Value> },
    Br { dest: BlockId },
    CondBr { cond: Value, then_dest: BlockId, else_dest: BlockId },
    Unreachable,
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Ret { .. }
                | Instruction::Br { .. }
                | Instruction::CondBr { .. }
                | Instruction::Unreachable
        )
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            Instruction::Alloca { .. } => "alloca",
            Instruction::Load { .. } => "load",
            Instruction::Store { .. } => "store",
            Instruction::Binary { op, .. } => op.keyword(),
            Instruction::ICmp { .. } => "icmp",
            Instruction::Call { .. } => "call",
            Instruction::InsertValue { .. } => "insertvalue",
            Instruction::ExtractValue { .. } => "extractvalue",
            Instruction::InsertElement { .. } => "insertelement",
            Instruction::ExtractElement { .. } => "extractelement",
            Instruction::Ret { .. } => "ret",
            Instruction::Br { .. } => "br",
            Instruction::CondBr { .. } => "br",
            Instruction::Unreachable => "unreachable",
        }
    }

    /// Value operands in source order.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Instruction::Alloca { .. } | Instruction::Br { .. } | Instruction::Unreachable => {
                Vec::new()
            }
            Instruction::Load { ptr } => vec![ptr],
            Instruction::Store { value, ptr } => vec![value, ptr],
            Instruction::Binary { lhs, rhs, .. } | Instruction::ICmp { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Instruction::Call { args, .. } => args.iter().collect(),
            Instruction::InsertValue {
                aggregate, element, ..
            } => vec![aggregate, element],
            Instruction::ExtractValue { aggregate, .. } => vec![aggregate],
            Instruction::InsertElement {
                vector,
                element,
                lane,
            } => vec![vector, element, lane],
            Instruction::ExtractElement { vector, lane } => vec![vector, lane],
            Instruction::Ret { value } => value.iter().collect(),
            Instruction::CondBr { cond, .. } => vec![cond],
        }
    }

    /// Successor blocks of a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Instruction::Br { dest } => vec![*dest],
            Instruction::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            _ => Vec::new(),
        }
    }
}

/// An instruction together with its result type, debug label and parent block.
#[derive(Debug, Clone)]
pub struct InstData {
    pub(crate) inst: Instruction,
    pub(crate) ty: Type,
    pub(crate) name: String,
    pub(crate) block: u32,
}

impl InstData {
    pub fn instruction(&self) -> &Instruction {
        &self.inst
    }

    /// Result type; `void` for instructions without a result.
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_index(&self) -> usize {
        self.block as usize
    }
}

/// Ordered instruction list of one block.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub(crate) label: String,
    pub(crate) insts: Vec<InstId>,
}

impl BasicBlock {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn instructions(&self) -> &[InstId] {
        &self.insts
    }

    pub fn terminator(&self) -> Option<InstId> {
        self.insts.last().copied()
    }
}

/// Lifecycle state of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    /// No body yet.
    Declared,
    /// Blocks and instructions are being added.
    Assembling,
    /// Handed to a verifier; immutable.
    Sealed,
}

/// A function declaration or definition.
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) id: FuncId,
    pub(crate) name: String,
    pub(crate) ty: Type,
    pub(crate) sig: FunctionType,
    pub(crate) linkage: Linkage,
    pub(crate) call_conv: CallConv,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) param_names: Vec<Option<String>>,
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) insts: Vec<InstData>,
    pub(crate) state: FunctionState,
}

impl Function {
    pub fn id(&self) -> FuncId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pointer-free function type (`ret (params)`).
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn signature(&self) -> &FunctionType {
        &self.sig
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn has_attribute(&self, attribute: Attribute) -> bool {
        self.attributes.contains(&attribute)
    }

    pub fn param_name(&self, index: usize) -> Option<&str> {
        self.param_names.get(index).and_then(|name| name.as_deref())
    }

    pub fn param_count(&self) -> usize {
        self.signature().params.len()
    }

    /// Value of parameter `index`.
    pub fn param(&self, index: usize) -> Option<Value> {
        let ty = self.signature().params.get(index)?;
        Some(Value::new(
            ValueKind::Param {
                func: self.id,
                index: index as u32,
            },
            ty.clone(),
        ))
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn state(&self) -> FunctionState {
        self.state
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        if id.func != self.id {
            return None;
        }
        self.blocks.get(id.index())
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(move |index| BlockId {
            func: self.id,
            index,
        })
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        (!self.blocks.is_empty()).then_some(BlockId {
            func: self.id,
            index: 0,
        })
    }

    pub fn inst(&self, id: InstId) -> Option<&InstData> {
        if id.func != self.id {
            return None;
        }
        self.insts.get(id.index())
    }

    /// Number of instructions created in this function.
    pub fn inst_count(&self) -> usize {
        self.insts.len()
    }

    /// Result value of instruction `id`.
    pub fn inst_value(&self, id: InstId) -> Option<Value> {
        let data = self.inst(id)?;
        Some(Value::new(ValueKind::Inst(id), data.ty.clone()))
    }
}

/// A global variable.
#[derive(Debug, Clone)]
pub struct Global {
    pub(crate) id: GlobalId,
    pub(crate) name: String,
    pub(crate) ty: Type,
    pub(crate) initializer: Option<Constant>,
    pub(crate) linkage: Linkage,
}

impl Global {
    pub fn id(&self) -> GlobalId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type of the stored value; the global itself is a pointer to it.
    pub fn value_type(&self) -> &Type {
        &self.ty
    }

    /// Initial contents; `None` means zero-filled storage.
    pub fn initializer(&self) -> Option<&Constant> {
        self.initializer.as_ref()
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Global(GlobalId),
    Function(FuncId),
}

/// A translation unit.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    globals: Vec<Global>,
    functions: Vec<Function>,
    symbols: HashMap<String, Symbol>,
    sealed: bool,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: Vec::new(),
            functions: Vec::new(),
            symbols: HashMap::new(),
            sealed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Freeze the module. Every function becomes [`FunctionState::Sealed`].
    pub fn seal(&mut self) {
        if !self.sealed {
            log::debug!("sealing module {}", self.name);
        }
        self.sealed = true;
        for function in &mut self.functions {
            function.state = FunctionState::Sealed;
        }
    }

    fn ensure_module_mutable(&self) -> ConstructionResult<()> {
        if self.sealed {
            return Err(ConstructionError::SealedModule {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn function_mut(&mut self, id: FuncId) -> ConstructionResult<&mut Function> {
        let function = self
            .functions
            .get_mut(id.index())
            .ok_or_else(|| ConstructionError::unknown(format!("function #{}", id.0)))?;
        if function.state == FunctionState::Sealed {
            return Err(ConstructionError::SealedFunction {
                name: function.name.clone(),
            });
        }
        Ok(function)
    }

    fn bind(&mut self, name: &str, symbol: Symbol) -> ConstructionResult<()> {
        if self.symbols.contains_key(name) {
            return Err(ConstructionError::DuplicateSymbol {
                name: name.to_string(),
            });
        }
        self.symbols.insert(name.to_string(), symbol);
        Ok(())
    }

    /// Declare a zero-initialized global variable of type `ty`.
    pub fn add_global(&mut self, ty: &Type, name: &str) -> ConstructionResult<GlobalId> {
        self.ensure_module_mutable()?;
        if !ty.is_first_class() {
            return Err(ConstructionError::mismatch("add_global", "first-class type", ty));
        }
        let id = GlobalId(self.globals.len() as u32);
        self.bind(name, Symbol::Global(id))?;
        log::trace!("global @{name}: {ty}");
        self.globals.push(Global {
            id,
            name: name.to_string(),
            ty: ty.clone(),
            initializer: None,
            linkage: Linkage::External,
        });
        Ok(id)
    }

    /// Declare a global variable with a constant initializer.
    pub fn add_global_with_initializer(
        &mut self,
        name: &str,
        initializer: &Value,
    ) -> ConstructionResult<GlobalId> {
        let constant = initializer.as_const().cloned().ok_or_else(|| {
            ConstructionError::mismatch("global initializer", "constant", "non-constant value")
        })?;
        let id = self.add_global(initializer.ty(), name)?;
        self.globals[id.index()].initializer = Some(constant);
        Ok(id)
    }

    pub fn set_global_linkage(&mut self, id: GlobalId, linkage: Linkage) -> ConstructionResult<()> {
        self.ensure_module_mutable()?;
        let global = self
            .globals
            .get_mut(id.index())
            .ok_or_else(|| ConstructionError::unknown(format!("global #{}", id.0)))?;
        global.linkage = linkage;
        Ok(())
    }

    /// Declare a function of function type `ty`. It has no body until a block is appended.
    pub fn add_function(&mut self, ty: &Type, name: &str) -> ConstructionResult<FuncId> {
        self.ensure_module_mutable()?;
        let sig = ty
            .as_function()
            .ok_or_else(|| ConstructionError::mismatch("add_function", "function type", ty))?
            .clone();
        let params = sig.params.len();
        let id = FuncId(self.functions.len() as u32);
        self.bind(name, Symbol::Function(id))?;
        log::trace!("function @{name}: {ty}");
        self.functions.push(Function {
            id,
            name: name.to_string(),
            ty: ty.clone(),
            sig,
            linkage: Linkage::External,
            call_conv: CallConv::C,
            attributes: Vec::new(),
            param_names: vec![None; params],
            blocks: Vec::new(),
            insts: Vec::new(),
            state: FunctionState::Declared,
        });
        Ok(id)
    }

    pub fn lookup_function(&self, name: &str) -> ConstructionResult<FuncId> {
        match self.symbols.get(name) {
            Some(Symbol::Function(id)) => Ok(*id),
            _ => Err(ConstructionError::unknown(name)),
        }
    }

    pub fn lookup_global(&self, name: &str) -> ConstructionResult<GlobalId> {
        match self.symbols.get(name) {
            Some(Symbol::Global(id)) => Ok(*id),
            _ => Err(ConstructionError::unknown(name)),
        }
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    /// Function by name, for consumers that do not hold a handle.
    pub fn named_function(&self, name: &str) -> Option<&Function> {
        self.lookup_function(name).ok().and_then(|id| self.function(id))
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(id.index())
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn set_linkage(&mut self, func: FuncId, linkage: Linkage) -> ConstructionResult<()> {
        self.function_mut(func)?.linkage = linkage;
        Ok(())
    }

    pub fn set_call_conv(&mut self, func: FuncId, call_conv: CallConv) -> ConstructionResult<()> {
        self.function_mut(func)?.call_conv = call_conv;
        Ok(())
    }

    pub fn add_attribute(&mut self, func: FuncId, attribute: Attribute) -> ConstructionResult<()> {
        let function = self.function_mut(func)?;
        if !function.attributes.contains(&attribute) {
            function.attributes.push(attribute);
        }
        Ok(())
    }

    pub fn set_param_name(
        &mut self,
        func: FuncId,
        index: usize,
        name: &str,
    ) -> ConstructionResult<()> {
        let function = self.function_mut(func)?;
        let fname = function.name.clone();
        let slot = function
            .param_names
            .get_mut(index)
            .ok_or_else(|| ConstructionError::unknown(format!("{fname} parameter {index}")))?;
        *slot = Some(name.to_string());
        Ok(())
    }

    /// Value of parameter `index` of `func`.
    pub fn param(&self, func: FuncId, index: usize) -> ConstructionResult<Value> {
        let function = self
            .function(func)
            .ok_or_else(|| ConstructionError::unknown(format!("function #{}", func.0)))?;
        function
            .param(index)
            .ok_or_else(|| ConstructionError::unknown(format!("{} parameter {index}", function.name)))
    }

    /// Address of a global, typed as a pointer to its value type.
    pub fn global_value(&self, id: GlobalId) -> ConstructionResult<Value> {
        let global = self
            .global(id)
            .ok_or_else(|| ConstructionError::unknown(format!("global #{}", id.0)))?;
        Ok(Value::new(
            ValueKind::Global(id),
            Type::pointer_to(&global.ty),
        ))
    }

    /// Address of a function, typed as a pointer to its function type.
    pub fn function_value(&self, id: FuncId) -> ConstructionResult<Value> {
        let function = self
            .function(id)
            .ok_or_else(|| ConstructionError::unknown(format!("function #{}", id.0)))?;
        Ok(Value::new(
            ValueKind::Function(id),
            Type::pointer_to(&function.ty),
        ))
    }

    /// Append an empty block to `func`. Duplicate labels get a numeric suffix.
    pub fn append_block(&mut self, func: FuncId, label: &str) -> ConstructionResult<BlockId> {
        let function = self.function_mut(func)?;
        let label = unique_label(function, label);
        let index = function.blocks.len() as u32;
        function.blocks.push(BasicBlock {
            label,
            insts: Vec::new(),
        });
        function.state = FunctionState::Assembling;
        Ok(BlockId { func, index })
    }

    /// Insert an instruction into `block` at `position` (`None` = block end).
    pub(crate) fn insert_inst(
        &mut self,
        block: BlockId,
        position: Option<usize>,
        inst: Instruction,
        ty: Type,
        name: &str,
    ) -> ConstructionResult<InstId> {
        let function = self.function_mut(block.func)?;
        let fname = function.name.clone();
        let id = InstId {
            func: block.func,
            index: function.insts.len() as u32,
        };
        let bb = function
            .blocks
            .get_mut(block.index())
            .ok_or_else(|| ConstructionError::unknown(format!("{fname} block #{}", block.index)))?;
        match position {
            Some(at) if at <= bb.insts.len() => bb.insts.insert(at, id),
            _ => bb.insts.push(id),
        }
        function.insts.push(InstData {
            inst,
            ty,
            name: name.to_string(),
            block: block.index,
        });
        Ok(id)
    }
}

fn unique_label(function: &Function, label: &str) -> String {
    let taken = |candidate: &str| function.blocks.iter().any(|b| b.label == candidate);
    if !taken(label) {
        return label.to_string();
    }
    (1..)
        .map(|n| format!("{label}{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TypeRegistry;

    #[test]
    fn test_duplicate_and_unknown_symbols() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[], false).unwrap();

        let mut module = Module::new("symbols");
        module.add_global(&i32_ty, "AAA").unwrap();
        assert_eq!(
            module.add_global(&i32_ty, "AAA"),
            Err(ConstructionError::DuplicateSymbol { name: "AAA".into() })
        );
        // functions and globals share one namespace
        assert!(matches!(
            module.add_function(&fn_ty, "AAA"),
            Err(ConstructionError::DuplicateSymbol { .. })
        ));

        let main = module.add_function(&fn_ty, "main").unwrap();
        assert_eq!(module.lookup_function("main"), Ok(main));
        assert!(matches!(
            module.lookup_function("AAA"),
            Err(ConstructionError::UnknownSymbol { .. })
        ));
        assert!(matches!(
            module.lookup_global("missing"),
            Err(ConstructionError::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn test_function_lifecycle() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone()], false).unwrap();

        let mut module = Module::new("lifecycle");
        let f = module.add_function(&fn_ty, "f").unwrap();
        assert_eq!(module.function(f).unwrap().state(), FunctionState::Declared);
        assert!(module.function(f).unwrap().is_declaration());

        let entry = module.append_block(f, "entry").unwrap();
        let again = module.append_block(f, "entry").unwrap();
        assert_eq!(module.function(f).unwrap().state(), FunctionState::Assembling);
        assert_eq!(module.function(f).unwrap().block(again).unwrap().label(), "entry1");
        assert_ne!(entry, again);

        module.seal();
        assert_eq!(module.function(f).unwrap().state(), FunctionState::Sealed);
        assert!(matches!(
            module.append_block(f, "late"),
            Err(ConstructionError::SealedFunction { .. })
        ));
        assert!(matches!(
            module.add_attribute(f, Attribute::NoInline),
            Err(ConstructionError::SealedFunction { .. })
        ));
        assert!(matches!(
            module.add_global(&i32_ty, "late"),
            Err(ConstructionError::SealedModule { .. })
        ));
    }

    #[test]
    fn test_params_and_addresses() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let ptr = types.pointer_type(&i32_ty).unwrap();
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone(), ptr.clone()], false).unwrap();

        let mut module = Module::new("values");
        let g = module.add_global(&i32_ty, "g").unwrap();
        let f = module.add_function(&fn_ty, "f").unwrap();

        assert_eq!(module.param(f, 1).unwrap().ty(), &ptr);
        assert!(matches!(
            module.param(f, 2),
            Err(ConstructionError::UnknownSymbol { .. })
        ));
        assert_eq!(module.global_value(g).unwrap().ty(), &ptr);
        assert!(module.function_value(f).unwrap().ty().is_pointer());
    }

    #[test]
    fn test_constants() {
        let i8_ty = Type::int(8);
        let c = Value::const_int(&i8_ty, -1).unwrap();
        assert_eq!(c.as_const_int(), Some(0xff));
        assert!(Value::const_int(&Type::pointer_to(&i8_ty), 0).is_err());

        let v2 = Type::vector_of(&Type::int(32), 2);
        let lanes = [Value::const_i32(1), Value::const_i32(2)];
        assert!(Value::const_aggregate(&v2, &lanes).is_ok());
        assert!(Value::const_aggregate(&v2, &lanes[..1]).is_err());
        assert!(Value::const_aggregate(&v2, &[Value::const_i32(1), Value::const_i64(2)]).is_err());
    }

    #[test]
    fn test_call_conv_ids() {
        for cc in [CallConv::C, CallConv::Fast, CallConv::Cold, CallConv::Stack, CallConv::Numbered(64)] {
            assert_eq!(CallConv::from_llvm_id(cc.llvm_id()), cc);
        }
        assert_eq!(CallConv::Stack.to_string(), "cc 1023");
    }
}
