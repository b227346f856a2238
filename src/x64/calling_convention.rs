// This module implements the System V AMD64 ABI calling convention used by the native lowering.
// It provides the CCAssigner trait and the SysVAssigner implementation for argument passing and
// return value placement: GP arguments pass in RDI, RSI, RDX, RCX, R8, R9 (first 6), vector
// arguments pass in XMM0-XMM7 (first 8), remaining arguments go on the stack with 8-byte
// slots, integer and small aggregate returns use RAX/RDX and vector returns use XMM0.
// Aggregates larger than 16 bytes are passed by value in memory and returned through a hidden
// pointer in RDI. classify() maps an IR type to its ABI class; the custom Stack convention
// sets must_assign_stack so that every argument is passed in memory. FunctionFrame manages the
// rbp-relative stack layout of a function (one slot per SSA value plus alloca storage) in a
// bumpalo arena and keeps the frame 16-byte aligned per ABI requirements.

//! System V x86-64 calling convention implementation.

use super::encoder::AsmReg;
use crate::core::error::{LoweringError, LoweringResult};
use crate::core::layout;
use crate::core::module::CallConv;
use crate::core::types::{Type, TypeKind};
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Register banks for different register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
}

/// Argument attributes for calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAttribute {
    /// No special attributes.
    None,
    /// Pass by value (copy entire aggregate to the argument area).
    ByVal { size: u32, align: u32 },
    /// Struct return (hidden first parameter).
    StructRet,
}

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy)]
pub struct CCAssignment {
    /// Register bank this argument belongs to.
    pub bank: RegBank,
    /// Size of the argument in bytes.
    pub size: u32,
    /// Required alignment in bytes.
    pub align: u32,
    /// Number of consecutive registers needed.
    pub consecutive: u32,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Second register of a two-register assignment.
    pub reg_hi: Option<AsmReg>,
    /// Offset from the start of the outgoing argument area (if assigned to stack).
    pub stack_off: Option<i32>,
    /// Argument attributes.
    pub attribute: ArgAttribute,
}

impl CCAssignment {
    /// Create a new assignment for an argument.
    pub fn new(bank: RegBank, size: u32, align: u32) -> Self {
        Self::with_attribute(bank, size, align, ArgAttribute::None)
    }

    /// Create a new assignment with attribute.
    pub fn with_attribute(bank: RegBank, size: u32, align: u32, attribute: ArgAttribute) -> Self {
        Self {
            bank,
            size,
            align,
            consecutive: 1,
            reg: None,
            reg_hi: None,
            stack_off: None,
            attribute,
        }
    }

    /// Assignment for a value of `ty` according to its ABI class.
    pub fn for_type(ty: &Type) -> LoweringResult<Self> {
        let size = layout::size_of(ty) as u32;
        let align = layout::align_of(ty) as u32;
        Ok(match classify(ty)? {
            ArgClass::Integer { regs } => Self {
                consecutive: regs,
                ..Self::new(RegBank::GeneralPurpose, size, align)
            },
            ArgClass::Sse => Self::new(RegBank::Xmm, size, align),
            ArgClass::Memory => Self::with_attribute(
                RegBank::GeneralPurpose,
                size,
                align,
                ArgAttribute::ByVal { size, align },
            ),
        })
    }

    pub fn in_register(&self) -> bool {
        self.reg.is_some()
    }
}

/// ABI class of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// Passed in one or two general purpose registers.
    Integer { regs: u32 },
    /// Passed in one XMM register.
    Sse,
    /// Passed in memory; returned through a hidden pointer.
    Memory,
}

fn unsupported(reason: impl Into<String>) -> LoweringError {
    LoweringError::Unsupported {
        target: "x86_64".to_string(),
        reason: reason.into(),
    }
}

fn has_vector(ty: &Type) -> bool {
    match ty.kind() {
        TypeKind::Vector { .. } => true,
        TypeKind::Struct { fields, .. } => fields.iter().any(has_vector),
        _ => false,
    }
}

fn is_misaligned(ty: &Type) -> bool {
    match ty.kind() {
        TypeKind::Struct { fields, .. } => fields.iter().enumerate().any(|(i, field)| {
            let offset = layout::element_offset(ty, i as u32).unwrap_or(0);
            offset % layout::align_of(field) != 0 || is_misaligned(field)
        }),
        _ => false,
    }
}

/// Classify a first-class value for argument passing and return.
pub fn classify(ty: &Type) -> LoweringResult<ArgClass> {
    let size = layout::size_of(ty);
    match ty.kind() {
        TypeKind::Int(_) | TypeKind::Pointer(_) => Ok(ArgClass::Integer { regs: 1 }),
        TypeKind::Vector { elem, .. } if elem.int_width() == Some(1) => Err(unsupported(format!(
            "vector of i1 {ty} as argument or return value"
        ))),
        TypeKind::Vector { .. } if size > 16 => Err(unsupported(format!(
            "vector argument {ty} wider than 128 bits"
        ))),
        TypeKind::Vector { .. } => Ok(ArgClass::Sse),
        TypeKind::Struct { .. } if size > 16 || is_misaligned(ty) => Ok(ArgClass::Memory),
        TypeKind::Struct { .. } if has_vector(ty) => Err(unsupported(format!(
            "register-sized aggregate {ty} with vector fields"
        ))),
        TypeKind::Struct { .. } if size == 0 => Ok(ArgClass::Memory),
        TypeKind::Struct { .. } => Ok(ArgClass::Integer {
            regs: size.div_ceil(8) as u32,
        }),
        TypeKind::Void | TypeKind::Function(_) => {
            Err(unsupported(format!("{ty} is not a value type")))
        }
    }
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign an argument according to the calling convention.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a return value according to the calling convention.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Reset state for a new function.
    fn reset(&mut self);

    /// Get the total stack space needed for arguments.
    fn get_stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
///
/// Implements the standard Unix/Linux x86-64 ABI:
/// - First 6 integer args in RDI, RSI, RDX, RCX, R8, R9
/// - First 8 vector args in XMM0-XMM7
/// - Remaining args on stack
/// - Return values in RAX/RDX (int) or XMM0 (vector)
#[derive(Debug, Default)]
pub struct SysVAssigner {
    /// Current GP argument register index.
    gp_cnt: usize,
    /// Current XMM argument register index.
    xmm_cnt: usize,
    /// Current stack offset for arguments.
    stack: u32,
    /// Force remaining args to stack.
    must_assign_stack: bool,
    /// Return value GP register count.
    ret_gp_cnt: usize,
    /// Return value XMM register count.
    ret_xmm_cnt: usize,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmReg; 6] = [
        AsmReg::RDI,
        AsmReg::RSI,
        AsmReg::RDX,
        AsmReg::RCX,
        AsmReg::R8,
        AsmReg::R9,
    ];

    /// System V x86-64 XMM argument registers.
    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::xmm(0),
        AsmReg::xmm(1),
        AsmReg::xmm(2),
        AsmReg::xmm(3),
        AsmReg::xmm(4),
        AsmReg::xmm(5),
        AsmReg::xmm(6),
        AsmReg::xmm(7),
    ];

    /// Return value registers.
    pub const RET_GP_REGS: [AsmReg; 2] = [AsmReg::RAX, AsmReg::RDX];

    pub const RET_XMM_REGS: [AsmReg; 2] = [AsmReg::xmm(0), AsmReg::xmm(1)];

    /// Create a new System V calling convention assigner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigner for functions and calls using `call_conv`.
    ///
    /// C, fast and cold calls follow the plain System V rules. The opaque
    /// `Stack` convention passes every argument in memory.
    pub fn for_call_conv(call_conv: CallConv) -> Self {
        let mut assigner = Self::new();
        if call_conv == CallConv::Stack {
            assigner.set_must_assign_stack();
        }
        assigner
    }

    /// Force remaining arguments to be assigned to stack.
    pub fn set_must_assign_stack(&mut self) {
        self.must_assign_stack = true;
    }

    /// Number of XMM argument registers used so far.
    pub fn xmm_used(&self) -> usize {
        self.xmm_cnt
    }

    /// Align a value up to the specified alignment.
    fn align_up(value: u32, align: u32) -> u32 {
        (value + align - 1) & !(align - 1)
    }

    fn assign_stack(&mut self, arg: &mut CCAssignment, size: u32, align: u32) {
        self.stack = Self::align_up(self.stack, align.max(8));
        arg.stack_off = Some(self.stack as i32);
        self.stack += Self::align_up(size.max(1), 8);
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        // Handle special attributes
        match arg.attribute {
            ArgAttribute::ByVal { size, align } => {
                // byval arguments are always passed on stack as a copy
                self.assign_stack(arg, size, align);
                return;
            }
            ArgAttribute::StructRet => {
                // sret is always the first argument and goes in RDI
                if self.gp_cnt == 0 {
                    arg.reg = Some(Self::GP_ARG_REGS[0]);
                    self.gp_cnt = 1;
                } else {
                    log::warn!("sret argument not first - assigning to stack");
                    self.assign_stack(arg, 8, 8);
                }
                return;
            }
            ArgAttribute::None => {}
        }

        match arg.bank {
            RegBank::GeneralPurpose => {
                let needed = arg.consecutive as usize;
                if !self.must_assign_stack && self.gp_cnt + needed <= Self::GP_ARG_REGS.len() {
                    arg.reg = Some(Self::GP_ARG_REGS[self.gp_cnt]);
                    if needed > 1 {
                        arg.reg_hi = Some(Self::GP_ARG_REGS[self.gp_cnt + 1]);
                    }
                    self.gp_cnt += needed;
                } else {
                    self.assign_stack(arg, arg.size, arg.align);
                }
            }
            RegBank::Xmm => {
                if !self.must_assign_stack && self.xmm_cnt < Self::XMM_ARG_REGS.len() {
                    arg.reg = Some(Self::XMM_ARG_REGS[self.xmm_cnt]);
                    self.xmm_cnt += 1;
                } else {
                    let size = Self::align_up(arg.size, 8);
                    self.assign_stack(arg, size, size.min(16));
                }
            }
        }
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        if matches!(arg.attribute, ArgAttribute::ByVal { .. }) {
            // Returned through the hidden sret pointer.
            return;
        }
        match arg.bank {
            RegBank::GeneralPurpose => {
                let needed = arg.consecutive as usize;
                if self.ret_gp_cnt + needed <= Self::RET_GP_REGS.len() {
                    arg.reg = Some(Self::RET_GP_REGS[self.ret_gp_cnt]);
                    if needed > 1 {
                        arg.reg_hi = Some(Self::RET_GP_REGS[self.ret_gp_cnt + 1]);
                    }
                    self.ret_gp_cnt += needed;
                }
            }
            RegBank::Xmm => {
                if self.ret_xmm_cnt < Self::RET_XMM_REGS.len() {
                    arg.reg = Some(Self::RET_XMM_REGS[self.ret_xmm_cnt]);
                    self.ret_xmm_cnt += 1;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
        self.stack = 0;
        self.must_assign_stack = false;
        self.ret_gp_cnt = 0;
        self.ret_xmm_cnt = 0;
    }

    fn get_stack_size(&self) -> u32 {
        // Align stack to 16-byte boundary as required by System V ABI
        Self::align_up(self.stack, 16)
    }
}

/// Argument and return placement of one call signature.
#[derive(Debug)]
pub struct CallLayout<'a> {
    pub args: BumpVec<'a, CCAssignment>,
    /// `None` for void returns.
    pub ret: Option<CCAssignment>,
    /// Hidden struct-return pointer, when the result is returned in memory.
    pub sret: Option<CCAssignment>,
    /// Bytes of outgoing stack arguments, 16-byte aligned.
    pub stack_size: u32,
    /// XMM registers used, reported in AL for variadic calls.
    pub xmm_used: u32,
}

impl<'a> CallLayout<'a> {
    /// Lay out a call passing `args` and returning `ret` under `call_conv`.
    pub fn compute(
        arena: &'a Bump,
        call_conv: CallConv,
        ret: &Type,
        args: &[Type],
    ) -> LoweringResult<Self> {
        let mut assigner = SysVAssigner::for_call_conv(call_conv);

        let mut ret_assignment = None;
        let mut sret = None;
        if !ret.is_void() {
            let mut assignment = CCAssignment::for_type(ret)?;
            assigner.assign_ret(&mut assignment);
            if !assignment.in_register() {
                let mut hidden =
                    CCAssignment::with_attribute(RegBank::GeneralPurpose, 8, 8, ArgAttribute::StructRet);
                assigner.assign_arg(&mut hidden);
                sret = Some(hidden);
            }
            ret_assignment = Some(assignment);
        }

        let mut assigned = BumpVec::with_capacity_in(args.len(), arena);
        for ty in args {
            let mut assignment = CCAssignment::for_type(ty)?;
            assigner.assign_arg(&mut assignment);
            assigned.push(assignment);
        }

        Ok(Self {
            args: assigned,
            ret: ret_assignment,
            sret,
            stack_size: assigner.get_stack_size(),
            xmm_used: assigner.xmm_used() as u32,
        })
    }
}

/// Stack frame of one function, addressed relative to rbp.
///
/// ```text
/// rbp + 16:  incoming stack arguments
/// rbp + 8:   return address
/// rbp:       saved rbp
/// rbp - X:   value slots, alloca storage and scratch
/// ```
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Total size of the stack frame below the saved rbp.
    pub frame_size: u32,
    /// Lowest allocated offset so far.
    slot_offset: i32,
    /// Every slot handed out, as (offset, size).
    pub slots: BumpVec<'a, (i32, u32)>,
}

impl<'a> FunctionFrame<'a> {
    /// Create a new function frame using the provided arena.
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            frame_size: 0,
            slot_offset: 0,
            slots: BumpVec::new_in(arena),
        }
    }

    /// Allocate a slot of `size` bytes aligned to `align` and return its rbp offset.
    ///
    /// Sizes are rounded to 8 bytes so whole-register accesses stay inside the slot.
    pub fn allocate_slot(&mut self, size: u32, align: u32) -> i32 {
        let aligned_size = size.max(1).div_ceil(8) * 8;
        let align = align.clamp(8, 16) as i32;
        self.slot_offset -= aligned_size as i32;
        self.slot_offset = -((-self.slot_offset + align - 1) / align * align);
        let offset = self.slot_offset;
        self.slots.push((offset, aligned_size));
        offset
    }

    /// Calculate the final frame size.
    pub fn calculate_frame_size(&mut self) {
        // Total frame size must be 16-byte aligned for System V ABI
        let used = (-self.slot_offset) as u32;
        self.frame_size = used.div_ceil(16) * 16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TypeRegistry;

    #[test]
    fn test_sysv_gp_argument_assignment() {
        let mut assigner = SysVAssigner::new();

        // First 6 GP arguments go to registers
        for i in 0..6 {
            let mut arg = CCAssignment::new(RegBank::GeneralPurpose, 8, 8);
            assigner.assign_arg(&mut arg);

            assert!(arg.stack_off.is_none());
            assert_eq!(arg.reg, Some(SysVAssigner::GP_ARG_REGS[i]));
        }

        // 7th argument should go to stack
        let mut arg7 = CCAssignment::new(RegBank::GeneralPurpose, 8, 8);
        assigner.assign_arg(&mut arg7);

        assert!(arg7.reg.is_none());
        assert_eq!(arg7.stack_off, Some(0));
        assert_eq!(assigner.get_stack_size(), 16);
    }

    #[test]
    fn test_two_register_aggregate_spills_whole() {
        let mut assigner = SysVAssigner::new();
        for _ in 0..5 {
            let mut arg = CCAssignment::new(RegBank::GeneralPurpose, 8, 8);
            assigner.assign_arg(&mut arg);
        }
        let mut pair = CCAssignment {
            consecutive: 2,
            ..CCAssignment::new(RegBank::GeneralPurpose, 16, 8)
        };
        assigner.assign_arg(&mut pair);
        assert!(pair.reg.is_none());
        assert_eq!(pair.stack_off, Some(0));
        assert_eq!(assigner.get_stack_size(), 16);
    }

    #[test]
    fn test_stack_convention_uses_memory_only() {
        let arena = Bump::new();
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let layout =
            CallLayout::compute(&arena, CallConv::Stack, &i32_ty, &[i32_ty.clone(), i32_ty.clone()])
                .unwrap();
        assert!(layout.args.iter().all(|a| a.reg.is_none()));
        assert_eq!(layout.args[0].stack_off, Some(0));
        assert_eq!(layout.args[1].stack_off, Some(8));
        assert_eq!(layout.ret.and_then(|r| r.reg), Some(AsmReg::RAX));
        assert_eq!(layout.stack_size, 16);

        let c = CallLayout::compute(&arena, CallConv::C, &i32_ty, &[i32_ty.clone()]).unwrap();
        assert_eq!(c.args[0].reg, Some(AsmReg::RDI));
        assert_eq!(c.stack_size, 0);
    }

    #[test]
    fn test_large_aggregate_uses_sret_and_byval() {
        let arena = Bump::new();
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let fields = vec![i32_ty.clone(); 5];
        let record = types.struct_type(&fields, false).unwrap();
        let layout = CallLayout::compute(&arena, CallConv::C, &record, &[record.clone()]).unwrap();

        assert_eq!(layout.sret.and_then(|s| s.reg), Some(AsmReg::RDI));
        assert!(layout.ret.is_some_and(|r| r.reg.is_none()));
        assert_eq!(layout.args[0].attribute, ArgAttribute::ByVal { size: 20, align: 4 });
        assert_eq!(layout.args[0].stack_off, Some(0));
        assert_eq!(layout.stack_size, 32);
    }

    #[test]
    fn test_classification() {
        let mut types = TypeRegistry::new();
        let i8_ty = types.i8();
        let i32_ty = types.i32();
        let i64_ty = types.i64();
        let v4 = types.vector_type(&i32_ty, 4).unwrap();
        let v8 = types.vector_type(&i32_ty, 8).unwrap();
        let pair = types.struct_type(&[i64_ty.clone(), i32_ty.clone()], false).unwrap();
        let packed = types.struct_type(&[i8_ty, i32_ty], true).unwrap();

        assert_eq!(classify(&i64_ty).unwrap(), ArgClass::Integer { regs: 1 });
        assert_eq!(classify(&v4).unwrap(), ArgClass::Sse);
        assert!(matches!(classify(&v8), Err(LoweringError::Unsupported { .. })));
        assert_eq!(classify(&pair).unwrap(), ArgClass::Integer { regs: 2 });
        assert_eq!(classify(&packed).unwrap(), ArgClass::Memory);
    }

    #[test]
    fn test_function_frame_slot_allocation() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);

        let slot1 = frame.allocate_slot(8, 8);
        let slot2 = frame.allocate_slot(4, 4);
        let slot3 = frame.allocate_slot(16, 16);

        // Slots should be allocated in descending order
        assert!(slot1 > slot2);
        assert!(slot2 > slot3);
        assert_eq!(slot1 % 8, 0);
        assert_eq!(slot2 % 8, 0);
        assert_eq!(slot3 % 16, 0);

        frame.calculate_frame_size();
        assert_eq!(frame.frame_size % 16, 0);
        assert!(frame.frame_size as i32 >= -slot3);
    }
}
