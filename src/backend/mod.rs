// This module defines the adapter seams between the IR and the machinery that consumes it.
// Verifier checks a module and reports the first structural violation as a value.
// VerifiedModule is the only handle lowering and execution accept: it can only be produced
// by sealing a module and running a verifier over it, so an invalid module never reaches a
// backend. TargetLowering selects a target by triple, configures a machine (cpu, features,
// optimization level, relocation and code model) and emits assembly text or object bytes.
// ExecutionBackend creates an ExecutionEngine that invokes functions by name with typed
// GenericValue arguments. The native implementations live in crate::x64 (lowering) and
// interp (execution); the `llvm` feature adds inkwell-backed implementations of all three.

//! Backend adapter traits and shared configuration types.

pub mod interp;

use crate::core::error::{ExecutionError, ExecutionResult, LoweringResult, Violation};
use crate::core::layout;
use crate::core::module::{Constant, Function, Module};
use crate::core::types::{Type, TypeKind};
use std::fmt;
use std::sync::Arc;

/// Outcome of verifying a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid(Violation),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }

    pub fn into_result(self) -> Result<(), Violation> {
        match self {
            Verification::Valid => Ok(()),
            Verification::Invalid(violation) => Err(violation),
        }
    }
}

/// Structural checker for modules. Never panics; never mutates.
pub trait Verifier {
    fn verify(&self, module: &Module) -> Verification;
}

/// A sealed module that passed verification.
///
/// Cloning is cheap and the handle can be shared across threads.
#[derive(Debug, Clone)]
pub struct VerifiedModule {
    module: Arc<Module>,
}

/// A module that failed verification, returned for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{violation}")]
pub struct Rejected {
    pub module: Box<Module>,
    pub violation: Violation,
}

impl From<Rejected> for crate::core::error::Error {
    fn from(rejected: Rejected) -> Self {
        crate::core::error::Error::Verification(rejected.violation)
    }
}

impl VerifiedModule {
    /// Seal `module` and verify it with `verifier`.
    pub fn new<V: Verifier + ?Sized>(mut module: Module, verifier: &V) -> Result<Self, Rejected> {
        module.seal();
        match verifier.verify(&module) {
            Verification::Valid => {
                log::debug!("module {} verified", module.name());
                Ok(Self {
                    module: Arc::new(module),
                })
            }
            Verification::Invalid(violation) => {
                log::debug!("module {} rejected: {violation}", module.name());
                Err(Rejected {
                    module: Box::new(module),
                    violation,
                })
            }
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

/// Code generation optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

/// Relocation model for emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelocModel {
    #[default]
    Default,
    Static,
    Pic,
    DynamicNoPic,
}

/// Code model for emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeModel {
    #[default]
    Default,
    Small,
    Kernel,
    Medium,
    Large,
}

/// Target machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// CPU name; empty selects the generic CPU of the target.
    pub cpu: String,
    /// Comma separated feature list such as `+avx2,-sse4.1`.
    pub features: String,
    pub opt_level: OptLevel,
    pub reloc_model: RelocModel,
    pub code_model: CodeModel,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu: String::new(),
            features: String::new(),
            opt_level: OptLevel::Default,
            reloc_model: RelocModel::Static,
            code_model: CodeModel::Default,
        }
    }
}

/// Artifact kind produced by [`TargetLowering::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    AssemblyText,
    ObjectBytes,
}

/// Lowers verified modules to machine artifacts.
pub trait TargetLowering {
    type Target;
    type Machine;

    /// Register the available target descriptors. Must precede [`select_target`].
    ///
    /// [`select_target`]: TargetLowering::select_target
    fn initialize_targets(&mut self) -> LoweringResult<()>;

    fn select_target(&self, triple: &str) -> LoweringResult<Self::Target>;

    fn create_machine(
        &self,
        target: &Self::Target,
        triple: &str,
        config: &MachineConfig,
    ) -> LoweringResult<Self::Machine>;

    /// Emit `module` for `machine`. Assembly text is returned as UTF-8 bytes.
    fn emit(
        &self,
        machine: &Self::Machine,
        module: &VerifiedModule,
        kind: OutputKind,
    ) -> LoweringResult<Vec<u8>>;
}

/// Options for creating an execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOptions {
    pub opt_level: OptLevel,
    pub code_model: CodeModel,
    pub no_frame_pointer_elim: bool,
    pub fast_isel: bool,
    /// Maximum nesting of calls before an invocation faults.
    pub max_call_depth: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::None,
            code_model: CodeModel::Default,
            no_frame_pointer_elim: false,
            fast_isel: false,
            max_call_depth: 256,
        }
    }
}

/// Creates execution engines for verified modules.
pub trait ExecutionBackend {
    type Engine: ExecutionEngine;

    fn create_jit(&self, module: &VerifiedModule, options: &JitOptions)
        -> ExecutionResult<Self::Engine>;
}

/// Runs functions of one module. Global state persists between invocations.
pub trait ExecutionEngine {
    fn invoke(&mut self, name: &str, args: &[GenericValue]) -> ExecutionResult<GenericValue>;

    /// Current contents of a global variable.
    fn read_global(&self, name: &str) -> ExecutionResult<GenericValue>;
}

/// Check `args` against the signature of `function`.
pub(crate) fn check_arguments(function: &Function, args: &[GenericValue]) -> ExecutionResult<()> {
    let sig = function.signature();
    let arity_ok = if sig.variadic {
        args.len() >= sig.params.len()
    } else {
        args.len() == sig.params.len()
    };
    if !arity_ok {
        return Err(ExecutionError::ArgumentMismatch {
            function: function.name().to_string(),
            detail: format!("expected {} arguments, got {}", sig.params.len(), args.len()),
        });
    }
    for (i, (param, arg)) in sig.params.iter().zip(args).enumerate() {
        if !arg.conforms_to(param) {
            return Err(ExecutionError::ArgumentMismatch {
                function: function.name().to_string(),
                detail: format!("argument {i} is {arg}, expected {param}"),
            });
        }
    }
    Ok(())
}

/// A typed runtime value crossing the execution boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GenericValue {
    /// Result of a void function.
    Void,
    /// Integer bits, truncated to `width`.
    Int { width: u32, bits: u128 },
    /// Engine-specific address.
    Pointer(u64),
    /// Struct fields or vector lanes, in order.
    Aggregate(Vec<GenericValue>),
}

fn truncate(bits: u128, width: u32) -> u128 {
    if width >= 128 {
        bits
    } else {
        bits & ((1u128 << width) - 1)
    }
}

impl GenericValue {
    pub fn int(width: u32, value: i128) -> Self {
        GenericValue::Int {
            width,
            bits: truncate(value as u128, width),
        }
    }

    pub fn from_i32(value: i32) -> Self {
        Self::int(32, i128::from(value))
    }

    pub fn from_i64(value: i64) -> Self {
        Self::int(64, i128::from(value))
    }

    pub fn vector_i32(lanes: &[i32]) -> Self {
        GenericValue::Aggregate(lanes.iter().map(|&lane| Self::from_i32(lane)).collect())
    }

    /// Sign-extended integer value.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            GenericValue::Int { width, bits } => {
                if width == 0 || width >= 128 {
                    return Some(bits as i128);
                }
                let shift = 128 - width;
                Some(((bits << shift) as i128) >> shift)
            }
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i128().and_then(|v| i32::try_from(v).ok())
    }

    pub fn elements(&self) -> Option<&[GenericValue]> {
        match self {
            GenericValue::Aggregate(elements) => Some(elements),
            _ => None,
        }
    }

    /// Lanes of an integer vector as sign-extended `i32`s.
    pub fn as_i32_lanes(&self) -> Option<Vec<i32>> {
        self.elements()?.iter().map(GenericValue::as_i32).collect()
    }

    /// Whether the value has the shape of `ty`.
    pub fn conforms_to(&self, ty: &Type) -> bool {
        match (self, ty.kind()) {
            (GenericValue::Void, TypeKind::Void) => true,
            (GenericValue::Int { width, .. }, TypeKind::Int(w)) => width == w,
            (GenericValue::Pointer(_), TypeKind::Pointer(_)) => true,
            (GenericValue::Aggregate(elements), TypeKind::Vector { elem, count }) => {
                elements.len() == *count as usize && elements.iter().all(|e| e.conforms_to(elem))
            }
            (GenericValue::Aggregate(elements), TypeKind::Struct { fields, .. }) => {
                elements.len() == fields.len()
                    && elements.iter().zip(fields).all(|(e, f)| e.conforms_to(f))
            }
            _ => false,
        }
    }

    /// Runtime value of an IR constant of type `ty`. Undef reads as zero.
    pub fn from_constant(ty: &Type, constant: &Constant) -> Self {
        match (constant, ty.kind()) {
            (Constant::Int(bits), TypeKind::Int(width)) => GenericValue::Int {
                width: *width,
                bits: truncate(*bits, *width),
            },
            (Constant::Aggregate(elements), TypeKind::Struct { fields, .. }) => {
                GenericValue::Aggregate(
                    fields
                        .iter()
                        .zip(elements)
                        .map(|(field, element)| Self::from_constant(field, element))
                        .collect(),
                )
            }
            (Constant::Aggregate(elements), TypeKind::Vector { elem, .. }) => {
                GenericValue::Aggregate(
                    elements
                        .iter()
                        .map(|element| Self::from_constant(elem, element))
                        .collect(),
                )
            }
            _ => Self::from_bytes(ty, &[]),
        }
    }

    /// Little-endian memory image of a value of type `ty`, laid out per [`layout`].
    pub fn to_bytes(&self, ty: &Type) -> Vec<u8> {
        let mut out = vec![0u8; layout::size_of(ty) as usize];
        self.write_bytes(ty, &mut out);
        out
    }

    fn write_bytes(&self, ty: &Type, out: &mut [u8]) {
        match (self, ty.kind()) {
            (GenericValue::Int { bits, .. }, TypeKind::Int(width)) => {
                let size = layout::int_store_size(*width) as usize;
                let bytes = bits.to_le_bytes();
                let n = size.min(out.len());
                out[..n].copy_from_slice(&bytes[..n]);
            }
            (GenericValue::Pointer(addr), TypeKind::Pointer(_)) => {
                let n = 8.min(out.len());
                out[..n].copy_from_slice(&addr.to_le_bytes()[..n]);
            }
            (GenericValue::Aggregate(elements), TypeKind::Vector { elem, .. }) => {
                let step = layout::size_of(elem) as usize;
                for (i, element) in elements.iter().enumerate() {
                    let start = i * step;
                    if start + step <= out.len() {
                        element.write_bytes(elem, &mut out[start..start + step]);
                    }
                }
            }
            (GenericValue::Aggregate(elements), TypeKind::Struct { fields, .. }) => {
                for (i, (element, field)) in elements.iter().zip(fields).enumerate() {
                    let start = layout::element_offset(ty, i as u32).unwrap_or(0) as usize;
                    let end = start + layout::size_of(field) as usize;
                    if end <= out.len() {
                        element.write_bytes(field, &mut out[start..end]);
                    }
                }
            }
            _ => {}
        }
    }

    /// Decode a value of type `ty` from its memory image.
    pub fn from_bytes(ty: &Type, bytes: &[u8]) -> Self {
        match ty.kind() {
            TypeKind::Void | TypeKind::Function(_) => GenericValue::Void,
            TypeKind::Int(width) => {
                let mut buf = [0u8; 16];
                let n = (layout::int_store_size(*width) as usize).min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                GenericValue::Int {
                    width: *width,
                    bits: truncate(u128::from_le_bytes(buf), *width),
                }
            }
            TypeKind::Pointer(_) => {
                let mut buf = [0u8; 8];
                let n = 8.min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                GenericValue::Pointer(u64::from_le_bytes(buf))
            }
            TypeKind::Vector { elem, count } => {
                let step = layout::size_of(elem) as usize;
                GenericValue::Aggregate(
                    (0..*count as usize)
                        .map(|i| {
                            let start = (i * step).min(bytes.len());
                            let end = (start + step).min(bytes.len());
                            Self::from_bytes(elem, &bytes[start..end])
                        })
                        .collect(),
                )
            }
            TypeKind::Struct { fields, .. } => GenericValue::Aggregate(
                fields
                    .iter()
                    .enumerate()
                    .map(|(i, field)| {
                        let start = (layout::element_offset(ty, i as u32).unwrap_or(0) as usize)
                            .min(bytes.len());
                        let end = (start + layout::size_of(field) as usize).min(bytes.len());
                        Self::from_bytes(field, &bytes[start..end])
                    })
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for GenericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenericValue::Void => write!(f, "void"),
            GenericValue::Int { width, .. } => match self.as_i128() {
                Some(v) => write!(f, "i{width} {v}"),
                None => write!(f, "i{width} ?"),
            },
            GenericValue::Pointer(addr) => write!(f, "ptr {addr:#x}"),
            GenericValue::Aggregate(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_value_sign_extension() {
        let v = GenericValue::int(8, -1);
        assert_eq!(v, GenericValue::Int { width: 8, bits: 0xff });
        assert_eq!(v.as_i32(), Some(-1));
        assert_eq!(GenericValue::int(1, 1).as_i128(), Some(-1));
    }

    #[test]
    fn test_generic_value_memory_image() {
        let i8_ty = Type::int(8);
        let i32_ty = Type::int(32);
        let record = Type::structure(vec![i8_ty, i32_ty.clone()], false);
        let value = GenericValue::Aggregate(vec![GenericValue::int(8, 7), GenericValue::from_i32(-2)]);
        assert!(value.conforms_to(&record));
        let bytes = value.to_bytes(&record);
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 7);
        assert_eq!(&bytes[4..8], &(-2i32).to_le_bytes());
        assert_eq!(GenericValue::from_bytes(&record, &bytes), value);

        let v4 = Type::vector_of(&i32_ty, 4);
        let lanes = GenericValue::vector_i32(&[1, 2, 3, 4]);
        assert!(lanes.conforms_to(&v4));
        assert!(!lanes.conforms_to(&record));
        assert_eq!(
            GenericValue::from_bytes(&v4, &lanes.to_bytes(&v4)).as_i32_lanes(),
            Some(vec![1, 2, 3, 4])
        );
    }
}
