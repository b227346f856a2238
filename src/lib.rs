//! irgen - IR construction, verification, lowering and execution.
//!
//! irgen builds modules of an LLVM-flavoured SSA IR in memory, verifies them,
//! lowers them to x86-64 assembly text or ELF objects and executes them.
//!
//! # Primary Usage
//!
//! ```ignore
//! use irgen::backend::interp::InterpreterBackend;
//! use irgen::backend::{ExecutionBackend, ExecutionEngine, JitOptions, VerifiedModule};
//! use irgen::core::StructuralVerifier;
//! use irgen::samples::Sample;
//!
//! let module = Sample::B.build()?;
//! let verified = VerifiedModule::new(module, &StructuralVerifier)?;
//! let mut engine = InterpreterBackend.create_jit(&verified, &JitOptions::default())?;
//! let result = engine.invoke("main", &[])?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Types, modules, the instruction builder and verification
//! - [`backend`] - Adapter traits and the interpreter engine
//! - [`x64`] - Native x86-64 lowering (iced-x86, object)
//! - [`text`] - Textual IR printer and parser
//! - [`samples`] - End-to-end sample programs
//! - `llvm` - inkwell-backed adapters (feature `llvm`)

pub mod core;
pub mod backend;
pub mod x64;
pub mod text;
pub mod samples;

#[cfg(feature = "llvm")]
pub mod llvm;

pub use crate::core::{
    // Types
    FunctionType, Type, TypeKind, TypeRegistry,
    // Module
    Attribute, BlockId, CallConv, FuncId, Function, GlobalId, InstId, Instruction, Linkage,
    Module, Value, ValueKind,
    // Construction
    Builder, Cursor, InsertPoint,
    // Verification
    Analyzer, StructuralVerifier,
    // Errors
    ConstructionError, Error, ExecutionError, LoweringError, ParseError, Violation,
};
pub use crate::backend::{
    ExecutionBackend, ExecutionEngine, GenericValue, JitOptions, MachineConfig, OutputKind,
    TargetLowering, Verification, VerifiedModule, Verifier,
};
pub use crate::text::{parse_module, print_module};

/// Result type alias for whole-pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
