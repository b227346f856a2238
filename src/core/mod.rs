// This module gathers the target-independent half of irgen: the interned type registry and
// its x86-64 SysV data layout, the module representation (globals, functions, blocks,
// instructions and typed values), the cursor-based instruction builder, control-flow
// analysis (reverse post-order and dominators) and the structural verifier. Nothing in
// here knows about machine code; backends consume a sealed, verified module through the
// traits in crate::backend.

//! Core IR infrastructure
//!
//! # Key Components
//!
//! ## Types (`types`, `layout`)
//! - Structurally compared, interned types
//! - Sizes, alignments and field offsets
//!
//! ## Module (`module`)
//! - Globals and functions sharing one symbol table
//! - Declared, Assembling and Sealed function states
//!
//! ## Construction (`builder`)
//! - Cursor at a block end or before an instruction
//! - Eager operand type checks
//!
//! ## Verification (`analyzer`, `verifier`)
//! - Terminators, dangling references and dominance

pub mod error;
pub mod types;
pub mod layout;
pub mod module;
pub mod builder;
pub mod analyzer;
pub mod verifier;

pub use error::{
    ConstructionError,
    ConstructionResult,
    Error,
    ExecutionError,
    ExecutionResult,
    LoweringError,
    LoweringResult,
    ParseError,
    Violation,
};

pub use types::{FunctionType, Type, TypeKind, TypeRegistry};

pub use module::{
    Attribute,
    BinaryOp,
    BlockId,
    CallConv,
    Constant,
    FuncId,
    Function,
    FunctionState,
    GlobalId,
    InstId,
    Instruction,
    IntPredicate,
    Linkage,
    Module,
    Value,
    ValueKind,
};

pub use builder::{Builder, Cursor, InsertPoint};
pub use analyzer::Analyzer;
pub use verifier::StructuralVerifier;
