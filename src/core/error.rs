// This module defines the error taxonomy of irgen using the thiserror crate. Each pipeline
// stage owns one enum: ConstructionError is raised eagerly by the type registry, module
// builder and instruction builder (duplicate/unknown symbols, type mismatches, sealed
// functions, invalid type specs, missing insert point); Violation describes the first
// structural defect found by a verifier and is carried as a value rather than raised;
// LoweringError covers target selection and code emission; ExecutionError covers JIT
// creation and invocation; ParseError reports textual IR syntax errors with a position.
// The crate-level Error aggregates all of them for callers that drive the full pipeline,
// and each family has a Result alias in the style of CompileResult<T>.

//! Error types for the irgen pipeline.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

/// Errors raised while constructing types, symbols and instructions.
///
/// All of these are detected eagerly, at the call that caused them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("Duplicate symbol: {name}")]
    DuplicateSymbol { name: String },

    #[error("Unknown symbol: {name}")]
    UnknownSymbol { name: String },

    #[error("Type mismatch in {operation}: expected {expected}, found {found}")]
    TypeMismatch {
        operation: &'static str,
        expected: String,
        found: String,
    },

    #[error("Function {name} is sealed and can no longer be modified")]
    SealedFunction { name: String },

    #[error("Module {name} is sealed and can no longer be modified")]
    SealedModule { name: String },

    #[error("Invalid type specification: {reason}")]
    InvalidTypeSpec { reason: String },

    #[error("No insertion point set")]
    NoInsertPoint,
}

impl ConstructionError {
    pub(crate) fn mismatch(
        operation: &'static str,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        ConstructionError::TypeMismatch {
            operation,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn unknown(name: impl Into<String>) -> Self {
        ConstructionError::UnknownSymbol { name: name.into() }
    }
}

/// A structural violation reported by a verifier.
///
/// Violations are returned as values: callers may log them and keep going
/// for diagnostics, but a module with a violation never reaches lowering or
/// execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("Block {block} in function {function} has no terminator")]
    MissingTerminator { function: String, block: String },

    #[error("Terminator in the middle of block {block} in function {function}")]
    MisplacedTerminator { function: String, block: String },

    #[error("Dangling reference in function {function}: {detail}")]
    DanglingReference { function: String, detail: String },

    #[error("Type mismatch in function {function}: {detail}")]
    TypeMismatch { function: String, detail: String },

    #[error("Duplicate symbol: {name}")]
    DuplicateSymbol { name: String },

    #[error("Function {function} has conflicting attributes {first} and {second}")]
    ConflictingAttributes {
        function: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("Backend verifier rejected the module: {message}")]
    Backend { message: String },
}

/// Errors raised while selecting a target or lowering a module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    #[error("Target descriptors have not been initialized")]
    TargetsNotInitialized,

    #[error("Unknown target triple: {triple}")]
    UnknownTarget { triple: String },

    #[error("Unsupported CPU {cpu} for target {target}")]
    UnsupportedCpu { cpu: String, target: String },

    #[error("Unsupported by target {target}: {reason}")]
    Unsupported { target: String, reason: String },

    #[error("Instruction encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("Object file generation failed: {reason}")]
    Object { reason: String },

    #[error("Backend lowering failed: {message}")]
    Backend { message: String },
}

/// Errors raised while creating an execution engine or invoking a function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("JIT initialization failed: {reason}")]
    JitInit { reason: String },

    #[error("Unknown symbol: {name}")]
    UnknownSymbol { name: String },

    #[error("Argument mismatch calling {function}: {detail}")]
    ArgumentMismatch { function: String, detail: String },

    #[error("Runtime fault in {function}: {detail}")]
    Fault { function: String, detail: String },

    #[error("Execution backend failed: {message}")]
    Backend { message: String },
}

/// Syntax or semantic error while reading textual IR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Aggregate error for callers that drive the whole pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error("Verification failed: {0}")]
    Verification(#[from] Violation),

    #[error(transparent)]
    Lowering(#[from] LoweringError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Parse error at {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for construction operations.
pub type ConstructionResult<T> = Result<T, ConstructionError>;

/// Result type alias for lowering operations.
pub type LoweringResult<T> = Result<T, LoweringError>;

/// Result type alias for execution operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;
