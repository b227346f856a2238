//! Textual IR.
//!
//! The syntax follows LLVM assembly with typed pointers. [`print_module`]
//! writes it (also available through `Display` on [`Module`]) and
//! [`parse_module`] reads it back; printing a parsed module reproduces the
//! printed text.
//!
//! [`Module`]: crate::core::module::Module

mod parser;
mod printer;

pub use parser::parse_module;
pub use printer::print_module;
