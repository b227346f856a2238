//! Textual IR printer.
//!
//! Output uses LLVM assembly syntax with typed pointers (`i32*`). Local names
//! are made unique per function; unnamed values and blocks are numbered in
//! definition order, so printing a module that was parsed from printed text
//! reproduces that text exactly.

use crate::core::module::{
    Constant, Function, Global, InstId, Instruction, Module, Value, ValueKind,
};
use crate::core::types::{Type, TypeKind};
use hashbrown::{HashMap, HashSet};
use std::fmt::{self, Write};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print_module(self))
    }
}

/// Render `module` as textual IR.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; ModuleID = '{}'", module.name());
    if !module.globals().is_empty() {
        out.push('\n');
    }
    for global in module.globals() {
        print_global(&mut out, global);
    }
    for function in module.functions() {
        out.push('\n');
        print_function(&mut out, module, function);
    }
    out
}

fn is_plain_ident(name: &str) -> bool {
    let Some(first) = name.chars().next() else {
        return false;
    };
    let ident_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '$' | '.' | '_' | '-');
    if name.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    !first.is_ascii_digit() && name.chars().all(ident_char)
}

/// `name` as it appears after a `%` or `@` sigil or before a label colon.
pub(crate) fn quote_name(name: &str) -> String {
    if is_plain_ident(name) {
        return name.to_string();
    }
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        match c {
            '"' | '\\' => {
                let _ = write!(quoted, "\\{:02X}", c as u32);
            }
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn print_global(out: &mut String, global: &Global) {
    let _ = write!(out, "@{} = ", quote_name(global.name()));
    if let Some(linkage) = global.linkage().keyword() {
        let _ = write!(out, "{linkage} ");
    }
    let ty = global.value_type();
    let _ = write!(out, "global {ty} ");
    match global.initializer() {
        Some(init) => print_constant(out, init, ty),
        None => out.push_str("zeroinitializer"),
    }
    out.push('\n');
}

/// Unique local names for one function.
struct LocalNames {
    params: Vec<String>,
    blocks: Vec<String>,
    insts: HashMap<InstId, String>,
}

impl LocalNames {
    fn new(function: &Function) -> Self {
        let mut used = HashSet::new();
        let mut next = 0usize;
        let mut pick = |wanted: &str| -> String {
            if wanted.is_empty() {
                loop {
                    let candidate = next.to_string();
                    next += 1;
                    if used.insert(candidate.clone()) {
                        return candidate;
                    }
                }
            }
            if used.insert(wanted.to_string()) {
                return wanted.to_string();
            }
            let mut n = 1usize;
            loop {
                let candidate = format!("{wanted}{n}");
                if used.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        };

        let params = (0..function.param_count())
            .map(|i| pick(function.param_name(i).unwrap_or("")))
            .collect();
        let mut blocks = Vec::with_capacity(function.blocks().len());
        let mut insts = HashMap::new();
        for block in function.blocks() {
            blocks.push(pick(block.label()));
            for id in block.instructions() {
                if let Some(data) = function.inst(*id) {
                    if !data.ty().is_void() {
                        insts.insert(*id, pick(data.name()));
                    }
                }
            }
        }
        Self {
            params,
            blocks,
            insts,
        }
    }
}

fn print_function(out: &mut String, module: &Module, function: &Function) {
    let names = LocalNames::new(function);
    let sig = function.signature();
    let keyword = if function.is_declaration() { "declare" } else { "define" };
    let _ = write!(out, "{keyword} ");
    if let Some(linkage) = function.linkage().keyword() {
        let _ = write!(out, "{linkage} ");
    }
    if function.call_conv() != Default::default() {
        let _ = write!(out, "{} ", function.call_conv());
    }
    let _ = write!(out, "{} @{}(", sig.ret, quote_name(function.name()));
    for (i, param) in sig.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{param}");
        if !function.is_declaration() || function.param_name(i).is_some() {
            let _ = write!(out, " %{}", quote_name(&names.params[i]));
        }
    }
    if sig.variadic {
        if !sig.params.is_empty() {
            out.push_str(", ");
        }
        out.push_str("...");
    }
    out.push(')');
    for attribute in function.attributes() {
        let _ = write!(out, " {}", attribute.name());
    }
    if function.is_declaration() {
        out.push('\n');
        return;
    }
    out.push_str(" {\n");
    for (b, block) in function.blocks().iter().enumerate() {
        if b > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "{}:", quote_name(&names.blocks[b]));
        for id in block.instructions() {
            if let Some(data) = function.inst(*id) {
                out.push_str("  ");
                if let Some(name) = names.insts.get(id) {
                    let _ = write!(out, "%{} = ", quote_name(name));
                }
                print_instruction(out, module, function, &names, data.instruction(), data.ty());
                out.push('\n');
            }
        }
    }
    out.push_str("}\n");
}

fn print_instruction(
    out: &mut String,
    module: &Module,
    function: &Function,
    names: &LocalNames,
    inst: &Instruction,
    result: &Type,
) {
    let operand = |out: &mut String, value: &Value| print_operand(out, module, names, value);
    let typed = |out: &mut String, value: &Value| {
        let _ = write!(out, "{} ", value.ty());
        print_operand(out, module, names, value);
    };
    let label = |out: &mut String, block: usize| {
        let name = names.blocks.get(block).map(String::as_str).unwrap_or("?");
        let _ = write!(out, "label %{}", quote_name(name));
    };
    match inst {
        Instruction::Alloca { allocated } => {
            let _ = write!(out, "alloca {allocated}");
        }
        Instruction::Load { ptr } => {
            let _ = write!(out, "load {result}, ");
            typed(out, ptr);
        }
        Instruction::Store { value, ptr } => {
            out.push_str("store ");
            typed(out, value);
            out.push_str(", ");
            typed(out, ptr);
        }
        Instruction::Binary { op, lhs, rhs } => {
            let _ = write!(out, "{} ", op.keyword());
            typed(out, lhs);
            out.push_str(", ");
            operand(out, rhs);
        }
        Instruction::ICmp { pred, lhs, rhs } => {
            let _ = write!(out, "icmp {} ", pred.keyword());
            typed(out, lhs);
            out.push_str(", ");
            operand(out, rhs);
        }
        Instruction::Call {
            callee,
            args,
            call_conv,
        } => {
            out.push_str("call ");
            if let Some(cc) = call_conv {
                let _ = write!(out, "{cc} ");
            }
            let callee_name = module.function(*callee).map(|f| f.name()).unwrap_or("?");
            let _ = write!(out, "{result} @{}(", quote_name(callee_name));
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                typed(out, arg);
            }
            out.push(')');
        }
        Instruction::InsertValue {
            aggregate,
            element,
            index,
        } => {
            out.push_str("insertvalue ");
            typed(out, aggregate);
            out.push_str(", ");
            typed(out, element);
            let _ = write!(out, ", {index}");
        }
        Instruction::ExtractValue { aggregate, index } => {
            out.push_str("extractvalue ");
            typed(out, aggregate);
            let _ = write!(out, ", {index}");
        }
        Instruction::InsertElement {
            vector,
            element,
            lane,
        } => {
            out.push_str("insertelement ");
            typed(out, vector);
            out.push_str(", ");
            typed(out, element);
            out.push_str(", ");
            typed(out, lane);
        }
        Instruction::ExtractElement { vector, lane } => {
            out.push_str("extractelement ");
            typed(out, vector);
            out.push_str(", ");
            typed(out, lane);
        }
        Instruction::Ret { value } => match value {
            Some(value) => {
                out.push_str("ret ");
                typed(out, value);
            }
            None => out.push_str("ret void"),
        },
        Instruction::Br { dest } => {
            out.push_str("br ");
            label(out, foreign_or_index(function, dest.func(), dest.index()));
        }
        Instruction::CondBr {
            cond,
            then_dest,
            else_dest,
        } => {
            out.push_str("br ");
            typed(out, cond);
            out.push_str(", ");
            label(out, foreign_or_index(function, then_dest.func(), then_dest.index()));
            out.push_str(", ");
            label(out, foreign_or_index(function, else_dest.func(), else_dest.index()));
        }
        Instruction::Unreachable => out.push_str("unreachable"),
    }
}

fn foreign_or_index(function: &Function, func: crate::core::module::FuncId, index: usize) -> usize {
    if func == function.id() {
        index
    } else {
        usize::MAX
    }
}

fn print_operand(out: &mut String, module: &Module, names: &LocalNames, value: &Value) {
    match value.kind() {
        ValueKind::Const(constant) => print_constant(out, constant, value.ty()),
        ValueKind::Param { index, .. } => {
            let name = names.params.get(*index as usize).map(String::as_str).unwrap_or("?");
            let _ = write!(out, "%{}", quote_name(name));
        }
        ValueKind::Inst(id) => {
            let name = names.insts.get(id).map(String::as_str).unwrap_or("?");
            let _ = write!(out, "%{}", quote_name(name));
        }
        ValueKind::Global(id) => {
            let name = module.global(*id).map(|g| g.name()).unwrap_or("?");
            let _ = write!(out, "@{}", quote_name(name));
        }
        ValueKind::Function(id) => {
            let name = module.function(*id).map(|f| f.name()).unwrap_or("?");
            let _ = write!(out, "@{}", quote_name(name));
        }
    }
}

fn sign_extend(bits: u128, width: u32) -> i128 {
    if width == 0 || width >= 128 {
        return bits as i128;
    }
    let shift = 128 - width;
    ((bits << shift) as i128) >> shift
}

fn print_constant(out: &mut String, constant: &Constant, ty: &Type) {
    match constant {
        Constant::Int(bits) => match ty.int_width() {
            Some(1) => out.push_str(if *bits & 1 == 1 { "true" } else { "false" }),
            Some(width) => {
                let _ = write!(out, "{}", sign_extend(*bits, width));
            }
            None => {
                let _ = write!(out, "{bits}");
            }
        },
        Constant::Undef => out.push_str("undef"),
        Constant::Zero => out.push_str("zeroinitializer"),
        Constant::Aggregate(elements) => {
            let element_types: Vec<Type> = match ty.kind() {
                TypeKind::Struct { fields, .. } => fields.clone(),
                TypeKind::Vector { elem, count } => vec![elem.clone(); *count as usize],
                _ => Vec::new(),
            };
            let (open, close) = match ty.kind() {
                TypeKind::Vector { .. } => ("<", ">"),
                TypeKind::Struct { packed: true, .. } => ("<{ ", " }>"),
                _ => ("{ ", " }"),
            };
            out.push_str(open);
            for (i, (element, element_ty)) in elements.iter().zip(&element_types).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{element_ty} ");
                print_constant(out, element, element_ty);
            }
            out.push_str(close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::Builder;
    use crate::core::module::{Attribute, CallConv};
    use crate::core::types::TypeRegistry;

    #[test]
    fn test_quote_name() {
        assert_eq!(quote_name("entry"), "entry");
        assert_eq!(quote_name("12"), "12");
        assert_eq!(quote_name("param 1"), "\"param 1\"");
        assert_eq!(quote_name("a\"b"), "\"a\\22b\"");
        assert_eq!(quote_name(""), "\"\"");
    }

    #[test]
    fn test_print_function() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let ptr = types.pointer_type(&i32_ty).unwrap();
        let fn_ty = types.function_type(&i32_ty, &[i32_ty.clone(), ptr.clone()], false).unwrap();
        let mut module = Module::new("my_module");
        let aaa = module.add_global(&i32_ty, "AAA").unwrap();
        let f = module.add_function(&fn_ty, "foo2").unwrap();
        module.add_attribute(f, Attribute::NoInline).unwrap();
        module.set_call_conv(f, CallConv::Fast).unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        let a = module.param(f, 0).unwrap();
        let b_ptr = module.param(f, 1).unwrap();
        let aaa_ptr = module.global_value(aaa).unwrap();

        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        let loaded = b.load(&b_ptr, "param 1").unwrap();
        let sum = b.add(&a, &loaded, "add").unwrap();
        b.store(&sum, &aaa_ptr).unwrap();
        b.ret(&Value::const_i32(0)).unwrap();

        let text = print_module(&module);
        let expected = "\
; ModuleID = 'my_module'

@AAA = global i32 zeroinitializer

define fastcc i32 @foo2(i32 %0, i32* %1) noinline {
entry:
  %\"param 1\" = load i32, i32* %1
  %add = add i32 %0, %\"param 1\"
  store i32 %add, i32* @AAA
  ret i32 0
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_print_constants() {
        let mut out = String::new();
        let v = Type::vector_of(&Type::int(32), 2);
        print_constant(&mut out, &Constant::Aggregate(vec![Constant::Int(1), Constant::Int(0xffff_ffff)]), &v);
        assert_eq!(out, "<i32 1, i32 -1>");

        out.clear();
        let packed = Type::structure(vec![Type::int(1), Type::int(8)], true);
        print_constant(&mut out, &Constant::Aggregate(vec![Constant::Int(1), Constant::Undef]), &packed);
        assert_eq!(out, "<{ i1 true, i8 undef }>");
    }
}
