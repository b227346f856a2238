// Builders for the three end-to-end sample programs shared by the irgen binary and the tests.
//
// A: global AAA; foo2(a, *b) stores a + *b into AAA under the Stack convention; foo(req, a, b)
//    spills b, calls foo2 with a call-site Stack override and returns a + AAA; main fills a
//    five-field struct literal and calls foo. Leaves 48 in AAA and returns 80.
// B: main allocates a = 32 and b = 16 and returns a + b (48).
// C: main(v: <4 x i32>) inserts 12 at lane 1 of v and returns it.

//! Sample modules exercising the whole pipeline.

use crate::core::builder::Builder;
use crate::core::error::ConstructionResult;
use crate::core::module::{Attribute, CallConv, Linkage, Module, Value};
use crate::core::types::TypeRegistry;
use std::fmt;
use std::str::FromStr;

/// One of the bundled sample programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    A,
    B,
    C,
}

impl Sample {
    pub const ALL: [Sample; 3] = [Sample::A, Sample::B, Sample::C];

    /// Build the sample's module.
    pub fn build(self) -> ConstructionResult<Module> {
        match self {
            Sample::A => scenario_a(),
            Sample::B => scenario_b(),
            Sample::C => scenario_c(),
        }
    }

    /// Lower-case name used for artifact file names.
    pub fn name(self) -> &'static str {
        match self {
            Sample::A => "a",
            Sample::B => "b",
            Sample::C => "c",
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Sample {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(Sample::A),
            "b" => Ok(Sample::B),
            "c" => Ok(Sample::C),
            other => Err(format!("unknown sample '{other}' (expected a, b or c)")),
        }
    }
}

/// Calls through a Stack-convention helper that writes a global.
pub fn scenario_a() -> ConstructionResult<Module> {
    let mut types = TypeRegistry::new();
    let i32_ty = types.i32();
    let i32_ptr = types.pointer_type(&i32_ty)?;
    let req_ty = types.struct_type(&vec![i32_ty.clone(); 5], false)?;

    let mut module = Module::new("my_module");
    let aaa = module.add_global(&i32_ty, "AAA")?;
    let aaa_ptr = module.global_value(aaa)?;

    let foo2_ty = types.function_type(&i32_ty, &[i32_ty.clone(), i32_ptr], false)?;
    let foo2 = module.add_function(&foo2_ty, "foo2")?;
    module.add_attribute(foo2, Attribute::NoInline)?;
    module.set_linkage(foo2, Linkage::External)?;
    module.set_call_conv(foo2, CallConv::Stack)?;
    {
        let entry = module.append_block(foo2, "entry")?;
        let a = module.param(foo2, 0)?;
        let b = module.param(foo2, 1)?;
        let mut builder = Builder::new(&mut module);
        builder.position_at_end(entry);
        let loaded = builder.load(&b, "param1")?;
        let sum = builder.add(&a, &loaded, "add")?;
        builder.store(&sum, &aaa_ptr)?;
        builder.ret(&Value::const_i32(0))?;
    }

    let foo_ty = types.function_type(
        &i32_ty,
        &[req_ty.clone(), i32_ty.clone(), i32_ty.clone()],
        false,
    )?;
    let foo = module.add_function(&foo_ty, "foo")?;
    module.add_attribute(foo, Attribute::NoInline)?;
    module.set_linkage(foo, Linkage::External)?;
    module.set_call_conv(foo, CallConv::Stack)?;
    {
        let entry = module.append_block(foo, "entry")?;
        let a = module.param(foo, 1)?;
        let b = module.param(foo, 2)?;
        let mut builder = Builder::new(&mut module);
        builder.position_at_end(entry);
        let slot = builder.alloca(&i32_ty, "p2")?;
        builder.store(&b, &slot)?;
        builder.call_with_conv(foo2, &[a.clone(), slot], Some(CallConv::Stack), "foo2add")?;
        let global = builder.load(&aaa_ptr, "AAA")?;
        let sum = builder.add(&a, &global, "add")?;
        builder.ret(&sum)?;
    }

    let main_ty = types.function_type(&i32_ty, &[], false)?;
    let main = module.add_function(&main_ty, "main")?;
    let entry = module.append_block(main, "entry")?;
    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    let a = builder.alloca(&i32_ty, "a")?;
    builder.store(&Value::const_i32(32), &a)?;
    let b = builder.alloca(&i32_ty, "b")?;
    builder.store(&Value::const_i32(16), &b)?;
    let req = builder.alloca(&req_ty, "req")?;
    let b_val = builder.load(&b, "b_val")?;
    let a_val = builder.load(&a, "a_val")?;
    let mut req_val = builder.load(&req, "req")?;
    for field in 0..5u32 {
        req_val = builder.insert_value(&req_val, &Value::const_i32(field as i32), field, "field")?;
    }
    let result = builder.call_with_conv(
        foo,
        &[req_val, a_val, b_val],
        Some(CallConv::Stack),
        "ab_val",
    )?;
    builder.ret(&result)?;
    Ok(module)
}

/// Two stack slots added together.
pub fn scenario_b() -> ConstructionResult<Module> {
    let mut types = TypeRegistry::new();
    let i32_ty = types.i32();
    let main_ty = types.function_type(&i32_ty, &[], false)?;

    let mut module = Module::new("my_module");
    let main = module.add_function(&main_ty, "main")?;
    let entry = module.append_block(main, "entry")?;
    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    let a = builder.alloca(&i32_ty, "a")?;
    builder.store(&Value::const_i32(32), &a)?;
    let b = builder.alloca(&i32_ty, "b")?;
    builder.store(&Value::const_i32(16), &b)?;
    let b_val = builder.load(&b, "b_val")?;
    let a_val = builder.load(&a, "a_val")?;
    let sum = builder.add(&a_val, &b_val, "ab_val")?;
    builder.ret(&sum)?;
    Ok(module)
}

/// Vector lane replacement.
pub fn scenario_c() -> ConstructionResult<Module> {
    let mut types = TypeRegistry::new();
    let i32_ty = types.i32();
    let v4 = types.vector_type(&i32_ty, 4)?;
    let main_ty = types.function_type(&v4, &[v4.clone()], false)?;

    let mut module = Module::new("my_module");
    let main = module.add_function(&main_ty, "main")?;
    let entry = module.append_block(main, "entry")?;
    let v = module.param(main, 0)?;
    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    let inserted = builder.insert_element(&v, &Value::const_i32(12), &Value::const_i32(1), "insert")?;
    builder.ret(&inserted)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::interp::InterpreterBackend;
    use crate::backend::{ExecutionBackend, ExecutionEngine, GenericValue, JitOptions, VerifiedModule};
    use crate::core::verifier::StructuralVerifier;

    fn run(sample: Sample, args: &[GenericValue]) -> (GenericValue, impl ExecutionEngine) {
        let module = sample.build().unwrap();
        let verified = VerifiedModule::new(module, &StructuralVerifier).unwrap();
        let mut engine = InterpreterBackend
            .create_jit(&verified, &JitOptions::default())
            .unwrap();
        let result = engine.invoke("main", args).unwrap();
        (result, engine)
    }

    #[test]
    fn test_sample_names() {
        for sample in Sample::ALL {
            assert_eq!(sample.name().parse::<Sample>(), Ok(sample));
        }
        assert!("d".parse::<Sample>().is_err());
    }

    #[test]
    fn test_scenario_a() {
        let (result, engine) = run(Sample::A, &[]);
        assert_eq!(result.as_i32(), Some(80));
        assert_eq!(engine.read_global("AAA").unwrap().as_i32(), Some(48));
    }

    #[test]
    fn test_scenario_a_shape() {
        let module = scenario_a().unwrap();
        let foo = module.named_function("foo").unwrap();
        assert_eq!(foo.call_conv(), CallConv::Stack);
        assert!(foo.has_attribute(Attribute::NoInline));
        assert_eq!(module.functions().len(), 3);
        assert_eq!(module.globals().len(), 1);
    }

    #[test]
    fn test_scenario_b() {
        let (result, _) = run(Sample::B, &[]);
        assert_eq!(result.as_i32(), Some(48));
    }

    #[test]
    fn test_scenario_c() {
        let (result, _) = run(Sample::C, &[GenericValue::vector_i32(&[1, 2, 3, 4])]);
        assert_eq!(result.as_i32_lanes(), Some(vec![1, 12, 3, 4]));
    }
}
