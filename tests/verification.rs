//! Verification through the public API.

use irgen::{
    parse_module, print_module, Builder, CallConv, ConstructionError, Function, Instruction,
    Module, StructuralVerifier, TypeRegistry, Value, VerifiedModule, Verification, Verifier,
    Violation,
};

fn unterminated() -> (Module, irgen::BlockId, Value) {
    let mut types = TypeRegistry::new();
    let i32_ty = types.i32();
    let fn_ty = types.function_type(&i32_ty, &[], false).unwrap();
    let mut module = Module::new("m");
    let main = module.add_function(&fn_ty, "main").unwrap();
    let entry = module.append_block(main, "entry").unwrap();
    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    let sum = builder
        .add(&Value::const_i32(32), &Value::const_i32(16), "sum")
        .unwrap();
    (module, entry, sum)
}

#[test]
fn missing_terminator_is_reported_until_fixed() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut module, entry, sum) = unterminated();
    let first = StructuralVerifier.verify(&module);
    assert!(matches!(
        first,
        Verification::Invalid(Violation::MissingTerminator { .. })
    ));
    assert_eq!(StructuralVerifier.verify(&module), first);

    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    builder.ret(&sum).unwrap();
    assert!(StructuralVerifier.verify(&module).is_valid());
}

#[test]
fn rejected_module_is_returned_sealed() {
    let (module, entry, sum) = unterminated();
    let rejected = VerifiedModule::new(module, &StructuralVerifier).unwrap_err();
    assert!(matches!(
        rejected.violation,
        Violation::MissingTerminator { .. }
    ));

    let mut module = *rejected.module;
    assert!(module.is_sealed());
    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    assert!(matches!(
        builder.ret(&sum),
        Err(ConstructionError::SealedFunction { .. })
    ));
}

#[test]
fn aggregate_bounds_are_checked_at_construction() {
    let mut types = TypeRegistry::new();
    let i32_ty = types.i32();
    let pair = types.struct_type(&[i32_ty.clone(), i32_ty.clone()], false).unwrap();
    let v4 = types.vector_type(&i32_ty, 4).unwrap();
    let fn_ty = types.function_type(&pair, &[pair.clone(), v4.clone()], false).unwrap();
    let mut module = Module::new("bounds");
    let f = module.add_function(&fn_ty, "f").unwrap();
    let entry = module.append_block(f, "entry").unwrap();
    let record = module.param(f, 0).unwrap();
    let lanes = module.param(f, 1).unwrap();

    let mut builder = Builder::new(&mut module);
    builder.position_at_end(entry);
    let one = Value::const_i32(1);
    assert!(matches!(
        builder.insert_value(&record, &one, 2, "bad"),
        Err(ConstructionError::TypeMismatch { .. })
    ));
    let updated = builder.insert_value(&record, &one, 1, "ok").unwrap();
    assert_eq!(updated.ty(), &pair);

    assert!(matches!(
        builder.insert_element(&lanes, &one, &Value::const_i32(4), "bad"),
        Err(ConstructionError::TypeMismatch { .. })
    ));
    let lanes = builder
        .insert_element(&lanes, &one, &Value::const_i32(3), "ok")
        .unwrap();
    assert_eq!(lanes.ty(), &v4);

    builder.ret(&updated).unwrap();
    assert!(StructuralVerifier.verify(&module).is_valid());
}

/// Call-site conventions of every call in `function`, in block order.
fn call_site_convs(function: &Function) -> Vec<Option<CallConv>> {
    function
        .blocks()
        .iter()
        .flat_map(|block| block.instructions())
        .filter_map(|&id| match function.inst(id)?.instruction() {
            Instruction::Call { call_conv, .. } => Some(*call_conv),
            _ => None,
        })
        .collect()
}

#[test]
fn call_site_convention_differs_from_callee() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut types = TypeRegistry::new();
    let i32_ty = types.i32();
    let unary = types.function_type(&i32_ty, &[i32_ty.clone()], false).unwrap();
    let nullary = types.function_type(&i32_ty, &[], false).unwrap();
    let mut module = Module::new("override");
    let callee = module.add_function(&unary, "callee").unwrap();
    let main = module.add_function(&nullary, "main").unwrap();

    let body = module.append_block(callee, "entry").unwrap();
    let arg = module.param(callee, 0).unwrap();
    let entry = module.append_block(main, "entry").unwrap();
    let mut builder = Builder::new(&mut module);
    builder.position_at_end(body);
    builder.ret(&arg).unwrap();
    builder.position_at_end(entry);
    let plain = builder
        .call(callee, &[Value::const_i32(1)], "plain")
        .unwrap();
    let stacked = builder
        .call_with_conv(callee, &[plain], Some(CallConv::Stack), "stacked")
        .unwrap();
    builder.ret(&stacked).unwrap();

    assert_eq!(module.named_function("callee").unwrap().call_conv(), CallConv::C);
    assert_eq!(
        call_site_convs(module.named_function("main").unwrap()),
        vec![None, Some(CallConv::Stack)]
    );
    assert!(StructuralVerifier.verify(&module).is_valid());

    let printed = print_module(&module);
    assert!(printed.contains("call cc 1023 "), "{printed}");
    let reparsed = parse_module(&printed).unwrap();
    assert_eq!(reparsed.named_function("callee").unwrap().call_conv(), CallConv::C);
    assert_eq!(
        call_site_convs(reparsed.named_function("main").unwrap()),
        vec![None, Some(CallConv::Stack)]
    );
    assert_eq!(print_module(&reparsed), printed);

    let verified = VerifiedModule::new(reparsed, &StructuralVerifier).unwrap();
    assert!(verified.module().is_sealed());
}
