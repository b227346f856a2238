//! End-to-end runs of the sample programs.

use irgen::backend::interp::InterpreterBackend;
use irgen::samples::Sample;
use irgen::{
    parse_module, print_module, ExecutionBackend, ExecutionEngine, ExecutionError, GenericValue,
    JitOptions, StructuralVerifier, VerifiedModule,
};

fn verified(sample: Sample) -> VerifiedModule {
    let module = sample.build().unwrap();
    VerifiedModule::new(module, &StructuralVerifier).unwrap()
}

#[test]
fn scenario_a_writes_global_and_returns_sum() {
    let _ = env_logger::builder().is_test(true).try_init();

    let verified = verified(Sample::A);
    let mut engine = InterpreterBackend
        .create_jit(&verified, &JitOptions::default())
        .unwrap();
    assert_eq!(engine.read_global("AAA").unwrap().as_i32(), Some(0));

    let result = engine.invoke("main", &[]).unwrap();
    assert_eq!(result.as_i32(), Some(80));
    assert_eq!(engine.read_global("AAA").unwrap().as_i32(), Some(48));

    // foo can also be entered directly with an explicit record
    let req = GenericValue::Aggregate((0..5).map(GenericValue::from_i32).collect());
    let result = engine
        .invoke("foo", &[req, GenericValue::from_i32(1), GenericValue::from_i32(2)])
        .unwrap();
    assert_eq!(result.as_i32(), Some(4));
    assert_eq!(engine.read_global("AAA").unwrap().as_i32(), Some(3));
}

#[test]
fn scenario_b_adds_stack_slots() {
    let _ = env_logger::builder().is_test(true).try_init();

    let verified = verified(Sample::B);
    let mut engine = InterpreterBackend
        .create_jit(&verified, &JitOptions::default())
        .unwrap();
    assert_eq!(engine.invoke("main", &[]).unwrap().as_i32(), Some(48));
}

#[test]
fn scenario_c_replaces_lane() {
    let _ = env_logger::builder().is_test(true).try_init();

    let verified = verified(Sample::C);
    let mut engine = InterpreterBackend
        .create_jit(&verified, &JitOptions::default())
        .unwrap();
    let result = engine
        .invoke("main", &[GenericValue::vector_i32(&[1, 2, 3, 4])])
        .unwrap();
    assert_eq!(result.as_i32_lanes(), Some(vec![1, 12, 3, 4]));

    assert!(matches!(
        engine.invoke("main", &[GenericValue::from_i32(1)]),
        Err(ExecutionError::ArgumentMismatch { .. })
    ));
}

#[test]
fn samples_survive_a_text_round_trip() {
    for sample in Sample::ALL {
        let module = sample.build().unwrap();
        let printed = print_module(&module);
        let reparsed = parse_module(&printed).unwrap();

        assert_eq!(reparsed.functions().len(), module.functions().len());
        for (a, b) in module.functions().iter().zip(reparsed.functions()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.call_conv(), b.call_conv());
            assert_eq!(a.blocks().len(), b.blocks().len());
            for (block_a, block_b) in a.blocks().iter().zip(b.blocks()) {
                let term_a = block_a.terminator().and_then(|id| a.inst(id));
                let term_b = block_b.terminator().and_then(|id| b.inst(id));
                assert_eq!(
                    term_a.map(|data| data.instruction().opcode()),
                    term_b.map(|data| data.instruction().opcode())
                );
            }
        }
        assert_eq!(print_module(&reparsed), printed, "sample {sample}");
    }
}

#[test]
fn reparsed_sample_runs_the_same() {
    let text = print_module(&Sample::A.build().unwrap());
    let verified = VerifiedModule::new(parse_module(&text).unwrap(), &StructuralVerifier).unwrap();
    let mut engine = InterpreterBackend
        .create_jit(&verified, &JitOptions::default())
        .unwrap();
    assert_eq!(engine.invoke("main", &[]).unwrap().as_i32(), Some(80));
}

#[cfg(feature = "llvm")]
mod llvm {
    use super::*;
    use inkwell::context::Context;
    use irgen::llvm::{LlvmExecution, LlvmVerifier};

    #[test]
    fn scenarios_run_under_mcjit() {
        let _ = env_logger::builder().is_test(true).try_init();
        let context = Context::create();
        let backend = LlvmExecution::new(&context);

        let a = VerifiedModule::new(Sample::A.build().unwrap(), &LlvmVerifier).unwrap();
        let mut engine = backend.create_jit(&a, &JitOptions::default()).unwrap();
        assert_eq!(engine.invoke("main", &[]).unwrap().as_i32(), Some(80));
        assert_eq!(engine.read_global("AAA").unwrap().as_i32(), Some(48));

        let b = VerifiedModule::new(Sample::B.build().unwrap(), &LlvmVerifier).unwrap();
        let mut engine = backend.create_jit(&b, &JitOptions::default()).unwrap();
        assert_eq!(engine.invoke("main", &[]).unwrap().as_i32(), Some(48));

        let c = VerifiedModule::new(Sample::C.build().unwrap(), &LlvmVerifier).unwrap();
        let mut engine = backend.create_jit(&c, &JitOptions::default()).unwrap();
        let result = engine
            .invoke("main", &[GenericValue::vector_i32(&[1, 2, 3, 4])])
            .unwrap();
        assert_eq!(result.as_i32_lanes(), Some(vec![1, 12, 3, 4]));
    }
}
