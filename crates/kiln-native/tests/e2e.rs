//! End-to-end tests: kernels -> native module -> artifacts and back.

use std::sync::Arc;

use kiln_ir::{DType, Tensor};
use kiln_native::{build, BinOp, Kernel, KernelBody, NativeModule, Target, UnOp};

fn kernels() -> Vec<Arc<Kernel>> {
    vec![
        Arc::new(Kernel {
            name: "fused_add_0".to_string(),
            inputs: 2,
            outputs: 1,
            body: KernelBody::Binary { op: BinOp::Add, len: 4, dtype: DType::Float32 },
        }),
        Arc::new(Kernel {
            name: "fused_negative_1".to_string(),
            inputs: 1,
            outputs: 1,
            body: KernelBody::Unary { op: UnOp::Neg, len: 4, dtype: DType::Float32 },
        }),
    ]
}

#[test]
fn clif_round_trip_preserves_target_and_symbols() {
    let target = Target::parse("native -system-lib").unwrap();
    let module = build(&kernels(), &target).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernels.clif");
    module.save_to_file(&path, "").unwrap();

    let loaded = NativeModule::load_ir(&path).unwrap();
    assert_eq!(loaded.target().to_string(), "native -system-lib");
    assert!(loaded.is_system_module());
    let names: Vec<_> = loaded.function_names().collect();
    assert_eq!(names, vec!["fused_add_0", "fused_negative_1"]);
    assert_eq!(loaded.entry_name(), "fused_add_0");
}

#[test]
fn reloaded_module_still_jits() {
    let module = build(&kernels(), &Target::native()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernels.clif");
    module.save_to_file(&path, "clif").unwrap();

    let loaded = NativeModule::load_ir(&path).unwrap();
    let neg = loaded.get_function("fused_negative_1").unwrap().expect("kernel resolves");
    let mut input = Tensor::from_f32s(vec![4], &[1.0, -2.0, 3.0, -4.0]);
    let mut out = Tensor::from_f32s(vec![4], &[0.0; 4]);
    assert_eq!(neg.call_on_tensors(&mut [&mut input, &mut out]), 0);
    assert_eq!(out.as_f32s(), vec![-1.0, 2.0, -3.0, 4.0]);
}

#[test]
fn object_emission_produces_a_nonempty_artifact() {
    let module = build(&kernels(), &Target::native()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernels.o");
    // format chosen by extension
    module.save_to_file(&path, "").unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert!(!bytes.is_empty());
}

#[test]
fn unknown_format_fails_loudly() {
    let module = build(&kernels(), &Target::native()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernels.xyz");
    assert!(module.save_to_file(&path, "").is_err());
    assert!(module.get_source("xyz").is_err());
}

#[test]
fn textual_source_carries_the_target_flag() {
    let target = Target::parse("native -mcpu=skylake").unwrap();
    let module = build(&kernels(), &target).unwrap();
    let source = module.get_source("").unwrap();
    assert!(source.starts_with("; kiln_target = native -mcpu=skylake"));
    assert!(source.contains("; symbol = fused_add_0"));
}

#[test]
fn architecture_mismatch_is_fatal_at_jit_time() {
    // an arch that is not the host on any supported platform
    let target = Target::parse("native -target=riscv64gc-unknown-linux-gnu").unwrap();
    let module = build(&kernels(), &target).unwrap();
    if target_lexicon::Triple::host().architecture
        == target_lexicon::Architecture::Riscv64(target_lexicon::Riscv64Architecture::Riscv64gc)
    {
        return;
    }
    assert!(module.get_function("fused_add_0").is_err());
}
