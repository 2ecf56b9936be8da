use std::time::Duration;

use glam::UVec3;
use piston_ops::{
    Bhwc, BindError, BufferDescriptor, CalculationsPrecision, Conv2d1x1, CreationContext, DType,
    ElementwiseKind, ElementwiseOperation, GpuOperation, InvariantError, Linkables, OperationDef,
    OperationError, TensorDescriptor, TensorRole, Tensors, TuningBudget, TuningParameters,
    TuningType,
    gpu::{DeviceInfo, KernelBuildError},
    rvec,
    test_utils::RecordingBackend,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compile(
    op: &mut impl GpuOperation,
    backend: &mut RecordingBackend,
    tensors: &Tensors,
    linkables: &mut Linkables,
) -> Result<(), OperationError> {
    let device = backend.device.clone();
    let mut ctx = CreationContext {
        device: &device,
        cache: backend,
        tensors,
    };
    op.compile(&mut ctx, linkables)
}

fn tune(
    op: &mut impl GpuOperation,
    backend: &mut RecordingBackend,
    tensors: &Tensors,
    tuning_type: TuningType,
    budget: TuningBudget,
) -> Result<(), OperationError> {
    let device = backend.device.clone();
    let mut params = TuningParameters::new(backend, &device)
        .with_type(tuning_type)
        .with_budget(budget);
    op.tune(&mut params, tensors)
}

fn f32_def() -> OperationDef {
    OperationDef::unary(CalculationsPrecision::F32, TensorDescriptor::f32())
}

struct Conv {
    op: Conv2d1x1,
    tensors: Tensors,
    backend: RecordingBackend,
}

fn bound_conv(mut backend: RecordingBackend, def: OperationDef, src: Bhwc, dst_channels: usize) -> Conv {
    let mut tensors = Tensors::new();
    let weights = backend.create_buffer(4096);
    let desc = def.src_tensors()[0];
    let mut op = Conv2d1x1::new(def, src.c, dst_channels, weights);
    let src_id = backend.create_tensor(&mut tensors, src, desc);
    let dst_id = backend.create_tensor(
        &mut tensors,
        Bhwc::new(src.b, src.h, src.w, dst_channels),
        desc,
    );
    op.set_src(src_id, 0);
    op.set_dst(dst_id, 0);
    Conv {
        op,
        tensors,
        backend,
    }
}

#[test]
fn test_reduced_precision_without_attachments() -> anyhow::Result<()> {
    init();
    let device = DeviceInfo {
        supports_f16: true,
        ..Default::default()
    };
    let def = OperationDef::unary(CalculationsPrecision::F16, TensorDescriptor::f16());
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::new(device), def, Bhwc::new(1, 2, 2, 4), 4);

    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    assert_eq!(op.state().grid_size(), UVec3::new(2, 2, 1));

    let kernel = op.state().kernel().expect("compiled");
    let source = backend.source(kernel).expect("built here");
    assert!(source.code.starts_with("enable f16;"));
    assert!(source.code.contains("var acc = vec4<f16>(0.0);"));
    Ok(())
}

#[test]
fn test_f16_kernel_needs_device_support() {
    init();
    let def = OperationDef::unary(CalculationsPrecision::F16, TensorDescriptor::f16());
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), def, Bhwc::new(1, 2, 2, 4), 4);
    let err = compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key()).unwrap_err();
    assert!(matches!(
        err,
        OperationError::KernelBuildError(KernelBuildError::F16Unsupported { .. })
    ));
    assert!(op.state().kernel().is_none());
}

#[test]
fn test_update_params_recomputes_grid_only() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        mut tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(2, 3, 5, 8), 8);
    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    assert_eq!(op.state().grid_size(), UVec3::new(10, 3, 2));
    assert_eq!(op.state().work_group_size(), UVec3::new(8, 4, 1));

    let resized_src = backend.create_tensor(&mut tensors, Bhwc::new(1, 7, 9, 8), TensorDescriptor::f32());
    let resized_dst = backend.create_tensor(&mut tensors, Bhwc::new(1, 7, 9, 8), TensorDescriptor::f32());
    op.set_src(resized_src, 0);
    op.set_dst(resized_dst, 0);
    op.update_params(&tensors)?;
    assert_eq!(op.state().grid_size(), UVec3::new(9, 7, 2));
    assert_eq!(op.state().work_group_size(), UVec3::new(8, 4, 1));
    Ok(())
}

#[test]
fn test_update_params_validates_bound_tensors() {
    init();
    let mut backend = RecordingBackend::default();
    let mut tensors = Tensors::new();
    let mut op = ElementwiseOperation::new(f32_def(), ElementwiseKind::Relu { clip: None, alpha: 0.0 });

    let src = backend.create_tensor(&mut tensors, Bhwc::new(1, 2, 2, 4), TensorDescriptor::f32());
    op.set_src(src, 0);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::Arity {
            role: TensorRole::Dst,
            expected: 1,
            actual: 0
        }))
    ));

    let half = backend.create_tensor(&mut tensors, Bhwc::new(1, 2, 2, 4), TensorDescriptor::f16());
    op.set_dst(half, 0);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::DTypeMismatch {
            role: TensorRole::Dst,
            expected: DType::F32,
            actual: DType::F16,
            ..
        }))
    ));

    let dst = backend.create_tensor(&mut tensors, Bhwc::new(1, 2, 2, 4), TensorDescriptor::f32());
    op.set_dst(dst, 0);
    assert!(op.update_params(&tensors).is_ok());

    tensors.remove(src);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::StaleTensor {
            role: TensorRole::Src,
            index: 0
        }))
    ));

    let two_inputs = OperationDef::new(
        CalculationsPrecision::F32,
        rvec![TensorDescriptor::f32(), TensorDescriptor::f32()],
        rvec![TensorDescriptor::f32()],
    );
    let mut add = ElementwiseOperation::new(two_inputs, ElementwiseKind::Add { channels: 4 });
    add.set_src(dst, 1);
    add.set_dst(dst, 0);
    assert!(matches!(
        add.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::MissingTensor {
            role: TensorRole::Src,
            index: 0
        }))
    ));
}

#[test]
fn test_update_params_rejects_mismatched_shapes() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        mut tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 4, 4, 8), 8);
    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    let grid = op.state().grid_size();

    let narrow_src = backend.create_tensor(&mut tensors, Bhwc::new(1, 4, 4, 4), TensorDescriptor::f32());
    let src = op.state().src()[0].expect("bound");
    op.set_src(narrow_src, 0);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::ChannelsMismatch {
            role: TensorRole::Src,
            index: 0,
            expected: 8,
            actual: 4
        }))
    ));
    op.set_src(src, 0);

    let wide_dst = backend.create_tensor(&mut tensors, Bhwc::new(1, 4, 4, 12), TensorDescriptor::f32());
    let dst = op.state().dst()[0].expect("bound");
    op.set_dst(wide_dst, 0);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::ChannelsMismatch {
            role: TensorRole::Dst,
            index: 0,
            expected: 8,
            actual: 12
        }))
    ));

    let taller_dst = backend.create_tensor(&mut tensors, Bhwc::new(1, 6, 4, 8), TensorDescriptor::f32());
    op.set_dst(taller_dst, 0);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::ShapeMismatch { src, dst }))
            if src == Bhwc::new(1, 4, 4, 8) && dst == Bhwc::new(1, 6, 4, 8)
    ));
    assert_eq!(op.state().grid_size(), grid);

    op.set_dst(dst, 0);
    op.update_params(&tensors)?;
    Ok(())
}

#[test]
fn test_lifecycle_requires_compile() {
    init();
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 4, 4, 4), 4);
    assert!(matches!(
        op.add_to_queue(&mut backend, &tensors),
        Err(OperationError::NotCompiled(ref name)) if name == "conv2d_1x1"
    ));
    assert!(matches!(
        tune(&mut op, &mut backend, &tensors, TuningType::Fast, TuningBudget::default()),
        Err(OperationError::NotCompiled(_))
    ));
    assert!(backend.dispatches.is_empty());
}

#[test]
fn test_tune_changes_only_work_group() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 16, 16, 8), 8);
    backend.cost_model = |_, work_group| {
        if work_group == UVec3::new(16, 2, 1) {
            Duration::from_nanos(1)
        } else {
            Duration::from_micros(1)
        }
    };
    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    let grid = op.state().grid_size();
    let key = op.state().kernel().map(|k| k.key().clone());

    tune(&mut op, &mut backend, &tensors, TuningType::Exhaustive, TuningBudget::default())?;
    assert_eq!(op.state().work_group_size(), UVec3::new(16, 2, 1));
    assert_eq!(op.state().grid_size(), grid);
    assert_eq!(op.state().kernel().map(|k| k.key().clone()), key);
    assert!(backend.dispatches.is_empty());
    assert!(backend.profiles.contains(&UVec3::new(16, 2, 1)));
    assert_eq!(backend.builds, 1);
    Ok(())
}

#[test]
fn test_tune_ties_keep_first_candidate_and_respect_budget() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 16, 16, 8), 8);
    backend.cost_model = |_, _| Duration::from_nanos(10);
    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;

    let budget = TuningBudget {
        max_candidates: 3,
        time_limit: Duration::from_secs(60),
    };
    tune(&mut op, &mut backend, &tensors, TuningType::Exhaustive, budget)?;
    assert_eq!(backend.profiles.len(), 3);
    assert_eq!(op.state().work_group_size(), backend.profiles[0]);
    assert_eq!(backend.profiles[0], UVec3::new(16, 16, 1));

    tune(&mut op, &mut backend, &tensors, TuningType::Fast, budget)?;
    assert_eq!(op.state().work_group_size(), UVec3::new(16, 16, 1));
    assert_eq!(backend.profiles.len(), 3);
    Ok(())
}

#[test]
fn test_tuned_work_groups_fit_device() -> anyhow::Result<()> {
    init();
    let device = DeviceInfo {
        max_work_group_size: UVec3::new(64, 4, 1),
        max_work_group_invocations: 64,
        ..Default::default()
    };
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::new(device.clone()), f32_def(), Bhwc::new(2, 40, 40, 16), 8);
    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    tune(&mut op, &mut backend, &tensors, TuningType::Exhaustive, TuningBudget::default())?;

    for work_group in backend.profiles.iter().chain([op.state().work_group_size()].iter()) {
        assert!(work_group.cmple(device.max_work_group_size).all());
        assert!(work_group.element_product() <= device.max_work_group_invocations);
    }
    Ok(())
}

#[test]
fn test_fused_dispatch_binds_every_argument() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        mut tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 4, 4, 8), 8);
    let mut linkables = Linkables::with_key();
    let bias = backend.create_buffer(32);
    let residual = backend.create_tensor(&mut tensors, Bhwc::new(1, 4, 4, 8), TensorDescriptor::f32());
    let bias_add = linkables.insert(ElementwiseOperation::new(
        f32_def(),
        ElementwiseKind::BiasAdd {
            bias,
            desc: BufferDescriptor::new(DType::F32, 2),
        },
    ));
    let mut add = ElementwiseOperation::new(f32_def(), ElementwiseKind::Add { channels: 8 });
    add.set_src(residual, 1);
    let add = linkables.insert(add);
    let clamp = linkables.insert(ElementwiseOperation::new(
        f32_def(),
        ElementwiseKind::Clamp { min: 0.0, max: 6.0 },
    ));
    op.add_operation(bias_add);
    op.add_operation(add);
    op.add_operation(clamp);

    compile(&mut op, &mut backend, &tensors, &mut linkables)?;
    op.update_params(&tensors)?;
    op.add_to_queue(&mut backend, &tensors)?;

    let kernel = op.state().kernel().expect("compiled");
    let names: Vec<_> = kernel.layout().storage.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["bias_link1", "dst_tensor", "src_tensor", "src_tensor_1_link2", "weights"]
    );

    let dispatch = &backend.dispatches[0];
    assert_eq!(dispatch.grid, UVec3::new(4, 4, 2));
    assert_eq!(dispatch.work_group, UVec3::new(8, 4, 1));
    assert_eq!(dispatch.bindings.storage[0], bias);
    assert_eq!(dispatch.bindings.storage[3], tensors.get(residual).unwrap().buffer);

    // dst, src and residual shapes, then max and min of the clamp.
    let params = &dispatch.bindings.params;
    assert_eq!(params.len(), 64);
    assert_eq!(&params[0..16], bytemuck::cast_slice::<u32, u8>(&[1, 4, 4, 2]));
    assert_eq!(&params[48..52], 6.0f32.to_le_bytes().as_slice());
    assert_eq!(&params[52..56], 0.0f32.to_le_bytes().as_slice());
    Ok(())
}

#[test]
fn test_linked_input_can_be_rebound_after_compile() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        mut tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 4, 4, 8), 8);
    let mut linkables = Linkables::with_key();
    let residual = backend.create_tensor(&mut tensors, Bhwc::new(1, 4, 4, 8), TensorDescriptor::f32());
    let mut add = ElementwiseOperation::new(f32_def(), ElementwiseKind::Add { channels: 8 });
    add.set_src(residual, 1);
    op.add_operation(linkables.insert(add));

    compile(&mut op, &mut backend, &tensors, &mut linkables)?;
    assert_eq!(op.definition().src_tensors().len(), 2);
    assert_eq!(op.state().src()[1], Some(residual));

    let next = backend.create_tensor(&mut tensors, Bhwc::new(1, 4, 4, 8), TensorDescriptor::f32());
    op.set_src(next, 1);
    op.update_params(&tensors)?;
    op.add_to_queue(&mut backend, &tensors)?;

    // dst_tensor, src_tensor, src_tensor_1_link1, weights
    let storage = &backend.dispatches[0].bindings.storage;
    assert_eq!(storage[2], tensors.get(next).unwrap().buffer);
    assert_ne!(storage[2], tensors.get(residual).unwrap().buffer);

    let misshapen = backend.create_tensor(&mut tensors, Bhwc::new(1, 2, 2, 8), TensorDescriptor::f32());
    op.set_src(misshapen, 1);
    assert!(matches!(
        op.update_params(&tensors),
        Err(OperationError::InvariantError(InvariantError::ShapeMismatch { .. }))
    ));
    Ok(())
}

#[test]
fn test_removed_tensor_fails_at_dispatch() -> anyhow::Result<()> {
    init();
    let Conv {
        mut op,
        mut tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 2, 2, 4), 4);
    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    let src = op.state().src()[0].expect("bound");
    tensors.remove(src);

    let err = op.add_to_queue(&mut backend, &tensors).unwrap_err();
    assert!(matches!(
        err,
        OperationError::BindError(BindError::StaleTensor(ref name)) if name == "src_tensor"
    ));
    assert!(backend.dispatches.is_empty());
    Ok(())
}

#[test]
fn test_identical_operations_share_a_kernel() -> anyhow::Result<()> {
    init();
    let Conv {
        op: mut first,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 2, 2, 4), 4);
    let weights = backend.create_buffer(64);
    let mut second = Conv2d1x1::new(f32_def(), 4, 4, weights);

    compile(&mut first, &mut backend, &tensors, &mut Linkables::with_key())?;
    compile(&mut second, &mut backend, &tensors, &mut Linkables::with_key())?;
    assert_eq!(backend.builds, 1);
    assert_eq!(
        first.state().kernel().map(|k| k.key().clone()),
        second.state().kernel().map(|k| k.key().clone())
    );
    Ok(())
}

#[test]
fn test_build_errors_propagate() {
    init();
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::default(), f32_def(), Bhwc::new(1, 2, 2, 4), 4);
    backend.fail_builds_containing = Some("clamp(".to_string());
    let mut linkables = Linkables::with_key();
    let clamp = linkables.insert(ElementwiseOperation::new(
        f32_def(),
        ElementwiseKind::Clamp { min: 0.0, max: 1.0 },
    ));
    op.add_operation(clamp);

    let err = compile(&mut op, &mut backend, &tensors, &mut linkables).unwrap_err();
    assert!(matches!(
        err,
        OperationError::KernelBuildError(KernelBuildError::Build { .. })
    ));
    assert_eq!(backend.builds, 0);
}

#[test]
fn test_post_compile_check_rejects_kernel() {
    init();
    let device = DeviceInfo {
        max_storage_buffers_per_stage: 2,
        ..Default::default()
    };
    let Conv {
        mut op,
        tensors,
        mut backend,
    } = bound_conv(RecordingBackend::new(device), f32_def(), Bhwc::new(1, 2, 2, 4), 4);
    let err = compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key()).unwrap_err();
    assert!(matches!(err, OperationError::PostCompileCheck(_)));
    assert!(op.state().kernel().is_none());
}

#[test]
fn test_standalone_elementwise_dispatch() -> anyhow::Result<()> {
    init();
    let mut backend = RecordingBackend::default();
    let mut tensors = Tensors::new();
    let shape = Bhwc::new(3, 5, 7, 6);
    let src = backend.create_tensor(&mut tensors, shape, TensorDescriptor::f32());
    let dst = backend.create_tensor(&mut tensors, shape, TensorDescriptor::f32());
    let mut op = ElementwiseOperation::new(
        f32_def(),
        ElementwiseKind::Relu {
            clip: Some(6.0),
            alpha: 0.0,
        },
    );
    op.set_src(src, 0);
    op.set_dst(dst, 0);

    compile(&mut op, &mut backend, &tensors, &mut Linkables::with_key())?;
    op.update_params(&tensors)?;
    op.add_to_queue(&mut backend, &tensors)?;

    let dispatch = &backend.dispatches[0];
    assert_eq!(dispatch.grid, UVec3::new(21, 5, 2));
    assert!(dispatch.key.as_str().starts_with("relu_"));
    let buffers = [
        tensors.get(dst).unwrap().buffer,
        tensors.get(src).unwrap().buffer,
    ];
    assert_eq!(dispatch.bindings.storage.as_slice(), buffers.as_slice());
    Ok(())
}
