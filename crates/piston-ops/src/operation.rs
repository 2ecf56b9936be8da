use glam::UVec3;

use crate::{
    ArgumentSet, Bhwc, BindError, BufferDescriptor, BufferId, DType, ElementwiseId, FusionError,
    Linkables, OperationDef, RVec, StorageType, Tensor, TensorDescriptor, TensorId, Tensors,
    TuningParameters,
    gpu::{
        CompiledKernel, CompilerOption, DeviceInfo, DispatchError, KernelBuildError,
        ProgramCache, CommandQueue,
        wgsl::{LINKED_OPERATIONS, insert_linked_code, render_kernel},
    },
    check_link_names, get_best_work_group, merge_operations,
};

/// Whether a tensor is an input or an output of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Src,
    Dst,
}

impl std::fmt::Display for TensorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorRole::Src => write!(f, "src"),
            TensorRole::Dst => write!(f, "dst"),
        }
    }
}

/// Structural contract of an operation violated by its bound tensors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantError {
    #[error("Wrong {role} arity. Expected {expected}, operation has {actual}.")]
    Arity {
        role: TensorRole,
        expected: usize,
        actual: usize,
    },
    #[error("No tensor bound to {role} {index}.")]
    MissingTensor { role: TensorRole, index: usize },
    #[error("Tensor bound to {role} {index} no longer exists.")]
    StaleTensor { role: TensorRole, index: usize },
    #[error("Storage mismatch on {role} {index}, expected {expected:?}, got {actual:?}.")]
    StorageMismatch {
        role: TensorRole,
        index: usize,
        expected: StorageType,
        actual: StorageType,
    },
    #[error("Wrong channel count on {role} {index}. Expected {expected}, got {actual}.")]
    ChannelsMismatch {
        role: TensorRole,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Shape mismatch between src {src} and dst {dst}.")]
    ShapeMismatch { src: Bhwc, dst: Bhwc },
    #[error("DType mismatch on {role} {index}, expected {expected}, got {actual}.")]
    DTypeMismatch {
        role: TensorRole,
        index: usize,
        expected: DType,
        actual: DType,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    KernelBuildError(#[from] KernelBuildError),
    #[error(transparent)]
    BindError(#[from] BindError),
    #[error(transparent)]
    FusionError(#[from] FusionError),
    #[error(transparent)]
    DispatchError(#[from] DispatchError),
    #[error(transparent)]
    InvariantError(#[from] InvariantError),
    #[error("{0} has not been compiled")]
    NotCompiled(String),
    #[error("Post compile check failed: {0}")]
    PostCompileCheck(String),
}

/// Everything `compile` needs from the environment.
pub struct CreationContext<'a> {
    pub device: &'a DeviceInfo,
    pub cache: &'a mut dyn ProgramCache,
    /// Used to read the shapes of already bound inputs.
    pub tensors: &'a Tensors,
}

/// State shared by every operation: definition, arguments, bound tensors, kernel and
/// dispatch geometry.
///
/// Move-only. The compiled kernel is a unique resource and is never duplicated.
#[derive(Debug)]
pub struct OperationState {
    pub(crate) definition: OperationDef,
    pub(crate) args: ArgumentSet,
    pub(crate) src: RVec<Option<TensorId>>,
    pub(crate) dst: RVec<Option<TensorId>>,
    pub(crate) kernel: Option<CompiledKernel>,
    pub(crate) work_group_size: UVec3,
    pub(crate) grid_size: UVec3,
    pub(crate) code: String,
    pub(crate) src_tensors_names: RVec<String>,
    pub(crate) dst_tensors_names: RVec<String>,
    pub(crate) compiler_options: RVec<CompilerOption>,
    pub(crate) linked_operations: RVec<ElementwiseId>,
}

impl OperationState {
    pub fn new(definition: OperationDef) -> Self {
        Self {
            definition,
            args: ArgumentSet::new(),
            src: RVec::new(),
            dst: RVec::new(),
            kernel: None,
            work_group_size: UVec3::new(8, 4, 1),
            grid_size: UVec3::ZERO,
            code: String::new(),
            src_tensors_names: RVec::new(),
            dst_tensors_names: RVec::new(),
            compiler_options: RVec::new(),
            linked_operations: RVec::new(),
        }
    }

    pub fn definition(&self) -> &OperationDef {
        &self.definition
    }

    pub fn args(&self) -> &ArgumentSet {
        &self.args
    }

    pub fn src(&self) -> &[Option<TensorId>] {
        &self.src
    }

    pub fn dst(&self) -> &[Option<TensorId>] {
        &self.dst
    }

    pub fn kernel(&self) -> Option<&CompiledKernel> {
        self.kernel.as_ref()
    }

    pub fn work_group_size(&self) -> UVec3 {
        self.work_group_size
    }

    pub fn grid_size(&self) -> UVec3 {
        self.grid_size
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn linked_operations(&self) -> &[ElementwiseId] {
        &self.linked_operations
    }

    pub fn compiler_options(&self) -> &[CompilerOption] {
        &self.compiler_options
    }

    pub fn add_compiler_option(&mut self, option: CompilerOption) {
        if !self.compiler_options.contains(&option) {
            self.compiler_options.push(option);
        }
    }

    /// The tensor bound to output `index`.
    pub fn dst_tensor<'t>(
        &self,
        tensors: &'t Tensors,
        index: usize,
    ) -> Result<&'t Tensor, InvariantError> {
        resolve(&self.dst, TensorRole::Dst, index, tensors)
    }

    pub fn src_tensor<'t>(
        &self,
        tensors: &'t Tensors,
        index: usize,
    ) -> Result<&'t Tensor, InvariantError> {
        resolve(&self.src, TensorRole::Src, index, tensors)
    }

    /// Channel count of the first input, if it is bound and alive.
    pub(crate) fn primary_src_channels(&self, tensors: &Tensors) -> Option<usize> {
        self.src
            .first()
            .copied()
            .flatten()
            .and_then(|id| tensors.get(id))
            .map(|t| t.shape.c)
    }

    fn validate_tensors(&self, tensors: &Tensors) -> Result<(), InvariantError> {
        let roles = [
            (TensorRole::Src, &self.src, self.definition.src_tensors()),
            (TensorRole::Dst, &self.dst, self.definition.dst_tensors()),
        ];
        for (role, bound, expected) in roles {
            if bound.len() != expected.len() {
                return Err(InvariantError::Arity {
                    role,
                    expected: expected.len(),
                    actual: bound.len(),
                });
            }
            for (index, desc) in expected.iter().enumerate() {
                let tensor = resolve(bound, role, index, tensors)?;
                check_descriptor(role, index, desc, &tensor.descriptor)?;
            }
        }
        Ok(())
    }

    /// Points tensor arguments at the bound handles and resolves the kernel bindings.
    fn bind(&mut self, tensors: &Tensors) -> Result<(), BindError> {
        let named = self
            .src_tensors_names
            .iter()
            .zip(self.src.iter())
            .chain(self.dst_tensors_names.iter().zip(self.dst.iter()));
        for (name, id) in named {
            if let Some(id) = id {
                self.args.bind_tensor_if_present(name, *id);
            }
        }
        if let Some(kernel) = self.kernel.as_mut() {
            self.args.bind(kernel, tensors)?;
        }
        Ok(())
    }
}

fn resolve<'t>(
    bound: &[Option<TensorId>],
    role: TensorRole,
    index: usize,
    tensors: &'t Tensors,
) -> Result<&'t Tensor, InvariantError> {
    let id = bound
        .get(index)
        .copied()
        .flatten()
        .ok_or(InvariantError::MissingTensor { role, index })?;
    tensors
        .get(id)
        .ok_or(InvariantError::StaleTensor { role, index })
}

fn check_descriptor(
    role: TensorRole,
    index: usize,
    expected: &TensorDescriptor,
    actual: &TensorDescriptor,
) -> Result<(), InvariantError> {
    if expected.storage != actual.storage {
        return Err(InvariantError::StorageMismatch {
            role,
            index,
            expected: expected.storage,
            actual: actual.storage,
        });
    }
    if expected.dtype != actual.dtype {
        return Err(InvariantError::DTypeMismatch {
            role,
            index,
            expected: expected.dtype,
            actual: actual.dtype,
        });
    }
    Ok(())
}

/// One invocation per (column, row, slice) of `shape`. The batch is folded into x
/// when every tensor of `definition` has a batch axis.
pub(crate) fn elementwise_grid(definition: &OperationDef, shape: Bhwc) -> UVec3 {
    let batch = if definition.is_batch_supported() {
        shape.b
    } else {
        1
    };
    UVec3::new(
        (shape.w * batch) as u32,
        shape.h as u32,
        shape.slices() as u32,
    )
}

fn set_slot(slots: &mut RVec<Option<TensorId>>, tensor: TensorId, index: usize) {
    if slots.len() <= index {
        slots.resize(index + 1, None);
    }
    slots[index] = Some(tensor);
}

/// A single GPU kernel instance and its compile, tune and dispatch lifecycle.
///
/// Implementors provide their state, a name and the dispatch grid; everything else is
/// provided. The kernel body kept in [`OperationState::code`] must contain the
/// [`LINKED_OPERATIONS`] marker line where attached elementwise operations run.
pub trait GpuOperation {
    fn name(&self) -> &str;

    fn state(&self) -> &OperationState;

    fn state_mut(&mut self) -> &mut OperationState;

    /// Number of invocations needed for the currently bound tensors.
    fn grid_size(&self, tensors: &Tensors) -> Result<UVec3, OperationError>;

    /// Hook to refresh operation specific arguments before each dispatch.
    fn bind_arguments(&mut self, _tensors: &Tensors) -> Result<(), OperationError> {
        Ok(())
    }

    /// Hook to check the shapes of bound tensors against each other and against the
    /// operation's own parameters. Runs after the generic checks of `update_params`.
    fn validate_shapes(&self, _tensors: &Tensors) -> Result<(), InvariantError> {
        Ok(())
    }

    /// Hook to reject a built kernel the device cannot run.
    fn post_compile_check(&self, _device: &DeviceInfo) -> Result<(), OperationError> {
        Ok(())
    }

    fn definition(&self) -> &OperationDef {
        &self.state().definition
    }

    /// Attaches an elementwise operation. Attachment order is execution order.
    fn add_operation(&mut self, operation: ElementwiseId) {
        self.state_mut().linked_operations.push(operation);
    }

    fn set_src(&mut self, tensor: TensorId, index: usize) {
        let state = self.state_mut();
        set_slot(&mut state.src, tensor, index);
        if let Some(name) = state.src_tensors_names.get(index) {
            state.args.bind_tensor_if_present(name, tensor);
        }
    }

    fn set_dst(&mut self, tensor: TensorId, index: usize) {
        let state = self.state_mut();
        set_slot(&mut state.dst, tensor, index);
        if let Some(name) = state.dst_tensors_names.get(index) {
            state.args.bind_tensor_if_present(name, tensor);
        }
    }

    /// Registers the next input as the tensor argument `name`.
    fn add_src_tensor(&mut self, name: &str, desc: TensorDescriptor) {
        let state = self.state_mut();
        state.args.add_tensor(name, desc, crate::AccessMode::Read);
        state.src_tensors_names.push(name.to_string());
    }

    fn add_src_buffer(&mut self, name: &str, desc: BufferDescriptor, buffer: BufferId) {
        self.state_mut().args.add_buffer(name, desc, buffer);
    }

    fn add_dst_tensor(&mut self, name: &str, desc: TensorDescriptor) {
        let state = self.state_mut();
        state.args.add_tensor(name, desc, crate::AccessMode::ReadWrite);
        state.dst_tensors_names.push(name.to_string());
    }

    /// Validates the bound tensors and recomputes the grid size from their shapes.
    ///
    /// The work-group size is left as is.
    fn update_params(&mut self, tensors: &Tensors) -> Result<(), OperationError> {
        self.state().validate_tensors(tensors)?;
        self.validate_shapes(tensors)?;
        let grid = self.grid_size(tensors)?;
        self.state_mut().grid_size = grid;
        Ok(())
    }

    /// Fuses attached operations into the kernel body and builds the kernel.
    fn compile(
        &mut self,
        ctx: &mut CreationContext<'_>,
        linkables: &mut Linkables,
    ) -> Result<(), OperationError> {
        build_kernel(self, ctx, linkables)
    }

    /// Picks the work-group size for the current grid. Only the work-group size changes.
    fn tune(
        &mut self,
        params: &mut TuningParameters<'_>,
        tensors: &Tensors,
    ) -> Result<(), OperationError> {
        prepare_dispatch(self, tensors)?;
        let state = self.state();
        let Some(kernel) = state.kernel.as_ref() else {
            return Err(OperationError::NotCompiled(self.name().to_string()));
        };
        let work_group = get_best_work_group(params, kernel, state.grid_size)?;
        log::debug!(
            "Tuned {} for grid {}: work group {}",
            kernel.key(),
            state.grid_size,
            work_group
        );
        self.state_mut().work_group_size = work_group;
        Ok(())
    }

    /// Binds arguments and submits one dispatch with the stored geometry.
    fn add_to_queue(
        &mut self,
        queue: &mut dyn CommandQueue,
        tensors: &Tensors,
    ) -> Result<(), OperationError> {
        prepare_dispatch(self, tensors)?;
        let state = self.state();
        let Some(kernel) = state.kernel.as_ref() else {
            return Err(OperationError::NotCompiled(self.name().to_string()));
        };
        queue.dispatch(kernel, state.grid_size, state.work_group_size)?;
        Ok(())
    }
}

fn prepare_dispatch<O: GpuOperation + ?Sized>(
    op: &mut O,
    tensors: &Tensors,
) -> Result<(), OperationError> {
    if op.state().kernel.is_none() {
        return Err(OperationError::NotCompiled(op.name().to_string()));
    }
    op.bind_arguments(tensors)?;
    op.state_mut().bind(tensors)?;
    Ok(())
}

/// Merges linked operations into the body held in `code`, renders it and builds it.
pub(crate) fn build_kernel<O: GpuOperation + ?Sized>(
    op: &mut O,
    ctx: &mut CreationContext<'_>,
    linkables: &mut Linkables,
) -> Result<(), OperationError> {
    let state = op.state();
    let linked = state.linked_operations.clone();
    if !linked.is_empty() && !state.code.contains(LINKED_OPERATIONS) {
        return Err(FusionError::MissingLinkMarker(op.name().to_string()).into());
    }
    let primary_channels = state.primary_src_channels(ctx.tensors);
    check_link_names(&linked, linkables, &state.args)?;

    let merged = merge_operations(&linked, linkables, primary_channels)?;
    let label = op.name().to_string();
    let state = op.state_mut();
    state.args.merge(merged.args)?;
    for source in merged.src_tensors {
        let index = state.definition.src_tensors().len();
        state.definition.push_src_tensor(source.desc);
        state.src_tensors_names.push(source.name);
        match source.tensor {
            Some(tensor) => set_slot(&mut state.src, tensor, index),
            None if state.src.len() <= index => state.src.resize(index + 1, None),
            None => {}
        }
    }
    if let Some(body) = insert_linked_code(&state.code, &merged.code) {
        state.code = body;
    }

    let options = state.compiler_options.clone();
    let source = render_kernel(
        &label,
        &state.definition,
        &state.args,
        &state.code,
        &options,
    )?;
    let kernel = ctx.cache.get_or_create_kernel(&source, &options, ctx.device)?;
    log::debug!(
        "Compiled {} with {} linked operations",
        kernel.key(),
        linked.len()
    );
    state.kernel = Some(kernel);

    if let Err(e) = op.post_compile_check(ctx.device) {
        op.state_mut().kernel = None;
        return Err(e);
    }
    Ok(())
}
