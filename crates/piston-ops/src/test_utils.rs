//! An in-memory backend that records instead of executing. Useful to test operation
//! lifecycles without a GPU.
use std::time::Duration;

use glam::UVec3;
use slotmap::SlotMap;

use crate::{
    Bhwc, BufferId, HashMap, Tensor, TensorDescriptor, TensorId, Tensors,
    gpu::{
        CommandQueue, CompiledKernel, CompilerOption, DeviceInfo, DispatchError, KernelBindings,
        KernelBuildError, KernelHandle, KernelKey, ProgramCache, validate_geometry,
        wgsl::{KernelSource, LINKED_OPERATIONS},
    },
};

#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub key: KernelKey,
    pub grid: UVec3,
    pub work_group: UVec3,
    pub bindings: KernelBindings,
}

/// Cost of one dispatch: every launched invocation plus a fixed overhead per work group.
pub fn default_cost_model(grid: UVec3, work_group: UVec3) -> Duration {
    let groups = (grid + work_group - UVec3::ONE) / work_group;
    let launched = groups.element_product() as u64 * work_group.element_product() as u64;
    Duration::from_nanos(launched + groups.element_product() as u64 * 64)
}

pub struct RecordingBackend {
    pub device: DeviceInfo,
    kernels: SlotMap<KernelHandle, KernelSource>,
    keys: HashMap<KernelKey, KernelHandle>,
    buffers: SlotMap<BufferId, u64>,
    /// Number of kernels actually built; cache hits are not counted.
    pub builds: usize,
    pub dispatches: Vec<RecordedDispatch>,
    /// Work groups passed to `profile`, in call order.
    pub profiles: Vec<UVec3>,
    /// Builds of sources containing this text fail.
    pub fail_builds_containing: Option<String>,
    pub cost_model: fn(UVec3, UVec3) -> Duration,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new(DeviceInfo::default())
    }
}

impl RecordingBackend {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            kernels: SlotMap::with_key(),
            keys: HashMap::default(),
            buffers: SlotMap::with_key(),
            builds: 0,
            dispatches: Vec::new(),
            profiles: Vec::new(),
            fail_builds_containing: None,
            cost_model: default_cost_model,
        }
    }

    pub fn create_buffer(&mut self, size: u64) -> BufferId {
        self.buffers.insert(size)
    }

    pub fn create_tensor(
        &mut self,
        tensors: &mut Tensors,
        shape: Bhwc,
        descriptor: TensorDescriptor,
    ) -> TensorId {
        let size = (shape.padded_len() * 4 * descriptor.dtype.size_of()) as u64;
        let buffer = self.create_buffer(size);
        tensors.insert(Tensor::new(shape, descriptor, buffer))
    }

    pub fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(buffer);
    }

    /// The source a compiled kernel was built from.
    pub fn source(&self, kernel: &CompiledKernel) -> Option<&KernelSource> {
        self.kernels.get(kernel.handle())
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.len()
    }

    fn check_dispatch<'k>(
        &self,
        kernel: &'k CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<&'k KernelBindings, DispatchError> {
        if !self.kernels.contains_key(kernel.handle()) {
            return Err(DispatchError::UnknownKernel(kernel.key().clone()));
        }
        let bindings = kernel
            .bindings()
            .ok_or_else(|| DispatchError::Unbound(kernel.key().clone()))?;
        let layout = kernel.layout();
        if bindings.storage.len() != layout.storage.len() {
            return Err(DispatchError::Rejected(format!(
                "{} expects {} storage bindings, got {}",
                kernel.key(),
                layout.storage.len(),
                bindings.storage.len()
            )));
        }
        if let Some(missing) = bindings
            .storage
            .iter()
            .find(|b| !self.buffers.contains_key(**b))
        {
            return Err(DispatchError::UnknownBuffer(*missing));
        }
        if bindings.params.len() != layout.params_size() {
            return Err(DispatchError::Rejected(format!(
                "{} expects {} bytes of params, got {}",
                kernel.key(),
                layout.params_size(),
                bindings.params.len()
            )));
        }
        validate_geometry(&self.device, grid, work_group)?;
        Ok(bindings)
    }
}

impl ProgramCache for RecordingBackend {
    fn get_or_create_kernel(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
        device: &DeviceInfo,
    ) -> Result<CompiledKernel, KernelBuildError> {
        let key = KernelKey::new(source, options);
        if let Some(handle) = self.keys.get(&key) {
            return Ok(CompiledKernel::new(key, *handle, source.layout.clone()));
        }

        let unresolved = ["args.", LINKED_OPERATIONS]
            .into_iter()
            .find(|marker| source.code.contains(marker));
        if let Some(marker) = unresolved {
            return Err(KernelBuildError::Build {
                key,
                message: format!("unresolved `{marker}` in source"),
            });
        }
        if let Some(needle) = self
            .fail_builds_containing
            .as_deref()
            .filter(|needle| source.code.contains(needle))
        {
            return Err(KernelBuildError::Build {
                key,
                message: format!("rejected source containing `{needle}`"),
            });
        }
        if source.code.contains("enable f16;") && !device.supports_f16 {
            return Err(KernelBuildError::F16Unsupported { key });
        }

        self.builds += 1;
        let handle = self.kernels.insert(source.clone());
        self.keys.insert(key.clone(), handle);
        Ok(CompiledKernel::new(key, handle, source.layout.clone()))
    }
}

impl CommandQueue for RecordingBackend {
    fn dispatch(
        &mut self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<(), DispatchError> {
        let bindings = self.check_dispatch(kernel, grid, work_group)?.clone();
        self.dispatches.push(RecordedDispatch {
            key: kernel.key().clone(),
            grid,
            work_group,
            bindings,
        });
        Ok(())
    }

    fn profile(
        &mut self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<Duration, DispatchError> {
        self.check_dispatch(kernel, grid, work_group)?;
        self.profiles.push(work_group);
        Ok((self.cost_model)(grid, work_group))
    }
}
