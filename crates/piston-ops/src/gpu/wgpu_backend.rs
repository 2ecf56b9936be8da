//! [`ProgramCache`] and [`CommandQueue`] over wgpu.
//!
//! Shader modules are built once per [`KernelKey`]. Compute pipelines are created per
//! (module, work-group size) by overriding the `wg_x`, `wg_y` and `wg_z` constants, so
//! tuning never rebuilds a module.
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::UVec3;
use half::f16;
use parking_lot::RwLock;
use slotmap::SlotMap;
use wgpu::util::DeviceExt;

use crate::{
    Bhwc, BufferId, DType, HashMap, Tensor, TensorDescriptor, TensorId, Tensors,
    gpu::{
        CommandQueue, CompiledKernel, CompilerOption, DeviceInfo, DispatchError,
        KernelBuildError, KernelHandle, KernelKey, ProgramCache, Vendor, validate_geometry,
        wgsl::KernelSource,
    },
};

#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub power_preference: wgpu::PowerPreference,
    /// Enable `shader-f16` when the adapter supports it.
    pub request_f16: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            request_f16: true,
        }
    }
}

struct ModuleEntry {
    module: wgpu::ShaderModule,
    zero_initialize_workgroup_memory: bool,
}

struct Inner {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    modules: RwLock<SlotMap<KernelHandle, ModuleEntry>>,
    keys: RwLock<HashMap<KernelKey, KernelHandle>>,
    pipelines: RwLock<HashMap<(KernelHandle, [u32; 3]), Arc<wgpu::ComputePipeline>>>,
    buffers: RwLock<SlotMap<BufferId, wgpu::Buffer>>,
}

/// Cheaply clonable handle to a wgpu device and its kernel and buffer caches.
#[derive(Clone)]
pub struct WgpuBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("info", &self.inner.info)
            .finish_non_exhaustive()
    }
}

impl WgpuBackend {
    pub fn new(config: GpuConfig) -> anyhow::Result<Self> {
        pollster::block_on(Self::request(config))
    }

    async fn request(config: GpuConfig) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;

        let supports_f16 =
            config.request_f16 && adapter.features().contains(wgpu::Features::SHADER_F16);
        let required_features = if supports_f16 {
            wgpu::Features::SHADER_F16
        } else {
            wgpu::Features::empty()
        };
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("piston-ops"),
                required_features,
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Using adapter {} ({:?}), f16: {supports_f16}",
            adapter_info.name,
            adapter_info.backend
        );
        let info = DeviceInfo {
            vendor: Vendor::from_pci_id(adapter_info.vendor),
            max_work_group_size: UVec3::new(
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ),
            max_work_group_invocations: limits.max_compute_invocations_per_workgroup,
            max_work_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_storage_buffers_per_stage: limits.max_storage_buffers_per_shader_stage,
            storage_buffer_alignment: limits.min_storage_buffer_offset_alignment,
            supports_f16,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                device,
                queue,
                info,
                modules: RwLock::new(SlotMap::with_key()),
                keys: RwLock::new(HashMap::default()),
                pipelines: RwLock::new(HashMap::default()),
                buffers: RwLock::new(SlotMap::with_key()),
            }),
        })
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    /// Allocates a zeroed storage buffer of at least `size` bytes.
    pub fn create_buffer(&self, size: u64) -> BufferId {
        let buffer = self.inner.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: size.max(16).next_multiple_of(16),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.inner.buffers.write().insert(buffer)
    }

    pub fn destroy_buffer(&self, id: BufferId) {
        if let Some(buffer) = self.inner.buffers.write().remove(id) {
            buffer.destroy();
        }
    }

    pub fn create_tensor(
        &self,
        tensors: &mut Tensors,
        shape: Bhwc,
        descriptor: TensorDescriptor,
    ) -> TensorId {
        let size = (shape.padded_len() * 4 * descriptor.dtype.size_of()) as u64;
        tensors.insert(Tensor::new(shape, descriptor, self.create_buffer(size)))
    }

    pub fn write_buffer(&self, id: BufferId, bytes: &[u8]) -> anyhow::Result<()> {
        let buffers = self.inner.buffers.read();
        let buffer = buffers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown buffer {id:?}"))?;
        self.inner.queue.write_buffer(buffer, 0, bytes);
        Ok(())
    }

    /// Creates a buffer holding `data`, e.g. weights or biases.
    pub fn create_buffer_f32(&self, data: &[f32]) -> anyhow::Result<BufferId> {
        let id = self.create_buffer(std::mem::size_of_val(data) as u64);
        self.write_buffer(id, bytemuck::cast_slice(data))?;
        Ok(id)
    }

    pub fn read_buffer(&self, id: BufferId) -> anyhow::Result<Vec<u8>> {
        let device = &self.inner.device;
        let staging = {
            let buffers = self.inner.buffers.read();
            let buffer = buffers
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("Unknown buffer {id:?}"))?;
            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size: buffer.size(),
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder =
                device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, buffer.size());
            self.inner.queue.submit(Some(encoder.finish()));
            staging
        };

        let (tx, rx) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        device.poll(wgpu::PollType::Wait)?;
        rx.recv()??;
        let bytes = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    /// Uploads logical BHWC values, padding channels up to whole slices.
    pub fn write_tensor_f32(&self, tensor: &Tensor, data: &[f32]) -> anyhow::Result<()> {
        let shape = tensor.shape;
        anyhow::ensure!(
            data.len() == shape.numel(),
            "Expected {} values for {shape}, got {}",
            shape.numel(),
            data.len()
        );
        let padded_c = shape.slices() * 4;
        let mut padded = vec![0f32; shape.padded_len() * 4];
        for (pixel, values) in data.chunks(shape.c.max(1)).enumerate() {
            padded[pixel * padded_c..pixel * padded_c + values.len()].copy_from_slice(values);
        }
        match tensor.descriptor.dtype {
            DType::F32 => self.write_buffer(tensor.buffer, bytemuck::cast_slice(&padded)),
            DType::F16 => {
                let halves: Vec<f16> = padded.iter().map(|v| f16::from_f32(*v)).collect();
                self.write_buffer(tensor.buffer, bytemuck::cast_slice(&halves))
            }
            other => anyhow::bail!("Cannot write f32 data to a {other} tensor"),
        }
    }

    /// Downloads logical BHWC values, dropping slice padding.
    pub fn read_tensor_f32(&self, tensor: &Tensor) -> anyhow::Result<Vec<f32>> {
        let shape = tensor.shape;
        let bytes = self.read_buffer(tensor.buffer)?;
        let values: Vec<f32> = match tensor.descriptor.dtype {
            DType::F32 => bytemuck::pod_collect_to_vec(&bytes),
            DType::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(&bytes)
                .into_iter()
                .map(f16::to_f32)
                .collect(),
            other => anyhow::bail!("Cannot read a {other} tensor as f32"),
        };
        let padded_c = shape.slices() * 4;
        let mut out = Vec::with_capacity(shape.numel());
        for pixel in 0..shape.b * shape.h * shape.w {
            out.extend_from_slice(&values[pixel * padded_c..pixel * padded_c + shape.c]);
        }
        Ok(out)
    }

    fn pipeline(
        &self,
        kernel: &CompiledKernel,
        work_group: UVec3,
    ) -> Result<Arc<wgpu::ComputePipeline>, DispatchError> {
        let cache_key = (kernel.handle(), work_group.to_array());
        if let Some(pipeline) = self.inner.pipelines.read().get(&cache_key) {
            return Ok(pipeline.clone());
        }

        let modules = self.inner.modules.read();
        let entry = modules
            .get(kernel.handle())
            .ok_or_else(|| DispatchError::UnknownKernel(kernel.key().clone()))?;
        let constants = [
            ("wg_x", work_group.x as f64),
            ("wg_y", work_group.y as f64),
            ("wg_z", work_group.z as f64),
        ];
        let device = &self.inner.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.key().as_str()),
            layout: None,
            module: &entry.module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                zero_initialize_workgroup_memory: entry.zero_initialize_workgroup_memory,
            },
            cache: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(DispatchError::Rejected(error.to_string()));
        }
        log::debug!("Created pipeline {} with work group {work_group}", kernel.key());

        let pipeline = Arc::new(pipeline);
        self.inner
            .pipelines
            .write()
            .insert(cache_key, pipeline.clone());
        Ok(pipeline)
    }

    fn submit(
        &self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<wgpu::SubmissionIndex, DispatchError> {
        let groups = validate_geometry(&self.inner.info, grid, work_group)?;
        let bindings = kernel
            .bindings()
            .ok_or_else(|| DispatchError::Unbound(kernel.key().clone()))?;
        let pipeline = self.pipeline(kernel, work_group)?;
        let device = &self.inner.device;
        let layout = kernel.layout();

        let params = layout.params_binding().map(|binding| {
            let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: &bindings.params,
                usage: wgpu::BufferUsages::UNIFORM,
            });
            (binding, buffer)
        });

        let buffers = self.inner.buffers.read();
        let mut entries = Vec::with_capacity(layout.storage.len() + 1);
        for (slot, id) in layout.storage.iter().zip(bindings.storage.iter()) {
            let buffer = buffers.get(*id).ok_or(DispatchError::UnknownBuffer(*id))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource: buffer.as_entire_binding(),
            });
        }
        if let Some((binding, buffer)) = &params {
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = (!entries.is_empty()).then(|| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.key().as_str()),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            })
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel.key().as_str()),
        });
        if groups.cmpgt(UVec3::ZERO).all() {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.key().as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            if let Some(bind_group) = &bind_group {
                pass.set_bind_group(0, bind_group, &[]);
            }
            pass.dispatch_workgroups(groups.x, groups.y, groups.z);
        }
        Ok(self.inner.queue.submit(Some(encoder.finish())))
    }
}

impl ProgramCache for WgpuBackend {
    fn get_or_create_kernel(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
        device: &DeviceInfo,
    ) -> Result<CompiledKernel, KernelBuildError> {
        let key = KernelKey::new(source, options);
        if let Some(handle) = self.inner.keys.read().get(&key).copied() {
            return Ok(CompiledKernel::new(key, handle, source.layout.clone()));
        }
        if source.code.contains("enable f16;") && !device.supports_f16 {
            return Err(KernelBuildError::F16Unsupported { key });
        }

        let gpu = &self.inner.device;
        gpu.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = gpu.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(key.as_str()),
            source: wgpu::ShaderSource::Wgsl(source.code.as_str().into()),
        });
        if let Some(error) = pollster::block_on(gpu.pop_error_scope()) {
            return Err(KernelBuildError::Build {
                key,
                message: error.to_string(),
            });
        }

        let handle = self.inner.modules.write().insert(ModuleEntry {
            module,
            zero_initialize_workgroup_memory: options
                .contains(&CompilerOption::ZeroInitializeWorkgroupMemory),
        });
        self.inner.keys.write().insert(key.clone(), handle);
        log::debug!("Built shader module {key}");
        Ok(CompiledKernel::new(key, handle, source.layout.clone()))
    }
}

impl CommandQueue for WgpuBackend {
    fn dispatch(
        &mut self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<(), DispatchError> {
        self.submit(kernel, grid, work_group)?;
        Ok(())
    }

    fn profile(
        &mut self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<Duration, DispatchError> {
        // Pipeline creation is not part of the measurement.
        self.pipeline(kernel, work_group)?;
        let start = Instant::now();
        self.submit(kernel, grid, work_group)?;
        self.inner
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        Ok(start.elapsed())
    }
}
