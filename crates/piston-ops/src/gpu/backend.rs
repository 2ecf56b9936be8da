//! Narrow interfaces to the compute backend: kernel building, submission and device
//! capabilities.
use std::hash::{Hash, Hasher};
use std::time::Duration;

use derive_new::new;
use glam::UVec3;
use rustc_hash::FxHasher;
use slotmap::new_key_type;

use crate::{BufferId, RVec, gpu::wgsl::{KernelLayout, KernelSource}};

new_key_type! {
    /// Handle to a built kernel inside a [`ProgramCache`].
    pub struct KernelHandle;
}

/// Unique string representing a kernel.
/// If the key is already registered in a [`ProgramCache`], the built kernel is reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey(String);

impl KernelKey {
    pub fn new(source: &KernelSource, options: &[CompilerOption]) -> Self {
        let mut hasher = FxHasher::default();
        source.code.hash(&mut hasher);
        options.hash(&mut hasher);
        Self(format!("{}_{:016x}", source.label, hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerOption {
    /// Build with the `shader-f16` feature even if no argument is F16.
    ShaderF16,
    ZeroInitializeWorkgroupMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Arm,
    Qualcomm,
    ImgTec,
    Apple,
    #[default]
    Unknown,
}

impl Vendor {
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10DE => Vendor::Nvidia,
            0x1002 => Vendor::Amd,
            0x8086 => Vendor::Intel,
            0x13B5 => Vendor::Arm,
            0x5143 => Vendor::Qualcomm,
            0x1010 => Vendor::ImgTec,
            0x106B => Vendor::Apple,
            _ => Vendor::Unknown,
        }
    }

    /// Typical subgroup width; used to seed work-group heuristics.
    pub fn preferred_wave_size(&self) -> u32 {
        match self {
            Vendor::Amd => 64,
            Vendor::Arm => 16,
            Vendor::Intel => 16,
            Vendor::Qualcomm => 64,
            _ => 32,
        }
    }
}

/// Capabilities of the device kernels are built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: Vendor,
    pub max_work_group_size: UVec3,
    pub max_work_group_invocations: u32,
    pub max_work_groups_per_dimension: u32,
    pub max_storage_buffers_per_stage: u32,
    pub storage_buffer_alignment: u32,
    pub supports_f16: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            vendor: Vendor::Unknown,
            max_work_group_size: UVec3::new(256, 256, 64),
            max_work_group_invocations: 256,
            max_work_groups_per_dimension: 65535,
            max_storage_buffers_per_stage: 8,
            storage_buffer_alignment: 256,
            supports_f16: false,
        }
    }
}

/// Concrete resources for every binding of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct KernelBindings {
    /// One buffer per storage slot, in binding order.
    pub storage: RVec<BufferId>,
    /// Packed contents of the `Params` uniform. Empty if the kernel has none.
    pub params: Vec<u8>,
}

/// A kernel built by a [`ProgramCache`].
///
/// Holds the bindings most recently produced by argument binding. Move-only.
#[derive(Debug)]
pub struct CompiledKernel {
    key: KernelKey,
    handle: KernelHandle,
    layout: KernelLayout,
    bindings: Option<KernelBindings>,
}

impl CompiledKernel {
    pub fn new(key: KernelKey, handle: KernelHandle, layout: KernelLayout) -> Self {
        Self {
            key,
            handle,
            layout,
            bindings: None,
        }
    }

    pub fn key(&self) -> &KernelKey {
        &self.key
    }

    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    pub fn bindings(&self) -> Option<&KernelBindings> {
        self.bindings.as_ref()
    }

    pub fn set_bindings(&mut self, bindings: KernelBindings) {
        self.bindings = Some(bindings);
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelBuildError {
    #[error("Failed to build kernel {key}: {message}")]
    Build { key: KernelKey, message: String },
    #[error("Kernel {key} requires f16 but the device does not support it")]
    F16Unsupported { key: KernelKey },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Kernel {0} has no bindings")]
    Unbound(KernelKey),
    #[error("Invalid dispatch geometry grid {grid} with work group {work_group}: {reason}")]
    InvalidGeometry {
        grid: UVec3,
        work_group: UVec3,
        reason: String,
    },
    #[error("Unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("Unknown kernel {0}")]
    UnknownKernel(KernelKey),
    #[error("Queue rejected submission: {0}")]
    Rejected(String),
}

/// Builds kernels, deduplicating by [`KernelKey`].
pub trait ProgramCache {
    fn get_or_create_kernel(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
        device: &DeviceInfo,
    ) -> Result<CompiledKernel, KernelBuildError>;
}

/// Submits kernels for execution.
pub trait CommandQueue {
    /// Records and submits one dispatch of `kernel` using its current bindings.
    fn dispatch(
        &mut self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<(), DispatchError>;

    /// Runs one dispatch to completion and reports how long it took.
    fn profile(
        &mut self,
        kernel: &CompiledKernel,
        grid: UVec3,
        work_group: UVec3,
    ) -> Result<Duration, DispatchError>;
}

/// Checks `work_group` against device limits and returns the number of work groups
/// needed to cover `grid`.
pub fn validate_geometry(
    device: &DeviceInfo,
    grid: UVec3,
    work_group: UVec3,
) -> Result<UVec3, DispatchError> {
    let invalid = |reason: String| DispatchError::InvalidGeometry {
        grid,
        work_group,
        reason,
    };
    if work_group.cmpeq(UVec3::ZERO).any() {
        return Err(invalid("work group has a zero extent".to_string()));
    }
    if work_group.cmpgt(device.max_work_group_size).any() {
        return Err(invalid(format!(
            "exceeds per-axis limit {}",
            device.max_work_group_size
        )));
    }
    if work_group.element_product() > device.max_work_group_invocations {
        return Err(invalid(format!(
            "exceeds {} invocations",
            device.max_work_group_invocations
        )));
    }
    let groups = (grid + work_group - UVec3::ONE) / work_group;
    if groups.max_element() > device.max_work_groups_per_dimension {
        return Err(invalid(format!(
            "needs {groups} work groups, limit is {}",
            device.max_work_groups_per_dimension
        )));
    }
    Ok(groups)
}
