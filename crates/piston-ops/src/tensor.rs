//! Tensor descriptors and the caller-owned tensor arena.
//!
//! Operations never own tensors. They hold [`TensorId`] handles into a [`Tensors`]
//! arena owned by the execution context, and only read shape and layout metadata from
//! it. Storage itself lives in the compute backend, referenced through [`BufferId`].
use derive_new::new;
use slotmap::{SlotMap, new_key_type};

use crate::DType;

new_key_type! {
    /// Handle to a tensor in a [`Tensors`] arena.
    pub struct TensorId;
}

new_key_type! {
    /// Handle to a device buffer owned by a compute backend.
    pub struct BufferId;
}

/// Physical storage used for a tensor on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageType {
    #[default]
    Buffer,
    ImageBuffer,
    Texture2D,
    TextureArray,
    Texture3D,
    SingleTexture2D,
}

/// Logical axis order of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    HWC,
    #[default]
    BHWC,
    HWDC,
    BHWDC,
}

impl Layout {
    pub fn has_batch(&self) -> bool {
        matches!(self, Layout::BHWC | Layout::BHWDC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, new)]
pub struct TensorDescriptor {
    pub dtype: DType,
    pub storage: StorageType,
    pub layout: Layout,
}

impl TensorDescriptor {
    pub fn f32() -> Self {
        Self::new(DType::F32, StorageType::Buffer, Layout::BHWC)
    }

    pub fn f16() -> Self {
        Self::new(DType::F16, StorageType::Buffer, Layout::BHWC)
    }
}

/// Describes a plain buffer argument (weights, biases) of `vec4` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct BufferDescriptor {
    pub dtype: DType,
    /// Number of `vec4` elements.
    pub len: usize,
}

/// Batch, height, width, channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, new)]
pub struct Bhwc {
    pub b: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl Bhwc {
    /// Number of 4-channel groups.
    pub fn slices(&self) -> usize {
        self.c.div_ceil(4)
    }

    pub fn numel(&self) -> usize {
        self.b * self.h * self.w * self.c
    }

    /// Number of `vec4` elements needed to store the tensor.
    pub fn padded_len(&self) -> usize {
        self.b * self.h * self.w * self.slices()
    }

    /// Shape as seen by kernels: (batch, height, width, slices).
    pub fn kernel_shape(&self) -> [u32; 4] {
        [
            self.b as u32,
            self.h as u32,
            self.w as u32,
            self.slices() as u32,
        ]
    }
}

impl std::fmt::Display for Bhwc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.b, self.h, self.w, self.c)
    }
}

/// A device tensor as seen by operations: metadata plus a backend buffer handle.
#[derive(Debug, Clone, new)]
pub struct Tensor {
    pub shape: Bhwc,
    pub descriptor: TensorDescriptor,
    pub buffer: BufferId,
}

impl Tensor {
    pub fn num_bytes(&self) -> usize {
        self.shape.padded_len() * 4 * self.descriptor.dtype.size_of()
    }
}

/// Caller-owned tensor arena.
///
/// Removing a tensor invalidates its handle; operations holding it fail at the next
/// `update_params` or dispatch instead of reading freed memory.
#[derive(Debug, Default)]
pub struct Tensors {
    inner: SlotMap<TensorId, Tensor>,
}

impl Tensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: Tensor) -> TensorId {
        self.inner.insert(tensor)
    }

    pub fn get(&self, id: TensorId) -> Option<&Tensor> {
        self.inner.get(id)
    }

    pub fn get_mut(&mut self, id: TensorId) -> Option<&mut Tensor> {
        self.inner.get_mut(id)
    }

    pub fn remove(&mut self, id: TensorId) -> Option<Tensor> {
        self.inner.remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
