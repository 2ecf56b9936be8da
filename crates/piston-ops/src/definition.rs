use derive_new::new;

use crate::{DType, Layout, RVec, StorageType, TensorDescriptor};

/// Numeric width used for intermediate calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CalculationsPrecision {
    #[default]
    F32,
    /// F16 storage, F32 accumulation.
    F32F16,
    F16,
}

impl CalculationsPrecision {
    pub fn is_reduced(&self) -> bool {
        !matches!(self, CalculationsPrecision::F32)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationsPrecision::F32 => "f32",
            CalculationsPrecision::F32F16 => "f32_f16",
            CalculationsPrecision::F16 => "f16",
        }
    }
}

/// Defines operation calculation precision and the format of src/dst tensors.
///
/// Immutable once built; all queries are pure functions of the descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Default, new)]
pub struct OperationDef {
    precision: CalculationsPrecision,
    src_tensors: RVec<TensorDescriptor>,
    dst_tensors: RVec<TensorDescriptor>,
}

impl OperationDef {
    /// Definition with one source and one destination of the same descriptor.
    pub fn unary(precision: CalculationsPrecision, desc: TensorDescriptor) -> Self {
        Self::new(precision, crate::rvec![desc], crate::rvec![desc])
    }

    pub fn precision(&self) -> CalculationsPrecision {
        self.precision
    }

    pub fn src_tensors(&self) -> &[TensorDescriptor] {
        &self.src_tensors
    }

    pub fn dst_tensors(&self) -> &[TensorDescriptor] {
        &self.dst_tensors
    }

    /// F32 for F32 precision, F16 for the reduced precisions.
    pub fn data_type(&self) -> DType {
        match self.precision {
            CalculationsPrecision::F32 => DType::F32,
            CalculationsPrecision::F32F16 | CalculationsPrecision::F16 => DType::F16,
        }
    }

    /// Type used for accumulators in reductions (e.g. convolution sums).
    pub fn accumulator_type(&self) -> DType {
        match self.precision {
            CalculationsPrecision::F32 | CalculationsPrecision::F32F16 => DType::F32,
            CalculationsPrecision::F16 => DType::F16,
        }
    }

    // Primary means the first src tensor: it defines the structure of the kernel, all
    // other resources (biases etc.) must be compatible with it. A definition without
    // sources reports the default descriptor.
    fn primary(&self) -> TensorDescriptor {
        self.src_tensors.first().copied().unwrap_or_default()
    }

    pub fn primary_data_type(&self) -> DType {
        self.primary().dtype
    }

    pub fn primary_storage_type(&self) -> StorageType {
        self.primary().storage
    }

    pub fn primary_layout(&self) -> Layout {
        self.primary().layout
    }

    /// Registers an input contributed by a linked operation.
    pub(crate) fn push_src_tensor(&mut self, desc: TensorDescriptor) {
        self.src_tensors.push(desc);
    }

    pub fn has_all_tensors_of_type(&self, storage: StorageType) -> bool {
        self.all_tensors().all(|t| t.storage == storage)
    }

    pub fn is_batch_supported(&self) -> bool {
        self.all_tensors().all(|t| t.layout.has_batch())
    }

    fn all_tensors(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.src_tensors.iter().chain(self.dst_tensors.iter())
    }
}
