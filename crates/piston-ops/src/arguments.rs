//! # Arguments
//!
//! The named, kernel-visible bindings of one operation: tensors, opaque buffers and
//! scalars. Fragments refer to them as `args.<name>`; the WGSL renderer resolves those
//! selectors and [`ArgumentSet::bind`] turns the set into concrete kernel bindings
//! before each dispatch.
use std::collections::BTreeMap;

use crate::{
    BufferDescriptor, BufferId, DType, FusionError, RVec, TensorDescriptor, TensorId, Tensors,
    gpu::{CompiledKernel, KernelBindings, wgsl::ParamField},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F32(f32),
    I32(i32),
    U32(u32),
}

impl Scalar {
    pub fn dtype(&self) -> DType {
        match self {
            Scalar::F32(_) => DType::F32,
            Scalar::I32(_) => DType::I32,
            Scalar::U32(_) => DType::U32,
        }
    }

    fn to_le_bytes(self) -> [u8; 4] {
        match self {
            Scalar::F32(v) => v.to_le_bytes(),
            Scalar::I32(v) => v.to_le_bytes(),
            Scalar::U32(v) => v.to_le_bytes(),
        }
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::F32(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::I32(value)
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Scalar::U32(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Tensor {
        desc: TensorDescriptor,
        access: AccessMode,
        value: Option<TensorId>,
    },
    Buffer {
        desc: BufferDescriptor,
        value: BufferId,
    },
    Scalar(Scalar),
}

impl Argument {
    pub fn kind(&self) -> &'static str {
        match self {
            Argument::Tensor { .. } => "tensor",
            Argument::Buffer { .. } => "buffer",
            Argument::Scalar(_) => "scalar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error("Unknown argument `{0}`")]
    UnknownArgument(String),
    #[error("Tensor argument `{0}` has no tensor bound")]
    UnboundTensor(String),
    #[error("Tensor bound to `{0}` no longer exists")]
    StaleTensor(String),
    #[error("Tensor bound to `{name}` has dtype {actual}, expected {expected}")]
    IncompatibleTensor {
        name: String,
        expected: DType,
        actual: DType,
    },
    #[error("Argument `{name}` is a {kind}, expected a {expected}")]
    WrongKind {
        name: String,
        kind: &'static str,
        expected: &'static str,
    },
}

/// Named bindings of one operation.
///
/// Names are unique. Iteration is ordered by name, which keeps binding indices and
/// generated sources stable across runs.
#[derive(Debug, Default, PartialEq)]
pub struct ArgumentSet {
    args: BTreeMap<String, Argument>,
}

impl ArgumentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tensor argument. Re-registering a name replaces it.
    pub fn add_tensor(&mut self, name: impl Into<String>, desc: TensorDescriptor, access: AccessMode) {
        self.args.insert(
            name.into(),
            Argument::Tensor {
                desc,
                access,
                value: None,
            },
        );
    }

    pub fn add_buffer(&mut self, name: impl Into<String>, desc: BufferDescriptor, value: BufferId) {
        self.args.insert(name.into(), Argument::Buffer { desc, value });
    }

    pub fn add_scalar(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.args.insert(name.into(), Argument::Scalar(value.into()));
    }

    pub fn set_tensor(&mut self, name: &str, tensor: TensorId) -> Result<(), BindError> {
        match self.args.get_mut(name) {
            Some(Argument::Tensor { value, .. }) => {
                *value = Some(tensor);
                Ok(())
            }
            Some(other) => Err(BindError::WrongKind {
                name: name.to_string(),
                kind: other.kind(),
                expected: "tensor",
            }),
            None => Err(BindError::UnknownArgument(name.to_string())),
        }
    }

    pub fn set_scalar(&mut self, name: &str, scalar: impl Into<Scalar>) -> Result<(), BindError> {
        match self.args.get_mut(name) {
            Some(Argument::Scalar(value)) => {
                *value = scalar.into();
                Ok(())
            }
            Some(other) => Err(BindError::WrongKind {
                name: name.to_string(),
                kind: other.kind(),
                expected: "scalar",
            }),
            None => Err(BindError::UnknownArgument(name.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Argument> {
        self.args.get(name)
    }

    /// Points the tensor argument `name` at `tensor` if such an argument exists.
    pub(crate) fn bind_tensor_if_present(&mut self, name: &str, tensor: TensorId) {
        if let Some(Argument::Tensor { value, .. }) = self.args.get_mut(name) {
            *value = Some(tensor);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.args.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.args.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Argument)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Appends `postfix` to every name.
    pub(crate) fn add_postfix(&mut self, postfix: &str) {
        let args = std::mem::take(&mut self.args);
        self.args = args
            .into_iter()
            .map(|(name, arg)| (format!("{name}{postfix}"), arg))
            .collect();
    }

    /// Moves every argument of `other` into this set.
    ///
    /// Fails on the first name present in both sets; nothing is overwritten. On failure
    /// the set is left unchanged.
    pub fn merge(&mut self, other: ArgumentSet) -> Result<(), FusionError> {
        if let Some(name) = other.args.keys().find(|name| self.args.contains_key(*name)) {
            return Err(FusionError::ArgumentCollision(name.clone()));
        }
        self.args.extend(other.args);
        Ok(())
    }

    fn resolve_tensor<'t>(
        &self,
        name: &str,
        tensors: &'t Tensors,
    ) -> Result<&'t crate::Tensor, BindError> {
        match self.args.get(name) {
            Some(Argument::Tensor { desc, value, .. }) => {
                let id = value.ok_or_else(|| BindError::UnboundTensor(name.to_string()))?;
                let tensor = tensors
                    .get(id)
                    .ok_or_else(|| BindError::StaleTensor(name.to_string()))?;
                if tensor.descriptor.dtype != desc.dtype {
                    return Err(BindError::IncompatibleTensor {
                        name: name.to_string(),
                        expected: desc.dtype,
                        actual: tensor.descriptor.dtype,
                    });
                }
                Ok(tensor)
            }
            Some(other) => Err(BindError::WrongKind {
                name: name.to_string(),
                kind: other.kind(),
                expected: "tensor",
            }),
            None => Err(BindError::UnknownArgument(name.to_string())),
        }
    }

    /// Resolves every binding the kernel declares and stores them on the kernel.
    pub fn bind(&self, kernel: &mut CompiledKernel, tensors: &Tensors) -> Result<(), BindError> {
        let layout = kernel.layout();

        let mut storage: RVec<BufferId> = RVec::with_capacity(layout.storage.len());
        for slot in layout.storage.iter() {
            let buffer = match self.args.get(&slot.name) {
                Some(Argument::Buffer { value, .. }) => *value,
                Some(Argument::Tensor { .. }) => self.resolve_tensor(&slot.name, tensors)?.buffer,
                Some(other) => {
                    return Err(BindError::WrongKind {
                        name: slot.name.clone(),
                        kind: other.kind(),
                        expected: "tensor or buffer",
                    });
                }
                None => return Err(BindError::UnknownArgument(slot.name.clone())),
            };
            storage.push(buffer);
        }

        let mut params: Vec<u8> = Vec::with_capacity(layout.params_size());
        for field in layout.params.iter() {
            match field {
                ParamField::Shape(name) => {
                    let shape = self.resolve_tensor(name, tensors)?.shape.kernel_shape();
                    params.extend_from_slice(bytemuck::cast_slice(&shape));
                }
                ParamField::Scalar(name, _) => match self.args.get(name) {
                    Some(Argument::Scalar(scalar)) => params.extend_from_slice(&scalar.to_le_bytes()),
                    Some(other) => {
                        return Err(BindError::WrongKind {
                            name: name.clone(),
                            kind: other.kind(),
                            expected: "scalar",
                        });
                    }
                    None => return Err(BindError::UnknownArgument(name.clone())),
                },
            }
        }
        params.resize(layout.params_size(), 0);

        kernel.set_bindings(KernelBindings::new(storage, params));
        Ok(())
    }
}
