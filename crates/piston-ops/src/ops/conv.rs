use glam::UVec3;

use crate::{
    BufferDescriptor, BufferId, GpuOperation, InvariantError, OperationDef, OperationError,
    OperationState, TensorRole, Tensors,
    gpu::{DeviceInfo, wgsl::LINKED_OPERATIONS},
    operation::elementwise_grid,
};

/// 1x1 convolution over BHWC tensors.
///
/// `weights` holds one `vec4` of four output channels per (output slice, input
/// channel): element `(s * src_slices + ss) * 4 + k` scales input channel `ss * 4 + k`
/// into output slice `s`. Sums are kept in the accumulator type of the definition.
#[derive(Debug)]
pub struct Conv2d1x1 {
    state: OperationState,
    src_channels: usize,
    dst_channels: usize,
}

impl Conv2d1x1 {
    pub fn new(
        definition: OperationDef,
        src_channels: usize,
        dst_channels: usize,
        weights: BufferId,
    ) -> Self {
        let weights_desc = BufferDescriptor::new(
            definition.accumulator_type(),
            dst_channels.div_ceil(4) * src_channels.div_ceil(4) * 4,
        );
        let src = definition.src_tensors().first().copied().unwrap_or_default();
        let dst = definition.dst_tensors().first().copied().unwrap_or_default();
        let code = Self::generate_code(&definition);

        let mut op = Self {
            state: OperationState::new(definition),
            src_channels,
            dst_channels,
        };
        op.add_src_tensor("src_tensor", src);
        op.add_dst_tensor("dst_tensor", dst);
        op.add_src_buffer("weights", weights_desc, weights);
        op.state.code = code;
        op
    }

    pub fn src_channels(&self) -> usize {
        self.src_channels
    }

    pub fn dst_channels(&self) -> usize {
        self.dst_channels
    }

    fn generate_code(definition: &OperationDef) -> String {
        let acc = definition.accumulator_type().wgsl_vec4();
        let ty = definition.data_type().wgsl_vec4();
        let out = definition
            .dst_tensors()
            .first()
            .map(|d| d.dtype)
            .unwrap_or(definition.data_type())
            .wgsl_vec4();
        format!(
            r#"let shape = args.dst_tensor.shape;
let src_shape = args.src_tensor.shape;
let x = gid.x / shape.x;
let b = gid.x % shape.x;
let y = gid.y;
let s = gid.z;
if (x >= shape.z || y >= shape.y || s >= shape.w) {{
    return;
}}
var acc = {acc}(0.0);
for (var ss = 0u; ss < src_shape.w; ss = ss + 1u) {{
    let v = {acc}(args.src_tensor[tensor_offset(src_shape, b, y, x, ss)]);
    let w = (s * src_shape.w + ss) * 4u;
    acc = acc + {acc}(args.weights[w]) * v.x;
    acc = acc + {acc}(args.weights[w + 1u]) * v.y;
    acc = acc + {acc}(args.weights[w + 2u]) * v.z;
    acc = acc + {acc}(args.weights[w + 3u]) * v.w;
}}
var in_out_value = {ty}(acc);
{LINKED_OPERATIONS}
args.dst_tensor[tensor_offset(shape, b, y, x, s)] = {out}(in_out_value);
"#
        )
    }
}

impl GpuOperation for Conv2d1x1 {
    fn name(&self) -> &str {
        "conv2d_1x1"
    }

    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn grid_size(&self, tensors: &Tensors) -> Result<UVec3, OperationError> {
        let shape = self.state.dst_tensor(tensors, 0)?.shape;
        Ok(elementwise_grid(self.definition(), shape))
    }

    /// Channels must match the weights; linked inputs must match the output.
    fn validate_shapes(&self, tensors: &Tensors) -> Result<(), InvariantError> {
        let src = self.state.src_tensor(tensors, 0)?.shape;
        let dst = self.state.dst_tensor(tensors, 0)?.shape;
        if src.c != self.src_channels {
            return Err(InvariantError::ChannelsMismatch {
                role: TensorRole::Src,
                index: 0,
                expected: self.src_channels,
                actual: src.c,
            });
        }
        if dst.c != self.dst_channels {
            return Err(InvariantError::ChannelsMismatch {
                role: TensorRole::Dst,
                index: 0,
                expected: self.dst_channels,
                actual: dst.c,
            });
        }
        if (src.b, src.h, src.w) != (dst.b, dst.h, dst.w) {
            return Err(InvariantError::ShapeMismatch { src, dst });
        }
        for index in 1..self.state.src().len() {
            let linked = self.state.src_tensor(tensors, index)?.shape;
            if linked != dst {
                return Err(InvariantError::ShapeMismatch { src: linked, dst });
            }
        }
        Ok(())
    }

    fn post_compile_check(&self, device: &DeviceInfo) -> Result<(), OperationError> {
        let Some(kernel) = self.state.kernel() else {
            return Ok(());
        };
        let storage = kernel.layout().storage.len() as u32;
        if storage > device.max_storage_buffers_per_stage {
            return Err(OperationError::PostCompileCheck(format!(
                "{} uses {storage} storage buffers, device allows {}",
                kernel.key(),
                device.max_storage_buffers_per_stage
            )));
        }
        Ok(())
    }
}
