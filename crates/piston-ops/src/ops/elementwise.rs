use glam::UVec3;

use crate::{
    AccessMode, Argument, ArgumentSet, BufferDescriptor, BufferId, CreationContext, GpuOperation,
    InvariantError, LinkedSource, Linkables, OperationDef, OperationError, OperationState,
    Tensors,
    gpu::wgsl::{
        LINKED_OPERATIONS,
        ident::{declared_locals, postfix_arguments, postfix_identifiers},
    },
    operation::{build_kernel, elementwise_grid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Exp,
    Tanh,
    Sigmoid,
    Silu,
    Neg,
    Sqrt,
    Square,
    Reciprocal,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Silu => "silu",
            UnaryOp::Neg => "neg",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Square => "square",
            UnaryOp::Reciprocal => "reciprocal",
        }
    }
}

/// The elementwise operations this crate knows how to generate.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementwiseKind {
    /// `max(x, 0)`, leaky below zero when `alpha != 0`, optionally clipped at `clip`.
    Relu { clip: Option<f32>, alpha: f32 },
    Clamp { min: f32, max: f32 },
    /// Adds one `vec4` of `bias` per channel slice.
    BiasAdd {
        bias: BufferId,
        desc: BufferDescriptor,
    },
    /// Adds a second tensor of the same shape. The primary input must have `channels`
    /// channels.
    Add { channels: usize },
    /// `x * scale + shift`.
    Affine { scale: f32, shift: f32 },
    Unary(UnaryOp),
}

impl ElementwiseKind {
    pub fn name(&self) -> &'static str {
        match self {
            ElementwiseKind::Relu { .. } => "relu",
            ElementwiseKind::Clamp { .. } => "clamp",
            ElementwiseKind::BiasAdd { .. } => "bias_add",
            ElementwiseKind::Add { .. } => "add",
            ElementwiseKind::Affine { .. } => "affine",
            ElementwiseKind::Unary(op) => op.name(),
        }
    }
}

/// An operation applied independently to every element, expressed as a WGSL fragment
/// over `var in_out_value`.
///
/// Fragments may read the coordinates `b`, `x`, `y` (batch, column, row) and `s`
/// (channel slice) and refer to their own arguments as `args.<name>`. It can run on its
/// own or be linked into another operation's kernel.
#[derive(Debug)]
pub struct ElementwiseOperation {
    state: OperationState,
    name: String,
    code: String,
    link_index: usize,
    linkable: bool,
    check_src_channels_size: bool,
    src_channels: usize,
}

impl Default for ElementwiseOperation {
    fn default() -> Self {
        Self::custom(
            OperationDef::default(),
            "elementwise",
            "",
            ArgumentSet::new(),
            true,
        )
    }
}

impl ElementwiseOperation {
    pub fn new(definition: OperationDef, kind: ElementwiseKind) -> Self {
        let ty = definition.data_type().wgsl_vec4();
        let st = definition.data_type().wgsl_scalar();
        let splat = |expr: &str| format!("{ty}({st}({expr}))");

        let mut args = ArgumentSet::new();
        let mut expected_channels = None;
        let code = match &kind {
            ElementwiseKind::Relu { clip, alpha } => {
                let mut code = format!("let zero = {};\n", splat("0.0"));
                if *alpha != 0.0 {
                    args.add_scalar("alpha", *alpha);
                    code.push_str(&format!("let slope = {};\n", splat("args.alpha")));
                    code.push_str(
                        "in_out_value = select(in_out_value * slope, in_out_value, in_out_value >= zero);\n",
                    );
                } else {
                    code.push_str("in_out_value = max(in_out_value, zero);\n");
                }
                if let Some(clip) = clip {
                    args.add_scalar("clip", *clip);
                    code.push_str(&format!(
                        "in_out_value = min(in_out_value, {});\n",
                        splat("args.clip")
                    ));
                }
                code
            }
            ElementwiseKind::Clamp { min, max } => {
                args.add_scalar("min", *min);
                args.add_scalar("max", *max);
                format!(
                    "let lo = {};\nlet hi = {};\nin_out_value = clamp(in_out_value, lo, hi);\n",
                    splat("args.min"),
                    splat("args.max")
                )
            }
            ElementwiseKind::BiasAdd { bias, desc } => {
                args.add_buffer("bias", *desc, *bias);
                format!("in_out_value = in_out_value + {ty}(args.bias[s]);\n")
            }
            ElementwiseKind::Add { channels } => {
                expected_channels = Some(*channels);
                "let other = args.src_tensor_1[tensor_offset(args.src_tensor_1.shape, b, y, x, s)];\n"
                    .to_string()
                    + &format!("in_out_value = in_out_value + {ty}(other);\n")
            }
            ElementwiseKind::Affine { scale, shift } => {
                args.add_scalar("scale", *scale);
                args.add_scalar("shift", *shift);
                format!(
                    "in_out_value = fma(in_out_value, {}, {});\n",
                    splat("args.scale"),
                    splat("args.shift")
                )
            }
            ElementwiseKind::Unary(op) => {
                let one = splat("1.0");
                match op {
                    UnaryOp::Abs => "in_out_value = abs(in_out_value);\n".to_string(),
                    UnaryOp::Exp => "in_out_value = exp(in_out_value);\n".to_string(),
                    UnaryOp::Tanh => "in_out_value = tanh(in_out_value);\n".to_string(),
                    UnaryOp::Sigmoid => format!(
                        "let e = exp(-in_out_value);\nin_out_value = {one} / ({one} + e);\n"
                    ),
                    UnaryOp::Silu => {
                        format!("in_out_value = in_out_value / ({one} + exp(-in_out_value));\n")
                    }
                    UnaryOp::Neg => "in_out_value = -in_out_value;\n".to_string(),
                    UnaryOp::Sqrt => "in_out_value = sqrt(in_out_value);\n".to_string(),
                    UnaryOp::Square => "in_out_value = in_out_value * in_out_value;\n".to_string(),
                    UnaryOp::Reciprocal => format!("in_out_value = {one} / in_out_value;\n"),
                }
            }
        };

        let second_src = matches!(kind, ElementwiseKind::Add { .. }).then(|| {
            let srcs = definition.src_tensors();
            srcs.get(1).or(srcs.first()).copied().unwrap_or_default()
        });

        let mut op = Self::custom(definition, kind.name(), code, args, true);
        if let Some(desc) = second_src {
            op.add_src_tensor("src_tensor_1", desc);
        }
        if let Some(channels) = expected_channels {
            op.check_src_channels_size = true;
            op.src_channels = channels;
        }
        op
    }

    /// An elementwise operation from a hand written fragment and its arguments.
    pub fn custom(
        definition: OperationDef,
        name: impl Into<String>,
        code: impl Into<String>,
        args: ArgumentSet,
        linkable: bool,
    ) -> Self {
        let mut state = OperationState::new(definition);
        state.args = args;
        state.src_tensors_names.push("src_tensor".to_string());
        state.dst_tensors_names.push("dst_tensor".to_string());
        Self {
            state,
            name: name.into(),
            code: code.into(),
            link_index: 0,
            linkable,
            check_src_channels_size: false,
            src_channels: 0,
        }
    }

    /// The fragment, including any postfix applied by fusion.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// 0 while unlinked, otherwise the 1-based position in a fusion chain.
    pub fn link_index(&self) -> usize {
        self.link_index
    }

    pub(crate) fn set_link_index(&mut self, link_index: usize) {
        self.link_index = link_index;
    }

    pub fn is_linkable(&self) -> bool {
        self.linkable
    }

    pub fn check_src_channels_size(&self) -> bool {
        self.check_src_channels_size
    }

    /// Channel count the primary input must have, if this operation checks it.
    pub fn expected_src_channels(&self) -> Option<usize> {
        self.check_src_channels_size.then_some(self.src_channels)
    }

    pub fn args(&self) -> &ArgumentSet {
        &self.state.args
    }

    /// Takes the arguments out of the operation. A second call returns an empty set.
    pub fn move_args(&mut self) -> ArgumentSet {
        std::mem::take(&mut self.state.args)
    }

    /// Appends `postfix` to every argument name and every local declared by the
    /// fragment, rewriting the fragment to match.
    pub fn add_unique_postfix(&mut self, postfix: &str) {
        let args = &self.state.args;
        let code = postfix_arguments(&self.code, postfix, |name| args.contains(name));
        let locals = declared_locals(&code);
        self.code = postfix_identifiers(&code, &locals, postfix);
        self.state.args.add_postfix(postfix);
        for name in self
            .state
            .src_tensors_names
            .iter_mut()
            .chain(self.state.dst_tensors_names.iter_mut())
        {
            name.push_str(postfix);
        }
    }

    /// Tensor inputs after the primary one, as registered by `add_src_tensor`.
    pub(crate) fn extra_sources(&self) -> Vec<LinkedSource> {
        self.state
            .src_tensors_names
            .iter()
            .skip(1)
            .filter_map(|name| match self.state.args.get(name) {
                Some(Argument::Tensor { desc, value, .. }) => Some(LinkedSource {
                    name: name.clone(),
                    desc: *desc,
                    tensor: *value,
                }),
                _ => None,
            })
            .collect()
    }

    fn standalone_body(&self) -> String {
        let definition = self.definition();
        let ty = definition.data_type().wgsl_vec4();
        let dst = definition
            .dst_tensors()
            .first()
            .map(|d| d.dtype)
            .unwrap_or(definition.data_type())
            .wgsl_vec4();

        let mut body = String::with_capacity(self.code.len() + 512);
        body.push_str(
            r#"let shape = args.dst_tensor.shape;
let x = gid.x / shape.x;
let b = gid.x % shape.x;
let y = gid.y;
let s = gid.z;
if (x >= shape.z || y >= shape.y || s >= shape.w) {
    return;
}
"#,
        );
        body.push_str(&format!(
            "var in_out_value = {ty}(args.src_tensor[tensor_offset(args.src_tensor.shape, b, y, x, s)]);\n"
        ));
        body.push_str("{\n");
        for line in self.code.lines() {
            body.push_str(&format!("    {line}\n"));
        }
        body.push_str("}\n");
        body.push_str(LINKED_OPERATIONS);
        body.push('\n');
        body.push_str(&format!(
            "args.dst_tensor[tensor_offset(shape, b, y, x, s)] = {dst}(in_out_value);\n"
        ));
        body
    }
}

impl GpuOperation for ElementwiseOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    /// (width * batch, height, slices) of the first output.
    fn grid_size(&self, tensors: &Tensors) -> Result<UVec3, OperationError> {
        let shape = self.state.dst_tensor(tensors, 0)?.shape;
        Ok(elementwise_grid(self.definition(), shape))
    }

    /// Every input has the shape of the output.
    fn validate_shapes(&self, tensors: &Tensors) -> Result<(), InvariantError> {
        let dst = self.state.dst_tensor(tensors, 0)?.shape;
        for index in 0..self.state.src().len() {
            let src = self.state.src_tensor(tensors, index)?.shape;
            if src != dst {
                return Err(InvariantError::ShapeMismatch { src, dst });
            }
        }
        Ok(())
    }

    /// Builds the operation as its own kernel. Does nothing once linked into another
    /// operation, whose kernel already runs this fragment.
    fn compile(
        &mut self,
        ctx: &mut CreationContext<'_>,
        linkables: &mut Linkables,
    ) -> Result<(), OperationError> {
        if self.link_index != 0 {
            log::warn!(
                "{} is linked at position {}, skipping standalone compile",
                self.name,
                self.link_index
            );
            return Ok(());
        }
        let definition = self.definition();
        let src = definition.src_tensors().first().copied().unwrap_or_default();
        let dst = definition.dst_tensors().first().copied().unwrap_or_default();
        self.state.args.add_tensor("src_tensor", src, AccessMode::Read);
        self.state.args.add_tensor("dst_tensor", dst, AccessMode::ReadWrite);
        self.state.code = self.standalone_body();
        build_kernel(self, ctx, linkables)
    }
}
