//! Rendering of complete WGSL kernels from an [`ArgumentSet`] and a kernel body.
use std::collections::BTreeSet;

use crate::{
    Argument, ArgumentSet, BindError, DType, OperationDef, RVec,
    gpu::{CompilerOption, wgsl::ident::arg_references},
};

/// Names of the pipeline-overridable work-group constants.
pub const WORKGROUP_CONSTANTS: [&str; 3] = ["wg_x", "wg_y", "wg_z"];

/// Line in a kernel body replaced by the code of linked elementwise operations.
pub const LINKED_OPERATIONS: &str = "{{LINKED_OPERATIONS}}";

/// Accumulates WGSL text.
#[derive(Debug, Default)]
pub struct WgslFragment(pub String);

impl WgslFragment {
    pub fn new(capacity: usize) -> Self {
        Self(String::with_capacity(capacity))
    }

    pub fn write(&mut self, s: impl AsRef<str>) {
        self.0.push_str(s.as_ref());
    }

    pub fn write_line(&mut self, indent: usize, s: impl AsRef<str>) {
        for _ in 0..indent {
            self.0.push_str("    ");
        }
        self.0.push_str(s.as_ref());
        self.0.push('\n');
    }
}

impl std::fmt::Display for WgslFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageSlot {
    pub name: String,
    pub binding: u32,
    pub read_only: bool,
}

/// A field of the `Params` uniform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamField {
    /// `<tensor>_shape: vec4<u32>` = (batch, height, width, slices).
    Shape(String),
    Scalar(String, DType),
}

impl ParamField {
    fn size(&self) -> usize {
        match self {
            ParamField::Shape(_) => 16,
            ParamField::Scalar(..) => 4,
        }
    }
}

/// Binding interface of a rendered kernel, in binding order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KernelLayout {
    pub storage: RVec<StorageSlot>,
    pub params: Vec<ParamField>,
}

impl KernelLayout {
    /// Binding index of the `Params` uniform, if the kernel uses one.
    pub fn params_binding(&self) -> Option<u32> {
        (!self.params.is_empty()).then_some(self.storage.len() as u32)
    }

    /// Size in bytes of the `Params` uniform, rounded up to its 16 byte alignment.
    pub fn params_size(&self) -> usize {
        let raw: usize = self.params.iter().map(ParamField::size).sum();
        raw.next_multiple_of(16)
    }
}

#[derive(Debug, Clone)]
pub struct KernelSource {
    pub label: String,
    pub code: String,
    pub layout: KernelLayout,
}

impl std::fmt::Display for KernelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}

const TENSOR_OFFSET_FN: &str = r#"
fn tensor_offset(shape: vec4<u32>, b: u32, y: u32, x: u32, s: u32) -> u32 {
    return ((b * shape.y + y) * shape.z + x) * shape.w + s;
}
"#;

/// Renders a full kernel: `enable` directives, work-group constants, storage bindings,
/// the `Params` uniform, helpers and an entry point `main` whose body is `body` with
/// every `args.` selector resolved. `body` may use `gid`, the global invocation id.
///
/// Only arguments the body references are bound. Tensors and buffers become
/// `array<vec4<T>>` storage bindings, scalars and `args.<tensor>.shape` become fields
/// of `params`.
pub fn render_kernel(
    label: &str,
    definition: &OperationDef,
    args: &ArgumentSet,
    body: &str,
    options: &[CompilerOption],
) -> Result<KernelSource, BindError> {
    let references = arg_references(body);

    let mut storage_names = BTreeSet::new();
    let mut shape_names = BTreeSet::new();
    let mut scalar_names = BTreeSet::new();
    for reference in references.iter() {
        let arg = args
            .get(reference.name)
            .ok_or_else(|| BindError::UnknownArgument(reference.name.to_string()))?;
        match (arg, reference.shape) {
            (Argument::Tensor { .. }, true) => {
                shape_names.insert(reference.name);
            }
            (Argument::Tensor { .. } | Argument::Buffer { .. }, false) => {
                storage_names.insert(reference.name);
            }
            (Argument::Scalar(_), false) => {
                scalar_names.insert(reference.name);
            }
            (other, true) => {
                return Err(BindError::WrongKind {
                    name: reference.name.to_string(),
                    kind: other.kind(),
                    expected: "tensor",
                });
            }
        }
    }

    let mut layout = KernelLayout::default();
    let mut uses_f16 = definition.data_type() == DType::F16
        || options.contains(&CompilerOption::ShaderF16);
    let mut bindings = WgslFragment::new(1024);
    for (binding, name) in storage_names.iter().enumerate() {
        let (dtype, read_only) = match args.get(name) {
            Some(Argument::Tensor { desc, access, .. }) => {
                (desc.dtype, *access == crate::AccessMode::Read)
            }
            Some(Argument::Buffer { desc, .. }) => (desc.dtype, true),
            _ => unreachable!("storage names are tensors or buffers"),
        };
        uses_f16 |= dtype == DType::F16;
        let access = if read_only { "read" } else { "read_write" };
        bindings.write_line(
            0,
            format!(
                "@group(0) @binding({binding}) var<storage, {access}> {name}: array<{}>;",
                dtype.wgsl_vec4()
            ),
        );
        layout.storage.push(StorageSlot {
            name: name.to_string(),
            binding: binding as u32,
            read_only,
        });
    }

    layout.params.extend(shape_names.iter().map(|n| ParamField::Shape(n.to_string())));
    for name in scalar_names.iter() {
        if let Some(Argument::Scalar(scalar)) = args.get(name) {
            layout
                .params
                .push(ParamField::Scalar(name.to_string(), scalar.dtype()));
        }
    }

    let mut params = WgslFragment::new(256);
    if let Some(binding) = layout.params_binding() {
        params.write("struct Params {\n");
        for field in layout.params.iter() {
            match field {
                ParamField::Shape(name) => params.write_line(1, format!("{name}_shape: vec4<u32>,")),
                ParamField::Scalar(name, dtype) => params.write_line(1, format!("{name}: {dtype},")),
            }
        }
        params.write("}\n\n");
        params.write_line(
            0,
            format!("@group(0) @binding({binding}) var<uniform> params: Params;"),
        );
    }

    let mut resolved = String::with_capacity(body.len() + 64);
    let mut cursor = 0;
    for reference in references.iter() {
        resolved.push_str(&body[cursor..reference.range.start]);
        let is_scalar = matches!(args.get(reference.name), Some(Argument::Scalar(_)));
        if reference.shape {
            resolved.push_str(&format!("params.{}_shape", reference.name));
        } else if is_scalar {
            resolved.push_str(&format!("params.{}", reference.name));
        } else {
            resolved.push_str(reference.name);
        }
        cursor = reference.range.end;
    }
    resolved.push_str(&body[cursor..]);

    let mut kernel = WgslFragment::new(resolved.len() + 2048);
    if uses_f16 {
        kernel.write("enable f16;\n\n");
    }
    for constant in WORKGROUP_CONSTANTS {
        let default = if constant == "wg_x" { 8 } else if constant == "wg_y" { 4 } else { 1 };
        kernel.write_line(0, format!("override {constant}: u32 = {default}u;"));
    }
    kernel.write("\n");
    kernel.write(bindings.0);
    kernel.write("\n");
    kernel.write(params.0);
    kernel.write(TENSOR_OFFSET_FN);
    kernel.write("\n@compute @workgroup_size(wg_x, wg_y, wg_z)\n");
    kernel.write("fn main(@builtin(global_invocation_id) gid: vec3<u32>) {\n");
    for line in resolved.lines() {
        kernel.write_line(usize::from(!line.is_empty()), line);
    }
    kernel.write("}\n");

    Ok(KernelSource {
        label: label.to_string(),
        code: kernel.0,
        layout,
    })
}

/// Replaces the [`LINKED_OPERATIONS`] marker line of `body` with `linked_code`.
///
/// Returns `None` when the marker is missing.
pub fn insert_linked_code(body: &str, linked_code: &str) -> Option<String> {
    let at = body.find(LINKED_OPERATIONS)?;
    let line_start = body[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = body[at..]
        .find('\n')
        .map(|i| at + i + 1)
        .unwrap_or(body.len());
    let mut out = String::with_capacity(body.len() + linked_code.len());
    out.push_str(&body[..line_start]);
    out.push_str(linked_code);
    out.push_str(&body[line_end..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessMode, CalculationsPrecision, TensorDescriptor};

    fn args() -> ArgumentSet {
        let mut args = ArgumentSet::new();
        args.add_tensor("src_tensor", TensorDescriptor::f32(), AccessMode::Read);
        args.add_tensor("dst_tensor", TensorDescriptor::f32(), AccessMode::ReadWrite);
        args.add_tensor("unused", TensorDescriptor::f32(), AccessMode::Read);
        args.add_scalar("alpha", 0.5f32);
        args
    }

    #[test]
    fn test_render_resolves_selectors() {
        let def = OperationDef::unary(CalculationsPrecision::F32, TensorDescriptor::f32());
        let body = "let shape = args.dst_tensor.shape;\nargs.dst_tensor[0] = args.src_tensor[0] * args.alpha;\n";
        let source = render_kernel("test", &def, &args(), body, &[]).unwrap();

        assert!(!source.code.contains("args."));
        assert!(!source.code.contains("enable f16"));
        assert!(source.code.contains("let shape = params.dst_tensor_shape;"));
        assert!(source.code.contains("dst_tensor[0] = src_tensor[0] * params.alpha;"));
        assert!(source.code.contains(
            "@group(0) @binding(0) var<storage, read_write> dst_tensor: array<vec4<f32>>;"
        ));
        assert!(source.code.contains(
            "@group(0) @binding(1) var<storage, read> src_tensor: array<vec4<f32>>;"
        ));
        assert!(!source.code.contains("unused"));

        assert_eq!(source.layout.storage.len(), 2);
        assert_eq!(source.layout.params_binding(), Some(2));
        assert_eq!(
            source.layout.params,
            vec![
                ParamField::Shape("dst_tensor".to_string()),
                ParamField::Scalar("alpha".to_string(), DType::F32)
            ]
        );
        assert_eq!(source.layout.params_size(), 32);
    }

    #[test]
    fn test_render_enables_f16() {
        let def = OperationDef::unary(CalculationsPrecision::F16, TensorDescriptor::f16());
        let source = render_kernel("test", &def, &ArgumentSet::new(), "", &[]).unwrap();
        assert!(source.code.starts_with("enable f16;"));
        assert_eq!(source.layout.params_binding(), None);
    }

    #[test]
    fn test_render_unknown_argument() {
        let def = OperationDef::unary(CalculationsPrecision::F32, TensorDescriptor::f32());
        let err = render_kernel("test", &def, &args(), "let v = args.missing;", &[]).unwrap_err();
        assert_eq!(err, BindError::UnknownArgument("missing".to_string()));
    }

    #[test]
    fn test_render_shape_of_scalar_fails() {
        let def = OperationDef::unary(CalculationsPrecision::F32, TensorDescriptor::f32());
        let err = render_kernel("test", &def, &args(), "let v = args.alpha.shape;", &[]).unwrap_err();
        assert!(matches!(err, BindError::WrongKind { expected: "tensor", .. }));
    }

    #[test]
    fn test_insert_linked_code() {
        let body = "a;\n    {{LINKED_OPERATIONS}}\nb;\n";
        assert_eq!(insert_linked_code(body, "x;\n").unwrap(), "a;\nx;\nb;\n");
        assert_eq!(insert_linked_code(body, "").unwrap(), "a;\nb;\n");
        assert!(insert_linked_code("a;\n", "x;\n").is_none());
    }
}
