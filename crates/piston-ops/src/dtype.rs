use half::f16;

/// Element types a kernel argument can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F16,
    #[default]
    F32,
    I32,
    U32,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::U32 => "u32",
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            DType::F16 => std::mem::size_of::<f16>(),
            DType::F32 => std::mem::size_of::<f32>(),
            DType::I32 => std::mem::size_of::<i32>(),
            DType::U32 => std::mem::size_of::<u32>(),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32)
    }

    /// WGSL scalar type name.
    pub fn wgsl_scalar(&self) -> &'static str {
        self.as_str()
    }

    /// WGSL type of one storage element: four channels packed in a `vec4`.
    pub fn wgsl_vec4(&self) -> String {
        format!("vec4<{}>", self.as_str())
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgsl_names() {
        assert_eq!(DType::F16.wgsl_vec4(), "vec4<f16>");
        assert_eq!(DType::F32.wgsl_scalar(), "f32");
        assert_eq!(DType::F16.size_of(), 2);
        assert!(!DType::U32.is_float());
    }
}
