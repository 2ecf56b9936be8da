mod backend;
mod wgpu_backend;
pub mod wgsl;

pub use backend::*;
pub use wgpu_backend::*;
