//! # piston-ops
//!
//! Single GPU operations that can absorb chains of elementwise operations into one
//! compiled WGSL kernel.
//!
//! The usage scenario is:
//! 1. Build a composite operation (e.g. [`Conv2d1x1`]).
//! 2. Build the [`ElementwiseOperation`]s that will be linked to it and store them in a
//!    caller-owned [`Linkables`] arena.
//! 3. Attach them with [`GpuOperation::add_operation`], in the order they should run.
//! 4. Call [`GpuOperation::compile`] once. Never compile an attached elementwise
//!    operation on its own.
//! 5. Per inference pass: [`GpuOperation::update_params`] after shape changes,
//!    optionally [`GpuOperation::tune`], then [`GpuOperation::add_to_queue`].
mod arguments;
mod definition;
mod dtype;
mod fusion;
pub mod gpu;
mod operation;
mod ops;
mod tensor;
pub mod test_utils;
mod tuning;

pub use arguments::*;
pub use definition::*;
pub use dtype::*;
pub use fusion::*;
pub use operation::*;
pub use ops::*;
pub use tensor::*;
pub use tuning::*;

use smallvec::SmallVec;

pub type RVec<T> = SmallVec<[T; 4]>;

pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;

#[macro_export]
macro_rules! rvec {
    ($($x:tt)*) => {
        smallvec::smallvec![$($x)*]
    };
}
