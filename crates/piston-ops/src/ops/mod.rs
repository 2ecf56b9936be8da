mod conv;
mod elementwise;

pub use conv::*;
pub use elementwise::*;
