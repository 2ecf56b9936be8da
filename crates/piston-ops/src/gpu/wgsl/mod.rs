pub mod ident;
mod source;

pub use source::*;
