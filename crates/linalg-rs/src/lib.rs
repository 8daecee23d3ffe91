//! Lowering of linear-algebra tensor operators (`mm`, `matmul`, `bmm`, `flip`,
//! `convolution`, `trilinear`) into a structured, loop-oriented IR with
//! explicit shapes, padding, broadcasting and accumulation.

pub mod env;
pub mod error;
pub mod ir;
pub mod lowering;

pub use env::LoweringConfig;
pub use error::{LoweringError, LoweringResult};
pub use ir::spec::{DType, Dimension, Shape, TensorSpec};
