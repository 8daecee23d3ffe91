//! Reference CPU interpreter for lowered `linalg-rs` programs.
//!
//! Numerics are computed in `f64` or wrapping `i64` and rounded to the
//! declared element type after every operation. Intended for testing
//! lowerings, not for speed.

pub mod cpu;

pub use cpu::{
    CpuTensor, Element, InterpreterError, InterpreterResult, ReferenceInterpreter, RuntimeValue,
    TensorData,
};
