#![allow(dead_code)]

use anyhow::{anyhow, Result};
use linalg_rs::ir::spec::{
    DType, Dimension, Function, Literal, Operation, Program, ProgramBuilder, Shape, TensorSpec,
    ValueId, ValueType,
};
use linalg_rs::lowering::lower_linear_ops;
use linalg_rs::LoweringConfig;
use linalg_rs_ref_cpu::{CpuTensor, InterpreterResult, ReferenceInterpreter, RuntimeValue};

pub fn tensor(dtype: DType, dims: &[usize]) -> ValueType {
    ValueType::Tensor(TensorSpec::new(dtype, Shape::from_static(dims)))
}

/// `None` entries are dynamic.
pub fn tensor_dyn(dtype: DType, dims: &[Option<usize>]) -> ValueType {
    ValueType::Tensor(TensorSpec::new(
        dtype,
        Shape::new(
            dims.iter()
                .map(|dim| dim.map_or(Dimension::Dynamic, Dimension::Static))
                .collect::<Vec<_>>(),
        ),
    ))
}

pub fn f32_input(dims: &[usize], values: Vec<f64>) -> Result<RuntimeValue> {
    Ok(RuntimeValue::Tensor(CpuTensor::from_f64(DType::F32, dims.to_vec(), values)?))
}

pub fn int_input(dtype: DType, dims: &[usize], values: Vec<i64>) -> Result<RuntimeValue> {
    Ok(RuntimeValue::Tensor(CpuTensor::from_i64(dtype, dims.to_vec(), values)?))
}

/// `0, 1, 2, ..` folded into a small signed range.
pub fn ramp(len: usize) -> Vec<f64> {
    (0..len).map(|i| (i % 7) as f64 - 3.0).collect()
}

pub fn quantize(builder: &mut ProgramBuilder, value: ValueId, zero_point: i64) -> ValueId {
    let ty = builder.value_type(value).cloned().expect("quantized value is defined");
    let scale = builder.emit_single(
        Operation::Constant(Literal::Float(0.5)),
        Vec::new(),
        ValueType::Float,
    );
    let zp = builder.constant_int(zero_point);
    builder.emit_single(
        Operation::MakePerTensorQuantized,
        vec![value.into(), scale.into(), zp.into()],
        ty,
    )
}

pub fn binary_function(op: Operation, lhs: ValueType, rhs: ValueType, result: ValueType) -> Function {
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(lhs);
    let rhs = builder.add_parameter(rhs);
    let out = builder.emit_single(op, vec![lhs.into(), rhs.into()], result);
    builder.finish("main", vec![out])
}

/// Lowers `function` as the entry of a program.
pub fn lower(function: Function) -> Result<Program> {
    let mut program = Program::new(function.name.clone()).with_functions(vec![function]);
    lower_linear_ops(&mut program, LoweringConfig::default())?;
    Ok(program)
}

pub fn execute(program: &Program, inputs: &[RuntimeValue]) -> InterpreterResult<Vec<RuntimeValue>> {
    ReferenceInterpreter::new().run_program(program, inputs)
}

/// Lowers, runs and returns the single tensor result.
pub fn lower_and_run(function: Function, inputs: &[RuntimeValue]) -> Result<CpuTensor> {
    let program = lower(function)?;
    let mut results = execute(&program, inputs)?;
    results
        .pop()
        .and_then(RuntimeValue::into_tensor)
        .ok_or_else(|| anyhow!("expected a tensor result"))
}

/// Row-major `[.., m, k] x [.., k, n]` over equal batch shapes.
pub fn reference_batched_matmul(
    lhs: &[f64],
    rhs: &[f64],
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
) -> Vec<f64> {
    let mut out = vec![0.0; batch * m * n];
    for b in 0..batch {
        for i in 0..m {
            for j in 0..n {
                out[(b * m + i) * n + j] = (0..k)
                    .map(|p| lhs[(b * m + i) * k + p] * rhs[(b * k + p) * n + j])
                    .sum();
            }
        }
    }
    out
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "element {index}: {a} vs {e}");
    }
}

/// Convolution parameters; `bias` adds an F32 (or Si32 when quantized) bias input.
#[derive(Debug, Clone)]
pub struct ConvParams {
    pub stride: Vec<i64>,
    pub padding: Vec<i64>,
    pub dilation: Vec<i64>,
    pub output_padding: Vec<i64>,
    pub transposed: bool,
    pub groups: i64,
    pub bias: Option<usize>,
}

impl ConvParams {
    pub fn forward(spatial: usize) -> Self {
        Self {
            stride: vec![1; spatial],
            padding: vec![0; spatial],
            dilation: vec![1; spatial],
            output_padding: vec![0; spatial],
            transposed: false,
            groups: 1,
            bias: None,
        }
    }
}

/// Parameters are `input, weight[, bias]`.
pub fn conv_function(
    input: ValueType,
    weight: ValueType,
    params: &ConvParams,
    result: ValueType,
    zero_points: Option<(i64, i64)>,
) -> Function {
    let mut builder = ProgramBuilder::new();
    let mut input = builder.add_parameter(input);
    let mut weight = builder.add_parameter(weight);
    let bias = match params.bias {
        Some(len) => {
            let dtype = if zero_points.is_some() { DType::Si32 } else { DType::F32 };
            builder.add_parameter(tensor(dtype, &[len]))
        }
        None => builder.constant_none(),
    };
    if let Some((input_zp, weight_zp)) = zero_points {
        input = quantize(&mut builder, input, input_zp);
        weight = quantize(&mut builder, weight, weight_zp);
    }
    let stride = builder.int_list(&params.stride);
    let padding = builder.int_list(&params.padding);
    let dilation = builder.int_list(&params.dilation);
    let transposed = builder.constant_bool(params.transposed);
    let output_padding = builder.int_list(&params.output_padding);
    let groups = builder.constant_int(params.groups);
    let out = builder.emit_single(
        Operation::Convolution,
        vec![
            input.into(),
            weight.into(),
            bias.into(),
            stride.into(),
            padding.into(),
            dilation.into(),
            transposed.into(),
            output_padding.into(),
            groups.into(),
        ],
        result,
    );
    builder.finish("main", vec![out])
}

/// `Trilinear` over three parameters with constant expand, sum and unroll operands.
pub fn trilinear_function(
    inputs: [ValueType; 3],
    expands: [&[i64]; 3],
    sum_dims: &[i64],
    unroll_dim: i64,
    result: ValueType,
) -> Function {
    let mut builder = ProgramBuilder::new();
    let inputs = inputs.map(|ty| builder.add_parameter(ty));
    let expands = expands.map(|dims| builder.int_list(dims));
    let sum_dims = builder.int_list(sum_dims);
    let unroll = builder.constant_int(unroll_dim);
    let operands = inputs
        .iter()
        .chain(&expands)
        .chain([&sum_dims, &unroll])
        .map(|id| (*id).into())
        .collect();
    let out = builder.emit_single(Operation::Trilinear, operands, result);
    builder.finish("main", vec![out])
}
