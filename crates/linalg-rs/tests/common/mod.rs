#![allow(dead_code)]

use anyhow::Result;
use linalg_rs::ir::{
    driver::{apply_partial_conversion, ConversionConfig, ConversionStats},
    legality::{ConversionTarget, OperationKind},
    pattern::PatternSet,
    spec::{
        DType, Dimension, Function, Literal, Operation, ProgramBuilder, Shape, TensorSpec, ValueId,
        ValueType,
    },
};
use linalg_rs::lowering::populate_linear_patterns_and_legality;
use linalg_rs::LoweringConfig;

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

/// Wraps `value` in `MakePerTensorQuantized` with the given zero-point.
pub fn quantize(builder: &mut ProgramBuilder, value: ValueId, zero_point: i64) -> ValueId {
    let ty = builder.value_type(value).cloned().expect("quantized value is defined");
    let scale = builder.emit_single(
        Operation::Constant(Literal::Float(0.25)),
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

/// `op(lhs, rhs)` with both operands as parameters.
pub fn binary_function(op: Operation, lhs: ValueType, rhs: ValueType, result: ValueType) -> Function {
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(lhs);
    let rhs = builder.add_parameter(rhs);
    let out = builder.emit_single(op, vec![lhs.into(), rhs.into()], result);
    builder.finish("main", vec![out])
}

/// Like [`binary_function`], quantizing the operands that have a zero-point.
pub fn quantized_binary_function(
    op: Operation,
    lhs: (ValueType, Option<i64>),
    rhs: (ValueType, Option<i64>),
    result: ValueType,
) -> Function {
    let mut builder = ProgramBuilder::new();
    let operand = |builder: &mut ProgramBuilder, (ty, zp): (ValueType, Option<i64>)| {
        let value = builder.add_parameter(ty);
        match zp {
            Some(zp) => quantize(builder, value, zp),
            None => value,
        }
    };
    let lhs = operand(&mut builder, lhs);
    let rhs = operand(&mut builder, rhs);
    let out = builder.emit_single(op, vec![lhs.into(), rhs.into()], result);
    builder.finish("main", vec![out])
}

/// Convolution parameters; `bias` is a bias length.
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

/// Runs the linear lowering patterns over `function` in place.
pub fn lower(function: &mut Function, config: LoweringConfig) -> Result<ConversionStats> {
    let mut patterns = PatternSet::new();
    let mut target = ConversionTarget::new();
    populate_linear_patterns_and_legality(&mut patterns, &mut target, config);
    let stats = apply_partial_conversion(
        function,
        &patterns.freeze(),
        &target,
        &ConversionConfig::default(),
    )?;
    Ok(stats)
}

pub fn op_kinds(function: &Function) -> Vec<OperationKind> {
    function
        .body
        .iter()
        .map(|inst| OperationKind::from_op(&inst.op))
        .collect()
}

pub fn count(function: &Function, kind: OperationKind) -> usize {
    op_kinds(function).into_iter().filter(|k| *k == kind).count()
}

pub fn find_op<'f>(function: &'f Function, kind: OperationKind) -> Option<&'f Operation> {
    function
        .body
        .iter()
        .find(|inst| OperationKind::from_op(&inst.op) == kind)
        .map(|inst| &inst.op)
}

pub fn assert_messages(function: &Function) -> Vec<String> {
    function
        .body
        .iter()
        .filter_map(|inst| match &inst.op {
            Operation::Assert(spec) => Some(spec.message.clone()),
            _ => None,
        })
        .collect()
}
