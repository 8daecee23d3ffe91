mod common;

use anyhow::{Context, Result};
use common::{assert_messages, conv_function, count, lower, op_kinds, tensor, tensor_dyn, ConvParams};
use linalg_rs::ir::legality::OperationKind;
use linalg_rs::ir::spec::{
    ConvKind, ConvSpec, DType, Dimension, Function, Literal, Operand, Operation, ProgramBuilder,
    ValueType,
};
use linalg_rs::lowering::conv::{
    conv_output_extent, is_depthwise, select_conv_strategy, transposed_conv_output_extent,
    ConvStrategy,
};
use linalg_rs::LoweringConfig;
use test_case::test_case;

fn conv_spec(function: &Function) -> ConvSpec {
    function
        .body
        .iter()
        .find_map(|inst| match &inst.op {
            Operation::Conv(spec) => Some(spec.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no convolution in {:?}", op_kinds(function)))
}

#[test]
fn output_extent_formulas() {
    assert_eq!(conv_output_extent(10, 1, 1, 3, 2), Some(5));
    assert_eq!(conv_output_extent(5, 0, 2, 3, 1), Some(1));
    assert_eq!(conv_output_extent(4, 0, 1, 3, 0), None);
    assert_eq!(transposed_conv_output_extent(3, 1, 1, 3, 2, 1), 6);
    assert_eq!(transposed_conv_output_extent(4, 0, 1, 1, 1, 0), 4);
}

#[test_case(1, 1, false, false, ConvStrategy::Direct, ConvKind::Conv1dNcwFcw ; "1d")]
#[test_case(2, 1, false, false, ConvStrategy::Direct, ConvKind::Conv2dNchwFchw ; "2d")]
#[test_case(3, 1, false, false, ConvStrategy::Direct, ConvKind::Conv3dNcdhwFcdhw ; "3d")]
#[test_case(2, 1, true, false, ConvStrategy::QuantizedChannelsLast, ConvKind::Conv2dNhwcHwcfQ ; "quantized 2d")]
#[test_case(3, 1, true, false, ConvStrategy::QuantizedChannelsLast, ConvKind::Conv3dNdhwcDhwcfQ ; "quantized 3d")]
#[test_case(1, 4, false, true, ConvStrategy::Depthwise, ConvKind::DepthwiseConv1dNcwCw ; "depthwise 1d")]
#[test_case(2, 4, false, true, ConvStrategy::Depthwise, ConvKind::DepthwiseConv2dNchwChw ; "depthwise 2d")]
#[test_case(2, 4, true, true, ConvStrategy::Depthwise, ConvKind::DepthwiseConv2dNhwcHwcQ ; "quantized depthwise 2d")]
#[test_case(2, 2, false, false, ConvStrategy::Grouped, ConvKind::Conv2dNgchwGfchw ; "grouped 2d")]
#[test_case(2, 2, true, false, ConvStrategy::Grouped, ConvKind::Conv2dNgchwGfchwQ ; "quantized grouped 2d")]
fn strategy_selection(
    spatial: usize,
    groups: i64,
    quantized: bool,
    depthwise: bool,
    strategy: ConvStrategy,
    kind: ConvKind,
) {
    assert_eq!(
        select_conv_strategy(spatial, groups, quantized, depthwise).expect("supported"),
        (strategy, kind)
    );
}

#[test_case(1, 1, true, false ; "quantized 1d")]
#[test_case(3, 2, false, false ; "grouped 3d")]
#[test_case(1, 2, false, false ; "grouped 1d")]
#[test_case(3, 4, false, true ; "depthwise 3d")]
#[test_case(1, 4, true, true ; "quantized depthwise 1d")]
fn unsupported_strategies(spatial: usize, groups: i64, quantized: bool, depthwise: bool) {
    assert!(select_conv_strategy(spatial, groups, quantized, depthwise).is_err());
}

#[test]
fn depthwise_requires_unit_weight_channels() {
    let s = Dimension::Static;
    assert!(is_depthwise(s(4), s(4), s(1), 4));
    assert!(!is_depthwise(s(4), s(8), s(1), 4));
    assert!(!is_depthwise(Dimension::Dynamic, s(4), s(1), 4));
    assert!(!is_depthwise(s(4), s(4), s(2), 4));
}

#[test]
fn forward_convolution_pads_and_broadcasts_bias() -> Result<()> {
    let params = ConvParams {
        stride: vec![2, 2],
        padding: vec![1, 1],
        bias: Some(3),
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 2, 5, 5]),
        tensor(DType::F32, &[3, 2, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 3, 3, 3]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 1, "{:?}", stats.diagnostics);
    assert_eq!(count(&function, OperationKind::Convolution), 0);
    assert_eq!(count(&function, OperationKind::Pad), 1);
    assert_eq!(count(&function, OperationKind::BroadcastTo), 1);
    assert!(assert_messages(&function).is_empty());
    assert_eq!(
        conv_spec(&function),
        ConvSpec {
            kind: ConvKind::Conv2dNchwFchw,
            strides: vec![2, 2],
            dilations: vec![1, 1],
        }
    );
    assert_eq!(function.results[0], tensor(DType::F32, &[1, 3, 3, 3]));
    Ok(())
}

#[test]
fn unpadded_convolution_skips_the_pad() -> Result<()> {
    let mut function = conv_function(
        tensor(DType::F32, &[2, 3, 8]),
        tensor(DType::F32, &[4, 3, 3]),
        &ConvParams::forward(1),
        tensor(DType::F32, &[2, 4, 6]),
        None,
    );
    lower(&mut function, LoweringConfig::default())?;
    assert_eq!(count(&function, OperationKind::Pad), 0);
    assert_eq!(conv_spec(&function).kind, ConvKind::Conv1dNcwFcw);
    Ok(())
}

#[test]
fn depthwise_convolution_collapses_the_filter() -> Result<()> {
    let params = ConvParams {
        groups: 4,
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 4, 5, 5]),
        tensor(DType::F32, &[4, 1, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 4, 3, 3]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 1, "{:?}", stats.diagnostics);
    assert_eq!(conv_spec(&function).kind, ConvKind::DepthwiseConv2dNchwChw);
    assert_eq!(count(&function, OperationKind::CollapseShape), 1);
    Ok(())
}

#[test]
fn grouped_convolution_splits_channels() -> Result<()> {
    let params = ConvParams {
        groups: 2,
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 4, 5, 5]),
        tensor(DType::F32, &[6, 2, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 6, 3, 3]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 1, "{:?}", stats.diagnostics);
    assert_eq!(conv_spec(&function).kind, ConvKind::Conv2dNgchwGfchw);
    // Input, filter and init are split per group; the result is merged back.
    assert_eq!(count(&function, OperationKind::ExpandShape), 3);
    assert_eq!(count(&function, OperationKind::CollapseShape), 1);
    assert_eq!(function.results[0], tensor(DType::F32, &[1, 6, 3, 3]));
    Ok(())
}

#[test]
fn grouped_three_dimensional_convolution_is_unimplemented() -> Result<()> {
    let params = ConvParams {
        groups: 2,
        ..ConvParams::forward(3)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 4, 3, 3, 3]),
        tensor(DType::F32, &[4, 2, 1, 1, 1]),
        &params,
        tensor(DType::F32, &[1, 4, 3, 3, 3]),
        None,
    );
    let original = function.clone();
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert_eq!(function, original);
    assert!(stats.diagnostics[0].message.contains("unimplemented"));
    Ok(())
}

#[test]
fn statically_invalid_groups_are_rejected() -> Result<()> {
    let params = ConvParams {
        groups: 3,
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 4, 5, 5]),
        tensor(DType::F32, &[3, 1, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 3, 3, 3]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert!(stats.diagnostics[0]
        .message
        .contains("groups must divide input channels"));
    Ok(())
}

#[test]
fn bias_length_mismatch_is_rejected() -> Result<()> {
    let params = ConvParams {
        bias: Some(5),
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 2, 5, 5]),
        tensor(DType::F32, &[3, 2, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 3, 3, 3]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert!(stats.diagnostics[0]
        .message
        .contains("bias length must match output channels"));
    Ok(())
}

#[test]
fn dynamic_channels_are_checked_at_run_time() -> Result<()> {
    let mut function = conv_function(
        tensor_dyn(DType::F32, &[None, None, Some(5), Some(5)]),
        tensor(DType::F32, &[3, 2, 3, 3]),
        &ConvParams::forward(2),
        tensor_dyn(DType::F32, &[None, Some(3), Some(3), Some(3)]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 1, "{:?}", stats.diagnostics);
    assert_eq!(
        assert_messages(&function),
        ["input channels must equal weight channels times groups"]
    );
    Ok(())
}

#[test]
fn transposed_convolution_scatters_input_and_flips_kernel() -> Result<()> {
    let params = ConvParams {
        stride: vec![2, 2],
        padding: vec![1, 1],
        output_padding: vec![1, 1],
        transposed: true,
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 2, 3, 3]),
        tensor(DType::F32, &[2, 3, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 3, 6, 6]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 1, "{:?}", stats.diagnostics);
    assert_eq!(count(&function, OperationKind::Transpose), 1);
    assert_eq!(count(&function, OperationKind::Reverse), 1);
    assert_eq!(count(&function, OperationKind::InsertSlice), 1);
    assert_eq!(count(&function, OperationKind::Pad), 0);
    let spec = conv_spec(&function);
    assert_eq!(spec.kind, ConvKind::Conv2dNchwFchw);
    assert_eq!(spec.strides, vec![1, 1]);
    assert_eq!(function.results[0], tensor(DType::F32, &[1, 3, 6, 6]));
    Ok(())
}

#[test]
fn transposed_convolution_with_groups_is_unimplemented() -> Result<()> {
    let params = ConvParams {
        transposed: true,
        groups: 2,
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::F32, &[1, 4, 3, 3]),
        tensor(DType::F32, &[4, 2, 3, 3]),
        &params,
        tensor(DType::F32, &[1, 4, 5, 5]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert!(stats.diagnostics[0]
        .message
        .contains("transposed convolution with groups != 1"));
    Ok(())
}

#[test]
fn runtime_transposed_flag_is_rejected() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    let input = builder.add_parameter(tensor(DType::F32, &[1, 2, 5, 5]));
    let weight = builder.add_parameter(tensor(DType::F32, &[3, 2, 3, 3]));
    let transposed = builder.add_parameter(ValueType::Bool);
    let bias = builder.constant_none();
    let ones = builder.int_list(&[1, 1]);
    let zeros = builder.int_list(&[0, 0]);
    let groups = builder.constant_int(1);
    let out = builder.emit_single(
        Operation::Convolution,
        vec![
            input.into(),
            weight.into(),
            bias.into(),
            ones.into(),
            zeros.into(),
            ones.into(),
            transposed.into(),
            zeros.into(),
            groups.into(),
        ],
        tensor(DType::F32, &[1, 3, 3, 3]),
    );
    let mut function = builder.finish("main", vec![out]);
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert!(stats.diagnostics[0]
        .message
        .contains("transposed must be a compile-time constant"));
    Ok(())
}

#[test]
fn unsupported_spatial_rank_is_reported() -> Result<()> {
    let mut function = conv_function(
        tensor(DType::F32, &[1, 1, 2, 2, 2, 2]),
        tensor(DType::F32, &[1, 1, 1, 1, 1, 1]),
        &ConvParams::forward(4),
        tensor(DType::F32, &[1, 1, 2, 2, 2, 2]),
        None,
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert!(stats.diagnostics[0].message.contains("unsupported spatial rank 4"));
    Ok(())
}

#[test]
fn quantized_convolution_runs_channels_last() -> Result<()> {
    let params = ConvParams {
        padding: vec![1, 1],
        bias: Some(2),
        ..ConvParams::forward(2)
    };
    let mut function = conv_function(
        tensor(DType::Ui8, &[1, 2, 4, 4]),
        tensor(DType::Si8, &[2, 2, 3, 3]),
        &params,
        tensor(DType::Si32, &[1, 2, 4, 4]),
        Some((3, 0)),
    );
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 1, "{:?}", stats.diagnostics);
    assert_eq!(conv_spec(&function).kind, ConvKind::Conv2dNhwcHwcfQ);
    // Input, filter and init go channels-last, the result comes back.
    assert_eq!(count(&function, OperationKind::Transpose), 4);

    let pad = function
        .body
        .iter()
        .find(|inst| matches!(inst.op, Operation::Pad(_)))
        .context("padded input")?;
    // The shifted input zero-point pads the input.
    assert_eq!(pad.operands[1], Operand::Literal(Literal::Int(3 - 128)));
    let conv = function
        .body
        .iter()
        .find(|inst| matches!(inst.op, Operation::Conv(_)))
        .context("convolution")?;
    assert_eq!(conv.operands[2], Operand::Literal(Literal::Int(3 - 128)));
    assert_eq!(conv.operands[3], Operand::Literal(Literal::Int(0)));
    Ok(())
}

#[test]
fn mixed_quantization_convolution_is_rejected() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    let input = builder.add_parameter(tensor(DType::Si8, &[1, 2, 4, 4]));
    let input = common::quantize(&mut builder, input, 0);
    let weight = builder.add_parameter(tensor(DType::Si8, &[2, 2, 1, 1]));
    let bias = builder.constant_none();
    let ones = builder.int_list(&[1, 1]);
    let zeros = builder.int_list(&[0, 0]);
    let transposed = builder.constant_bool(false);
    let groups = builder.constant_int(1);
    let out = builder.emit_single(
        Operation::Convolution,
        vec![
            input.into(),
            weight.into(),
            bias.into(),
            ones.into(),
            zeros.into(),
            ones.into(),
            transposed.into(),
            zeros.into(),
            groups.into(),
        ],
        tensor(DType::Si32, &[1, 2, 4, 4]),
    );
    let mut function = builder.finish("main", vec![out]);
    let stats = lower(&mut function, LoweringConfig::default())?;
    assert_eq!(stats.applied, 0);
    assert!(stats.diagnostics[0]
        .message
        .contains("mixed quantization is not supported: convolution"));
    Ok(())
}
