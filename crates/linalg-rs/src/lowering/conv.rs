//! Lowering of `convolution`, forward and transposed, over 1-3 spatial axes.

use crate::env::LoweringConfig;
use crate::error::{LoweringError, LoweringResult};
use crate::ir::{
    matchers,
    pattern::{ConvolutionOpView, OpRewritePattern},
    rewriter::ProgramRewriter,
    spec::{ConvKind, ConvSpec, DType, Dimension, Operand, ValueId},
};
use crate::lowering::builder::{floor_div, LinalgBuilder, Replacement};
use crate::lowering::quant::{quantization_pair, to_signed_domain};
use crate::lowering::shape::{Extent, Obligation};

pub struct ConvertConvolutionOp {
    pub config: LoweringConfig,
}

impl OpRewritePattern<ConvolutionOpView> for ConvertConvolutionOp {
    fn name(&self) -> &'static str {
        "convert-convolution"
    }

    fn match_and_rewrite(
        &self,
        op: ConvolutionOpView,
        rewriter: &mut ProgramRewriter,
    ) -> LoweringResult<()> {
        let root = op.root;
        lower_convolution(&op, rewriter, self.config)?.apply(root, rewriter)
    }
}

/// `floor((input + 2*padding - dilation*(kernel-1) - 1) / stride) + 1`
pub fn conv_output_extent(input: i64, padding: i64, dilation: i64, kernel: i64, stride: i64) -> Option<i64> {
    floor_div(input + 2 * padding - dilation * (kernel - 1) - 1, stride).map(|q| q + 1)
}

/// `(input-1)*stride - 2*padding + dilation*(kernel-1) + output_padding + 1`
pub fn transposed_conv_output_extent(
    input: i64,
    padding: i64,
    dilation: i64,
    kernel: i64,
    stride: i64,
    output_padding: i64,
) -> i64 {
    (input - 1) * stride - 2 * padding + dilation * (kernel - 1) + output_padding + 1
}

/// Channel layout used to emit the convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    Direct,
    /// Quantized primitives only exist channels-last; permute around them.
    QuantizedChannelsLast,
    Depthwise,
    Grouped,
}

/// Statically proven depthwise configuration: one input channel per group and
/// one filter per group.
pub fn is_depthwise(
    in_channels: Dimension,
    weight_out_channels: Dimension,
    weight_in_channels: Dimension,
    groups: i64,
) -> bool {
    let groups = usize::try_from(groups).ok();
    groups.is_some()
        && in_channels.as_static() == groups
        && weight_out_channels.as_static() == groups
        && weight_in_channels == Dimension::Static(1)
}

pub fn select_conv_strategy(
    spatial_rank: usize,
    groups: i64,
    quantized: bool,
    depthwise: bool,
) -> LoweringResult<(ConvStrategy, ConvKind)> {
    let unsupported = |what: &str| {
        Err(LoweringError::unimplemented(format!(
            "{what} convolution with {spatial_rank} spatial dimension(s)"
        )))
    };
    if groups == 1 {
        return match (quantized, spatial_rank) {
            (false, 1) => Ok((ConvStrategy::Direct, ConvKind::Conv1dNcwFcw)),
            (false, 2) => Ok((ConvStrategy::Direct, ConvKind::Conv2dNchwFchw)),
            (false, 3) => Ok((ConvStrategy::Direct, ConvKind::Conv3dNcdhwFcdhw)),
            (true, 2) => Ok((ConvStrategy::QuantizedChannelsLast, ConvKind::Conv2dNhwcHwcfQ)),
            (true, 3) => Ok((ConvStrategy::QuantizedChannelsLast, ConvKind::Conv3dNdhwcDhwcfQ)),
            (true, _) => unsupported("quantized"),
            (false, _) => unsupported("ungrouped"),
        };
    }
    if depthwise {
        return match (quantized, spatial_rank) {
            (false, 1) => Ok((ConvStrategy::Depthwise, ConvKind::DepthwiseConv1dNcwCw)),
            (false, 2) => Ok((ConvStrategy::Depthwise, ConvKind::DepthwiseConv2dNchwChw)),
            (true, 2) => Ok((ConvStrategy::Depthwise, ConvKind::DepthwiseConv2dNhwcHwcQ)),
            (true, _) => unsupported("quantized depthwise"),
            (false, _) => unsupported("depthwise"),
        };
    }
    match (quantized, spatial_rank) {
        (false, 2) => Ok((ConvStrategy::Grouped, ConvKind::Conv2dNgchwGfchw)),
        (true, 2) => Ok((ConvStrategy::Grouped, ConvKind::Conv2dNgchwGfchwQ)),
        _ => unsupported("grouped"),
    }
}

fn constant_positive_list(
    rewriter: &ProgramRewriter,
    operand: &Operand,
    len: usize,
    name: &'static str,
) -> LoweringResult<Vec<usize>> {
    let values =
        matchers::match_constant_int_list(rewriter, operand).ok_or(LoweringError::NonConstant(name))?;
    if values.len() != len {
        return Err(LoweringError::invalid_parameter(format!(
            "{name} has {} entries, expected {len}",
            values.len()
        )));
    }
    values
        .iter()
        .map(|value| {
            usize::try_from(*value)
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    LoweringError::invalid_parameter(format!(
                        "{name} entries must be positive, got {value}"
                    ))
                })
        })
        .collect()
}

fn index_list(
    b: &mut LinalgBuilder,
    operand: &Operand,
    len: usize,
    name: &'static str,
) -> LoweringResult<Vec<Extent>> {
    let elements = matchers::list_construct_elements(b.rewriter(), operand)
        .ok_or(LoweringError::NonConstant(name))?;
    if elements.len() != len {
        return Err(LoweringError::invalid_parameter(format!(
            "{name} has {} entries, expected {len}",
            elements.len()
        )));
    }
    elements.iter().map(|element| b.int_to_index(element)).collect()
}

fn reject_static_violations(obligations: &[Obligation]) -> LoweringResult<()> {
    match obligations.iter().find(|obligation| obligation.is_statically_false()) {
        Some(obligation) => Err(LoweringError::invalid_parameter(obligation.message.clone())),
        None => Ok(()),
    }
}

fn negative_extent(extent: Extent, what: &str) -> LoweringResult<()> {
    match extent.as_static() {
        Some(value) if value < 0 => Err(LoweringError::InvalidShape(format!(
            "{what} is negative ({value})"
        ))),
        _ => Ok(()),
    }
}

pub fn lower_convolution(
    op: &ConvolutionOpView,
    rewriter: &ProgramRewriter,
    config: LoweringConfig,
) -> LoweringResult<Replacement> {
    let quant = quantization_pair(&op.input, &op.weight, "convolution")?;
    let transposed = matchers::match_constant_bool(rewriter, &op.transposed)
        .ok_or(LoweringError::NonConstant("transposed"))?;

    let rank = op.input.rank();
    if !(3..=5).contains(&rank) {
        return Err(LoweringError::UnsupportedSpatialRank(rank.saturating_sub(2)));
    }
    let spatial = rank - 2;
    if op.weight.rank() != rank {
        return Err(LoweringError::unsupported_rank(format!(
            "convolution weight has rank {}, input has rank {rank}",
            op.weight.rank()
        )));
    }
    let strides = constant_positive_list(rewriter, &op.stride, spatial, "stride")?;
    let dilations = constant_positive_list(rewriter, &op.dilation, spatial, "dilation")?;
    let groups =
        matchers::match_constant_int(rewriter, &op.groups).ok_or(LoweringError::NonConstant("groups"))?;
    if groups <= 0 {
        return Err(LoweringError::invalid_parameter(format!(
            "groups must be positive, got {groups}"
        )));
    }
    if transposed && groups != 1 {
        return Err(LoweringError::unimplemented("transposed convolution with groups != 1"));
    }
    if quant.is_none() && op.input.spec.dtype != op.weight.spec.dtype {
        return Err(LoweringError::ElementTypeMismatch(format!(
            "convolution input is {:?} but weight is {:?}",
            op.input.spec.dtype, op.weight.spec.dtype
        )));
    }
    if let Some(bias) = &op.bias {
        if bias.rank() != 1 {
            return Err(LoweringError::unsupported_rank(format!(
                "convolution bias must have rank 1, got {}",
                bias.rank()
            )));
        }
        if quant.is_some() && bias.spec.dtype != DType::Si32 {
            return Err(LoweringError::UnsupportedElementType(format!(
                "quantized convolution bias must be Si32, got {:?}",
                bias.spec.dtype
            )));
        }
    }

    let mut b = LinalgBuilder::new(rewriter, config);
    let padding = index_list(&mut b, &op.padding, spatial, "padding")?;
    let output_padding = if transposed {
        index_list(&mut b, &op.output_padding, spatial, "output_padding")?
    } else {
        vec![Extent::Static(0); spatial]
    };

    let (input, weight, zero_points, in_dtype) = match quant {
        Some((input_quant, weight_quant)) => {
            let input = to_signed_domain(&mut b, &op.input, input_quant)?;
            let weight = to_signed_domain(&mut b, &op.weight, weight_quant)?;
            (
                input.value,
                weight.value,
                Some((input.zero_point, weight.zero_point)),
                input.dtype,
            )
        }
        None => (op.input.value, op.weight.value, None, op.input.spec.dtype),
    };
    let acc = in_dtype.default_accumulator();

    let input_dims = b.dims(input)?;
    let weight_dims = b.dims(weight)?;
    let (n, in_channels) = (input_dims[0], input_dims[1]);
    let group_extent = Extent::Static(groups);

    let mut obligations = Vec::new();
    let out_channels = if transposed {
        obligations.push(Obligation::equal(
            in_channels,
            weight_dims[0],
            "input channels must match the weight's leading dimension",
        ));
        weight_dims[1]
    } else {
        obligations.push(Obligation::divides(
            group_extent,
            in_channels,
            "groups must divide input channels",
        ));
        obligations.push(Obligation::divides(
            group_extent,
            weight_dims[0],
            "groups must divide weight output channels",
        ));
        let expected = b.mul(weight_dims[1], group_extent);
        obligations.push(Obligation::equal(
            in_channels,
            expected,
            "input channels must equal weight channels times groups",
        ));
        weight_dims[0]
    };
    if let Some(bias) = &op.bias {
        let length = b.dim(bias.value, 0)?;
        obligations.push(Obligation::equal(
            length,
            out_channels,
            "bias length must match output channels",
        ));
    }
    reject_static_violations(&obligations)?;
    b.emit_obligations(obligations);

    let pad_value = match &zero_points {
        Some((input_zp, _)) => b.scalar_convert(input_zp, in_dtype)?,
        None => LinalgBuilder::zero_literal(in_dtype),
    };

    // Transposed convolution becomes a stride-1 forward convolution over a
    // buffer with the input scattered at `stride` and a flipped kernel.
    let (padded, weight, conv_strides, out_spatial) = if transposed {
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(0, 1);
        let weight = b.transpose(weight, &perm)?;
        let weight = b.reverse(weight, (2..rank).collect())?;

        let mut outer = Vec::with_capacity(spatial);
        let mut offsets = vec![Extent::Static(0), Extent::Static(0)];
        let mut out_spatial = Vec::with_capacity(spatial);
        let mut offset_checks = Vec::new();
        for i in 0..spatial {
            let kernel_minus_one = b.sub(weight_dims[2 + i], Extent::Static(1));
            let dilated = b.mul(Extent::Static(dilations[i] as i64), kernel_minus_one);
            let offset = b.sub(dilated, padding[i]);
            negative_extent(offset, "transposed convolution padding offset")?;
            offset_checks.push(Obligation::non_negative(
                offset,
                "padding exceeds the dilated kernel of a transposed convolution",
            ));
            let in_minus_one = b.sub(input_dims[2 + i], Extent::Static(1));
            let strided = b.mul(in_minus_one, Extent::Static(strides[i] as i64));
            let twice = b.mul(offset, Extent::Static(2));
            let base = b.add(twice, strided);
            let base = b.add(base, Extent::Static(1));
            let extent = b.add(base, output_padding[i]);
            let out = b.sub(extent, dilated);
            negative_extent(out, "transposed convolution output extent")?;
            outer.push(extent);
            offsets.push(offset);
            out_spatial.push(out);
        }
        b.emit_obligations(offset_checks);

        let buffer_extents = [&[n, in_channels][..], &outer[..]].concat();
        let buffer = b.empty(in_dtype, &buffer_extents)?;
        let buffer = b.fill(pad_value.clone(), buffer)?;
        let mut slice_strides = vec![1, 1];
        slice_strides.extend(strides.iter().copied());
        let scattered = b.insert_slice(input, buffer, &offsets, slice_strides)?;
        (scattered, weight, vec![1; spatial], out_spatial)
    } else {
        let mut low = vec![Extent::Static(0), Extent::Static(0)];
        low.extend(padding.iter().copied());
        let padded = b.pad(input, pad_value.clone(), &low, &low)?;
        let mut out_spatial = Vec::with_capacity(spatial);
        for i in 0..spatial {
            let twice_pad = b.mul(padding[i], Extent::Static(2));
            let padded_extent = b.add(input_dims[2 + i], twice_pad);
            let kernel_minus_one = b.sub(weight_dims[2 + i], Extent::Static(1));
            let dilated = b.mul(Extent::Static(dilations[i] as i64), kernel_minus_one);
            let numerator = b.sub(padded_extent, dilated);
            let numerator = b.sub(numerator, Extent::Static(1));
            let quotient = b.floor_div(numerator, Extent::Static(strides[i] as i64));
            let out = b.add(quotient, Extent::Static(1));
            negative_extent(out, "convolution output extent")?;
            out_spatial.push(out);
        }
        (padded, weight, strides.clone(), out_spatial)
    };

    let out_extents = [&[n, out_channels][..], &out_spatial[..]].concat();
    let init = match &op.bias {
        None => b.zeros(acc, &out_extents)?,
        Some(bias) => {
            let bias = b.cast(bias.value, acc)?;
            b.broadcast_to(bias, &out_extents, vec![1])?
        }
    };

    let weight_spec = b.tensor_spec(weight)?;
    let input_spec = b.tensor_spec(input)?;
    let depthwise = !transposed
        && is_depthwise(
            input_spec.shape.dims()[1],
            weight_spec.shape.dims()[0],
            weight_spec.shape.dims()[1],
            groups,
        );
    let (strategy, kind) = select_conv_strategy(spatial, groups, zero_points.is_some(), depthwise)?;
    tracing::debug!(?strategy, ?kind, transposed, groups, "convolution dispatch");

    let spec = ConvSpec {
        kind,
        strides: conv_strides,
        dilations,
    };
    let conv_inputs = |input: ValueId, weight: ValueId| {
        let mut operands = vec![Operand::Value(input), Operand::Value(weight)];
        if let Some((input_zp, weight_zp)) = &zero_points {
            operands.push(input_zp.clone());
            operands.push(weight_zp.clone());
        }
        operands
    };

    let result = match strategy {
        ConvStrategy::Direct => b.conv(spec, conv_inputs(padded, weight), init)?,
        ConvStrategy::QuantizedChannelsLast => {
            let to_channels_last = channels_last_perm(rank);
            let mut weight_perm: Vec<usize> = (2..rank).collect();
            weight_perm.extend([1, 0]);
            let input = b.transpose(padded, &to_channels_last)?;
            let weight = b.transpose(weight, &weight_perm)?;
            let init = b.transpose(init, &to_channels_last)?;
            let result = b.conv(spec, conv_inputs(input, weight), init)?;
            b.transpose(result, &channels_first_perm(rank))?
        }
        ConvStrategy::Depthwise => {
            let mut groups_map = vec![vec![0, 1]];
            groups_map.extend((2..rank).map(|axis| vec![axis]));
            let weight = b.collapse_shape(weight, groups_map)?;
            if zero_points.is_some() {
                let input = b.transpose(padded, &channels_last_perm(rank))?;
                let weight = b.transpose(weight, &[1, 2, 0])?;
                let init = b.transpose(init, &channels_last_perm(rank))?;
                let result = b.conv(spec, conv_inputs(input, weight), init)?;
                b.transpose(result, &channels_first_perm(rank))?
            } else {
                b.conv(spec, conv_inputs(padded, weight), init)?
            }
        }
        ConvStrategy::Grouped => {
            let channel_split = vec![vec![0], vec![1, 2], vec![3], vec![4]];
            let filter_split = vec![vec![0, 1], vec![2], vec![3], vec![4]];

            let padded_dims = b.dims(padded)?;
            let in_per_group = b.floor_div(in_channels, group_extent);
            let input = b.expand_shape(
                padded,
                channel_split.clone(),
                &[padded_dims[0], group_extent, in_per_group, padded_dims[2], padded_dims[3]],
            )?;

            let out_per_group = b.floor_div(out_channels, group_extent);
            let weight = b.expand_shape(
                weight,
                filter_split,
                &[group_extent, out_per_group, weight_dims[1], weight_dims[2], weight_dims[3]],
            )?;

            let init = b.expand_shape(
                init,
                channel_split.clone(),
                &[n, group_extent, out_per_group, out_extents[2], out_extents[3]],
            )?;
            let result = b.conv(spec, conv_inputs(input, weight), init)?;
            b.collapse_shape(result, channel_split)?
        }
    };

    let result = b.cast(result, op.result_type.dtype)?;
    let result = b.finish(result, &op.result_type)?;
    Ok(b.into_replacement(result))
}

/// `[0, 2, .., rank-1, 1]`
fn channels_last_perm(rank: usize) -> Vec<usize> {
    let mut perm = vec![0];
    perm.extend(2..rank);
    perm.push(1);
    perm
}

/// `[0, rank-1, 1, .., rank-2]`
fn channels_first_perm(rank: usize) -> Vec<usize> {
    let mut perm = vec![0, rank - 1];
    perm.extend(1..rank - 1);
    perm
}
