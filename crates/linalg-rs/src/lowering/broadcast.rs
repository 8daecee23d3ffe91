//! Batch broadcasting for N-D matmul.

use crate::error::{LoweringError, LoweringResult};
use crate::ir::spec::Dimension;
use crate::lowering::builder::LinalgBuilder;
use crate::lowering::shape::{Extent, Obligation};

/// Where a broadcast batch extent comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastSource {
    Static(usize),
    Lhs,
    Rhs,
    /// Both sides are dynamic; the extent is their maximum.
    Max,
}

/// Right-aligned broadcast of two batch shapes.
///
/// Static pairs must be equal or contain a 1. A dynamic extent paired with a
/// static non-unit extent takes the static one; its compatibility is checked
/// at run time.
pub fn plan_batch_broadcast(
    lhs: &[Dimension],
    rhs: &[Dimension],
) -> LoweringResult<Vec<BroadcastSource>> {
    let rank = lhs.len().max(rhs.len());
    let lhs_offset = rank - lhs.len();
    let rhs_offset = rank - rhs.len();
    (0..rank)
        .map(|axis| {
            let l = axis.checked_sub(lhs_offset).map(|idx| lhs[idx]);
            let r = axis.checked_sub(rhs_offset).map(|idx| rhs[idx]);
            match (l, r) {
                (Some(Dimension::Static(a)), Some(Dimension::Static(b))) => {
                    if a == b || b == 1 {
                        Ok(BroadcastSource::Static(a))
                    } else if a == 1 {
                        Ok(BroadcastSource::Static(b))
                    } else {
                        Err(LoweringError::Unbroadcastable { lhs: a, rhs: b })
                    }
                }
                (Some(Dimension::Static(1)), Some(Dimension::Dynamic)) => Ok(BroadcastSource::Rhs),
                (Some(Dimension::Dynamic), Some(Dimension::Static(1))) => Ok(BroadcastSource::Lhs),
                (Some(Dimension::Static(a)), Some(Dimension::Dynamic))
                | (Some(Dimension::Dynamic), Some(Dimension::Static(a))) => {
                    Ok(BroadcastSource::Static(a))
                }
                (Some(Dimension::Dynamic), Some(Dimension::Dynamic)) => Ok(BroadcastSource::Max),
                (Some(Dimension::Static(a)), None) | (None, Some(Dimension::Static(a))) => {
                    Ok(BroadcastSource::Static(a))
                }
                (Some(Dimension::Dynamic), None) => Ok(BroadcastSource::Lhs),
                (None, Some(Dimension::Dynamic)) => Ok(BroadcastSource::Rhs),
                (None, None) => Err(LoweringError::InvalidShape("empty batch axis".into())),
            }
        })
        .collect()
}

/// How the batch dimensions of a matmul are contracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// A single batch axis: batch matmul directly.
    Direct,
    /// Several batch axes, at most one dynamic: flatten, batch matmul, expand.
    Collapsed,
    /// Several dynamic batch axes: indexed contraction over every axis.
    Generic,
}

pub fn select_batch_strategy(
    plan: &[BroadcastSource],
    quantized: bool,
) -> LoweringResult<BatchStrategy> {
    if plan.len() <= 1 {
        return Ok(BatchStrategy::Direct);
    }
    let dynamic = plan
        .iter()
        .filter(|source| !matches!(source, BroadcastSource::Static(_)))
        .count();
    if dynamic <= 1 {
        return Ok(BatchStrategy::Collapsed);
    }
    if quantized {
        return Err(LoweringError::unimplemented(
            "quantized matmul with more than one dynamic batch dimension",
        ));
    }
    Ok(BatchStrategy::Generic)
}

/// Materializes the broadcast batch extents and the checks that each operand
/// extent is 1 or equal to the broadcast extent.
pub fn materialize_batch_extents(
    builder: &mut LinalgBuilder,
    plan: &[BroadcastSource],
    lhs: &[Extent],
    rhs: &[Extent],
) -> (Vec<Extent>, Vec<Obligation>) {
    let rank = plan.len();
    let lhs_offset = rank - lhs.len();
    let rhs_offset = rank - rhs.len();
    let mut extents = Vec::with_capacity(rank);
    let mut obligations = Vec::new();
    for (axis, source) in plan.iter().enumerate() {
        let l = axis.checked_sub(lhs_offset).map(|idx| lhs[idx]);
        let r = axis.checked_sub(rhs_offset).map(|idx| rhs[idx]);
        let extent = match (source, l, r) {
            (BroadcastSource::Static(value), _, _) => Extent::Static(*value as i64),
            (BroadcastSource::Lhs, Some(l), _) => l,
            (BroadcastSource::Rhs, _, Some(r)) => r,
            (BroadcastSource::Max, Some(l), Some(r)) => builder.max(l, r),
            (_, Some(l), None) => l,
            (_, None, Some(r)) => r,
            (_, _, _) => Extent::Static(1),
        };
        for (side, input) in [("lhs", l), ("rhs", r)] {
            if let Some(input) = input {
                obligations.push(Obligation::broadcastable(
                    input,
                    extent,
                    format!("{side} batch dimension {axis} is not broadcastable"),
                ));
            }
        }
        extents.push(extent);
    }
    (extents, obligations)
}
