//! Lowering of `trilinear`.
//!
//! The three operands are unsqueezed into one unified axis space, then the
//! unroll axis is walked explicitly: every step slices the operands, multiplies
//! and reduces in two stages, and yields one partial result. The partials are
//! concatenated along the unroll axis, or summed when that axis is itself
//! reduced.

use crate::env::LoweringConfig;
use crate::error::{LoweringError, LoweringResult};
use crate::ir::{
    matchers,
    pattern::{OpRewritePattern, TrilinearOpView},
    rewriter::ProgramRewriter,
    spec::{ElementwiseBinaryOp, Operand, ValueId},
};
use crate::lowering::builder::{
    unit_axes_insertion_groups, unit_axis_removal_groups, LinalgBuilder, Replacement,
};
use crate::lowering::flip::normalize_dims;
use crate::lowering::shape::{Extent, Obligation};

pub struct ConvertTrilinearOp {
    pub config: LoweringConfig,
}

impl OpRewritePattern<TrilinearOpView> for ConvertTrilinearOp {
    fn name(&self) -> &'static str {
        "convert-trilinear"
    }

    fn match_and_rewrite(
        &self,
        op: TrilinearOpView,
        rewriter: &mut ProgramRewriter,
    ) -> LoweringResult<()> {
        let root = op.root;
        lower_trilinear(&op, rewriter, self.config)?.apply(root, rewriter)
    }
}

/// Axis bookkeeping over the unified axis space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrilinearPlan {
    pub rank: usize,
    pub expanded: [Vec<bool>; 3],
    pub summed: Vec<bool>,
    pub unroll: usize,
    /// Summed axes reduced right after `i1 * i2`: the axes `i3` does not have.
    pub sum12: Vec<usize>,
    /// The remaining summed axes, reduced after multiplying by `i3`.
    pub sum23: Vec<usize>,
}

impl TrilinearPlan {
    pub fn new(
        ranks: [usize; 3],
        expands: [&[i64]; 3],
        sum_dims: &[i64],
        unroll_dim: i64,
    ) -> LoweringResult<Self> {
        let rank = ranks[0] + expands[0].len();
        for operand in 1..3 {
            let unified = ranks[operand] + expands[operand].len();
            if unified != rank {
                return Err(LoweringError::InvalidShape(format!(
                    "trilinear operand {} spans {unified} unified axes, operand 1 spans {rank}",
                    operand + 1
                )));
            }
        }

        let mask = |dims: &[i64]| -> LoweringResult<Vec<bool>> {
            let mut mask = vec![false; rank];
            for axis in normalize_dims(dims, rank)? {
                mask[axis] = true;
            }
            Ok(mask)
        };
        let expanded = [mask(expands[0])?, mask(expands[1])?, mask(expands[2])?];
        let summed = mask(sum_dims)?;
        let unroll = normalize_dims(&[unroll_dim], rank)?[0];

        let (sum12, sum23): (Vec<usize>, Vec<usize>) = (0..rank)
            .filter(|axis| summed[*axis] && *axis != unroll)
            .partition(|axis| expanded[2][*axis]);

        Ok(Self {
            rank,
            expanded,
            summed,
            unroll,
            sum12,
            sum23,
        })
    }

    /// Operands present on `axis`, in priority order i3, i2, i1.
    fn present_on(&self, axis: usize) -> impl Iterator<Item = usize> + '_ {
        (0..3).rev().filter(move |operand| !self.expanded[*operand][axis])
    }

    /// Summed axes, highest first.
    pub fn squeeze_order(&self) -> Vec<usize> {
        (0..self.rank).rev().filter(|axis| self.summed[*axis]).collect()
    }
}

/// Size-1 slice of an unsqueezed operand at `step` along the unroll axis. An
/// operand expanded on that axis is always read at offset 0.
fn unroll_slice(
    b: &mut LinalgBuilder,
    plan: &TrilinearPlan,
    operand: usize,
    (value, dims): &(ValueId, Vec<Extent>),
    step: i64,
) -> LoweringResult<ValueId> {
    let mut offsets = vec![Extent::Static(0); plan.rank];
    let mut sizes = dims.clone();
    if !plan.expanded[operand][plan.unroll] {
        offsets[plan.unroll] = Extent::Static(step);
    }
    sizes[plan.unroll] = Extent::Static(1);
    b.extract_slice(*value, &offsets, &sizes, vec![1; plan.rank])
}

fn constant_list(rewriter: &ProgramRewriter, operand: &Operand, name: &'static str) -> LoweringResult<Vec<i64>> {
    matchers::match_constant_int_list(rewriter, operand).ok_or(LoweringError::NonConstant(name))
}

pub fn lower_trilinear(
    op: &TrilinearOpView,
    rewriter: &ProgramRewriter,
    config: LoweringConfig,
) -> LoweringResult<Replacement> {
    if op.inputs.iter().any(|input| input.is_quantized()) {
        return Err(LoweringError::no_match("trilinear of quantized tensors"));
    }
    let expand1 = constant_list(rewriter, &op.expands[0], "expand1")?;
    let expand2 = constant_list(rewriter, &op.expands[1], "expand2")?;
    let expand3 = constant_list(rewriter, &op.expands[2], "expand3")?;
    let sum_dims = constant_list(rewriter, &op.sum_dims, "sumdim")?;
    let unroll_dim = matchers::match_constant_int(rewriter, &op.unroll_dim)
        .ok_or(LoweringError::NonConstant("unroll_dim"))?;

    let dtype = op.inputs[0].spec.dtype;
    if op.inputs.iter().any(|input| input.spec.dtype != dtype) || op.result_type.dtype != dtype {
        return Err(LoweringError::ElementTypeMismatch(format!(
            "trilinear operands {:?}, {:?}, {:?} with result {:?}",
            op.inputs[0].spec.dtype, op.inputs[1].spec.dtype, op.inputs[2].spec.dtype, op.result_type.dtype
        )));
    }

    let plan = TrilinearPlan::new(
        [op.inputs[0].rank(), op.inputs[1].rank(), op.inputs[2].rank()],
        [&expand1[..], &expand2[..], &expand3[..]],
        &sum_dims,
        unroll_dim,
    )?;
    let rank = plan.rank;

    let mut b = LinalgBuilder::new(rewriter, config);

    // Unsqueeze every operand into the unified axis space.
    let mut unified = Vec::with_capacity(3);
    for (operand, input) in op.inputs.iter().enumerate() {
        let mut extents = Vec::with_capacity(rank);
        let mut next = 0;
        for axis in 0..rank {
            if plan.expanded[operand][axis] {
                extents.push(Extent::Static(1));
            } else {
                extents.push(b.dim(input.value, next)?);
                next += 1;
            }
        }
        let value = if next == rank {
            input.value
        } else {
            let groups = unit_axes_insertion_groups(&plan.expanded[operand]);
            b.expand_shape(input.value, groups, &extents)?
        };
        unified.push((value, extents));
    }

    let mut extents = Vec::with_capacity(rank);
    let mut obligations = Vec::new();
    for axis in 0..rank {
        let mut present = plan.present_on(axis);
        let extent = match present.next() {
            Some(first) => {
                let extent = unified[first].1[axis];
                for other in present {
                    obligations.push(Obligation::equal(
                        unified[other].1[axis],
                        extent,
                        format!("trilinear operands disagree on unified dimension {axis}"),
                    ));
                }
                extent
            }
            None => Extent::Static(1),
        };
        extents.push(extent);
    }
    if let Some(violated) = obligations.iter().find(|obligation| obligation.is_statically_false()) {
        return Err(LoweringError::invalid_parameter(violated.message.clone()));
    }
    b.emit_obligations(obligations);

    let unroll_size = extents[plan.unroll].as_static().ok_or_else(|| {
        LoweringError::unimplemented("trilinear with a dynamic unroll dimension")
    })?;
    tracing::debug!(
        rank,
        unroll = plan.unroll,
        unroll_size,
        sum12 = ?plan.sum12,
        sum23 = ?plan.sum23,
        "trilinear plan"
    );

    let mut partials = Vec::with_capacity(unroll_size.max(0) as usize);
    for step in 0..unroll_size {
        let s1 = unroll_slice(&mut b, &plan, 0, &unified[0], step)?;
        let s2 = unroll_slice(&mut b, &plan, 1, &unified[1], step)?;
        let s3 = unroll_slice(&mut b, &plan, 2, &unified[2], step)?;
        let product = b.binary(ElementwiseBinaryOp::Mul, s1, Operand::Value(s2), dtype)?;
        let product = b.reduce_sum(product, plan.sum12.clone(), true)?;
        let product = b.binary(ElementwiseBinaryOp::Mul, product, Operand::Value(s3), dtype)?;
        partials.push(b.reduce_sum(product, plan.sum23.clone(), true)?);
    }

    let mut output = match partials.split_first() {
        None => {
            let mut keepdims = extents.clone();
            for axis in 0..rank {
                if plan.summed[axis] {
                    keepdims[axis] = Extent::Static(1);
                }
            }
            b.zeros(dtype, &keepdims)?
        }
        Some((first, rest)) if plan.summed[plan.unroll] => {
            let mut sum = *first;
            for partial in rest {
                sum = b.binary(ElementwiseBinaryOp::Add, sum, Operand::Value(*partial), dtype)?;
            }
            sum
        }
        Some(_) => b.concat(&partials, plan.unroll)?,
    };

    for axis in plan.squeeze_order() {
        let current = b.tensor_spec(output)?.rank();
        output = b.collapse_shape(output, unit_axis_removal_groups(current, axis))?;
    }

    let output = b.finish(output, &op.result_type)?;
    Ok(b.into_replacement(output))
}
