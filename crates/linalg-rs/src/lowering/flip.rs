use crate::env::LoweringConfig;
use crate::error::{LoweringError, LoweringResult};
use crate::ir::{
    matchers,
    pattern::{FlipOpView, OpRewritePattern},
    rewriter::ProgramRewriter,
};
use crate::lowering::builder::{LinalgBuilder, Replacement};

pub struct ConvertFlipOp {
    pub config: LoweringConfig,
}

impl OpRewritePattern<FlipOpView> for ConvertFlipOp {
    fn name(&self) -> &'static str {
        "convert-flip"
    }

    fn match_and_rewrite(&self, op: FlipOpView, rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        let root = op.root;
        lower_flip(&op, rewriter, self.config)?.apply(root, rewriter)
    }
}

/// Maps possibly negative `dims` onto `0..rank`, rejecting repeats.
pub fn normalize_dims(dims: &[i64], rank: usize) -> LoweringResult<Vec<usize>> {
    let mut axes: Vec<usize> = Vec::with_capacity(dims.len());
    for &dim in dims {
        let normalized = if dim < 0 { dim + rank as i64 } else { dim };
        if normalized < 0 || normalized >= rank as i64 {
            return Err(LoweringError::InvalidDimension { dim, rank });
        }
        let axis = normalized as usize;
        if axes.contains(&axis) {
            return Err(LoweringError::invalid_parameter(format!(
                "dim {axis} appears more than once"
            )));
        }
        axes.push(axis);
    }
    Ok(axes)
}

pub fn lower_flip(
    op: &FlipOpView,
    rewriter: &ProgramRewriter,
    config: LoweringConfig,
) -> LoweringResult<Replacement> {
    if op.input.is_quantized() {
        return Err(LoweringError::no_match("flip of a quantized tensor"));
    }
    let dims = matchers::match_constant_int_list(rewriter, &op.dims)
        .ok_or(LoweringError::NonConstant("flip dims"))?;
    let axes = normalize_dims(&dims, op.input.rank())?;

    let mut b = LinalgBuilder::new(rewriter, config);
    let result = b.reverse(op.input.value, axes)?;
    let result = b.finish(result, &op.result_type)?;
    Ok(b.into_replacement(result))
}
