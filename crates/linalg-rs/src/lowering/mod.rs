//! Rewrite patterns lowering the linear-algebra operators.

pub mod broadcast;
pub mod builder;
pub mod conv;
pub mod flip;
pub mod matmul;
pub mod quant;
pub mod shape;
pub mod trilinear;

use crate::env::LoweringConfig;
use crate::ir::driver::{convert_program, ConversionConfig, ConversionError, ConversionStats};
use crate::ir::legality::{ConversionTarget, OperationKind};
use crate::ir::pattern::{
    BmmOpView, ConvolutionOpView, FlipOpView, MatmulOpView, MmOpView, PatternSet, TrilinearOpView,
};
use crate::ir::spec::Program;
use crate::register_patterns_for_view;

pub use builder::{LinalgBuilder, Replacement};
pub use conv::ConvertConvolutionOp;
pub use flip::ConvertFlipOp;
pub use matmul::{ConvertBmmOp, ConvertMatmulOp, ConvertMmOp};
pub use trilinear::ConvertTrilinearOp;

/// Marks the six operators illegal and registers one lowering pattern for each.
pub fn populate_linear_patterns_and_legality(
    patterns: &mut PatternSet,
    target: &mut ConversionTarget,
    config: LoweringConfig,
) {
    target
        .add_illegal_op(OperationKind::Mm)
        .add_illegal_op(OperationKind::Flip)
        .add_illegal_op(OperationKind::Matmul)
        .add_illegal_op(OperationKind::Bmm)
        .add_illegal_op(OperationKind::Convolution)
        .add_illegal_op(OperationKind::Trilinear);

    register_patterns_for_view!(patterns, MmOpView, ConvertMmOp { config });
    register_patterns_for_view!(patterns, FlipOpView, ConvertFlipOp { config });
    register_patterns_for_view!(patterns, MatmulOpView, ConvertMatmulOp { config });
    register_patterns_for_view!(patterns, BmmOpView, ConvertBmmOp { config });
    register_patterns_for_view!(patterns, ConvolutionOpView, ConvertConvolutionOp { config });
    register_patterns_for_view!(patterns, TrilinearOpView, ConvertTrilinearOp { config });
    tracing::debug!(patterns = patterns.len(), "registered linear lowering patterns");
}

/// Lowers every linear-algebra operator of `program`, failing if any remains.
pub fn lower_linear_ops(
    program: &mut Program,
    config: LoweringConfig,
) -> Result<ConversionStats, ConversionError> {
    let mut patterns = PatternSet::new();
    let mut target = ConversionTarget::new();
    populate_linear_patterns_and_legality(&mut patterns, &mut target, config);
    convert_program(program, &patterns.freeze(), &target, &ConversionConfig::default())
}
