mod common;

use anyhow::{Context, Result};
use common::{binary_function, count, tensor};
use linalg_rs::ir::{
    driver::{apply_full_conversion, apply_partial_conversion, ConversionConfig, ConversionError},
    legality::{check_program_legality, ConversionStage, ConversionTarget, OperationKind},
    pattern::{FlipOpView, OpRewritePattern, PatternSet},
    rewriter::ProgramRewriter,
    spec::{AssertSpec, DType, Function, Literal, Operation, Program, ProgramBuilder, ValueType},
};
use linalg_rs::lowering::{lower_linear_ops, populate_linear_patterns_and_legality, ConvertFlipOp};
use linalg_rs::{register_patterns_for_view, LoweringConfig, LoweringError, LoweringResult};

fn flip_function(name: &str) -> Function {
    let mut builder = ProgramBuilder::new();
    let x = builder.add_parameter(tensor(DType::F32, &[2, 3]));
    let dims = builder.int_list(&[0]);
    let out = builder.emit_single(
        Operation::Flip,
        vec![x.into(), dims.into()],
        tensor(DType::F32, &[2, 3]),
    );
    builder.finish(name, vec![out])
}

fn mm_function(name: &str) -> Function {
    let mut function = binary_function(
        Operation::Mm,
        tensor(DType::F32, &[2, 3]),
        tensor(DType::F32, &[3, 4]),
        tensor(DType::F32, &[2, 4]),
    );
    function.name = name.to_string();
    function
}

#[test]
fn populate_registers_one_pattern_per_operator() {
    let mut patterns = PatternSet::new();
    let mut target = ConversionTarget::new();
    populate_linear_patterns_and_legality(&mut patterns, &mut target, LoweringConfig::default());
    assert_eq!(patterns.len(), 6);

    let mut illegal: Vec<_> = target.illegal_ops().collect();
    illegal.sort_by_key(|kind| format!("{kind:?}"));
    assert_eq!(
        illegal,
        [
            OperationKind::Bmm,
            OperationKind::Convolution,
            OperationKind::Flip,
            OperationKind::Matmul,
            OperationKind::Mm,
            OperationKind::Trilinear,
        ]
    );
}

#[test]
fn full_conversion_reports_remaining_illegal_ops() {
    let mut function = flip_function("main");
    let mut target = ConversionTarget::new();
    target.add_illegal_op(OperationKind::Flip);
    let err = apply_full_conversion(
        &mut function,
        &PatternSet::new().freeze(),
        &target,
        &ConversionConfig::default(),
    )
    .expect_err("flip stays illegal");
    let (report, stats) = match err {
        ConversionError::IllegalOperations { report, stats } => (report, stats),
        other => panic!("unexpected error {other}"),
    };
    assert_eq!(stats.applied, 0);
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].stage, ConversionStage::Legalize);
    assert_eq!(report.diagnostics[0].function.as_deref(), Some("main"));
    assert_eq!(report.diagnostics[0].instruction_index, Some(2));
}

#[test]
fn lower_linear_ops_converts_every_function() -> Result<()> {
    let mut program =
        Program::new("main").with_functions(vec![mm_function("main"), flip_function("helper")]);
    assert!(check_program_legality(&program, &ConversionTarget::new()).is_ok());

    let stats = lower_linear_ops(&mut program, LoweringConfig::default()).context("lowered")?;
    assert_eq!(stats.applied, 2);
    assert!(stats.diagnostics.is_empty());
    for function in &program.functions {
        assert_eq!(count(function, OperationKind::Mm), 0);
        assert_eq!(count(function, OperationKind::Flip), 0);
    }
    Ok(())
}

#[test]
fn lower_linear_ops_surfaces_pattern_failures() -> Result<()> {
    let mut program = Program::new("main").with_functions(vec![binary_function(
        Operation::Mm,
        tensor(DType::F32, &[2, 3, 1]),
        tensor(DType::F32, &[3, 4]),
        tensor(DType::F32, &[2, 4]),
    )]);
    let err = lower_linear_ops(&mut program, LoweringConfig::default()).expect_err("rank 3 mm");
    let report = match err {
        ConversionError::IllegalOperations { report, .. } => report,
        other => panic!("unexpected error {other}"),
    };
    let stages: Vec<_> = report.diagnostics.iter().map(|d| d.stage).collect();
    assert_eq!(stages, [ConversionStage::Legalize, ConversionStage::Lower]);
    assert!(report.diagnostics[1].message.starts_with("convert-mm: unsupported rank"));
    Ok(())
}

#[test]
fn dead_code_elimination_keeps_assertions() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    let x = builder.add_parameter(tensor(DType::F32, &[2]));
    let condition = builder.emit_single(
        Operation::Constant(Literal::Bool(false)),
        Vec::new(),
        ValueType::Scalar(DType::I1),
    );
    builder.emit_single(
        Operation::Assert(AssertSpec {
            message: "kept".into(),
        }),
        vec![condition.into()],
        ValueType::Unit,
    );
    builder.constant_int(42);
    let mut function = builder.finish("main", vec![x]);

    let stats = apply_partial_conversion(
        &mut function,
        &PatternSet::new().freeze(),
        &ConversionTarget::new(),
        &ConversionConfig::default(),
    )
    .context("conversion runs")?;
    assert_eq!(stats.dce_removed, 1);
    assert_eq!(count(&function, OperationKind::Assert), 1);
    assert_eq!(count(&function, OperationKind::Constant), 1);
    Ok(())
}

#[test]
fn iteration_limit_stops_the_driver() -> Result<()> {
    let mut function = flip_function("main");
    let mut patterns = PatternSet::new();
    let mut target = ConversionTarget::new();
    populate_linear_patterns_and_legality(&mut patterns, &mut target, LoweringConfig::default());
    let config = ConversionConfig {
        max_iterations: 0,
        enable_dce: false,
    };
    let stats = apply_partial_conversion(&mut function, &patterns.freeze(), &target, &config)
        .context("conversion runs")?;
    assert_eq!(stats.applied, 0);
    assert_eq!(count(&function, OperationKind::Flip), 1);
    Ok(())
}

struct RefuseFlip;

impl OpRewritePattern<FlipOpView> for RefuseFlip {
    fn name(&self) -> &'static str {
        "refuse-flip"
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, _op: FlipOpView, _rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        Err(LoweringError::no_match("always declines"))
    }
}

#[test]
fn higher_benefit_patterns_are_tried_first() -> Result<()> {
    let mut function = flip_function("main");
    let mut patterns = PatternSet::new();
    let config = LoweringConfig::default();
    register_patterns_for_view!(patterns, FlipOpView, ConvertFlipOp { config }, RefuseFlip);
    let mut target = ConversionTarget::new();
    target.add_illegal_op(OperationKind::Flip);

    let stats = apply_partial_conversion(
        &mut function,
        &patterns.freeze(),
        &target,
        &ConversionConfig::default(),
    )
    .context("conversion runs")?;
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.iterations, 2);
    assert_eq!(stats.diagnostics.len(), 1);
    assert!(stats.diagnostics[0].message.starts_with("refuse-flip: pattern does not apply"));
    assert_eq!(stats.diagnostics[0].stage, ConversionStage::Lower);
    Ok(())
}
