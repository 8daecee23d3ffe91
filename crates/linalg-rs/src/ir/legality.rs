use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ir::spec::{Function, Operation, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Constant,
    ListConstruct,
    MakePerTensorQuantized,
    Mm,
    Matmul,
    Bmm,
    Flip,
    Convolution,
    Trilinear,
    Dim,
    IndexBinary,
    IndexCmp,
    Or,
    IndexCast,
    ScalarConvert,
    Assert,
    Empty,
    Fill,
    Transpose,
    ExpandShape,
    CollapseShape,
    BroadcastTo,
    Pad,
    ExtractSlice,
    InsertSlice,
    Concat,
    Cast,
    ShapeCast,
    ElementwiseBinary,
    ReduceSum,
    Reverse,
    Contract,
    Generic,
    Conv,
}

impl OperationKind {
    pub fn from_op(op: &Operation) -> Self {
        match op {
            Operation::Constant(_) => OperationKind::Constant,
            Operation::ListConstruct => OperationKind::ListConstruct,
            Operation::MakePerTensorQuantized => OperationKind::MakePerTensorQuantized,
            Operation::Mm => OperationKind::Mm,
            Operation::Matmul => OperationKind::Matmul,
            Operation::Bmm => OperationKind::Bmm,
            Operation::Flip => OperationKind::Flip,
            Operation::Convolution => OperationKind::Convolution,
            Operation::Trilinear => OperationKind::Trilinear,
            Operation::Dim(_) => OperationKind::Dim,
            Operation::IndexBinary(_) => OperationKind::IndexBinary,
            Operation::IndexCmp(_) => OperationKind::IndexCmp,
            Operation::Or => OperationKind::Or,
            Operation::IndexCast => OperationKind::IndexCast,
            Operation::ScalarConvert => OperationKind::ScalarConvert,
            Operation::Assert(_) => OperationKind::Assert,
            Operation::Empty => OperationKind::Empty,
            Operation::Fill => OperationKind::Fill,
            Operation::Transpose(_) => OperationKind::Transpose,
            Operation::ExpandShape(_) => OperationKind::ExpandShape,
            Operation::CollapseShape(_) => OperationKind::CollapseShape,
            Operation::BroadcastTo(_) => OperationKind::BroadcastTo,
            Operation::Pad(_) => OperationKind::Pad,
            Operation::ExtractSlice(_) => OperationKind::ExtractSlice,
            Operation::InsertSlice(_) => OperationKind::InsertSlice,
            Operation::Concat(_) => OperationKind::Concat,
            Operation::Cast(_) => OperationKind::Cast,
            Operation::ShapeCast => OperationKind::ShapeCast,
            Operation::ElementwiseBinary(_) => OperationKind::ElementwiseBinary,
            Operation::ReduceSum(_) => OperationKind::ReduceSum,
            Operation::Reverse(_) => OperationKind::Reverse,
            Operation::Contract(_) => OperationKind::Contract,
            Operation::Generic(_) => OperationKind::Generic,
            Operation::Conv(_) => OperationKind::Conv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionStage {
    Lower,
    Legalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionDiagnostic {
    pub stage: ConversionStage,
    pub function: Option<String>,
    pub instruction_index: Option<usize>,
    pub message: String,
}

impl ConversionDiagnostic {
    pub fn new(
        stage: ConversionStage,
        function: Option<String>,
        instruction_index: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            function,
            instruction_index,
            message: message.into(),
        }
    }
}

/// Operation kinds that must not survive conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionTarget {
    illegal_ops: HashSet<OperationKind>,
}

impl ConversionTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_illegal_op(&mut self, kind: OperationKind) -> &mut Self {
        self.illegal_ops.insert(kind);
        self
    }

    pub fn add_legal_op(&mut self, kind: OperationKind) -> &mut Self {
        self.illegal_ops.remove(&kind);
        self
    }

    pub fn is_illegal(&self, op: &Operation) -> bool {
        self.illegal_ops.contains(&OperationKind::from_op(op))
    }

    pub fn illegal_ops(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.illegal_ops.iter().copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegalityReport {
    pub diagnostics: Vec<ConversionDiagnostic>,
}

impl LegalityReport {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

pub(crate) fn check_function_legality(
    function: &Function,
    target: &ConversionTarget,
    report: &mut LegalityReport,
) {
    for (idx, inst) in function.body.iter().enumerate() {
        if target.is_illegal(&inst.op) {
            report.diagnostics.push(ConversionDiagnostic::new(
                ConversionStage::Legalize,
                Some(function.name.clone()),
                Some(idx),
                format!(
                    "operation {:?} is illegal for the target",
                    OperationKind::from_op(&inst.op)
                ),
            ));
        }
    }
}

pub fn check_program_legality(
    program: &Program,
    target: &ConversionTarget,
) -> Result<(), LegalityReport> {
    let mut report = LegalityReport::default();
    for function in &program.functions {
        check_function_legality(function, target, &mut report);
    }
    if report.is_ok() {
        Ok(())
    } else {
        Err(report)
    }
}
