//! Lowering of `mm`, `bmm` and `matmul`.

use crate::env::LoweringConfig;
use crate::error::{LoweringError, LoweringResult};
use crate::ir::{
    pattern::{BmmOpView, MatmulOpView, MmOpView, OpRewritePattern},
    rewriter::ProgramRewriter,
    spec::{ContractKind, ContractSpec, DType, GenericBody, GenericSpec, IteratorType, ValueId},
};
use crate::lowering::broadcast::{
    materialize_batch_extents, plan_batch_broadcast, select_batch_strategy, BatchStrategy,
};
use crate::lowering::builder::{LinalgBuilder, Replacement};
use crate::lowering::quant::{prepare_contraction_inputs, ContractionInputs};
use crate::lowering::shape::Extent;

/// Dispatch key for `matmul`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatmulKey {
    pub lhs_rank: usize,
    pub rhs_rank: usize,
    pub has_batch: bool,
    pub quantized: bool,
}

/// Contraction chosen for a [`MatmulKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulPlan {
    Dot,
    VecMat,
    MatVec,
    MatMat,
    QuantizedMatMat,
    /// Quantized contraction with 1-D operands promoted to 2-D.
    PromotedQuantized { lhs_vector: bool, rhs_vector: bool },
    Batched { quantized: bool },
}

impl MatmulKey {
    pub fn new(lhs_rank: usize, rhs_rank: usize, quantized: bool) -> Self {
        Self {
            lhs_rank,
            rhs_rank,
            has_batch: lhs_rank > 2 || rhs_rank > 2,
            quantized,
        }
    }

    pub fn plan(self) -> LoweringResult<MatmulPlan> {
        let plan = match (self.lhs_rank, self.rhs_rank, self.has_batch, self.quantized) {
            (0, _, _, _) | (_, 0, _, _) => {
                return Err(LoweringError::unsupported_rank(
                    "matmul operands must have rank at least 1",
                ))
            }
            (1, 1, _, false) => MatmulPlan::Dot,
            (1, 2, _, false) => MatmulPlan::VecMat,
            (2, 1, _, false) => MatmulPlan::MatVec,
            (2, 2, _, false) => MatmulPlan::MatMat,
            (2, 2, _, true) => MatmulPlan::QuantizedMatMat,
            (l @ 1..=2, r @ 1..=2, _, true) => MatmulPlan::PromotedQuantized {
                lhs_vector: l == 1,
                rhs_vector: r == 1,
            },
            (1, _, _, _) | (_, 1, _, _) => {
                return Err(LoweringError::unsupported_rank(format!(
                    "matmul of rank {} by rank {} is not supported",
                    self.lhs_rank, self.rhs_rank
                )))
            }
            (_, _, true, quantized) => MatmulPlan::Batched { quantized },
            (_, _, false, _) => {
                return Err(LoweringError::unsupported_rank(format!(
                    "matmul of rank {} by rank {} is not supported",
                    self.lhs_rank, self.rhs_rank
                )))
            }
        };
        Ok(plan)
    }
}

pub struct ConvertMmOp {
    pub config: LoweringConfig,
}

impl OpRewritePattern<MmOpView> for ConvertMmOp {
    fn name(&self) -> &'static str {
        "convert-mm"
    }

    fn match_and_rewrite(&self, op: MmOpView, rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        let root = op.root;
        lower_mm(&op, rewriter, self.config)?.apply(root, rewriter)
    }
}

pub struct ConvertMatmulOp {
    pub config: LoweringConfig,
}

impl OpRewritePattern<MatmulOpView> for ConvertMatmulOp {
    fn name(&self) -> &'static str {
        "convert-matmul"
    }

    fn match_and_rewrite(&self, op: MatmulOpView, rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        let root = op.root;
        lower_matmul(&op, rewriter, self.config)?.apply(root, rewriter)
    }
}

pub struct ConvertBmmOp {
    pub config: LoweringConfig,
}

impl OpRewritePattern<BmmOpView> for ConvertBmmOp {
    fn name(&self) -> &'static str {
        "convert-bmm"
    }

    fn match_and_rewrite(&self, op: BmmOpView, rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        let root = op.root;
        lower_bmm(&op, rewriter, self.config)?.apply(root, rewriter)
    }
}

fn contract_spec(kind: ContractKind, inputs: &ContractionInputs, unsigned: bool) -> ContractSpec {
    ContractSpec {
        kind,
        unsigned: unsigned && !inputs.is_quantized(),
    }
}

pub fn lower_mm(
    op: &MmOpView,
    rewriter: &ProgramRewriter,
    config: LoweringConfig,
) -> LoweringResult<Replacement> {
    if op.lhs.rank() != 2 || op.rhs.rank() != 2 {
        return Err(LoweringError::unsupported_rank(format!(
            "mm expects rank-2 operands, got {} and {}",
            op.lhs.rank(),
            op.rhs.rank()
        )));
    }
    let mut b = LinalgBuilder::new(rewriter, config);
    let inputs = prepare_contraction_inputs(&mut b, &op.lhs, &op.rhs, "mm")?;
    let lhs_dims = b.dims(inputs.lhs)?;
    let rhs_dims = b.dims(inputs.rhs)?;
    let rhs = b.check_contracting(
        inputs.rhs,
        0,
        lhs_dims[1],
        rhs_dims[0],
        "mismatching contracting dimension for mm",
    )?;

    let acc = inputs.dtype.default_accumulator();
    let init = b.zeros(acc, &[lhs_dims[0], rhs_dims[1]])?;
    let kind = if inputs.is_quantized() {
        ContractKind::QuantizedMatmul
    } else {
        ContractKind::Matmul
    };
    let unsigned = op.lhs.spec.dtype.is_unsigned_integer();
    let result = b.contract(
        contract_spec(kind, &inputs, unsigned),
        inputs.operands(inputs.lhs, rhs),
        init,
    )?;
    let result = b.cast(result, op.result_type.dtype)?;
    let result = b.finish(result, &op.result_type)?;
    Ok(b.into_replacement(result))
}

pub fn lower_bmm(
    op: &BmmOpView,
    rewriter: &ProgramRewriter,
    config: LoweringConfig,
) -> LoweringResult<Replacement> {
    if op.lhs.rank() != 3 || op.rhs.rank() != 3 {
        return Err(LoweringError::unsupported_rank(format!(
            "bmm expects rank-3 operands, got {} and {}",
            op.lhs.rank(),
            op.rhs.rank()
        )));
    }
    let mut b = LinalgBuilder::new(rewriter, config);
    let result_dtype = op.result_type.dtype;

    // Unquantized operands of differing types meet at the result type.
    let (inputs, acc) = if op.lhs.is_quantized() || op.rhs.is_quantized() {
        let inputs = prepare_contraction_inputs(&mut b, &op.lhs, &op.rhs, "bmm")?;
        let acc = inputs.dtype.default_accumulator();
        (inputs, acc)
    } else {
        let mut lhs = op.lhs.value;
        let mut rhs = op.rhs.value;
        if op.lhs.spec.dtype != op.rhs.spec.dtype {
            if op.lhs.spec.dtype != result_dtype {
                lhs = b.cast(lhs, result_dtype)?;
            }
            if op.rhs.spec.dtype != result_dtype {
                rhs = b.cast(rhs, result_dtype)?;
            }
        }
        let inputs = ContractionInputs {
            lhs,
            rhs,
            dtype: result_dtype,
            zero_points: None,
        };
        (inputs, result_dtype)
    };

    let lhs_dims = b.dims(inputs.lhs)?;
    let rhs_dims = b.dims(inputs.rhs)?;
    let rhs = b.check_contracting(
        inputs.rhs,
        0,
        lhs_dims[0],
        rhs_dims[0],
        "mismatching batch dimension for bmm",
    )?;
    let rhs = b.check_contracting(
        rhs,
        1,
        lhs_dims[2],
        rhs_dims[1],
        "mismatching contracting dimension for bmm",
    )?;

    let init = b.zeros(acc, &[lhs_dims[0], lhs_dims[1], rhs_dims[2]])?;
    let kind = if inputs.is_quantized() {
        ContractKind::QuantizedBatchMatmul
    } else {
        ContractKind::BatchMatmul
    };
    let result = b.contract(
        contract_spec(kind, &inputs, false),
        inputs.operands(inputs.lhs, rhs),
        init,
    )?;
    let result = b.cast(result, result_dtype)?;
    let result = b.finish(result, &op.result_type)?;
    Ok(b.into_replacement(result))
}

pub fn lower_matmul(
    op: &MatmulOpView,
    rewriter: &ProgramRewriter,
    config: LoweringConfig,
) -> LoweringResult<Replacement> {
    let mut b = LinalgBuilder::new(rewriter, config);
    let inputs = prepare_contraction_inputs(&mut b, &op.lhs, &op.rhs, "matmul")?;
    let key = MatmulKey::new(op.lhs.rank(), op.rhs.rank(), inputs.is_quantized());
    let plan = key.plan()?;
    tracing::debug!(?key, ?plan, "matmul dispatch");

    let acc = if inputs.is_quantized() {
        inputs.dtype.default_accumulator()
    } else {
        op.result_type.dtype.default_accumulator()
    };
    let unsigned = op.lhs.spec.dtype.is_unsigned_integer();

    let result = match plan {
        MatmulPlan::Dot => {
            vector_contraction(&mut b, &inputs, acc, ContractKind::Dot, (0, 0), unsigned)?
        }
        MatmulPlan::VecMat => {
            vector_contraction(&mut b, &inputs, acc, ContractKind::Vecmat, (0, 0), unsigned)?
        }
        MatmulPlan::MatVec => {
            vector_contraction(&mut b, &inputs, acc, ContractKind::Matvec, (1, 0), unsigned)?
        }
        MatmulPlan::MatMat => {
            vector_contraction(&mut b, &inputs, acc, ContractKind::Matmul, (1, 0), unsigned)?
        }
        MatmulPlan::QuantizedMatMat => {
            vector_contraction(&mut b, &inputs, acc, ContractKind::QuantizedMatmul, (1, 0), false)?
        }
        MatmulPlan::PromotedQuantized {
            lhs_vector,
            rhs_vector,
        } => promoted_quantized(&mut b, &inputs, acc, lhs_vector, rhs_vector)?,
        MatmulPlan::Batched { .. } => batched(&mut b, &inputs, acc, unsigned)?,
    };
    let result = b.cast(result, op.result_type.dtype)?;
    let result = b.finish(result, &op.result_type)?;
    Ok(b.into_replacement(result))
}

/// Rank-1/2 contraction; `contracting` gives the contracting axis of each side.
fn vector_contraction(
    b: &mut LinalgBuilder,
    inputs: &ContractionInputs,
    acc: DType,
    kind: ContractKind,
    contracting: (usize, usize),
    unsigned: bool,
) -> LoweringResult<ValueId> {
    let lhs_dims = b.dims(inputs.lhs)?;
    let rhs_dims = b.dims(inputs.rhs)?;
    let rhs = b.check_contracting(
        inputs.rhs,
        contracting.1,
        lhs_dims[contracting.0],
        rhs_dims[contracting.1],
        "mismatching contracting dimension for matmul",
    )?;
    let out = free_extents(&lhs_dims, contracting.0)
        .chain(free_extents(&rhs_dims, contracting.1))
        .collect::<Vec<_>>();
    let init = b.zeros(acc, &out)?;
    b.contract(
        contract_spec(kind, inputs, unsigned),
        inputs.operands(inputs.lhs, rhs),
        init,
    )
}

fn free_extents(dims: &[Extent], contracting: usize) -> impl Iterator<Item = Extent> + '_ {
    dims.iter()
        .enumerate()
        .filter(move |(axis, _)| *axis != contracting)
        .map(|(_, extent)| *extent)
}

fn promoted_quantized(
    b: &mut LinalgBuilder,
    inputs: &ContractionInputs,
    acc: DType,
    lhs_vector: bool,
    rhs_vector: bool,
) -> LoweringResult<ValueId> {
    let mut lhs = inputs.lhs;
    let mut rhs = inputs.rhs;
    if lhs_vector {
        let k = b.dim(lhs, 0)?;
        lhs = b.expand_shape(lhs, vec![vec![0, 1]], &[Extent::Static(1), k])?;
    }
    if rhs_vector {
        let k = b.dim(rhs, 0)?;
        rhs = b.expand_shape(rhs, vec![vec![0, 1]], &[k, Extent::Static(1)])?;
    }
    let promoted = ContractionInputs {
        lhs,
        rhs,
        dtype: inputs.dtype,
        zero_points: inputs.zero_points.clone(),
    };
    let result = vector_contraction(b, &promoted, acc, ContractKind::QuantizedMatmul, (1, 0), false)?;
    match (lhs_vector, rhs_vector) {
        (true, true) => b.collapse_shape(result, Vec::new()),
        (true, false) | (false, true) => b.collapse_shape(result, vec![vec![0, 1]]),
        (false, false) => Ok(result),
    }
}

fn batched(
    b: &mut LinalgBuilder,
    inputs: &ContractionInputs,
    acc: DType,
    unsigned: bool,
) -> LoweringResult<ValueId> {
    let lhs_spec = b.tensor_spec(inputs.lhs)?;
    let rhs_spec = b.tensor_spec(inputs.rhs)?;
    let (l, r) = (lhs_spec.rank(), rhs_spec.rank());
    let plan = plan_batch_broadcast(
        &lhs_spec.shape.dims()[..l - 2],
        &rhs_spec.shape.dims()[..r - 2],
    )?;
    let strategy = select_batch_strategy(&plan, inputs.is_quantized())?;
    tracing::debug!(?strategy, batch_rank = plan.len(), "batched matmul");

    let lhs_dims = b.dims(inputs.lhs)?;
    let rhs_dims = b.dims(inputs.rhs)?;
    let (batch, obligations) =
        materialize_batch_extents(b, &plan, &lhs_dims[..l - 2], &rhs_dims[..r - 2]);
    b.emit_obligations(obligations);

    let rhs = b.check_contracting(
        inputs.rhs,
        r - 2,
        lhs_dims[l - 1],
        rhs_dims[r - 2],
        "mismatching contracting dimension for matmul",
    )?;
    let rhs_dims = if rhs == inputs.rhs { rhs_dims } else { b.dims(rhs)? };
    let (m, k) = (lhs_dims[l - 2], lhs_dims[l - 1]);
    let (k_rhs, n) = (rhs_dims[r - 2], rhs_dims[r - 1]);

    let nb = batch.len();
    let lhs_target = [batch.as_slice(), &[m, k]].concat();
    let rhs_target = [batch.as_slice(), &[k_rhs, n]].concat();
    let lhs = b.broadcast_to(inputs.lhs, &lhs_target, (nb + 2 - l..nb + 2).collect())?;
    let rhs = b.broadcast_to(rhs, &rhs_target, (nb + 2 - r..nb + 2).collect())?;

    let batch_kind = if inputs.is_quantized() {
        ContractKind::QuantizedBatchMatmul
    } else {
        ContractKind::BatchMatmul
    };
    let out_extents = [batch.as_slice(), &[m, n]].concat();

    match strategy {
        BatchStrategy::Direct => {
            let init = b.zeros(acc, &out_extents)?;
            b.contract(
                contract_spec(batch_kind, inputs, unsigned),
                inputs.operands(lhs, rhs),
                init,
            )
        }
        BatchStrategy::Collapsed => {
            let groups = vec![(0..nb).collect::<Vec<_>>(), vec![nb], vec![nb + 1]];
            let lhs = b.collapse_shape(lhs, groups.clone())?;
            let rhs = b.collapse_shape(rhs, groups.clone())?;
            let flat = b.product(&batch);
            let init = b.zeros(acc, &[flat, m, n])?;
            let result = b.contract(
                contract_spec(batch_kind, inputs, unsigned),
                inputs.operands(lhs, rhs),
                init,
            )?;
            b.expand_shape(result, groups, &out_extents)
        }
        BatchStrategy::Generic => {
            let batch_loops = (0..nb).collect::<Vec<_>>();
            let (m_loop, n_loop, k_loop) = (nb, nb + 1, nb + 2);
            let mut iterator_types = vec![IteratorType::Parallel; nb + 2];
            iterator_types.push(IteratorType::Reduction);
            let spec = GenericSpec {
                indexing_maps: vec![
                    [batch_loops.as_slice(), &[m_loop, k_loop]].concat(),
                    [batch_loops.as_slice(), &[k_loop, n_loop]].concat(),
                    [batch_loops.as_slice(), &[m_loop, n_loop]].concat(),
                ],
                iterator_types,
                body: GenericBody::MulAdd,
            };
            let init = b.zeros(acc, &out_extents)?;
            b.generic(spec, vec![lhs.into(), rhs.into()], init)
        }
    }
}
