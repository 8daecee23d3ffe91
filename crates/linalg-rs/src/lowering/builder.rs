use std::collections::HashMap;

use crate::env::LoweringConfig;
use crate::error::{LoweringError, LoweringResult};
use crate::ir::{
    index::InstId,
    matchers,
    rewriter::ProgramRewriter,
    spec::{
        format_value_type, AssertSpec, BroadcastToSpec, CastSpec, ConcatSpec, ContractSpec,
        ConvSpec, DType, DimSpec, Dimension, ElementwiseBinaryOp, GenericSpec, IndexBinaryOp,
        IndexCmpOp, Instruction, Literal, Operand, Operation, PadSpec, ReassociationSpec,
        ReduceSpec, ReverseSpec, Shape, SliceSpec, TensorSpec, TransposeSpec, ValueId,
        ValueType,
    },
};
use crate::lowering::shape::{pending_obligations, Extent, Obligation, Predicate, Truth};

/// Replacement graph produced by a lowering, ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub instructions: Vec<Instruction>,
    pub result: ValueId,
}

impl Replacement {
    /// Inserts the staged instructions before `root` and replaces it.
    pub fn apply(self, root: InstId, rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        rewriter.replace_op_with_staged(root, self.instructions, self.result)?;
        Ok(())
    }
}

/// Stages structured-level instructions without touching the function.
///
/// Value ids are allocated past the function's highest id, so a staged graph
/// can be committed as-is or dropped on failure.
pub struct LinalgBuilder<'r, 'f> {
    rewriter: &'r ProgramRewriter<'f>,
    config: LoweringConfig,
    staged: Vec<Instruction>,
    types: HashMap<ValueId, ValueType>,
    next_value: u32,
}

impl<'r, 'f> LinalgBuilder<'r, 'f> {
    pub fn new(rewriter: &'r ProgramRewriter<'f>, config: LoweringConfig) -> Self {
        Self {
            rewriter,
            config,
            staged: Vec::new(),
            types: HashMap::new(),
            next_value: rewriter.next_value_id().0,
        }
    }

    pub fn rewriter(&self) -> &'r ProgramRewriter<'f> {
        self.rewriter
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    pub fn staged(&self) -> &[Instruction] {
        &self.staged
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.types
            .get(&value)
            .or_else(|| self.rewriter.type_of(value))
    }

    pub fn tensor_spec(&self, value: ValueId) -> LoweringResult<TensorSpec> {
        self.type_of(value)
            .and_then(ValueType::as_tensor)
            .cloned()
            .ok_or_else(|| LoweringError::InvalidShape(format!("value %{} is not a tensor", value.0)))
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: ValueType) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.types.insert(id, output.clone());
        self.staged.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn into_replacement(self, result: ValueId) -> Replacement {
        Replacement {
            instructions: self.staged,
            result,
        }
    }

    // ----- index arithmetic -----

    pub fn operand(extent: Extent) -> Operand {
        match extent {
            Extent::Static(value) => Operand::Literal(Literal::Int(value)),
            Extent::Runtime(value) => Operand::Value(value),
        }
    }

    /// Extent of `axis`; dynamic axes are queried with a `Dim` instruction.
    pub fn dim(&mut self, value: ValueId, axis: usize) -> LoweringResult<Extent> {
        let spec = self.tensor_spec(value)?;
        match spec.shape.dim(axis) {
            Some(Dimension::Static(extent)) => Ok(Extent::Static(extent as i64)),
            Some(Dimension::Dynamic) => Ok(Extent::Runtime(self.emit(
                Operation::Dim(DimSpec { axis }),
                vec![value.into()],
                ValueType::Index,
            ))),
            None => Err(LoweringError::InvalidDimension {
                dim: axis as i64,
                rank: spec.rank(),
            }),
        }
    }

    pub fn dims(&mut self, value: ValueId) -> LoweringResult<Vec<Extent>> {
        let rank = self.tensor_spec(value)?.rank();
        (0..rank).map(|axis| self.dim(value, axis)).collect()
    }

    pub fn index_binary(&mut self, op: IndexBinaryOp, lhs: Extent, rhs: Extent) -> Extent {
        if let (Extent::Static(a), Extent::Static(b)) = (lhs, rhs) {
            if let Some(folded) = fold_index_binary(op, a, b) {
                return Extent::Static(folded);
            }
        }
        match (op, lhs, rhs) {
            (IndexBinaryOp::Add, Extent::Static(0), other)
            | (IndexBinaryOp::Add, other, Extent::Static(0))
            | (IndexBinaryOp::Sub, other, Extent::Static(0))
            | (IndexBinaryOp::Mul, Extent::Static(1), other)
            | (IndexBinaryOp::Mul, other, Extent::Static(1))
            | (IndexBinaryOp::FloorDiv, other, Extent::Static(1)) => return other,
            (IndexBinaryOp::Max, a, b) if a == b => return a,
            _ => {}
        }
        Extent::Runtime(self.emit(
            Operation::IndexBinary(op),
            vec![Self::operand(lhs), Self::operand(rhs)],
            ValueType::Index,
        ))
    }

    pub fn add(&mut self, lhs: Extent, rhs: Extent) -> Extent {
        self.index_binary(IndexBinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Extent, rhs: Extent) -> Extent {
        self.index_binary(IndexBinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Extent, rhs: Extent) -> Extent {
        self.index_binary(IndexBinaryOp::Mul, lhs, rhs)
    }

    pub fn floor_div(&mut self, lhs: Extent, rhs: Extent) -> Extent {
        self.index_binary(IndexBinaryOp::FloorDiv, lhs, rhs)
    }

    pub fn max(&mut self, lhs: Extent, rhs: Extent) -> Extent {
        self.index_binary(IndexBinaryOp::Max, lhs, rhs)
    }

    pub fn product(&mut self, extents: &[Extent]) -> Extent {
        extents
            .iter()
            .fold(Extent::Static(1), |acc, extent| self.mul(acc, *extent))
    }

    /// Converts a source-level integer into an index extent.
    pub fn int_to_index(&mut self, operand: &Operand) -> LoweringResult<Extent> {
        if let Some(value) = matchers::match_constant_int(self.rewriter, operand) {
            return Ok(Extent::Static(value));
        }
        let Some(value) = operand.value() else {
            return Err(LoweringError::invalid_parameter("expected an integer operand"));
        };
        match self.type_of(value).cloned() {
            Some(ValueType::Int) => Ok(Extent::Runtime(self.emit(
                Operation::IndexCast,
                vec![value.into()],
                ValueType::Index,
            ))),
            Some(ValueType::Index) => Ok(Extent::Runtime(value)),
            other => Err(LoweringError::invalid_parameter(format!(
                "expected an integer operand, found {}",
                other
                    .as_ref()
                    .map(format_value_type)
                    .unwrap_or_else(|| "undefined".into())
            ))),
        }
    }

    /// Converts a source-level integer or scalar into a scalar of `dtype`.
    pub fn scalar_convert(&mut self, operand: &Operand, dtype: DType) -> LoweringResult<Operand> {
        if let Some(value) = matchers::match_constant_int(self.rewriter, operand) {
            return Ok(if dtype.is_float() {
                Operand::Literal(Literal::Float(value as f64))
            } else {
                Operand::Literal(Literal::Int(value))
            });
        }
        let Some(value) = operand.value() else {
            return Err(LoweringError::invalid_parameter("expected a scalar operand"));
        };
        match self.type_of(value).cloned() {
            Some(ValueType::Scalar(current)) if current == dtype => Ok(Operand::Value(value)),
            Some(ValueType::Int | ValueType::Float | ValueType::Scalar(_)) => Ok(Operand::Value(
                self.emit(Operation::ScalarConvert, vec![value.into()], ValueType::Scalar(dtype)),
            )),
            _ => Err(LoweringError::invalid_parameter("expected a scalar operand")),
        }
    }

    /// Scalar arithmetic on structured-level scalars; literal operands fold.
    pub fn scalar_binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: Operand,
        rhs: Operand,
        dtype: DType,
    ) -> Operand {
        if let (Operand::Literal(Literal::Int(a)), Operand::Literal(Literal::Int(b))) = (&lhs, &rhs)
        {
            let folded = match op {
                ElementwiseBinaryOp::Add => a.wrapping_add(*b),
                ElementwiseBinaryOp::Sub => a.wrapping_sub(*b),
                ElementwiseBinaryOp::Mul => a.wrapping_mul(*b),
            };
            return Operand::Literal(Literal::Int(folded));
        }
        Operand::Value(self.emit(
            Operation::ElementwiseBinary(op),
            vec![lhs, rhs],
            ValueType::Scalar(dtype),
        ))
    }

    // ----- tensor construction -----

    fn shape_of(extents: &[Extent]) -> LoweringResult<(Shape, Vec<Operand>)> {
        let mut dims = Vec::with_capacity(extents.len());
        let mut operands = Vec::new();
        for extent in extents {
            match *extent {
                Extent::Static(value) if value < 0 => {
                    return Err(LoweringError::InvalidShape(format!(
                        "negative extent {value}"
                    )))
                }
                Extent::Static(value) => dims.push(Dimension::Static(value as usize)),
                Extent::Runtime(value) => {
                    dims.push(Dimension::Dynamic);
                    operands.push(Operand::Value(value));
                }
            }
        }
        Ok((Shape::new(dims), operands))
    }

    fn mixed_attribute(extents: &[Extent]) -> LoweringResult<(Vec<Dimension>, Vec<Operand>)> {
        let (shape, operands) = Self::shape_of(extents)?;
        Ok((shape.into_dims(), operands))
    }

    pub fn zero_literal(dtype: DType) -> Operand {
        if dtype.is_float() {
            Operand::Literal(Literal::Float(0.0))
        } else {
            Operand::Literal(Literal::Int(0))
        }
    }

    pub fn empty(&mut self, dtype: DType, extents: &[Extent]) -> LoweringResult<ValueId> {
        let (shape, operands) = Self::shape_of(extents)?;
        Ok(self.emit(
            Operation::Empty,
            operands,
            ValueType::Tensor(TensorSpec::new(dtype, shape)),
        ))
    }

    pub fn fill(&mut self, value: Operand, init: ValueId) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(init)?;
        Ok(self.emit(
            Operation::Fill,
            vec![value, init.into()],
            ValueType::Tensor(spec),
        ))
    }

    pub fn zeros(&mut self, dtype: DType, extents: &[Extent]) -> LoweringResult<ValueId> {
        let empty = self.empty(dtype, extents)?;
        self.fill(Self::zero_literal(dtype), empty)
    }

    pub fn transpose(&mut self, value: ValueId, perm: &[usize]) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if perm.len() != spec.rank() || !is_permutation(perm) {
            return Err(LoweringError::InvalidShape(format!(
                "{perm:?} is not a permutation of rank {}",
                spec.rank()
            )));
        }
        if perm.iter().enumerate().all(|(idx, axis)| idx == *axis) {
            return Ok(value);
        }
        let dims = spec.shape.dims();
        let shape = Shape::new(perm.iter().map(|axis| dims[*axis]).collect::<Vec<_>>());
        Ok(self.emit(
            Operation::Transpose(TransposeSpec {
                perm: perm.to_vec(),
            }),
            vec![value.into()],
            ValueType::Tensor(TensorSpec::new(spec.dtype, shape)),
        ))
    }

    pub fn collapse_shape(&mut self, value: ValueId, groups: Vec<Vec<usize>>) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        validate_reassociation(&groups, spec.rank())?;
        let dims = spec.shape.dims();
        let collapsed = groups
            .iter()
            .map(|group| {
                group.iter().try_fold(1usize, |acc, axis| {
                    dims[*axis].as_static().map(|extent| acc * extent)
                })
            })
            .map(|extent| extent.map_or(Dimension::Dynamic, Dimension::Static))
            .collect::<Vec<_>>();
        Ok(self.emit(
            Operation::CollapseShape(ReassociationSpec { groups }),
            vec![value.into()],
            ValueType::Tensor(TensorSpec::new(spec.dtype, Shape::new(collapsed))),
        ))
    }

    /// Expands `value` to `extents`; dynamic result extents become index operands.
    pub fn expand_shape(
        &mut self,
        value: ValueId,
        groups: Vec<Vec<usize>>,
        extents: &[Extent],
    ) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if groups.len() != spec.rank() {
            return Err(LoweringError::InvalidShape(format!(
                "expand of rank {} needs {} groups, got {}",
                spec.rank(),
                spec.rank(),
                groups.len()
            )));
        }
        validate_reassociation(&groups, extents.len())?;
        let (shape, dynamic) = Self::shape_of(extents)?;
        let mut operands = vec![Operand::Value(value)];
        operands.extend(dynamic);
        Ok(self.emit(
            Operation::ExpandShape(ReassociationSpec { groups }),
            operands,
            ValueType::Tensor(TensorSpec::new(spec.dtype, shape)),
        ))
    }

    /// Broadcasts `value` to `extents`; input axis `i` lands on result axis `dims_map[i]`.
    pub fn broadcast_to(
        &mut self,
        value: ValueId,
        extents: &[Extent],
        dims_map: Vec<usize>,
    ) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if dims_map.len() != spec.rank() || dims_map.iter().any(|axis| *axis >= extents.len()) {
            return Err(LoweringError::InvalidShape(format!(
                "invalid broadcast dims {dims_map:?} for rank {} -> {}",
                spec.rank(),
                extents.len()
            )));
        }
        let (shape, dynamic) = Self::shape_of(extents)?;
        // Runtime target extents may still differ from the input's.
        if spec.shape == shape && dynamic.is_empty() {
            return Ok(value);
        }
        let mut operands = vec![Operand::Value(value)];
        operands.extend(dynamic);
        Ok(self.emit(
            Operation::BroadcastTo(BroadcastToSpec { dims_map }),
            operands,
            ValueType::Tensor(TensorSpec::new(spec.dtype, shape)),
        ))
    }

    pub fn pad(
        &mut self,
        value: ValueId,
        pad_value: Operand,
        low: &[Extent],
        high: &[Extent],
    ) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if low.len() != spec.rank() || high.len() != spec.rank() {
            return Err(LoweringError::InvalidShape("pad amounts must cover every axis".into()));
        }
        if low.iter().chain(high.iter()).all(|extent| *extent == Extent::Static(0)) {
            return Ok(value);
        }
        let mut extents = Vec::with_capacity(spec.rank());
        for axis in 0..spec.rank() {
            let extent = self.dim(value, axis)?;
            let with_low = self.add(extent, low[axis]);
            extents.push(self.add(with_low, high[axis]));
        }
        let (shape, _) = Self::shape_of(&extents)?;
        let (low_dims, low_operands) = Self::mixed_attribute(low)?;
        let (high_dims, high_operands) = Self::mixed_attribute(high)?;
        let mut operands = vec![Operand::Value(value), pad_value];
        operands.extend(low_operands);
        operands.extend(high_operands);
        Ok(self.emit(
            Operation::Pad(PadSpec {
                low: low_dims,
                high: high_dims,
            }),
            operands,
            ValueType::Tensor(TensorSpec::new(spec.dtype, shape)),
        ))
    }

    pub fn extract_slice(
        &mut self,
        value: ValueId,
        offsets: &[Extent],
        sizes: &[Extent],
        strides: Vec<usize>,
    ) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        let rank = spec.rank();
        if offsets.len() != rank || sizes.len() != rank || strides.len() != rank {
            return Err(LoweringError::InvalidShape("slice parameters must cover every axis".into()));
        }
        let (shape, _) = Self::shape_of(sizes)?;
        let (offset_dims, offset_operands) = Self::mixed_attribute(offsets)?;
        let (size_dims, size_operands) = Self::mixed_attribute(sizes)?;
        let mut operands = vec![Operand::Value(value)];
        operands.extend(offset_operands);
        operands.extend(size_operands);
        Ok(self.emit(
            Operation::ExtractSlice(SliceSpec {
                offsets: offset_dims,
                sizes: size_dims,
                strides,
            }),
            operands,
            ValueType::Tensor(TensorSpec::new(spec.dtype, shape)),
        ))
    }

    /// Writes `source` into `dest` at `offsets` with `strides`; the result has `dest`'s type.
    pub fn insert_slice(
        &mut self,
        source: ValueId,
        dest: ValueId,
        offsets: &[Extent],
        strides: Vec<usize>,
    ) -> LoweringResult<ValueId> {
        let dest_spec = self.tensor_spec(dest)?;
        let sizes = self.dims(source)?;
        let rank = dest_spec.rank();
        if offsets.len() != rank || sizes.len() != rank || strides.len() != rank {
            return Err(LoweringError::InvalidShape("slice parameters must cover every axis".into()));
        }
        let (offset_dims, offset_operands) = Self::mixed_attribute(offsets)?;
        let (size_dims, size_operands) = Self::mixed_attribute(&sizes)?;
        let mut operands = vec![Operand::Value(source), Operand::Value(dest)];
        operands.extend(offset_operands);
        operands.extend(size_operands);
        Ok(self.emit(
            Operation::InsertSlice(SliceSpec {
                offsets: offset_dims,
                sizes: size_dims,
                strides,
            }),
            operands,
            ValueType::Tensor(dest_spec),
        ))
    }

    pub fn concat(&mut self, values: &[ValueId], axis: usize) -> LoweringResult<ValueId> {
        let Some(first) = values.first() else {
            return Err(LoweringError::InvalidShape("concat needs at least one input".into()));
        };
        let spec = self.tensor_spec(*first)?;
        if axis >= spec.rank() {
            return Err(LoweringError::InvalidDimension {
                dim: axis as i64,
                rank: spec.rank(),
            });
        }
        if values.len() == 1 {
            return Ok(*first);
        }
        let mut total = Some(0usize);
        for value in values {
            let extent = self.tensor_spec(*value)?.shape.dim(axis).and_then(Dimension::as_static);
            total = total.zip(extent).map(|(acc, extent)| acc + extent);
        }
        let mut dims = spec.shape.dims().to_vec();
        dims[axis] = total.map_or(Dimension::Dynamic, Dimension::Static);
        Ok(self.emit(
            Operation::Concat(ConcatSpec { axis }),
            values.iter().map(|value| Operand::Value(*value)).collect(),
            ValueType::Tensor(TensorSpec::new(spec.dtype, Shape::new(dims))),
        ))
    }

    pub fn cast(&mut self, value: ValueId, dtype: DType) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if spec.dtype == dtype {
            return Ok(value);
        }
        Ok(self.emit(
            Operation::Cast(CastSpec { dtype }),
            vec![value.into()],
            ValueType::Tensor(TensorSpec::new(dtype, spec.shape)),
        ))
    }

    pub fn shape_cast(&mut self, value: ValueId, shape: Shape) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if spec.shape == shape {
            return Ok(value);
        }
        if !spec.shape.is_compatible_with(&shape) {
            return Err(LoweringError::InvalidShape(format!(
                "cannot cast {} to an incompatible shape",
                format_value_type(&ValueType::Tensor(spec))
            )));
        }
        Ok(self.emit(
            Operation::ShapeCast,
            vec![value.into()],
            ValueType::Tensor(TensorSpec::new(spec.dtype, shape)),
        ))
    }

    /// Forgets the static extents of `axes`.
    pub fn relax_dims(&mut self, value: ValueId, axes: &[usize]) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        let dims = spec
            .shape
            .dims()
            .iter()
            .enumerate()
            .map(|(axis, dim)| if axes.contains(&axis) { Dimension::Dynamic } else { *dim })
            .collect::<Vec<_>>();
        self.shape_cast(value, Shape::new(dims))
    }

    /// Elementwise tensor arithmetic producing `dtype`.
    ///
    /// A tensor `rhs` must have the rank of `lhs` and broadcasts along unit
    /// extents; a scalar or literal `rhs` applies to every element.
    pub fn binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: ValueId,
        rhs: Operand,
        dtype: DType,
    ) -> LoweringResult<ValueId> {
        let lhs_spec = self.tensor_spec(lhs)?;
        let rhs_spec = rhs.value().and_then(|value| self.type_of(value)).and_then(ValueType::as_tensor);
        let dims = match rhs_spec {
            Some(rhs_spec) => {
                if rhs_spec.rank() != lhs_spec.rank() {
                    return Err(LoweringError::InvalidShape(format!(
                        "elementwise operands have ranks {} and {}",
                        lhs_spec.rank(),
                        rhs_spec.rank()
                    )));
                }
                lhs_spec
                    .shape
                    .dims()
                    .iter()
                    .zip(rhs_spec.shape.dims())
                    .map(|(a, b)| broadcast_dimension(*a, *b))
                    .collect::<LoweringResult<Vec<_>>>()?
            }
            None => lhs_spec.shape.dims().to_vec(),
        };
        Ok(self.emit(
            Operation::ElementwiseBinary(op),
            vec![lhs.into(), rhs],
            ValueType::Tensor(TensorSpec::new(dtype, Shape::new(dims))),
        ))
    }

    pub fn reduce_sum(&mut self, value: ValueId, axes: Vec<usize>, keepdims: bool) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        if let Some(axis) = axes.iter().find(|axis| **axis >= spec.rank()) {
            return Err(LoweringError::InvalidDimension {
                dim: *axis as i64,
                rank: spec.rank(),
            });
        }
        if axes.is_empty() {
            return Ok(value);
        }
        let dims = spec
            .shape
            .dims()
            .iter()
            .enumerate()
            .filter_map(|(axis, dim)| match (axes.contains(&axis), keepdims) {
                (false, _) => Some(*dim),
                (true, true) => Some(Dimension::Static(1)),
                (true, false) => None,
            })
            .collect::<Vec<_>>();
        Ok(self.emit(
            Operation::ReduceSum(ReduceSpec { axes, keepdims }),
            vec![value.into()],
            ValueType::Tensor(TensorSpec::new(spec.dtype, Shape::new(dims))),
        ))
    }

    pub fn reverse(&mut self, value: ValueId, axes: Vec<usize>) -> LoweringResult<ValueId> {
        let spec = self.tensor_spec(value)?;
        Ok(self.emit(
            Operation::Reverse(ReverseSpec { axes }),
            vec![value.into()],
            ValueType::Tensor(spec),
        ))
    }

    fn operand_rank(&self, operand: Option<&Operand>) -> Option<usize> {
        let value = operand?.value()?;
        self.type_of(value)?.as_tensor().map(TensorSpec::rank)
    }

    /// Named contraction accumulating into `init`.
    pub fn contract(
        &mut self,
        spec: ContractSpec,
        inputs: Vec<Operand>,
        init: ValueId,
    ) -> LoweringResult<ValueId> {
        let (lhs_rank, rhs_rank, out_rank) = spec.kind.ranks();
        let init_spec = self.tensor_spec(init)?;
        if self.operand_rank(inputs.first()) != Some(lhs_rank)
            || self.operand_rank(inputs.get(1)) != Some(rhs_rank)
            || init_spec.rank() != out_rank
        {
            return Err(LoweringError::unsupported_rank(format!(
                "{:?} expects ranks ({lhs_rank}, {rhs_rank}) -> {out_rank}",
                spec.kind
            )));
        }
        let expected_inputs = if spec.kind.is_quantized() { 4 } else { 2 };
        if inputs.len() != expected_inputs {
            return Err(LoweringError::invalid_parameter(format!(
                "{:?} takes {expected_inputs} inputs",
                spec.kind
            )));
        }
        let mut operands = inputs;
        operands.push(init.into());
        Ok(self.emit(Operation::Contract(spec), operands, ValueType::Tensor(init_spec)))
    }

    pub fn generic(
        &mut self,
        spec: GenericSpec,
        inputs: Vec<Operand>,
        init: ValueId,
    ) -> LoweringResult<ValueId> {
        let init_spec = self.tensor_spec(init)?;
        if spec.indexing_maps.len() != inputs.len() + 1 {
            return Err(LoweringError::invalid_parameter(
                "generic needs one indexing map per operand",
            ));
        }
        let mut operands = inputs;
        operands.push(init.into());
        Ok(self.emit(Operation::Generic(spec), operands, ValueType::Tensor(init_spec)))
    }

    pub fn conv(&mut self, spec: ConvSpec, inputs: Vec<Operand>, init: ValueId) -> LoweringResult<ValueId> {
        let init_spec = self.tensor_spec(init)?;
        let expected_inputs = if spec.kind.is_quantized() { 4 } else { 2 };
        if inputs.len() != expected_inputs {
            return Err(LoweringError::invalid_parameter(format!(
                "{:?} takes {expected_inputs} inputs",
                spec.kind
            )));
        }
        let mut operands = inputs;
        operands.push(init.into());
        Ok(self.emit(Operation::Conv(spec), operands, ValueType::Tensor(init_spec)))
    }

    // ----- checks -----

    /// Materializes the obligations that still need a runtime check as `Assert`s.
    pub fn emit_obligations(&mut self, obligations: Vec<Obligation>) {
        for obligation in pending_obligations(obligations, &self.config) {
            let condition = self.condition(obligation.predicate);
            tracing::trace!(check = %obligation.message, "emit runtime assertion");
            self.emit(
                Operation::Assert(AssertSpec {
                    message: obligation.message,
                }),
                vec![condition],
                ValueType::Unit,
            );
        }
    }

    fn compare(&mut self, op: IndexCmpOp, lhs: Extent, rhs: Extent) -> Operand {
        Operand::Value(self.emit(
            Operation::IndexCmp(op),
            vec![Self::operand(lhs), Self::operand(rhs)],
            ValueType::Scalar(DType::I1),
        ))
    }

    fn condition(&mut self, predicate: Predicate) -> Operand {
        if predicate.evaluate() == Truth::False {
            return Operand::Value(self.emit(
                Operation::Constant(Literal::Bool(false)),
                Vec::new(),
                ValueType::Scalar(DType::I1),
            ));
        }
        match predicate {
            Predicate::Equal(lhs, rhs) => self.compare(IndexCmpOp::Eq, lhs, rhs),
            Predicate::Divides { divisor, dividend } => {
                let quotient = self.floor_div(dividend, divisor);
                let product = self.mul(quotient, divisor);
                self.compare(IndexCmpOp::Eq, product, dividend)
            }
            Predicate::Broadcastable { input, target } => {
                let unit = self.compare(IndexCmpOp::Eq, input, Extent::Static(1));
                let equal = self.compare(IndexCmpOp::Eq, input, target);
                Operand::Value(self.emit(Operation::Or, vec![unit, equal], ValueType::Scalar(DType::I1)))
            }
            Predicate::NonNegative(extent) => self.compare(IndexCmpOp::Ge, extent, Extent::Static(0)),
        }
    }

    /// Emits an equality check between contracting extents.
    ///
    /// When the extents are statically different the check is a trap, and the
    /// static extent of `axis` on `value` is dropped so the contraction stays
    /// well-typed.
    pub fn check_contracting(
        &mut self,
        value: ValueId,
        axis: usize,
        expected: Extent,
        actual: Extent,
        message: &str,
    ) -> LoweringResult<ValueId> {
        let obligation = Obligation::equal(expected, actual, message);
        let relax = obligation.is_statically_false();
        self.emit_obligations(vec![obligation]);
        if relax {
            self.relax_dims(value, &[axis])
        } else {
            Ok(value)
        }
    }

    /// Reconciles the computed value with the declared result type.
    pub fn finish(&mut self, value: ValueId, declared: &TensorSpec) -> LoweringResult<ValueId> {
        let computed = self.tensor_spec(value)?;
        if computed.dtype != declared.dtype || !computed.shape.is_compatible_with(&declared.shape) {
            return Err(LoweringError::IncompatibleResultType {
                computed: format_value_type(&ValueType::Tensor(computed)),
                declared: format_value_type(&ValueType::Tensor(declared.clone())),
            });
        }
        self.shape_cast(value, declared.shape.clone())
    }
}

fn fold_index_binary(op: IndexBinaryOp, a: i64, b: i64) -> Option<i64> {
    match op {
        IndexBinaryOp::Add => a.checked_add(b),
        IndexBinaryOp::Sub => a.checked_sub(b),
        IndexBinaryOp::Mul => a.checked_mul(b),
        IndexBinaryOp::FloorDiv => floor_div(a, b),
        IndexBinaryOp::Max => Some(a.max(b)),
    }
}

/// Division rounding toward negative infinity; `None` on division by zero.
pub fn floor_div(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let quotient = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

fn broadcast_dimension(lhs: Dimension, rhs: Dimension) -> LoweringResult<Dimension> {
    match (lhs, rhs) {
        (Dimension::Static(1), other) | (other, Dimension::Static(1)) => Ok(other),
        (Dimension::Static(a), Dimension::Static(b)) if a != b => Err(LoweringError::Unbroadcastable {
            lhs: a,
            rhs: b,
        }),
        (Dimension::Static(a), _) | (_, Dimension::Static(a)) => Ok(Dimension::Static(a)),
        (Dimension::Dynamic, Dimension::Dynamic) => Ok(Dimension::Dynamic),
    }
}

fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    perm.iter().all(|axis| {
        let fresh = *axis < seen.len() && !seen[*axis];
        if fresh {
            seen[*axis] = true;
        }
        fresh
    })
}

/// Groups must list `0..expanded_rank` in order, each group non-empty. No
/// groups at all describes a rank-0 collapsed side.
fn validate_reassociation(groups: &[Vec<usize>], expanded_rank: usize) -> LoweringResult<()> {
    if groups.is_empty() {
        return Ok(());
    }
    let contiguous = groups.iter().flatten().copied().eq(0..expanded_rank);
    if contiguous && groups.iter().all(|group| !group.is_empty()) {
        return Ok(());
    }
    Err(LoweringError::InvalidShape(format!(
        "invalid reassociation {groups:?} for rank {expanded_rank}"
    )))
}

/// Reassociation that removes unit axis `axis` from a tensor of rank `rank`.
pub fn unit_axis_removal_groups(rank: usize, axis: usize) -> Vec<Vec<usize>> {
    if rank <= 1 {
        return Vec::new();
    }
    let mut groups: Vec<Vec<usize>> = (0..rank)
        .filter(|candidate| *candidate != axis)
        .map(|candidate| vec![candidate])
        .collect();
    if axis == 0 {
        groups[0].insert(0, 0);
    } else {
        groups[axis - 1].push(axis);
    }
    groups
}

/// Reassociation that inserts unit axes where `inserted` is set.
pub fn unit_axes_insertion_groups(inserted: &[bool]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut pending = Vec::new();
    for (axis, unit) in inserted.iter().enumerate() {
        pending.push(axis);
        if !unit {
            groups.push(std::mem::take(&mut pending));
        }
    }
    if let Some(last) = groups.last_mut() {
        last.extend(pending);
    }
    groups
}
