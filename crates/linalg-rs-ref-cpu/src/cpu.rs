use std::collections::HashMap;
use std::sync::Arc;

use linalg_rs::ir::legality::OperationKind;
use linalg_rs::ir::spec::{
    format_value_type, BroadcastToSpec, CastSpec, ConcatSpec, ContractKind, ContractSpec, ConvKind,
    ConvSpec, DType, Dimension, ElementwiseBinaryOp, Function, GenericBody, GenericSpec,
    IndexBinaryOp, IndexCmpOp, Instruction, Literal, Operand, Operation, PadSpec,
    ReassociationSpec, ReduceSpec, ReverseSpec, Program, Shape, SliceSpec, TensorSpec,
    TransposeSpec, ValueId, ValueType,
};
use linalg_rs::lowering::builder::floor_div;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpreterError {
    #[error("runtime assertion failed: {message}")]
    AssertionFailed { message: String },
    #[error("execution error: {message}")]
    Execution { message: String },
    #[error("operation {op} cannot be executed: {reason}")]
    Unimplemented { op: String, reason: String },
}

impl InterpreterError {
    pub fn execution(message: impl Into<String>) -> Self {
        InterpreterError::Execution {
            message: message.into(),
        }
    }
}

pub type InterpreterResult<T> = Result<T, InterpreterError>;

/// A single element. Integers of every width are held sign- or zero-extended
/// to `i64` according to their dtype; `Ui64` keeps its bit pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    Int(i64),
    Float(f64),
}

impl Element {
    pub fn as_f64(self) -> f64 {
        match self {
            Element::Int(value) => value as f64,
            Element::Float(value) => value,
        }
    }

    /// Floats truncate toward zero, saturating at the `i64` range.
    pub fn as_i64(self) -> i64 {
        match self {
            Element::Int(value) => value,
            Element::Float(value) => value as i64,
        }
    }

    /// Converts to the storage domain of `dtype`: integers wrap to the dtype
    /// width, floats round to the dtype precision.
    pub fn convert(self, dtype: DType) -> Element {
        if dtype.is_float() {
            let value = self.as_f64();
            return Element::Float(match dtype {
                DType::F16 => half::f16::from_f64(value).to_f64(),
                DType::Bf16 => half::bf16::from_f64(value).to_f64(),
                DType::F32 => value as f32 as f64,
                _ => value,
            });
        }
        let value = self.as_i64();
        Element::Int(match dtype {
            DType::I1 => i64::from(value != 0),
            DType::Si8 => value as i8 as i64,
            DType::Ui8 => value as u8 as i64,
            DType::Si16 => value as i16 as i64,
            DType::Ui16 => value as u16 as i64,
            DType::Si32 => value as i32 as i64,
            DType::Ui32 => value as u32 as i64,
            _ => value,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Arc<[f64]>),
    Int(Arc<[i64]>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::Float(values) => values.len(),
            TensorData::Int(values) => values.len(),
        }
    }

    fn get(&self, index: usize) -> Element {
        match self {
            TensorData::Float(values) => Element::Float(values[index]),
            TensorData::Int(values) => Element::Int(values[index]),
        }
    }
}

/// Dense row-major tensor with concrete extents.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub data: TensorData,
}

impl CpuTensor {
    pub fn from_elements(dtype: DType, dims: Vec<usize>, elements: Vec<Element>) -> InterpreterResult<Self> {
        let expected: usize = dims.iter().product();
        if elements.len() != expected {
            return Err(InterpreterError::execution(format!(
                "{} elements do not fill a tensor of shape {dims:?}",
                elements.len()
            )));
        }
        let data = if dtype.is_float() {
            TensorData::Float(
                elements
                    .into_iter()
                    .map(|element| element.convert(dtype).as_f64())
                    .collect(),
            )
        } else {
            TensorData::Int(
                elements
                    .into_iter()
                    .map(|element| element.convert(dtype).as_i64())
                    .collect(),
            )
        };
        Ok(Self { dtype, dims, data })
    }

    pub fn from_f64(dtype: DType, dims: Vec<usize>, values: Vec<f64>) -> InterpreterResult<Self> {
        Self::from_elements(dtype, dims, values.into_iter().map(Element::Float).collect())
    }

    pub fn from_i64(dtype: DType, dims: Vec<usize>, values: Vec<i64>) -> InterpreterResult<Self> {
        Self::from_elements(dtype, dims, values.into_iter().map(Element::Int).collect())
    }

    pub fn filled(dtype: DType, dims: Vec<usize>, value: Element) -> Self {
        let len = dims.iter().product();
        let value = value.convert(dtype);
        let data = match value {
            Element::Float(value) => TensorData::Float(vec![value; len].into()),
            Element::Int(value) => TensorData::Int(vec![value; len].into()),
        };
        Self { dtype, dims, data }
    }

    pub fn zeros(dtype: DType, dims: Vec<usize>) -> Self {
        Self::filled(dtype, dims, Element::Int(0))
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self, index: usize) -> Element {
        self.data.get(index)
    }

    pub fn elements(&self) -> Vec<Element> {
        (0..self.len()).map(|index| self.element(index)).collect()
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|index| self.element(index).as_f64()).collect()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        (0..self.len()).map(|index| self.element(index).as_i64()).collect()
    }

    fn reshaped(&self, dims: Vec<usize>) -> InterpreterResult<Self> {
        if dims.iter().product::<usize>() != self.len() {
            return Err(InterpreterError::execution(format!(
                "cannot reshape {:?} to {dims:?}",
                self.dims
            )));
        }
        Ok(Self {
            dtype: self.dtype,
            dims,
            data: self.data.clone(),
        })
    }
}

/// Runtime value of an SSA id.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Tensor(CpuTensor),
    Scalar { dtype: DType, value: Element },
    Index(i64),
    Int(i64),
    Float(f64),
    Bool(bool),
    IntList(Vec<i64>),
    None,
    Unit,
}

impl RuntimeValue {
    pub fn as_tensor(&self) -> Option<&CpuTensor> {
        match self {
            RuntimeValue::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<CpuTensor> {
        match self {
            RuntimeValue::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    fn as_index(&self) -> Option<i64> {
        match self {
            RuntimeValue::Index(value) | RuntimeValue::Int(value) => Some(*value),
            RuntimeValue::Scalar {
                value: Element::Int(value),
                ..
            } => Some(*value),
            _ => None,
        }
    }

    fn as_element(&self) -> Option<Element> {
        match self {
            RuntimeValue::Scalar { value, .. } => Some(*value),
            RuntimeValue::Index(value) | RuntimeValue::Int(value) => Some(Element::Int(*value)),
            RuntimeValue::Float(value) => Some(Element::Float(*value)),
            RuntimeValue::Bool(value) => Some(Element::Int(i64::from(*value))),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            RuntimeValue::Bool(value) => Some(*value),
            RuntimeValue::Scalar { value, .. } => Some(value.as_i64() != 0),
            RuntimeValue::Int(value) => Some(*value != 0),
            _ => None,
        }
    }
}

/// Executes structured-level programs on dense CPU tensors.
///
/// Source-level operators other than constants, lists and quantization
/// wrappers are rejected; they must be lowered first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceInterpreter;

impl ReferenceInterpreter {
    pub fn new() -> Self {
        Self
    }

    pub fn run_program(
        &self,
        program: &Program,
        inputs: &[RuntimeValue],
    ) -> InterpreterResult<Vec<RuntimeValue>> {
        let function = program
            .entry_function()
            .ok_or_else(|| InterpreterError::execution("entry function not found"))?;
        self.run_function(function, inputs)
    }

    pub fn run_function(
        &self,
        function: &Function,
        inputs: &[RuntimeValue],
    ) -> InterpreterResult<Vec<RuntimeValue>> {
        if function.parameter_ids.len() != inputs.len() {
            return Err(InterpreterError::execution(format!(
                "function `{}` takes {} inputs, got {}",
                function.name,
                function.parameter_ids.len(),
                inputs.len()
            )));
        }
        tracing::debug!(function = %function.name, instructions = function.body.len(), "interpreting function");

        let mut values: HashMap<ValueId, RuntimeValue> = HashMap::new();
        for ((id, ty), input) in function
            .parameter_ids
            .iter()
            .zip(&function.parameters)
            .zip(inputs)
        {
            if let (ValueType::Tensor(spec), RuntimeValue::Tensor(tensor)) = (ty, input) {
                check_declared(tensor, spec)?;
            }
            values.insert(*id, input.clone());
        }

        for (index, instruction) in function.body.iter().enumerate() {
            let mut args = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                args.push(operand_value(&values, operand)?);
            }
            let result = execute_instruction(instruction, &args)
                .map_err(|err| augment_error(err, &function.name, index, instruction))?;
            tracing::trace!(id = instruction.id.0, op = ?OperationKind::from_op(&instruction.op), "executed");
            values.insert(instruction.id, result);
        }

        function
            .result_ids
            .iter()
            .map(|id| {
                values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| InterpreterError::execution(format!("missing result %{}", id.0)))
            })
            .collect()
    }
}

fn operand_value(
    values: &HashMap<ValueId, RuntimeValue>,
    operand: &Operand,
) -> InterpreterResult<RuntimeValue> {
    match operand {
        Operand::Value(id) => values
            .get(id)
            .cloned()
            .ok_or_else(|| InterpreterError::execution(format!("operand %{} has no value", id.0))),
        Operand::Literal(literal) => Ok(literal_value(literal)),
    }
}

fn literal_value(literal: &Literal) -> RuntimeValue {
    match literal {
        Literal::Int(value) => RuntimeValue::Int(*value),
        Literal::Float(value) => RuntimeValue::Float(*value),
        Literal::Bool(value) => RuntimeValue::Bool(*value),
        Literal::None => RuntimeValue::None,
    }
}

fn augment_error(
    error: InterpreterError,
    function: &str,
    index: usize,
    instruction: &Instruction,
) -> InterpreterError {
    match error {
        InterpreterError::Execution { message } => InterpreterError::Execution {
            message: format!(
                "{message} (at function `{function}` instruction #{index}, {:?} id %{})",
                OperationKind::from_op(&instruction.op),
                instruction.id.0
            ),
        },
        other => other,
    }
}

fn execute_instruction(instruction: &Instruction, args: &[RuntimeValue]) -> InterpreterResult<RuntimeValue> {
    let output = &instruction.output;
    let value = match &instruction.op {
        Operation::Constant(literal) => constant(literal, output)?,
        Operation::ListConstruct => RuntimeValue::IntList(
            args.iter()
                .map(|arg| {
                    arg.as_index()
                        .ok_or_else(|| InterpreterError::execution("list elements must be integers"))
                })
                .collect::<InterpreterResult<_>>()?,
        ),
        Operation::MakePerTensorQuantized => RuntimeValue::Tensor(tensor_arg(args, 0)?.clone()),
        op @ (Operation::Mm
        | Operation::Matmul
        | Operation::Bmm
        | Operation::Flip
        | Operation::Convolution
        | Operation::Trilinear) => {
            return Err(InterpreterError::Unimplemented {
                op: format!("{:?}", OperationKind::from_op(op)),
                reason: "source operators must be lowered before execution".into(),
            })
        }

        Operation::Dim(spec) => {
            let tensor = tensor_arg(args, 0)?;
            let extent = tensor.dims.get(spec.axis).ok_or_else(|| {
                InterpreterError::execution(format!("dim {} of a rank-{} tensor", spec.axis, tensor.rank()))
            })?;
            RuntimeValue::Index(*extent as i64)
        }
        Operation::IndexBinary(op) => {
            let (lhs, rhs) = (index_arg(args, 0)?, index_arg(args, 1)?);
            RuntimeValue::Index(index_binary(*op, lhs, rhs)?)
        }
        Operation::IndexCmp(op) => {
            let (lhs, rhs) = (index_arg(args, 0)?, index_arg(args, 1)?);
            let holds = match op {
                IndexCmpOp::Eq => lhs == rhs,
                IndexCmpOp::Ge => lhs >= rhs,
            };
            predicate(holds)
        }
        Operation::Or => predicate(bool_arg(args, 0)? || bool_arg(args, 1)?),
        Operation::IndexCast => {
            let value = index_arg(args, 0)?;
            match output {
                ValueType::Index => RuntimeValue::Index(value),
                ValueType::Int => RuntimeValue::Int(value),
                ValueType::Scalar(dtype) => RuntimeValue::Scalar {
                    dtype: *dtype,
                    value: Element::Int(value).convert(*dtype),
                },
                other => {
                    return Err(InterpreterError::execution(format!(
                        "index cast to {}",
                        format_value_type(other)
                    )))
                }
            }
        }
        Operation::ScalarConvert => match output {
            ValueType::Scalar(dtype) => RuntimeValue::Scalar {
                dtype: *dtype,
                value: element_arg(args, 0)?.convert(*dtype),
            },
            other => {
                return Err(InterpreterError::execution(format!(
                    "scalar conversion to {}",
                    format_value_type(other)
                )))
            }
        },
        Operation::Assert(spec) => {
            if !bool_arg(args, 0)? {
                return Err(InterpreterError::AssertionFailed {
                    message: spec.message.clone(),
                });
            }
            RuntimeValue::Unit
        }
        Operation::ElementwiseBinary(op) if args.first().and_then(RuntimeValue::as_tensor).is_none() => {
            let ValueType::Scalar(dtype) = output else {
                return Err(InterpreterError::execution("scalar arithmetic must produce a scalar"));
            };
            RuntimeValue::Scalar {
                dtype: *dtype,
                value: apply_binary(*op, element_arg(args, 0)?, element_arg(args, 1)?, *dtype),
            }
        }
        op => {
            let spec = output.as_tensor().ok_or_else(|| {
                InterpreterError::execution(format!(
                    "tensor operation declared as {}",
                    format_value_type(output)
                ))
            })?;
            let tensor = execute_tensor_op(op, spec, args)?;
            check_declared(&tensor, spec)?;
            RuntimeValue::Tensor(tensor)
        }
    };
    Ok(value)
}

fn execute_tensor_op(op: &Operation, output: &TensorSpec, args: &[RuntimeValue]) -> InterpreterResult<CpuTensor> {
    match op {
        Operation::Empty => {
            let dims = resolve_shape(&output.shape, &mut index_args(args, 0)?.into_iter())?;
            Ok(CpuTensor::zeros(output.dtype, dims))
        }
        Operation::Fill => {
            let value = element_arg(args, 0)?;
            let init = tensor_arg(args, 1)?;
            Ok(CpuTensor::filled(output.dtype, init.dims.clone(), value))
        }
        Operation::Transpose(spec) => op_transpose(tensor_arg(args, 0)?, spec),
        Operation::ExpandShape(spec) => op_expand_shape(args, output, spec),
        Operation::CollapseShape(spec) => op_collapse_shape(tensor_arg(args, 0)?, spec),
        Operation::BroadcastTo(spec) => op_broadcast_to(args, output, spec),
        Operation::Pad(spec) => op_pad(args, spec),
        Operation::ExtractSlice(spec) => op_extract_slice(args, spec),
        Operation::InsertSlice(spec) => op_insert_slice(args, spec),
        Operation::Concat(spec) => op_concat(args, spec),
        Operation::Cast(CastSpec { dtype }) => {
            let input = tensor_arg(args, 0)?;
            CpuTensor::from_elements(*dtype, input.dims.clone(), input.elements())
        }
        Operation::ShapeCast => Ok(tensor_arg(args, 0)?.clone()),
        Operation::ElementwiseBinary(op) => op_elementwise_binary(args, output, *op),
        Operation::ReduceSum(spec) => op_reduce_sum(tensor_arg(args, 0)?, spec),
        Operation::Reverse(spec) => op_reverse(tensor_arg(args, 0)?, spec),
        Operation::Contract(spec) => op_contract(args, spec),
        Operation::Generic(spec) => op_generic(args, spec),
        Operation::Conv(spec) => op_conv(args, spec),
        other => Err(InterpreterError::Unimplemented {
            op: format!("{:?}", OperationKind::from_op(other)),
            reason: "operation does not produce a tensor".into(),
        }),
    }
}

fn constant(literal: &Literal, output: &ValueType) -> InterpreterResult<RuntimeValue> {
    let value = literal_value(literal);
    Ok(match output {
        ValueType::Scalar(dtype) => RuntimeValue::Scalar {
            dtype: *dtype,
            value: value
                .as_element()
                .ok_or_else(|| InterpreterError::execution("none constant declared as a scalar"))?
                .convert(*dtype),
        },
        ValueType::Index => RuntimeValue::Index(
            value
                .as_index()
                .ok_or_else(|| InterpreterError::execution("index constant must be an integer"))?,
        ),
        _ => value,
    })
}

fn predicate(holds: bool) -> RuntimeValue {
    RuntimeValue::Scalar {
        dtype: DType::I1,
        value: Element::Int(i64::from(holds)),
    }
}

fn index_binary(op: IndexBinaryOp, lhs: i64, rhs: i64) -> InterpreterResult<i64> {
    let overflow = || InterpreterError::execution(format!("index arithmetic overflow in {op:?}"));
    match op {
        IndexBinaryOp::Add => lhs.checked_add(rhs).ok_or_else(overflow),
        IndexBinaryOp::Sub => lhs.checked_sub(rhs).ok_or_else(overflow),
        IndexBinaryOp::Mul => lhs.checked_mul(rhs).ok_or_else(overflow),
        IndexBinaryOp::FloorDiv => floor_div(lhs, rhs)
            .ok_or_else(|| InterpreterError::execution("index division by zero")),
        IndexBinaryOp::Max => Ok(lhs.max(rhs)),
    }
}

fn apply_binary(op: ElementwiseBinaryOp, lhs: Element, rhs: Element, dtype: DType) -> Element {
    let value = if dtype.is_float() {
        let (a, b) = (lhs.as_f64(), rhs.as_f64());
        Element::Float(match op {
            ElementwiseBinaryOp::Add => a + b,
            ElementwiseBinaryOp::Sub => a - b,
            ElementwiseBinaryOp::Mul => a * b,
        })
    } else {
        let (a, b) = (lhs.as_i64(), rhs.as_i64());
        Element::Int(match op {
            ElementwiseBinaryOp::Add => a.wrapping_add(b),
            ElementwiseBinaryOp::Sub => a.wrapping_sub(b),
            ElementwiseBinaryOp::Mul => a.wrapping_mul(b),
        })
    };
    value.convert(dtype)
}

/// `acc + (a - a_zp) * (b - b_zp)` in the accumulator domain.
fn mul_add(acc: Element, a: Element, a_zp: Element, b: Element, b_zp: Element, dtype: DType) -> Element {
    let lhs = apply_binary(ElementwiseBinaryOp::Sub, a, a_zp, dtype);
    let rhs = apply_binary(ElementwiseBinaryOp::Sub, b, b_zp, dtype);
    let product = apply_binary(ElementwiseBinaryOp::Mul, lhs, rhs, dtype);
    apply_binary(ElementwiseBinaryOp::Add, acc, product, dtype)
}

// ----- argument access -----

fn arg(args: &[RuntimeValue], index: usize) -> InterpreterResult<&RuntimeValue> {
    args.get(index)
        .ok_or_else(|| InterpreterError::execution(format!("missing operand #{index}")))
}

fn tensor_arg(args: &[RuntimeValue], index: usize) -> InterpreterResult<&CpuTensor> {
    arg(args, index)?
        .as_tensor()
        .ok_or_else(|| InterpreterError::execution(format!("operand #{index} is not a tensor")))
}

fn index_arg(args: &[RuntimeValue], index: usize) -> InterpreterResult<i64> {
    arg(args, index)?
        .as_index()
        .ok_or_else(|| InterpreterError::execution(format!("operand #{index} is not an index")))
}

fn element_arg(args: &[RuntimeValue], index: usize) -> InterpreterResult<Element> {
    arg(args, index)?
        .as_element()
        .ok_or_else(|| InterpreterError::execution(format!("operand #{index} is not a scalar")))
}

fn bool_arg(args: &[RuntimeValue], index: usize) -> InterpreterResult<bool> {
    arg(args, index)?
        .as_bool()
        .ok_or_else(|| InterpreterError::execution(format!("operand #{index} is not a predicate")))
}

/// Index operands from position `start` on.
fn index_args(args: &[RuntimeValue], start: usize) -> InterpreterResult<Vec<i64>> {
    (start..args.len()).map(|index| index_arg(args, index)).collect()
}

fn resolve_shape(shape: &Shape, dynamic: &mut impl Iterator<Item = i64>) -> InterpreterResult<Vec<usize>> {
    shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(extent) => Ok(*extent),
            Dimension::Dynamic => non_negative(dynamic.next(), "dynamic extent"),
        })
        .collect()
}

/// Resolves a mixed static/dynamic attribute.
fn resolve_mixed(dims: &[Dimension], dynamic: &mut impl Iterator<Item = i64>, what: &str) -> InterpreterResult<Vec<usize>> {
    dims.iter()
        .map(|dim| match dim {
            Dimension::Static(value) => Ok(*value),
            Dimension::Dynamic => non_negative(dynamic.next(), what),
        })
        .collect()
}

fn non_negative(value: Option<i64>, what: &str) -> InterpreterResult<usize> {
    let value = value.ok_or_else(|| InterpreterError::execution(format!("missing operand for {what}")))?;
    usize::try_from(value).map_err(|_| InterpreterError::execution(format!("{what} is negative ({value})")))
}

fn check_declared(tensor: &CpuTensor, spec: &TensorSpec) -> InterpreterResult<()> {
    let matches = tensor.dtype == spec.dtype
        && tensor.rank() == spec.rank()
        && tensor
            .dims
            .iter()
            .zip(spec.shape.dims())
            .all(|(actual, declared)| match declared {
                Dimension::Static(extent) => extent == actual,
                Dimension::Dynamic => true,
            });
    if matches {
        Ok(())
    } else {
        Err(InterpreterError::execution(format!(
            "computed {:?} x {:?} does not match declared {}",
            tensor.dtype,
            tensor.dims,
            format_value_type(&ValueType::Tensor(spec.clone()))
        )))
    }
}

// ----- shape operations -----

fn op_transpose(input: &CpuTensor, spec: &TransposeSpec) -> InterpreterResult<CpuTensor> {
    if spec.perm.len() != input.rank() {
        return Err(InterpreterError::execution("transpose rank mismatch"));
    }
    let out_dims: Vec<usize> = spec.perm.iter().map(|axis| input.dims[*axis]).collect();
    let strides = compute_strides(&input.dims);
    let elements = MultiIndex::new(&out_dims)
        .map(|coord| {
            let offset = coord
                .iter()
                .enumerate()
                .map(|(axis, c)| c * strides[spec.perm[axis]])
                .sum::<usize>();
            input.element(offset)
        })
        .collect();
    CpuTensor::from_elements(input.dtype, out_dims, elements)
}

fn op_expand_shape(args: &[RuntimeValue], output: &TensorSpec, spec: &ReassociationSpec) -> InterpreterResult<CpuTensor> {
    let input = tensor_arg(args, 0)?;
    let dims = resolve_shape(&output.shape, &mut index_args(args, 1)?.into_iter())?;
    for (axis, group) in spec.groups.iter().enumerate() {
        let product: usize = group.iter().map(|expanded| dims.get(*expanded).copied().unwrap_or(0)).product();
        if input.dims.get(axis) != Some(&product) {
            return Err(InterpreterError::execution(format!(
                "expanding {:?} to {dims:?} changes axis {axis}",
                input.dims
            )));
        }
    }
    input.reshaped(dims)
}

fn op_collapse_shape(input: &CpuTensor, spec: &ReassociationSpec) -> InterpreterResult<CpuTensor> {
    let dims = spec
        .groups
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|axis| {
                    input.dims.get(*axis).copied().ok_or_else(|| {
                        InterpreterError::execution(format!("collapse group names axis {axis}"))
                    })
                })
                .product::<InterpreterResult<usize>>()
        })
        .collect::<InterpreterResult<Vec<_>>>()?;
    input.reshaped(dims)
}

fn op_broadcast_to(args: &[RuntimeValue], output: &TensorSpec, spec: &BroadcastToSpec) -> InterpreterResult<CpuTensor> {
    let input = tensor_arg(args, 0)?;
    let out_dims = resolve_shape(&output.shape, &mut index_args(args, 1)?.into_iter())?;
    if spec.dims_map.len() != input.rank() {
        return Err(InterpreterError::execution("broadcast dims do not cover the input"));
    }
    for (axis, target) in spec.dims_map.iter().enumerate() {
        let extent = input.dims[axis];
        match out_dims.get(*target) {
            Some(out) if extent == 1 || extent == *out => {}
            _ => {
                return Err(InterpreterError::execution(format!(
                    "cannot broadcast {:?} to {out_dims:?}",
                    input.dims
                )))
            }
        }
    }
    let strides = compute_strides(&input.dims);
    let elements = MultiIndex::new(&out_dims)
        .map(|coord| {
            let offset = spec
                .dims_map
                .iter()
                .enumerate()
                .map(|(axis, target)| if input.dims[axis] == 1 { 0 } else { coord[*target] * strides[axis] })
                .sum::<usize>();
            input.element(offset)
        })
        .collect();
    CpuTensor::from_elements(input.dtype, out_dims, elements)
}

fn op_pad(args: &[RuntimeValue], spec: &PadSpec) -> InterpreterResult<CpuTensor> {
    let input = tensor_arg(args, 0)?;
    let pad_value = element_arg(args, 1)?;
    let mut dynamic = index_args(args, 2)?.into_iter();
    let low = resolve_mixed(&spec.low, &mut dynamic, "low padding")?;
    let high = resolve_mixed(&spec.high, &mut dynamic, "high padding")?;
    if low.len() != input.rank() || high.len() != input.rank() {
        return Err(InterpreterError::execution("padding does not cover every axis"));
    }
    let out_dims: Vec<usize> = (0..input.rank()).map(|axis| input.dims[axis] + low[axis] + high[axis]).collect();
    let strides = compute_strides(&input.dims);
    let elements = MultiIndex::new(&out_dims)
        .map(|coord| {
            let mut offset = 0;
            for (axis, c) in coord.iter().enumerate() {
                match c.checked_sub(low[axis]).filter(|source| *source < input.dims[axis]) {
                    Some(source) => offset += source * strides[axis],
                    None => return pad_value,
                }
            }
            input.element(offset)
        })
        .collect();
    CpuTensor::from_elements(input.dtype, out_dims, elements)
}

fn slice_bounds(
    dims: &[usize],
    offsets: &[usize],
    sizes: &[usize],
    strides: &[usize],
) -> InterpreterResult<()> {
    if offsets.len() != dims.len() || sizes.len() != dims.len() || strides.len() != dims.len() {
        return Err(InterpreterError::execution("slice parameters do not cover every axis"));
    }
    for axis in 0..dims.len() {
        if sizes[axis] > 0 && offsets[axis] + (sizes[axis] - 1) * strides[axis] >= dims[axis] {
            return Err(InterpreterError::execution(format!(
                "slice of axis {axis} (offset {}, size {}, stride {}) exceeds extent {}",
                offsets[axis], sizes[axis], strides[axis], dims[axis]
            )));
        }
    }
    Ok(())
}

fn op_extract_slice(args: &[RuntimeValue], spec: &SliceSpec) -> InterpreterResult<CpuTensor> {
    let input = tensor_arg(args, 0)?;
    let mut dynamic = index_args(args, 1)?.into_iter();
    let offsets = resolve_mixed(&spec.offsets, &mut dynamic, "slice offset")?;
    let sizes = resolve_mixed(&spec.sizes, &mut dynamic, "slice size")?;
    slice_bounds(&input.dims, &offsets, &sizes, &spec.strides)?;
    let strides = compute_strides(&input.dims);
    let elements = MultiIndex::new(&sizes)
        .map(|coord| {
            let offset = coord
                .iter()
                .enumerate()
                .map(|(axis, c)| (offsets[axis] + c * spec.strides[axis]) * strides[axis])
                .sum::<usize>();
            input.element(offset)
        })
        .collect();
    CpuTensor::from_elements(input.dtype, sizes, elements)
}

fn op_insert_slice(args: &[RuntimeValue], spec: &SliceSpec) -> InterpreterResult<CpuTensor> {
    let source = tensor_arg(args, 0)?;
    let dest = tensor_arg(args, 1)?;
    let mut dynamic = index_args(args, 2)?.into_iter();
    let offsets = resolve_mixed(&spec.offsets, &mut dynamic, "slice offset")?;
    let sizes = resolve_mixed(&spec.sizes, &mut dynamic, "slice size")?;
    if sizes != source.dims {
        return Err(InterpreterError::execution(format!(
            "inserted tensor {:?} does not match slice sizes {sizes:?}",
            source.dims
        )));
    }
    slice_bounds(&dest.dims, &offsets, &sizes, &spec.strides)?;
    let strides = compute_strides(&dest.dims);
    let mut elements = dest.elements();
    for (index, coord) in MultiIndex::new(&sizes).enumerate() {
        let offset = coord
            .iter()
            .enumerate()
            .map(|(axis, c)| (offsets[axis] + c * spec.strides[axis]) * strides[axis])
            .sum::<usize>();
        elements[offset] = source.element(index);
    }
    CpuTensor::from_elements(dest.dtype, dest.dims.clone(), elements)
}

fn op_concat(args: &[RuntimeValue], spec: &ConcatSpec) -> InterpreterResult<CpuTensor> {
    let inputs = (0..args.len())
        .map(|index| tensor_arg(args, index))
        .collect::<InterpreterResult<Vec<_>>>()?;
    let first = inputs
        .first()
        .ok_or_else(|| InterpreterError::execution("concat without inputs"))?;
    let axis = spec.axis;
    if axis >= first.rank() {
        return Err(InterpreterError::execution("concat axis out of range"));
    }
    for input in &inputs {
        let compatible = input.rank() == first.rank()
            && (0..first.rank()).all(|other| other == axis || input.dims[other] == first.dims[other]);
        if !compatible {
            return Err(InterpreterError::execution(format!(
                "cannot concatenate {:?} with {:?} along axis {axis}",
                input.dims, first.dims
            )));
        }
    }
    let mut out_dims = first.dims.clone();
    out_dims[axis] = inputs.iter().map(|input| input.dims[axis]).sum();

    let outer: usize = first.dims[..axis].iter().product();
    let inner: usize = first.dims[axis + 1..].iter().product();
    let mut elements = Vec::with_capacity(out_dims.iter().product());
    for block in 0..outer {
        for input in &inputs {
            let chunk = input.dims[axis] * inner;
            elements.extend((block * chunk..(block + 1) * chunk).map(|index| input.element(index)));
        }
    }
    CpuTensor::from_elements(first.dtype, out_dims, elements)
}

fn op_reverse(input: &CpuTensor, spec: &ReverseSpec) -> InterpreterResult<CpuTensor> {
    if let Some(axis) = spec.axes.iter().find(|axis| **axis >= input.rank()) {
        return Err(InterpreterError::execution(format!("reverse axis {axis} out of range")));
    }
    let strides = compute_strides(&input.dims);
    let elements = MultiIndex::new(&input.dims)
        .map(|coord| {
            let offset = coord
                .iter()
                .enumerate()
                .map(|(axis, c)| {
                    let source = if spec.axes.contains(&axis) { input.dims[axis] - 1 - c } else { *c };
                    source * strides[axis]
                })
                .sum::<usize>();
            input.element(offset)
        })
        .collect();
    CpuTensor::from_elements(input.dtype, input.dims.clone(), elements)
}

// ----- arithmetic -----

fn op_elementwise_binary(
    args: &[RuntimeValue],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> InterpreterResult<CpuTensor> {
    let lhs = tensor_arg(args, 0)?;
    let rhs = arg(args, 1)?;
    let Some(rhs) = rhs.as_tensor() else {
        let scalar = element_arg(args, 1)?;
        let elements = lhs
            .elements()
            .into_iter()
            .map(|element| apply_binary(op, element, scalar, output.dtype))
            .collect();
        return CpuTensor::from_elements(output.dtype, lhs.dims.clone(), elements);
    };
    if lhs.rank() != rhs.rank() {
        return Err(InterpreterError::execution("elementwise operands differ in rank"));
    }
    let out_dims = lhs
        .dims
        .iter()
        .zip(&rhs.dims)
        .map(|(a, b)| match (a, b) {
            (a, b) if a == b => Ok(*a),
            (1, b) => Ok(*b),
            (a, 1) => Ok(*a),
            _ => Err(InterpreterError::execution(format!(
                "cannot broadcast {:?} with {:?}",
                lhs.dims, rhs.dims
            ))),
        })
        .collect::<InterpreterResult<Vec<_>>>()?;
    let lhs_strides = compute_strides(&lhs.dims);
    let rhs_strides = compute_strides(&rhs.dims);
    let elements = MultiIndex::new(&out_dims)
        .map(|coord| {
            let a = broadcast_offset(&coord, &lhs.dims, &lhs_strides);
            let b = broadcast_offset(&coord, &rhs.dims, &rhs_strides);
            apply_binary(op, lhs.element(a), rhs.element(b), output.dtype)
        })
        .collect();
    CpuTensor::from_elements(output.dtype, out_dims, elements)
}

fn broadcast_offset(coord: &[usize], dims: &[usize], strides: &[usize]) -> usize {
    coord
        .iter()
        .enumerate()
        .map(|(axis, c)| if dims[axis] == 1 { 0 } else { c * strides[axis] })
        .sum()
}

fn op_reduce_sum(input: &CpuTensor, spec: &ReduceSpec) -> InterpreterResult<CpuTensor> {
    if let Some(axis) = spec.axes.iter().find(|axis| **axis >= input.rank()) {
        return Err(InterpreterError::execution(format!("reduce axis {axis} out of range")));
    }
    let kept: Vec<usize> = input
        .dims
        .iter()
        .enumerate()
        .map(|(axis, extent)| if spec.axes.contains(&axis) { 1 } else { *extent })
        .collect();
    let kept_strides = compute_strides(&kept);
    let mut sums = vec![Element::Int(0).convert(input.dtype); kept.iter().product()];
    for (index, coord) in MultiIndex::new(&input.dims).enumerate() {
        let target = coord
            .iter()
            .enumerate()
            .map(|(axis, c)| if spec.axes.contains(&axis) { 0 } else { c * kept_strides[axis] })
            .sum::<usize>();
        sums[target] = apply_binary(ElementwiseBinaryOp::Add, sums[target], input.element(index), input.dtype);
    }
    let out_dims = if spec.keepdims {
        kept
    } else {
        input
            .dims
            .iter()
            .enumerate()
            .filter(|(axis, _)| !spec.axes.contains(axis))
            .map(|(_, extent)| *extent)
            .collect()
    };
    CpuTensor::from_elements(input.dtype, out_dims, sums)
}

/// Loop-nest description of a contraction: `maps[i][a]` is the loop read by
/// axis `a` of operand `i` (lhs, rhs, init).
fn contraction_maps(kind: ContractKind) -> (usize, [Vec<usize>; 3]) {
    match kind {
        ContractKind::Dot => (1, [vec![0], vec![0], vec![]]),
        ContractKind::Vecmat => (2, [vec![1], vec![1, 0], vec![0]]),
        ContractKind::Matvec => (2, [vec![0, 1], vec![1], vec![0]]),
        ContractKind::Matmul | ContractKind::QuantizedMatmul => (3, [vec![0, 2], vec![2, 1], vec![0, 1]]),
        ContractKind::BatchMatmul | ContractKind::QuantizedBatchMatmul => {
            (4, [vec![0, 1, 3], vec![0, 3, 2], vec![0, 1, 2]])
        }
    }
}

fn op_contract(args: &[RuntimeValue], spec: &ContractSpec) -> InterpreterResult<CpuTensor> {
    let (loops, maps) = contraction_maps(spec.kind);
    let (zero_points, init) = if spec.kind.is_quantized() {
        ((element_arg(args, 2)?, element_arg(args, 3)?), tensor_arg(args, 4)?)
    } else {
        ((Element::Int(0), Element::Int(0)), tensor_arg(args, 2)?)
    };
    mul_add_contraction(tensor_arg(args, 0)?, tensor_arg(args, 1)?, zero_points, init, loops, &maps)
}

fn op_generic(args: &[RuntimeValue], spec: &GenericSpec) -> InterpreterResult<CpuTensor> {
    match spec.body {
        GenericBody::MulAdd => {}
    }
    let maps: [Vec<usize>; 3] = spec
        .indexing_maps
        .clone()
        .try_into()
        .map_err(|_| InterpreterError::execution("mul-add generic needs exactly three indexing maps"))?;
    mul_add_contraction(
        tensor_arg(args, 0)?,
        tensor_arg(args, 1)?,
        (Element::Int(0), Element::Int(0)),
        tensor_arg(args, 2)?,
        spec.iterator_types.len(),
        &maps,
    )
}

fn mul_add_contraction(
    lhs: &CpuTensor,
    rhs: &CpuTensor,
    zero_points: (Element, Element),
    init: &CpuTensor,
    loops: usize,
    maps: &[Vec<usize>; 3],
) -> InterpreterResult<CpuTensor> {
    let operands = [lhs, rhs, init];
    let mut extents: Vec<Option<usize>> = vec![None; loops];
    for (tensor, map) in operands.iter().zip(maps) {
        if map.len() != tensor.rank() {
            return Err(InterpreterError::execution("indexing map does not match operand rank"));
        }
        for (axis, ldim) in map.iter().enumerate() {
            let slot = extents
                .get_mut(*ldim)
                .ok_or_else(|| InterpreterError::execution("indexing map names an unknown loop"))?;
            match *slot {
                None => *slot = Some(tensor.dims[axis]),
                Some(extent) if extent == tensor.dims[axis] => {}
                Some(extent) => {
                    return Err(InterpreterError::execution(format!(
                        "contraction extents disagree on loop {ldim}: {extent} vs {}",
                        tensor.dims[axis]
                    )))
                }
            }
        }
    }
    let extents = extents
        .into_iter()
        .map(|extent| extent.ok_or_else(|| InterpreterError::execution("loop not bound by any operand")))
        .collect::<InterpreterResult<Vec<_>>>()?;

    let strides = operands.map(|tensor| compute_strides(&tensor.dims));
    let offset = |which: usize, coord: &[usize]| -> usize {
        maps[which]
            .iter()
            .zip(&strides[which])
            .map(|(ldim, stride)| coord[*ldim] * stride)
            .sum()
    };
    let dtype = init.dtype;
    let mut elements = init.elements();
    for coord in MultiIndex::new(&extents) {
        let out = offset(2, &coord);
        elements[out] = mul_add(
            elements[out],
            lhs.element(offset(0, &coord)),
            zero_points.0,
            rhs.element(offset(1, &coord)),
            zero_points.1,
            dtype,
        );
    }
    CpuTensor::from_elements(dtype, init.dims.clone(), elements)
}

// ----- convolution -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Batch,
    Group,
    Filter,
    Channel,
    Spatial(usize),
}

fn layout(prefix: &[Role], spatial: usize, suffix: &[Role]) -> Vec<Role> {
    let mut roles = prefix.to_vec();
    roles.extend((0..spatial).map(Role::Spatial));
    roles.extend_from_slice(suffix);
    roles
}

/// Axis roles of the input, weight and output of each convolution kind.
fn conv_layouts(kind: ConvKind) -> [Vec<Role>; 3] {
    use Role::*;
    let s = kind.spatial_rank();
    match kind {
        ConvKind::Conv1dNcwFcw | ConvKind::Conv2dNchwFchw | ConvKind::Conv3dNcdhwFcdhw => [
            layout(&[Batch, Channel], s, &[]),
            layout(&[Filter, Channel], s, &[]),
            layout(&[Batch, Filter], s, &[]),
        ],
        ConvKind::Conv2dNhwcHwcfQ | ConvKind::Conv3dNdhwcDhwcfQ => [
            layout(&[Batch], s, &[Channel]),
            layout(&[], s, &[Channel, Filter]),
            layout(&[Batch], s, &[Filter]),
        ],
        ConvKind::DepthwiseConv1dNcwCw | ConvKind::DepthwiseConv2dNchwChw => [
            layout(&[Batch, Group], s, &[]),
            layout(&[Group], s, &[]),
            layout(&[Batch, Group], s, &[]),
        ],
        ConvKind::DepthwiseConv2dNhwcHwcQ => [
            layout(&[Batch], s, &[Group]),
            layout(&[], s, &[Group]),
            layout(&[Batch], s, &[Group]),
        ],
        ConvKind::Conv2dNgchwGfchw | ConvKind::Conv2dNgchwGfchwQ => [
            layout(&[Batch, Group, Channel], s, &[]),
            layout(&[Group, Filter, Channel], s, &[]),
            layout(&[Batch, Group, Filter], s, &[]),
        ],
    }
}

fn role_extent(roles: &[Role], dims: &[usize], role: Role) -> Option<usize> {
    roles.iter().position(|candidate| *candidate == role).map(|axis| dims[axis])
}

/// Canonical convolution coordinate.
struct ConvCoord<'a> {
    batch: usize,
    group: usize,
    filter: usize,
    channel: usize,
    spatial: &'a [usize],
}

fn conv_offset(roles: &[Role], strides: &[usize], coord: &ConvCoord) -> usize {
    roles
        .iter()
        .zip(strides)
        .map(|(role, stride)| {
            let c = match role {
                Role::Batch => coord.batch,
                Role::Group => coord.group,
                Role::Filter => coord.filter,
                Role::Channel => coord.channel,
                Role::Spatial(i) => coord.spatial[*i],
            };
            c * stride
        })
        .sum()
}

fn op_conv(args: &[RuntimeValue], spec: &ConvSpec) -> InterpreterResult<CpuTensor> {
    let input = tensor_arg(args, 0)?;
    let weight = tensor_arg(args, 1)?;
    let (zero_points, init) = if spec.kind.is_quantized() {
        ((element_arg(args, 2)?, element_arg(args, 3)?), tensor_arg(args, 4)?)
    } else {
        ((Element::Int(0), Element::Int(0)), tensor_arg(args, 2)?)
    };
    let [in_roles, w_roles, out_roles] = conv_layouts(spec.kind);
    let spatial = spec.kind.spatial_rank();
    if input.rank() != in_roles.len() || weight.rank() != w_roles.len() || init.rank() != out_roles.len() {
        return Err(InterpreterError::execution(format!("{:?} operand ranks do not match", spec.kind)));
    }
    if spec.strides.len() != spatial || spec.dilations.len() != spatial {
        return Err(InterpreterError::execution("strides and dilations must cover every spatial axis"));
    }

    let batch = role_extent(&in_roles, &input.dims, Role::Batch).unwrap_or(1);
    let groups = role_extent(&in_roles, &input.dims, Role::Group).unwrap_or(1);
    let channels = role_extent(&in_roles, &input.dims, Role::Channel).unwrap_or(1);
    let filters = role_extent(&w_roles, &weight.dims, Role::Filter).unwrap_or(1);
    let consistent = [
        role_extent(&w_roles, &weight.dims, Role::Group).map_or(true, |g| g == groups),
        role_extent(&w_roles, &weight.dims, Role::Channel).map_or(true, |c| c == channels),
        role_extent(&out_roles, &init.dims, Role::Batch).map_or(true, |n| n == batch),
        role_extent(&out_roles, &init.dims, Role::Group).map_or(true, |g| g == groups),
        role_extent(&out_roles, &init.dims, Role::Filter).map_or(true, |f| f == filters),
    ];
    if consistent.contains(&false) {
        return Err(InterpreterError::execution(format!(
            "{:?} operands disagree: input {:?}, weight {:?}, init {:?}",
            spec.kind, input.dims, weight.dims, init.dims
        )));
    }
    let extents = |roles: &[Role], dims: &[usize]| -> Vec<usize> {
        (0..spatial)
            .map(|i| role_extent(roles, dims, Role::Spatial(i)).unwrap_or(1))
            .collect()
    };
    let in_spatial = extents(&in_roles, &input.dims);
    let kernel = extents(&w_roles, &weight.dims);
    let out_spatial = extents(&out_roles, &init.dims);

    let in_strides = compute_strides(&input.dims);
    let w_strides = compute_strides(&weight.dims);
    let out_strides = compute_strides(&init.dims);
    let dtype = init.dtype;
    let mut elements = init.elements();
    let mut position = vec![0usize; spatial];

    for n in 0..batch {
        for g in 0..groups {
            for f in 0..filters {
                for o in MultiIndex::new(&out_spatial) {
                    let out = conv_offset(
                        &out_roles,
                        &out_strides,
                        &ConvCoord { batch: n, group: g, filter: f, channel: 0, spatial: &o },
                    );
                    let mut acc = elements[out];
                    for c in 0..channels {
                        for k in MultiIndex::new(&kernel) {
                            for i in 0..spatial {
                                position[i] = o[i] * spec.strides[i] + k[i] * spec.dilations[i];
                                if position[i] >= in_spatial[i] {
                                    return Err(InterpreterError::execution(format!(
                                        "convolution window leaves the input on spatial axis {i}"
                                    )));
                                }
                            }
                            let x = input.element(conv_offset(
                                &in_roles,
                                &in_strides,
                                &ConvCoord { batch: n, group: g, filter: 0, channel: c, spatial: &position },
                            ));
                            let w = weight.element(conv_offset(
                                &w_roles,
                                &w_strides,
                                &ConvCoord { batch: 0, group: g, filter: f, channel: c, spatial: &k },
                            ));
                            acc = mul_add(acc, x, zero_points.0, w, zero_points.1, dtype);
                        }
                    }
                    elements[out] = acc;
                }
            }
        }
    }
    CpuTensor::from_elements(dtype, init.dims.clone(), elements)
}

// ----- indexing helpers -----

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

/// Row-major walk over every coordinate of `shape`.
struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: true,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            if self.shape.contains(&0) {
                return None;
            }
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}
