use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frozen IR version written into serialized programs.
pub const IR_VERSION: &str = "linalg.v0.1";

fn default_ir_version() -> String {
    IR_VERSION.to_string()
}

/// Enumerates scalar element types understood by the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer (excluding `I1`).
    pub fn is_integer(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(self, DType::Si8 | DType::Si16 | DType::Si32 | DType::Si64)
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(self, DType::Ui8 | DType::Ui16 | DType::Ui32 | DType::Ui64)
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32 | DType::F64)
    }

    /// Returns the storage bit-width of the scalar.
    pub fn bitwidth(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si8 | DType::Ui8 => 8,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 16,
            DType::Si32 | DType::Ui32 | DType::F32 => 32,
            DType::Si64 | DType::Ui64 | DType::F64 => 64,
        }
    }

    /// Signed integer of the same width; non-integers are returned unchanged.
    pub fn to_signed(self) -> DType {
        match self {
            DType::Ui8 => DType::Si8,
            DType::Ui16 => DType::Si16,
            DType::Ui32 => DType::Si32,
            DType::Ui64 => DType::Si64,
            other => other,
        }
    }

    /// Accumulator dtype used when contracting values of this dtype.
    pub fn default_accumulator(self) -> DType {
        match self {
            DType::Bf16 | DType::F16 | DType::F32 => DType::F32,
            DType::F64 => DType::F64,
            DType::I1 | DType::Si8 | DType::Ui8 | DType::Si16 | DType::Ui16 => DType::Si32,
            DType::Si32 | DType::Ui32 => DType::Si32,
            DType::Si64 | DType::Ui64 => DType::Si64,
        }
    }
}

/// Represents a single axis extent in a tensor shape.
///
/// In mixed static/dynamic attributes (pad amounts, slice offsets) `Dynamic`
/// stands for the next index operand of the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

impl Dimension {
    pub fn as_static(self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(value),
            Dimension::Dynamic => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Dimension::Dynamic)
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Dimension::Static).collect::<Vec<_>>())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<Dimension> {
        self.dims.get(axis).copied()
    }

    pub fn into_dims(self) -> Vec<Dimension> {
        self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|dim| dim.as_static()).collect()
    }

    pub fn dynamic_count(&self) -> usize {
        self.dims.iter().filter(|dim| dim.is_dynamic()).count()
    }

    /// Two shapes are compatible when ranks agree and static extents never disagree.
    pub fn is_compatible_with(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(lhs, rhs)| match (lhs, rhs) {
                    (Dimension::Static(a), Dimension::Static(b)) => a == b,
                    _ => true,
                })
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

/// Scalar literal usable both as a constant payload and as an inline operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    None,
}

/// SSA value identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Type attached to every SSA value.
///
/// `Int`, `Float`, `Bool`, `IntList` and `None` are the scalar kinds of source
/// operators; `Index` and `Scalar` belong to the structured level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Scalar(DType),
    Index,
    Int,
    Float,
    Bool,
    IntList,
    None,
    Unit,
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    Literal(Literal),
}

impl Operand {
    pub fn value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            Operand::Literal(_) => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(value: ValueId) -> Self {
        Operand::Value(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexBinaryOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexCmpOp {
    Eq,
    Ge,
}

/// Elementwise binary ops; equal-rank operands broadcast along unit extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertSpec {
    pub message: String,
}

/// Permutation payload for `transpose`: result axis `i` reads input axis `perm[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Groups of adjacent axes for `expand_shape`/`collapse_shape`.
///
/// There is one group per axis of the collapsed (lower-rank) side; each group
/// lists the axes of the expanded side it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassociationSpec {
    pub groups: Vec<Vec<usize>>,
}

/// Input axis `i` lands on result axis `dims_map[i]`; the input extent must be 1 or match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub dims_map: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadSpec {
    pub low: Vec<Dimension>,
    pub high: Vec<Dimension>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub offsets: Vec<Dimension>,
    pub sizes: Vec<Dimension>,
    pub strides: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSpec {
    pub axes: Vec<usize>,
}

/// Named contraction primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    Dot,
    Vecmat,
    Matvec,
    Matmul,
    BatchMatmul,
    QuantizedMatmul,
    QuantizedBatchMatmul,
}

impl ContractKind {
    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            ContractKind::QuantizedMatmul | ContractKind::QuantizedBatchMatmul
        )
    }

    /// `(lhs rank, rhs rank, result rank)` of the primitive.
    pub fn ranks(self) -> (usize, usize, usize) {
        match self {
            ContractKind::Dot => (1, 1, 0),
            ContractKind::Vecmat => (1, 2, 1),
            ContractKind::Matvec => (2, 1, 1),
            ContractKind::Matmul | ContractKind::QuantizedMatmul => (2, 2, 2),
            ContractKind::BatchMatmul | ContractKind::QuantizedBatchMatmul => (3, 3, 3),
        }
    }

    /// Every named primitive reduces over exactly one axis.
    pub fn contracting_dims(self) -> usize {
        1
    }
}

/// Operands: lhs, rhs, then the two zero-points for quantized kinds, then the init tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub kind: ContractKind,
    /// Zero-extend integer inputs instead of sign-extending them.
    pub unsigned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IteratorType {
    Parallel,
    Reduction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericBody {
    /// `out += lhs * rhs`
    MulAdd,
}

/// Indexed contraction. `indexing_maps[i][a]` is the loop dimension read by axis `a`
/// of operand `i` (inputs first, init last).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericSpec {
    pub indexing_maps: Vec<Vec<usize>>,
    pub iterator_types: Vec<IteratorType>,
    pub body: GenericBody,
}

/// Named convolution primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvKind {
    Conv1dNcwFcw,
    Conv2dNchwFchw,
    Conv3dNcdhwFcdhw,
    Conv2dNhwcHwcfQ,
    Conv3dNdhwcDhwcfQ,
    DepthwiseConv1dNcwCw,
    DepthwiseConv2dNchwChw,
    DepthwiseConv2dNhwcHwcQ,
    Conv2dNgchwGfchw,
    Conv2dNgchwGfchwQ,
}

impl ConvKind {
    pub fn spatial_rank(self) -> usize {
        match self {
            ConvKind::Conv1dNcwFcw | ConvKind::DepthwiseConv1dNcwCw => 1,
            ConvKind::Conv3dNcdhwFcdhw | ConvKind::Conv3dNdhwcDhwcfQ => 3,
            _ => 2,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            ConvKind::Conv2dNhwcHwcfQ
                | ConvKind::Conv3dNdhwcDhwcfQ
                | ConvKind::DepthwiseConv2dNhwcHwcQ
                | ConvKind::Conv2dNgchwGfchwQ
        )
    }

    pub fn is_depthwise(self) -> bool {
        matches!(
            self,
            ConvKind::DepthwiseConv1dNcwCw
                | ConvKind::DepthwiseConv2dNchwChw
                | ConvKind::DepthwiseConv2dNhwcHwcQ
        )
    }

    pub fn is_grouped(self) -> bool {
        matches!(self, ConvKind::Conv2dNgchwGfchw | ConvKind::Conv2dNgchwGfchwQ)
    }

    /// Channels-last kinds place the channel axis after the spatial axes.
    pub fn is_channels_last(self) -> bool {
        matches!(
            self,
            ConvKind::Conv2dNhwcHwcfQ
                | ConvKind::Conv3dNdhwcDhwcfQ
                | ConvKind::DepthwiseConv2dNhwcHwcQ
        )
    }
}

/// Operands: input, weight, then the two zero-points for quantized kinds, then the init tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub kind: ConvKind,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
}

/// Declarative form of IR operations.
///
/// The first group are source-level tensor operators; everything from `Dim`
/// onwards is the structured level they are lowered into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(Literal),
    ListConstruct,
    MakePerTensorQuantized,
    Mm,
    Matmul,
    Bmm,
    Flip,
    Convolution,
    Trilinear,

    Dim(DimSpec),
    IndexBinary(IndexBinaryOp),
    IndexCmp(IndexCmpOp),
    Or,
    IndexCast,
    ScalarConvert,
    Assert(AssertSpec),
    Empty,
    Fill,
    Transpose(TransposeSpec),
    ExpandShape(ReassociationSpec),
    CollapseShape(ReassociationSpec),
    BroadcastTo(BroadcastToSpec),
    Pad(PadSpec),
    ExtractSlice(SliceSpec),
    InsertSlice(SliceSpec),
    Concat(ConcatSpec),
    Cast(CastSpec),
    ShapeCast,
    ElementwiseBinary(ElementwiseBinaryOp),
    ReduceSum(ReduceSpec),
    Reverse(ReverseSpec),
    Contract(ContractSpec),
    Generic(GenericSpec),
    Conv(ConvSpec),
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: ValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<ValueType>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_ir_version")]
    pub ir_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program ir version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            ir_version: IR_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src)?;
        if program.ir_version.is_empty() {
            program.ir_version = IR_VERSION.to_string();
        }
        if program.ir_version != IR_VERSION {
            return Err(ProgramSerdeError::VersionMismatch {
                found: program.ir_version,
                expected: IR_VERSION,
            });
        }
        Ok(program)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!("program @{} (ir_version = {}) {{", self.entry, self.ir_version),
        )?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_function(self, 0, f)
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, value_type) in function
            .parameter_ids
            .iter()
            .zip(function.parameters.iter())
        {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_value_type(value_type)),
            )?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, value_type) in function.result_ids.iter().zip(function.results.iter()) {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_value_type(value_type)),
            )?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = format!("{:?}", instruction.op);
    let line = if operands.is_empty() {
        format!(
            "%{} = {} -> {}",
            instruction.id.0,
            op_repr,
            format_value_type(&instruction.output)
        )
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0,
            op_repr,
            operands,
            format_value_type(&instruction.output)
        )
    };
    write_line(f, indent, &line)
}

pub fn format_value_type(value_type: &ValueType) -> String {
    match value_type {
        ValueType::Tensor(spec) => {
            format!("tensor<{:?} x {}>", spec.dtype, format_shape(&spec.shape))
        }
        ValueType::Scalar(dtype) => format!("{dtype:?}"),
        ValueType::Index => "index".to_string(),
        ValueType::Int => "int".to_string(),
        ValueType::Float => "float".to_string(),
        ValueType::Bool => "bool".to_string(),
        ValueType::IntList => "list<int>".to_string(),
        ValueType::None => "none".to_string(),
        ValueType::Unit => "()".to_string(),
    }
}

pub fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => v.to_string(),
            Dimension::Dynamic => "?".to_string(),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::Literal(Literal::Bool(v)) => format!("{v}"),
        Operand::Literal(Literal::Int(v)) => format!("{v}"),
        Operand::Literal(Literal::Float(v)) => format!("{v:?}"),
        Operand::Literal(Literal::None) => "none".to_string(),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing functions programmatically.
#[derive(Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, ValueType)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, ValueType>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, ty: ValueType) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, ty.clone());
        self.parameters.push((id, ty));
        id
    }

    pub fn emit_single(
        &mut self,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn constant_int(&mut self, value: i64) -> ValueId {
        self.emit_single(
            Operation::Constant(Literal::Int(value)),
            Vec::new(),
            ValueType::Int,
        )
    }

    pub fn constant_bool(&mut self, value: bool) -> ValueId {
        self.emit_single(
            Operation::Constant(Literal::Bool(value)),
            Vec::new(),
            ValueType::Bool,
        )
    }

    pub fn constant_none(&mut self) -> ValueId {
        self.emit_single(Operation::Constant(Literal::None), Vec::new(), ValueType::None)
    }

    /// Emits a `ListConstruct` whose elements are fresh integer constants.
    pub fn int_list(&mut self, values: &[i64]) -> ValueId {
        let elements = values
            .iter()
            .map(|value| Operand::Value(self.constant_int(*value)))
            .collect();
        self.emit_single(Operation::ListConstruct, elements, ValueType::IntList)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    /// Finishes the function; result ids must have been produced by this builder.
    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> Function {
        let results = result_ids
            .iter()
            .map(|id| self.value_types.get(id).cloned().unwrap_or(ValueType::Unit))
            .collect();
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        }
    }
}
