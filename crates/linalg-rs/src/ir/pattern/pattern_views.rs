use super::{filters, OperationMatcher, OperationView};
use crate::ir::{
    index::InstId,
    matchers,
    rewriter::ProgramRewriter,
    spec::{Operand, Operation, TensorSpec, ValueId},
};

/// Affine quantization attached to a tensor operand by `MakePerTensorQuantized`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationInfo {
    /// Source-level integer zero-point.
    pub zero_point: Operand,
    pub unsigned: bool,
}

/// Tensor operand with the quantization wrapper already stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorOperand {
    pub value: ValueId,
    pub spec: TensorSpec,
    pub quant: Option<QuantizationInfo>,
}

impl TensorOperand {
    pub fn rank(&self) -> usize {
        self.spec.rank()
    }

    pub fn is_quantized(&self) -> bool {
        self.quant.is_some()
    }

    /// Resolves `operand` to a tensor, looking through a `MakePerTensorQuantized` producer.
    pub fn resolve(rewriter: &ProgramRewriter, operand: &Operand) -> Option<Self> {
        let value = operand.value()?;
        if let Some((Operation::MakePerTensorQuantized, operands)) = rewriter.producer(value) {
            let [tensor, _scale, zero_point] = operands else {
                return None;
            };
            let inner = tensor.value()?;
            let spec = rewriter.type_of(inner)?.as_tensor()?.clone();
            let unsigned = spec.dtype.is_unsigned_integer();
            return Some(Self {
                value: inner,
                spec,
                quant: Some(QuantizationInfo {
                    zero_point: zero_point.clone(),
                    unsigned,
                }),
            });
        }
        let spec = rewriter.type_of(value)?.as_tensor()?.clone();
        Some(Self {
            value,
            spec,
            quant: None,
        })
    }
}

fn result_spec(root: InstId, rewriter: &ProgramRewriter) -> Option<(ValueId, TensorSpec)> {
    let result = rewriter.value_of(root)?;
    let spec = rewriter.type_of(result)?.as_tensor()?.clone();
    Some((result, spec))
}

macro_rules! define_binary_contraction_view {
    ($name:ident, $variant:ident, $matcher:path) => {
        #[derive(Clone)]
        pub struct $name {
            pub root: InstId,
            pub result: ValueId,
            pub result_type: TensorSpec,
            pub lhs: TensorOperand,
            pub rhs: TensorOperand,
        }

        impl $name {
            pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
                if !matches!(rewriter.op(root)?, Operation::$variant) {
                    return None;
                }
                let [lhs, rhs] = rewriter.operands(root) else {
                    return None;
                };
                let (result, result_type) = result_spec(root, rewriter)?;
                Some(Self {
                    root,
                    result,
                    result_type,
                    lhs: TensorOperand::resolve(rewriter, lhs)?,
                    rhs: TensorOperand::resolve(rewriter, rhs)?,
                })
            }
        }

        impl OperationView for $name {
            const MATCHER: OperationMatcher = $matcher;

            fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
                Self::new(root, rewriter)
            }
        }
    };
}

define_binary_contraction_view!(MmOpView, Mm, filters::mm);
define_binary_contraction_view!(MatmulOpView, Matmul, filters::matmul);
define_binary_contraction_view!(BmmOpView, Bmm, filters::bmm);

#[derive(Clone)]
pub struct FlipOpView {
    pub root: InstId,
    pub result: ValueId,
    pub result_type: TensorSpec,
    pub input: TensorOperand,
    pub dims: Operand,
}

impl FlipOpView {
    pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        if !matches!(rewriter.op(root)?, Operation::Flip) {
            return None;
        }
        let [input, dims] = rewriter.operands(root) else {
            return None;
        };
        let (result, result_type) = result_spec(root, rewriter)?;
        Some(Self {
            root,
            result,
            result_type,
            input: TensorOperand::resolve(rewriter, input)?,
            dims: dims.clone(),
        })
    }
}

impl OperationView for FlipOpView {
    const MATCHER: OperationMatcher = filters::flip;

    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        Self::new(root, rewriter)
    }
}

#[derive(Clone)]
pub struct ConvolutionOpView {
    pub root: InstId,
    pub result: ValueId,
    pub result_type: TensorSpec,
    pub input: TensorOperand,
    pub weight: TensorOperand,
    /// `None` when the bias operand is the none constant.
    pub bias: Option<TensorOperand>,
    pub stride: Operand,
    pub padding: Operand,
    pub dilation: Operand,
    pub transposed: Operand,
    pub output_padding: Operand,
    pub groups: Operand,
}

impl ConvolutionOpView {
    pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        if !matches!(rewriter.op(root)?, Operation::Convolution) {
            return None;
        }
        let [input, weight, bias, stride, padding, dilation, transposed, output_padding, groups] =
            rewriter.operands(root)
        else {
            return None;
        };
        let bias = if matchers::is_none(rewriter, bias) {
            None
        } else {
            Some(TensorOperand::resolve(rewriter, bias)?)
        };
        let (result, result_type) = result_spec(root, rewriter)?;
        Some(Self {
            root,
            result,
            result_type,
            input: TensorOperand::resolve(rewriter, input)?,
            weight: TensorOperand::resolve(rewriter, weight)?,
            bias,
            stride: stride.clone(),
            padding: padding.clone(),
            dilation: dilation.clone(),
            transposed: transposed.clone(),
            output_padding: output_padding.clone(),
            groups: groups.clone(),
        })
    }
}

impl OperationView for ConvolutionOpView {
    const MATCHER: OperationMatcher = filters::convolution;

    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        Self::new(root, rewriter)
    }
}

#[derive(Clone)]
pub struct TrilinearOpView {
    pub root: InstId,
    pub result: ValueId,
    pub result_type: TensorSpec,
    pub inputs: [TensorOperand; 3],
    pub expands: [Operand; 3],
    pub sum_dims: Operand,
    pub unroll_dim: Operand,
}

impl TrilinearOpView {
    pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        if !matches!(rewriter.op(root)?, Operation::Trilinear) {
            return None;
        }
        let [i1, i2, i3, expand1, expand2, expand3, sum_dims, unroll_dim] = rewriter.operands(root)
        else {
            return None;
        };
        let (result, result_type) = result_spec(root, rewriter)?;
        Some(Self {
            root,
            result,
            result_type,
            inputs: [
                TensorOperand::resolve(rewriter, i1)?,
                TensorOperand::resolve(rewriter, i2)?,
                TensorOperand::resolve(rewriter, i3)?,
            ],
            expands: [expand1.clone(), expand2.clone(), expand3.clone()],
            sum_dims: sum_dims.clone(),
            unroll_dim: unroll_dim.clone(),
        })
    }
}

impl OperationView for TrilinearOpView {
    const MATCHER: OperationMatcher = filters::trilinear;

    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        Self::new(root, rewriter)
    }
}
