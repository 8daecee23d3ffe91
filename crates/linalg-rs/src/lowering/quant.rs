//! Zero-point handling for quantized operands.
//!
//! Contraction and convolution primitives only understand signed zero-points,
//! so unsigned N-bit operands are moved into the signed N-bit domain by adding
//! `-2^(N-1)` to every element and to the zero-point. `value - zero_point` is
//! unchanged by the shift.

use crate::error::{LoweringError, LoweringResult};
use crate::ir::pattern::{QuantizationInfo, TensorOperand};
use crate::ir::spec::{DType, ElementwiseBinaryOp, Literal, Operand, ValueId};
use crate::lowering::builder::LinalgBuilder;

/// `-2^(bits-1)`, the offset that maps `[0, 2^bits)` onto the signed range.
pub fn sign_shift_constant(bits: usize) -> i64 {
    i64::MIN >> (64 - bits.clamp(1, 64))
}

/// Shifts an unsigned value into the signed domain of the same width.
pub fn shift_unsigned_value(value: i64, bits: usize) -> i64 {
    value + sign_shift_constant(bits)
}

/// Returns both quantization descriptors, or none; a lone descriptor is an error.
pub fn quantization_pair<'a>(
    lhs: &'a TensorOperand,
    rhs: &'a TensorOperand,
    op: &'static str,
) -> LoweringResult<Option<(&'a QuantizationInfo, &'a QuantizationInfo)>> {
    match (&lhs.quant, &rhs.quant) {
        (Some(lhs), Some(rhs)) => Ok(Some((lhs, rhs))),
        (None, None) => Ok(None),
        _ => Err(LoweringError::MixedQuantization(op)),
    }
}

/// Quantized operand after the optional sign shift.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedOperand {
    pub value: ValueId,
    pub dtype: DType,
    /// `Si32` scalar or integer literal.
    pub zero_point: Operand,
}

pub fn to_signed_domain(
    builder: &mut LinalgBuilder,
    operand: &TensorOperand,
    quant: &QuantizationInfo,
) -> LoweringResult<SignedOperand> {
    let dtype = operand.spec.dtype;
    if !dtype.is_integer() {
        return Err(LoweringError::UnsupportedElementType(format!(
            "quantized operand of type {dtype:?}"
        )));
    }
    let zero_point = builder.scalar_convert(&quant.zero_point, DType::Si32)?;
    if !quant.unsigned {
        return Ok(SignedOperand {
            value: operand.value,
            dtype,
            zero_point,
        });
    }

    let shift = sign_shift_constant(dtype.bitwidth());
    let signed = dtype.to_signed();
    let zero_point = builder.scalar_binary(
        ElementwiseBinaryOp::Add,
        zero_point,
        Operand::Literal(Literal::Int(shift)),
        DType::Si32,
    );
    let value = builder.binary(
        ElementwiseBinaryOp::Add,
        operand.value,
        Operand::Literal(Literal::Int(shift)),
        signed,
    )?;
    Ok(SignedOperand {
        value,
        dtype: signed,
        zero_point,
    })
}

/// Prepared contraction inputs: plain tensors plus zero-points when quantized.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractionInputs {
    pub lhs: ValueId,
    pub rhs: ValueId,
    pub dtype: DType,
    pub zero_points: Option<(Operand, Operand)>,
}

impl ContractionInputs {
    pub fn is_quantized(&self) -> bool {
        self.zero_points.is_some()
    }

    /// Operand list for a contraction primitive, zero-points included.
    pub fn operands(&self, lhs: ValueId, rhs: ValueId) -> Vec<Operand> {
        let mut operands = vec![Operand::Value(lhs), Operand::Value(rhs)];
        if let Some((lhs_zp, rhs_zp)) = &self.zero_points {
            operands.push(lhs_zp.clone());
            operands.push(rhs_zp.clone());
        }
        operands
    }
}

/// Resolves quantization for a binary operator and applies the sign shift.
///
/// Unquantized operands must share an element type.
pub fn prepare_contraction_inputs(
    builder: &mut LinalgBuilder,
    lhs: &TensorOperand,
    rhs: &TensorOperand,
    op: &'static str,
) -> LoweringResult<ContractionInputs> {
    match quantization_pair(lhs, rhs, op)? {
        Some((lhs_quant, rhs_quant)) => {
            let lhs = to_signed_domain(builder, lhs, lhs_quant)?;
            let rhs = to_signed_domain(builder, rhs, rhs_quant)?;
            Ok(ContractionInputs {
                lhs: lhs.value,
                rhs: rhs.value,
                dtype: lhs.dtype,
                zero_points: Some((lhs.zero_point, rhs.zero_point)),
            })
        }
        None => {
            if lhs.spec.dtype != rhs.spec.dtype {
                return Err(LoweringError::ElementTypeMismatch(format!(
                    "{op} operands have types {:?} and {:?}",
                    lhs.spec.dtype, rhs.spec.dtype
                )));
            }
            Ok(ContractionInputs {
                lhs: lhs.value,
                rhs: rhs.value,
                dtype: lhs.spec.dtype,
                zero_points: None,
            })
        }
    }
}
