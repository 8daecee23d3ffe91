use thiserror::Error;

use crate::ir::index::FunctionIndexError;

/// Reason a lowering pattern declined to rewrite an operation.
///
/// Every variant leaves the program untouched; the driver may try another
/// pattern or report the operation as illegal later.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoweringError {
    #[error("pattern does not apply: {0}")]
    NoMatch(String),
    #[error("unsupported rank combination: {0}")]
    UnsupportedRank(String),
    #[error("{0} must be a compile-time constant")]
    NonConstant(&'static str),
    #[error("unsupported spatial rank {0} (expected 1 to 3)")]
    UnsupportedSpatialRank(usize),
    #[error("mixed quantization is not supported: {0}")]
    MixedQuantization(&'static str),
    #[error("element type mismatch: {0}")]
    ElementTypeMismatch(String),
    #[error("unsupported element type: {0}")]
    UnsupportedElementType(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("invalid dimension {dim} for rank {rank}")]
    InvalidDimension { dim: i64, rank: usize },
    #[error("batch extents {lhs} and {rhs} cannot be broadcast")]
    Unbroadcastable { lhs: usize, rhs: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("computed type {computed} is incompatible with declared result type {declared}")]
    IncompatibleResultType { computed: String, declared: String },
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error(transparent)]
    Ir(#[from] FunctionIndexError),
}

impl LoweringError {
    pub fn no_match(reason: impl Into<String>) -> Self {
        LoweringError::NoMatch(reason.into())
    }

    pub fn unsupported_rank(reason: impl Into<String>) -> Self {
        LoweringError::UnsupportedRank(reason.into())
    }

    pub fn unimplemented(reason: impl Into<String>) -> Self {
        LoweringError::Unimplemented(reason.into())
    }

    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        LoweringError::InvalidParameter(reason.into())
    }
}

pub type LoweringResult<T> = Result<T, LoweringError>;
