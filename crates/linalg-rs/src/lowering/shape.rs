//! Shape obligations: pure predicates over tensor extents.
//!
//! Checks are collected as [`Obligation`]s and only turned into `Assert`
//! instructions by the builder, so the checking logic can be exercised
//! without any IR.

use crate::env::LoweringConfig;
use crate::ir::spec::{Dimension, ValueId};

/// Extent of a tensor axis: a known integer or a runtime `index` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extent {
    Static(i64),
    Runtime(ValueId),
}

impl Extent {
    pub fn as_static(self) -> Option<i64> {
        match self {
            Extent::Static(value) => Some(value),
            Extent::Runtime(_) => None,
        }
    }

    pub fn is_static(self) -> bool {
        matches!(self, Extent::Static(_))
    }

    pub fn is_one(self) -> bool {
        self == Extent::Static(1)
    }

    /// Static non-negative extents keep their value; everything else is dynamic.
    pub fn to_dimension(self) -> Dimension {
        match self {
            Extent::Static(value) if value >= 0 => Dimension::Static(value as usize),
            _ => Dimension::Dynamic,
        }
    }
}

/// Statically decided outcome of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Equal(Extent, Extent),
    /// `divisor` evenly divides `dividend`.
    Divides { divisor: Extent, dividend: Extent },
    /// `input` is 1 or equal to `target`.
    Broadcastable { input: Extent, target: Extent },
    NonNegative(Extent),
}

impl Predicate {
    pub fn evaluate(&self) -> Truth {
        match *self {
            Predicate::Equal(lhs, rhs) => equality(lhs, rhs),
            Predicate::Divides { divisor, dividend } => match (divisor, dividend) {
                (Extent::Static(0), _) => Truth::False,
                (Extent::Static(1), _) => Truth::True,
                (Extent::Static(d), Extent::Static(n)) => truth(n % d == 0),
                (lhs, rhs) if lhs == rhs => Truth::True,
                _ => Truth::Unknown,
            },
            Predicate::Broadcastable { input, target } => {
                if input.is_one() {
                    return Truth::True;
                }
                equality(input, target)
            }
            Predicate::NonNegative(extent) => match extent {
                Extent::Static(value) => truth(value >= 0),
                Extent::Runtime(_) => Truth::Unknown,
            },
        }
    }

    pub fn is_equality(&self) -> bool {
        matches!(self, Predicate::Equal(..))
    }
}

fn truth(value: bool) -> Truth {
    if value {
        Truth::True
    } else {
        Truth::False
    }
}

fn equality(lhs: Extent, rhs: Extent) -> Truth {
    match (lhs, rhs) {
        (Extent::Static(a), Extent::Static(b)) => truth(a == b),
        (a, b) if a == b => Truth::True,
        _ => Truth::Unknown,
    }
}

/// A runtime check with the message carried by its `Assert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obligation {
    pub predicate: Predicate,
    pub message: String,
}

impl Obligation {
    pub fn new(predicate: Predicate, message: impl Into<String>) -> Self {
        Self {
            predicate,
            message: message.into(),
        }
    }

    pub fn equal(lhs: Extent, rhs: Extent, message: impl Into<String>) -> Self {
        Self::new(Predicate::Equal(lhs, rhs), message)
    }

    pub fn divides(divisor: Extent, dividend: Extent, message: impl Into<String>) -> Self {
        Self::new(Predicate::Divides { divisor, dividend }, message)
    }

    pub fn broadcastable(input: Extent, target: Extent, message: impl Into<String>) -> Self {
        Self::new(Predicate::Broadcastable { input, target }, message)
    }

    pub fn non_negative(extent: Extent, message: impl Into<String>) -> Self {
        Self::new(Predicate::NonNegative(extent), message)
    }

    pub fn is_statically_false(&self) -> bool {
        self.predicate.evaluate() == Truth::False
    }
}

/// Drops obligations that need no runtime check.
///
/// Statically true obligations always disappear; under strict symbolic
/// shapes so do equality obligations. Statically false obligations are kept.
pub fn pending_obligations(obligations: Vec<Obligation>, config: &LoweringConfig) -> Vec<Obligation> {
    obligations
        .into_iter()
        .filter(|obligation| obligation.predicate.evaluate() != Truth::True)
        .filter(|obligation| {
            !(config.assume_strict_symbolic_shapes && obligation.predicate.is_equality())
        })
        .collect()
}
