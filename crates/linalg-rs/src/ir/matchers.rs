//! Constant matchers over source-level operands.
//!
//! An operand counts as constant when it is an inline literal or the result
//! of a `Constant` instruction; lists are recognised through `ListConstruct`.

use crate::ir::{
    rewriter::ProgramRewriter,
    spec::{Literal, Operand, Operation, ValueType},
};

fn constant_literal<'a>(rewriter: &'a ProgramRewriter, operand: &'a Operand) -> Option<&'a Literal> {
    match operand {
        Operand::Literal(literal) => Some(literal),
        Operand::Value(value) => match rewriter.producer(*value)? {
            (Operation::Constant(literal), _) => Some(literal),
            _ => None,
        },
    }
}

pub fn match_constant_int(rewriter: &ProgramRewriter, operand: &Operand) -> Option<i64> {
    match constant_literal(rewriter, operand)? {
        Literal::Int(value) => Some(*value),
        _ => None,
    }
}

pub fn match_constant_bool(rewriter: &ProgramRewriter, operand: &Operand) -> Option<bool> {
    match constant_literal(rewriter, operand)? {
        Literal::Bool(value) => Some(*value),
        _ => None,
    }
}

/// Returns the element operands of a list produced by `ListConstruct`.
pub fn list_construct_elements(rewriter: &ProgramRewriter, operand: &Operand) -> Option<Vec<Operand>> {
    let value = operand.value()?;
    match rewriter.producer(value)? {
        (Operation::ListConstruct, elements) => Some(elements.to_vec()),
        _ => None,
    }
}

pub fn match_constant_int_list(rewriter: &ProgramRewriter, operand: &Operand) -> Option<Vec<i64>> {
    list_construct_elements(rewriter, operand)?
        .iter()
        .map(|element| match_constant_int(rewriter, element))
        .collect()
}

pub fn is_none(rewriter: &ProgramRewriter, operand: &Operand) -> bool {
    if matches!(constant_literal(rewriter, operand), Some(Literal::None)) {
        return true;
    }
    operand
        .value()
        .and_then(|value| rewriter.type_of(value))
        .is_some_and(|ty| matches!(ty, ValueType::None))
}
