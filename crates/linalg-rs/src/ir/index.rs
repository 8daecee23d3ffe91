//! Def-use bookkeeping for one [`Function`] body.
//!
//! Every instruction defines exactly one value, so the index keys instructions
//! by a stable [`InstId`] and values by their [`ValueId`]. Rewrites go through
//! [`crate::ir::rewriter::ProgramRewriter`], which keeps the body and this index
//! in lockstep.

use std::collections::HashMap;

use smallvec::SmallVec;
use thiserror::Error;

use crate::ir::spec::{Function, Instruction, Operand, ValueId, ValueType};

/// Handle for an instruction that survives insertions and removals around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct InstId(pub u32);

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefId {
    Param { index: u32 },
    Inst(InstId),
}

#[derive(Debug, Clone, Copy)]
struct InstSlot {
    value: ValueId,
    position: usize,
    /// Bumped each time an operand of the instruction is redirected.
    version: u32,
}

#[derive(Debug, Clone)]
struct ValueInfo {
    def: DefId,
    ty: ValueType,
}

/// Producers, consumers and types of the values in a function body.
#[derive(Debug, Clone)]
pub struct FunctionIndices {
    insts: HashMap<InstId, InstSlot>,
    values: HashMap<ValueId, ValueInfo>,
    users: HashMap<ValueId, SmallVec<[InstId; 4]>>,
    next_value: u32,
    next_inst: u32,
}

impl FunctionIndices {
    /// Indexes `function`, rejecting bodies that use a value before its
    /// definition or define the same value twice.
    pub fn build(function: &Function) -> Result<Self, FunctionIndexError> {
        if function.parameter_ids.len() != function.parameters.len() {
            return Err(FunctionIndexError::SignatureMismatch {
                ids: function.parameter_ids.len(),
                types: function.parameters.len(),
            });
        }

        let mut indices = FunctionIndices {
            insts: HashMap::with_capacity(function.body.len()),
            values: HashMap::new(),
            users: HashMap::new(),
            next_value: 0,
            next_inst: 0,
        };
        for (index, (&param, ty)) in function
            .parameter_ids
            .iter()
            .zip(&function.parameters)
            .enumerate()
        {
            indices.define(param, DefId::Param { index: index as u32 }, ty.clone())?;
        }
        for (position, instruction) in function.body.iter().enumerate() {
            let inst = indices.allocate_inst();
            indices.check_operands(instruction)?;
            indices.define(instruction.id, DefId::Inst(inst), instruction.output.clone())?;
            indices.add_uses(inst, instruction);
            indices.insts.insert(
                inst,
                InstSlot {
                    value: instruction.id,
                    position,
                    version: 0,
                },
            );
        }
        if let Some(&missing) = function
            .result_ids
            .iter()
            .find(|id| !indices.values.contains_key(*id))
        {
            return Err(FunctionIndexError::MissingValueDefinition { value: missing });
        }
        Ok(indices)
    }

    pub fn position(&self, inst: InstId) -> Option<usize> {
        self.insts.get(&inst).map(|slot| slot.position)
    }

    pub fn value_of(&self, inst: InstId) -> Option<ValueId> {
        self.insts.get(&inst).map(|slot| slot.value)
    }

    /// Producing instruction; `None` for parameters and unknown values.
    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        match self.def_of(value)? {
            DefId::Inst(inst) => Some(inst),
            DefId::Param { .. } => None,
        }
    }

    pub fn def_of(&self, value: ValueId) -> Option<DefId> {
        self.values.get(&value).map(|info| info.def)
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.values.get(&value).map(|info| &info.ty)
    }

    /// Instructions reading `value`, once per operand slot.
    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.users
            .get(&value)
            .map(|users| users.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.insts.contains_key(&inst)
    }

    pub fn version(&self, inst: InstId) -> Option<u32> {
        self.insts.get(&inst).map(|slot| slot.version)
    }

    pub fn next_value(&self) -> ValueId {
        ValueId(self.next_value)
    }

    /// Live instructions in body order.
    pub fn ordered_inst_ids(&self) -> Vec<InstId> {
        let mut ordered: Vec<(usize, InstId)> = self
            .insts
            .iter()
            .map(|(inst, slot)| (slot.position, *inst))
            .collect();
        ordered.sort_unstable();
        ordered.into_iter().map(|(_, inst)| inst).collect()
    }

    pub(crate) fn allocate_inst(&mut self) -> InstId {
        let inst = InstId(self.next_inst);
        self.next_inst += 1;
        inst
    }

    pub(crate) fn allocate_value(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        value
    }

    /// Records `instruction` at body position `pos`; later instructions move down one slot.
    pub(crate) fn insert_instruction(
        &mut self,
        inst: InstId,
        pos: usize,
        instruction: &Instruction,
    ) -> Result<(), FunctionIndexError> {
        if self.values.contains_key(&instruction.id) {
            return Err(FunctionIndexError::DuplicateValue {
                value: instruction.id,
            });
        }
        self.check_operands(instruction)?;

        for slot in self.insts.values_mut().filter(|slot| slot.position >= pos) {
            slot.position += 1;
        }
        self.define(instruction.id, DefId::Inst(inst), instruction.output.clone())?;
        self.add_uses(inst, instruction);
        self.insts.insert(
            inst,
            InstSlot {
                value: instruction.id,
                position: pos,
                version: 0,
            },
        );
        Ok(())
    }

    /// Forgets `inst`, its result and the uses it held on its operands.
    pub(crate) fn remove_instruction(&mut self, inst: InstId, instruction: &Instruction) {
        if let Some(removed) = self.insts.remove(&inst) {
            for slot in self
                .insts
                .values_mut()
                .filter(|slot| slot.position > removed.position)
            {
                slot.position -= 1;
            }
            self.values.remove(&removed.value);
            self.users.remove(&removed.value);
        }
        for operand in instruction.operands.iter().filter_map(Operand::value) {
            self.drop_use(operand, inst);
        }
    }

    /// Transfers the use `inst` holds on `from` over to `to`.
    pub(crate) fn update_operand_use(
        &mut self,
        inst: InstId,
        from: ValueId,
        to: ValueId,
    ) -> Result<(), FunctionIndexError> {
        if !self.values.contains_key(&to) {
            return Err(FunctionIndexError::MissingValueDefinition { value: to });
        }
        self.drop_use(from, inst);
        self.users.entry(to).or_default().push(inst);
        Ok(())
    }

    pub(crate) fn bump_version(&mut self, inst: InstId) {
        if let Some(slot) = self.insts.get_mut(&inst) {
            slot.version = slot.version.wrapping_add(1);
        }
    }

    fn define(&mut self, value: ValueId, def: DefId, ty: ValueType) -> Result<(), FunctionIndexError> {
        if self.values.contains_key(&value) {
            return Err(FunctionIndexError::DuplicateValue { value });
        }
        self.values.insert(value, ValueInfo { def, ty });
        self.next_value = self.next_value.max(value.0 + 1);
        Ok(())
    }

    fn check_operands(&self, instruction: &Instruction) -> Result<(), FunctionIndexError> {
        match instruction
            .operands
            .iter()
            .filter_map(Operand::value)
            .find(|value| !self.values.contains_key(value))
        {
            Some(value) => Err(FunctionIndexError::MissingValueDefinition { value }),
            None => Ok(()),
        }
    }

    fn add_uses(&mut self, inst: InstId, instruction: &Instruction) {
        for operand in instruction.operands.iter().filter_map(Operand::value) {
            self.users.entry(operand).or_default().push(inst);
        }
    }

    fn drop_use(&mut self, value: ValueId, inst: InstId) {
        if let Some(users) = self.users.get_mut(&value) {
            users.retain(|user| *user != inst);
            if users.is_empty() {
                self.users.remove(&value);
            }
        }
    }
}

/// Inconsistencies found while indexing or editing a function body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FunctionIndexError {
    #[error("duplicate value definition for %{}", value.0)]
    DuplicateValue { value: ValueId },
    #[error("value %{} is used but never defined", value.0)]
    MissingValueDefinition { value: ValueId },
    #[error("function declares {ids} parameter ids but {types} parameter types")]
    SignatureMismatch { ids: usize, types: usize },
    #[error("instruction {inst:?} is not part of the function")]
    UnknownInstruction { inst: InstId },
    #[error("value %{} still has {uses} use(s)", value.0)]
    LiveUses { value: ValueId, uses: usize },
}
