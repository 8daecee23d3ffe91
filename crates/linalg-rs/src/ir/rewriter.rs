use crate::ir::{
    index::{DefId, FunctionIndexError, FunctionIndices, InstId},
    spec::{Function, Instruction, Literal, Operand, Operation, ValueId, ValueType},
};

/// Mutable IR editor with stable instruction identifiers and SSA accounting.
pub struct ProgramRewriter<'a> {
    pub func: &'a mut Function,
    indices: FunctionIndices,
}

impl<'a> ProgramRewriter<'a> {
    /// Creates a rewriter for the provided function, indexing its body.
    pub fn new(func: &'a mut Function) -> Result<Self, FunctionIndexError> {
        let indices = FunctionIndices::build(func)?;
        Ok(Self { func, indices })
    }

    fn instruction(&self, inst: InstId) -> Option<&Instruction> {
        let pos = self.indices.position(inst)?;
        self.func.body.get(pos)
    }

    /// Returns the operation referenced by `inst`.
    pub fn op(&self, inst: InstId) -> Option<&Operation> {
        self.instruction(inst).map(|instruction| &instruction.op)
    }

    pub fn operands(&self, inst: InstId) -> &[Operand] {
        self.instruction(inst)
            .map(|instruction| instruction.operands.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the SSA value produced by the instruction.
    pub fn value_of(&self, inst: InstId) -> Option<ValueId> {
        self.indices.value_of(inst)
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.indices.type_of(value)
    }

    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        self.indices.inst_of(value)
    }

    pub fn def_of(&self, value: ValueId) -> Option<DefId> {
        self.indices.def_of(value)
    }

    /// Returns the operation producing `value`, or `None` for parameters.
    pub fn producer(&self, value: ValueId) -> Option<(&Operation, &[Operand])> {
        match self.def_of(value)? {
            DefId::Param { .. } => None,
            DefId::Inst(inst) => {
                let instruction = self.instruction(inst)?;
                Some((&instruction.op, instruction.operands.as_slice()))
            }
        }
    }

    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.indices.users_of(value)
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.indices.contains(inst)
    }

    pub fn version(&self, inst: InstId) -> Option<u32> {
        self.indices.version(inst)
    }

    /// First value id a staged replacement may use without colliding.
    pub fn next_value_id(&self) -> ValueId {
        self.indices.next_value()
    }

    pub fn insts_in_order(&self) -> Vec<InstId> {
        self.indices.ordered_inst_ids()
    }

    pub fn is_function_result(&self, value: ValueId) -> bool {
        self.func.result_ids.contains(&value)
    }

    /// Replaces all uses of `from` with `to`, including function results.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> Result<(), FunctionIndexError> {
        if from == to {
            return Ok(());
        }
        if self.indices.type_of(to).is_none() {
            return Err(FunctionIndexError::MissingValueDefinition { value: to });
        }
        let consumers = self.indices.users_of(from).to_vec();
        for inst in consumers {
            let pos = self
                .indices
                .position(inst)
                .ok_or(FunctionIndexError::UnknownInstruction { inst })?;
            for operand in &mut self.func.body[pos].operands {
                if matches!(operand, Operand::Value(value) if *value == from) {
                    *operand = Operand::Value(to);
                }
            }
            self.indices.update_operand_use(inst, from, to)?;
            self.indices.bump_version(inst);
        }
        let results_type = self.indices.type_of(to).cloned();
        for (slot, result) in self.func.result_ids.iter_mut().enumerate() {
            if *result == from {
                *result = to;
                if let (Some(ty), Some(declared)) = (&results_type, self.func.results.get_mut(slot)) {
                    *declared = ty.clone();
                }
            }
        }
        Ok(())
    }

    /// Erases the instruction identified by `inst`; it must have no remaining uses.
    pub fn erase_inst(&mut self, inst: InstId) -> Result<(), FunctionIndexError> {
        let value = self
            .indices
            .value_of(inst)
            .ok_or(FunctionIndexError::UnknownInstruction { inst })?;
        let uses = self.indices.users_of(value).len();
        if uses != 0 || self.is_function_result(value) {
            return Err(FunctionIndexError::LiveUses {
                value,
                uses: uses.max(1),
            });
        }
        let pos = self
            .indices
            .position(inst)
            .ok_or(FunctionIndexError::UnknownInstruction { inst })?;
        let instruction = self.func.body.remove(pos);
        self.indices.remove_instruction(inst, &instruction);
        Ok(())
    }

    /// Inserts a new instruction before `at`, returning its identifiers.
    pub fn insert_before(
        &mut self,
        at: InstId,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> Result<(InstId, ValueId), FunctionIndexError> {
        let value = self.indices.allocate_value();
        let inst = self.insert_instruction_before(
            at,
            Instruction {
                id: value,
                op,
                operands,
                output,
            },
        )?;
        Ok((inst, value))
    }

    /// Inserts a fully formed instruction (with a pre-assigned value id) before `at`.
    pub fn insert_instruction_before(
        &mut self,
        at: InstId,
        instruction: Instruction,
    ) -> Result<InstId, FunctionIndexError> {
        let pos = self
            .indices
            .position(at)
            .ok_or(FunctionIndexError::UnknownInstruction { inst: at })?;
        let inst_id = self.indices.allocate_inst();
        self.indices.insert_instruction(inst_id, pos, &instruction)?;
        self.func.body.insert(pos, instruction);
        Ok(inst_id)
    }

    pub fn materialize_constant(
        &mut self,
        at: InstId,
        literal: Literal,
        output: ValueType,
    ) -> Result<(InstId, ValueId), FunctionIndexError> {
        self.insert_before(at, Operation::Constant(literal), Vec::new(), output)
    }

    /// Commits a staged replacement graph for `root`.
    ///
    /// The instructions are inserted in order before `root`, every use of the
    /// root's value is redirected to `result`, and the root is erased.
    pub fn replace_op_with_staged(
        &mut self,
        root: InstId,
        staged: Vec<Instruction>,
        result: ValueId,
    ) -> Result<(), FunctionIndexError> {
        let old = self
            .indices
            .value_of(root)
            .ok_or(FunctionIndexError::UnknownInstruction { inst: root })?;
        for instruction in staged {
            tracing::trace!(value = instruction.id.0, op = ?instruction.op, "commit staged instruction");
            self.insert_instruction_before(root, instruction)?;
        }
        self.replace_all_uses(old, result)?;
        self.erase_inst(root)
    }

    /// Verifies basic SSA invariants after mutations.
    pub fn verify(&self) -> bool {
        FunctionIndices::build(self.func).is_ok()
    }
}
