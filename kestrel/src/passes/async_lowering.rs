//! Control-flow rebuilding around generator resume points.
//!
//! The entry state is split on `new_target == undefined`: a plain call runs
//! the method body from the top, a re-entry loads the saved bytecode offset
//! from the generator context and dispatches through a linear cascade of
//! equality tests, one per resume site. A resume site inside a loop gets an
//! I32 dispatch phi on each enclosing loop head whose back edge falls
//! through with a no-match sentinel.

use anyhow::Result;

use crate::bytecode::CommonArgIdx;
use crate::frontend::args::ArgumentAccessor;
use crate::frontend::FrontendInfo;
use crate::ir::accessor::GateAccessor;
use crate::ir::builder::CircuitBuilder;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::gate_type::GateType;
use crate::ir::machine::MachineType;
use crate::ir::opcode::OpCode;
use crate::ir::tagged;
use crate::ir::visualizer;

/// Byte offset of the execution context inside a generator object.
const GENERATOR_CONTEXT_OFFSET: u64 = 0x28;
/// Byte offset of the saved bytecode offset inside a generator context.
const GENERATOR_BC_OFFSET_OFFSET: u64 = 0x10;
/// Dispatch-phi operand meaning "not resuming through this loop".
const NO_MATCH_OFFSET: i32 = -1;

pub struct AsyncFunctionLowering<'a> {
    circuit: &'a mut Circuit,
    info: &'a FrontendInfo,
    enable_log: bool,
}

impl<'a> AsyncFunctionLowering<'a> {
    pub fn new(circuit: &'a mut Circuit, info: &'a FrontendInfo, enable_log: bool) -> Self {
        AsyncFunctionLowering {
            circuit,
            info,
            enable_log,
        }
    }

    pub fn is_async_related(&self) -> bool {
        self.info.is_async_related()
    }

    pub fn run(&mut self) -> Result<()> {
        self.process_jump_table()?;
        if self.enable_log {
            visualizer::print_circuit(self.circuit, "async function lowering");
        }
        Ok(())
    }

    fn process_jump_table(&mut self) -> Result<()> {
        let state_entry = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
        let new_target = ArgumentAccessor::new(self.circuit).common_arg(CommonArgIdx::NewTarget);

        // The method body previously hung directly off the state entry.
        let first_state = {
            let acc = GateAccessor::new(self.circuit);
            let mut uses = acc.uses(state_entry);
            let edge = uses
                .step(&acc)
                .expect("the state entry always has a successor");
            edge.gate
        };

        let mut builder = CircuitBuilder::new(self.circuit);
        let undefined = builder.undefined_constant(GateType::undefined())?;
        let is_first_entry = builder.binary_logic(OpCode::Eq, new_target, undefined)?;
        let prologue_branch = builder.branch(state_entry, is_first_entry)?;
        let first_entry = builder.if_true(prologue_branch)?;
        let re_entry = builder.if_false(prologue_branch)?;
        GateAccessor::new(self.circuit).replace_state_in(first_state, first_entry);

        // Load the saved bytecode offset out of the generator context.
        let mut builder = CircuitBuilder::new(self.circuit);
        let context_offset = builder.ptr_constant(GENERATOR_CONTEXT_OFFSET)?;
        let context_address = builder.ptr_add(new_target, context_offset)?;
        let context = builder.load(
            MachineType::I64,
            depend_entry,
            context_address,
            GateType::any(),
        )?;
        let bc_offset = builder.ptr_constant(GENERATOR_BC_OFFSET_OFFSET)?;
        let offset_address = builder.ptr_add(context, bc_offset)?;
        let restore_offset = builder.load(
            MachineType::I32,
            context,
            offset_address,
            GateType::number(),
        )?;

        let mut first_dispatch = Circuit::null_gate();
        for resume in self.info.async_related.clone() {
            let Some(bc) = self.info.bytecode_of(resume) else {
                continue;
            };
            if bc.is_resume() {
                self.rebuild_generator_cfg(resume, restore_offset, re_entry, new_target, &mut first_dispatch)?;
            }
        }
        Ok(())
    }

    fn rebuild_generator_cfg(
        &mut self,
        resume: GateRef,
        restore_offset: GateRef,
        re_entry: GateRef,
        new_target: GateRef,
        first_dispatch: &mut GateRef,
    ) -> Result<()> {
        let acc = GateAccessor::new(self.circuit);
        let if_success = acc.get_state(resume, 0);
        let suspend = acc.get_state(if_success, 0);
        let first_restore = self.first_restore_register(resume);
        // The suspend site stored its own offset as a constant; dispatch
        // compares the loaded offset against it.
        let offset_constant = GateAccessor::new(self.circuit).get_value_in(suspend, 0);
        let offset_constant =
            CircuitBuilder::new(self.circuit).unary_arithmetic(OpCode::TruncToInt32, offset_constant)?;

        let mut state_in = GateAccessor::new(self.circuit).get_state(resume, 0);
        let mut not_yet_rewired = true;
        let mut previous_loop_begin = Circuit::null_gate();
        let mut loop_begin_dispatch = Circuit::null_gate();
        let mut previous_offset_phi = Circuit::null_gate();
        loop {
            let opcode = self.circuit.opcode(state_in);
            if opcode == OpCode::StateEntry {
                let mut builder = CircuitBuilder::new(self.circuit);
                let condition =
                    builder.binary_logic(OpCode::Eq, offset_constant, restore_offset)?;
                let branch = builder.branch(re_entry, condition)?;
                let if_true = builder.if_true(branch)?;
                let if_false = builder.if_false(branch)?;
                if not_yet_rewired {
                    self.wire_resume_point(resume, if_true, new_target, first_restore, restore_offset)?;
                    self.return_suspended_value(if_success, suspend)?;
                } else {
                    loop_begin_dispatch = if_true;
                }
                if !first_dispatch.is_null() {
                    // Push the previous cascade entry below this one.
                    GateAccessor::new(self.circuit).replace_state_in(*first_dispatch, if_false);
                } else {
                    // Cascade miss: nothing to resume, return undefined.
                    let mut builder = CircuitBuilder::new(self.circuit);
                    let undefined = builder.undefined_constant(GateType::undefined())?;
                    builder.return_value(if_false, restore_offset, undefined)?;
                }
                *first_dispatch = branch;
            }

            if opcode == OpCode::LoopBegin {
                // A unique no-match constant: dispatch falls through on the
                // back edge.
                let no_match = self.circuit.new_gate(
                    OpCode::Constant,
                    MachineType::I32,
                    NO_MATCH_OFFSET as u32 as u64,
                    &[Circuit::get_circuit_root(OpCode::ConstantList)],
                    GateType::number(),
                )?;
                let offset_phi = self.circuit.new_gate(
                    OpCode::ValueSelector,
                    MachineType::I32,
                    2,
                    &[state_in, restore_offset, no_match],
                    GateType::number(),
                )?;
                let mut builder = CircuitBuilder::new(self.circuit);
                let condition = builder.binary_logic(OpCode::Eq, offset_constant, offset_phi)?;
                let branch = builder.branch(state_in, condition)?;
                let if_true = builder.if_true(branch)?;
                let if_false = builder.if_false(branch)?;

                let resume_state = GateAccessor::new(self.circuit).get_state(resume, 0);
                if self.circuit.opcode(resume_state) != OpCode::IfTrue {
                    self.wire_resume_point(resume, if_true, new_target, first_restore, restore_offset)?;
                    self.return_suspended_value(if_success, suspend)?;
                } else {
                    // A deeper loop already dispatched; chain its head into
                    // this level.
                    self.update_value_selector(previous_loop_begin, if_true, previous_offset_phi)?;
                    GateAccessor::new(self.circuit).replace_value_in(previous_offset_phi, offset_phi);
                }

                // Everything the loop head controlled now runs on the
                // no-dispatch side.
                let mut acc = GateAccessor::new(self.circuit);
                let mut uses = acc.uses(state_in);
                while let Some(edge) = uses.step(&acc) {
                    if acc.opcode(edge.gate).is_state()
                        && edge.gate != branch
                        && edge.index < acc.circuit().state_count(edge.gate)
                    {
                        acc.replace_in(&edge, if_false);
                    }
                }

                previous_loop_begin = state_in;
                previous_offset_phi = offset_phi;
                state_in = GateAccessor::new(self.circuit).get_state(state_in, 0);
                not_yet_rewired = false;
                continue;
            }

            if !loop_begin_dispatch.is_null() {
                self.update_value_selector(previous_loop_begin, loop_begin_dispatch, previous_offset_phi)?;
                break;
            }
            if self.circuit.opcode(state_in) == OpCode::StateEntry {
                break;
            }
            state_in = GateAccessor::new(self.circuit).get_state(state_in, 0);
        }
        Ok(())
    }

    /// Redirects the resume gate onto a dispatch hit and reroutes the
    /// restore chain to depend on the loaded offset.
    fn wire_resume_point(
        &mut self,
        resume: GateRef,
        dispatch_hit: GateRef,
        new_target: GateRef,
        first_restore: GateRef,
        restore_offset: GateRef,
    ) -> Result<()> {
        let mut acc = GateAccessor::new(self.circuit);
        acc.replace_state_in(resume, dispatch_hit);
        acc.replace_value_in(resume, new_target);
        if !first_restore.is_null() {
            acc.replace_depend_in(first_restore, restore_offset);
        }
        Ok(())
    }

    /// On the first-entry path the suspend's success continuation returns
    /// the suspended value to the caller.
    fn return_suspended_value(&mut self, if_success: GateRef, suspend: GateRef) -> Result<()> {
        CircuitBuilder::new(self.circuit).return_value(if_success, suspend, suspend)?;
        Ok(())
    }

    /// Splices a two-way merge above `loop_begin` so the dispatch edge joins
    /// the original forward edge, and rebases every value selector on the
    /// loop over that merge.
    fn update_value_selector(
        &mut self,
        loop_begin: GateRef,
        dispatch_state: GateRef,
        offset_phi: GateRef,
    ) -> Result<()> {
        let first_state = GateAccessor::new(self.circuit).get_state(loop_begin, 0);
        let merge = CircuitBuilder::new(self.circuit).merge(&[dispatch_state, first_state])?;
        GateAccessor::new(self.circuit).replace_state_in(loop_begin, merge);
        let users = self.circuit.outs(loop_begin);
        for user in users {
            if self.circuit.opcode(user) == OpCode::ValueSelector && user != offset_phi {
                let machine_type = self.circuit.machine_type(user);
                let gate_type = self.circuit.gate_type(user);
                let undefined = self.circuit.get_constant_gate(
                    machine_type,
                    tagged::VALUE_UNDEFINED,
                    gate_type,
                )?;
                let first_value = GateAccessor::new(self.circuit).get_value_in(user, 0);
                let selector = self.circuit.new_gate(
                    OpCode::ValueSelector,
                    machine_type,
                    2,
                    &[merge, undefined, first_value],
                    gate_type,
                )?;
                GateAccessor::new(self.circuit).replace_value_in(user, selector);
            }
        }
        Ok(())
    }

    /// The earliest RESTORE_REGISTER on the resume gate's depend chain.
    fn first_restore_register(&self, resume: GateRef) -> GateRef {
        let mut first = Circuit::null_gate();
        let state_count = self.circuit.state_count(resume);
        let mut current = self.circuit.get_in(resume, state_count);
        while self.circuit.opcode(current) == OpCode::RestoreRegister {
            first = current;
            current = self.circuit.get_in(current, 0);
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Bytecode, BytecodeTranslationInfo, MethodInfo};
    use crate::frontend::BytecodeCircuitBuilder;
    use crate::ir::verifier::Verifier;

    fn count_opcodes(circuit: &Circuit, opcode: OpCode) -> usize {
        circuit
            .all_gates()
            .iter()
            .filter(|g| circuit.opcode(**g) == opcode)
            .count()
    }

    fn method(num_vregs: u16) -> MethodInfo {
        MethodInfo {
            num_vregs,
            ..MethodInfo::default()
        }
    }

    #[test]
    fn straight_line_resume_gets_a_prologue_dispatch() -> Result<()> {
        use Bytecode::*;
        let translation = BytecodeTranslationInfo::new(
            method(1),
            vec![
                /* 0 */ LdUndefined,
                /* 1 */ Sta { dst: 0 },
                /* 2 */ SuspendGenerator { gen: 0, value: 0 },
                /* 3 */ ResumeGenerator { gen: 0 },
                /* 4 */ ReturnAcc,
            ],
        );
        let (mut circuit, info) = BytecodeCircuitBuilder::build(translation, false)?;
        Verifier::run(&circuit)?;
        let mut pass = AsyncFunctionLowering::new(&mut circuit, &info, false);
        assert!(pass.is_async_related());
        pass.run()?;
        Verifier::run(&circuit)?;

        // Entry now branches on new_target == undefined.
        let state_entry = Circuit::get_circuit_root(OpCode::StateEntry);
        let users = circuit.outs(state_entry);
        let prologue = users
            .iter()
            .copied()
            .find(|g| circuit.opcode(*g) == OpCode::IfBranch)
            .expect("prologue branch");
        let condition = circuit.get_in(prologue, 1);
        assert_eq!(circuit.opcode(condition), OpCode::Eq);
        // The resume side reads the saved offset from the context.
        assert_eq!(count_opcodes(&circuit, OpCode::Load), 2);
        // The resume gate is now dispatched from an IF_TRUE.
        let resume = info.async_related[1];
        assert_eq!(circuit.opcode(circuit.get_in(resume, 0)), OpCode::IfTrue);
        // Its restore chain depends on the loaded offset.
        let restore = circuit.get_in(resume, 1);
        assert_eq!(circuit.opcode(restore), OpCode::RestoreRegister);
        assert_eq!(circuit.opcode(circuit.get_in(restore, 0)), OpCode::Load);
        // Cascade miss returns undefined; first-entry suspend returns the
        // suspended value.
        assert_eq!(count_opcodes(&circuit, OpCode::Return), 3);
        Ok(())
    }

    #[test]
    fn resume_inside_a_loop_gets_a_dispatch_phi() -> Result<()> {
        use Bytecode::*;
        // A countdown loop whose body suspends and resumes each iteration.
        let translation = BytecodeTranslationInfo::new(
            method(1),
            vec![
                /* 0 */ LdaiInt { imm: 3 },
                /* 1 */ Sta { dst: 0 },
                /* 2 */ Lda { src: 0 },
                /* 3 */ Jeqz { offset: 7 },
                /* 4 */ SuspendGenerator { gen: 0, value: 0 },
                /* 5 */ ResumeGenerator { gen: 0 },
                /* 6 */ LdaiInt { imm: 1 },
                /* 7 */ Sub2 { lhs: 0 },
                /* 8 */ Sta { dst: 0 },
                /* 9 */ Jmp { offset: -7 },
                /* 10 */ ReturnUndefined,
            ],
        );
        let (mut circuit, info) = BytecodeCircuitBuilder::build(translation, false)?;
        Verifier::run(&circuit)?;
        AsyncFunctionLowering::new(&mut circuit, &info, false).run()?;
        Verifier::run(&circuit)?;

        // The loop head carries an I32 dispatch phi whose back edge is the
        // no-match sentinel.
        let dispatch_phi = circuit
            .all_gates()
            .into_iter()
            .find(|g| {
                circuit.opcode(*g) == OpCode::ValueSelector
                    && circuit.machine_type(*g) == MachineType::I32
            })
            .expect("dispatch phi");
        assert_eq!(
            circuit.opcode(circuit.get_in(dispatch_phi, 0)),
            OpCode::LoopBegin
        );
        assert_eq!(circuit.opcode(circuit.get_in(dispatch_phi, 1)), OpCode::Load);
        let sentinel = circuit.get_in(dispatch_phi, 2);
        assert_eq!(circuit.opcode(sentinel), OpCode::Constant);
        assert_eq!(circuit.bit_field(sentinel), NO_MATCH_OFFSET as u32 as u64);
        // The resume is reached through the in-loop dispatch hit.
        let resume = info.async_related[1];
        assert_eq!(circuit.opcode(circuit.get_in(resume, 0)), OpCode::IfTrue);
        Ok(())
    }
}
