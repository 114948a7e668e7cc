//! Generic lowering of the remaining `JS_BYTECODE` gates into runtime calls
//! with an explicit success/exception split.

use anyhow::Result;

use crate::bytecode::{Bytecode, CommonArgIdx};
use crate::frontend::args::ArgumentAccessor;
use crate::frontend::FrontendInfo;
use crate::ir::accessor::GateAccessor;
use crate::ir::builder::CircuitBuilder;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::gate_type::GateType;
use crate::ir::opcode::OpCode;
use crate::ir::visualizer;
use crate::stubs::{stub_for_bytecode, StubId};

/// Splices `call` in place of the bytecode gate `hir`.
///
/// The call adopts the hir's state and depend wires; a branch on
/// `call == exception` replaces the bytecode's two-way split: the old
/// `IF_SUCCESS` user becomes the branch's `IF_FALSE`, the old `IF_EXCEPTION`
/// its `IF_TRUE`, and every other user reads the call's result.
pub(crate) fn replace_hir_to_call(
    circuit: &mut Circuit,
    hir: GateRef,
    call: GateRef,
    no_throw: bool,
) -> Result<()> {
    let mut acc = GateAccessor::new(circuit);
    let state_in = acc.get_state(hir, 0);
    let depend_in = acc.get_dep(hir);
    acc.set_dep(call, depend_in);

    let mut builder = CircuitBuilder::new(acc.circuit_mut());
    let condition = if no_throw {
        builder.boolean_constant(false)?
    } else {
        let exception = builder.exception_constant(GateType::any())?;
        builder.binary_logic(OpCode::Eq, call, exception)?
    };
    let branch = builder.branch(state_in, condition)?;

    let mut uses = acc.uses(hir);
    while let Some(edge) = uses.step(&acc) {
        match acc.opcode(edge.gate) {
            OpCode::IfSuccess => {
                acc.set_opcode(edge.gate, OpCode::IfFalse);
                acc.replace_in(&edge, branch);
            }
            OpCode::IfException => {
                acc.set_opcode(edge.gate, OpCode::IfTrue);
                acc.replace_in(&edge, branch);
            }
            _ => acc.replace_in(&edge, call),
        }
    }
    circuit.delete_gate(hir);
    Ok(())
}

/// The conditional variant: the call runs only when `condition` holds, and
/// the no-call path joins the no-exception path in a fresh merge.
pub(crate) fn replace_hir_to_condition_call(
    circuit: &mut Circuit,
    hir: GateRef,
    condition: GateRef,
    call: GateRef,
) -> Result<()> {
    let mut acc = GateAccessor::new(circuit);
    let state_in = acc.get_state(hir, 0);
    let depend_in = acc.get_dep(hir);

    // Condition branch, then the exception check on the taken side.
    let mut builder = CircuitBuilder::new(acc.circuit_mut());
    let cond_branch = builder.branch(state_in, condition)?;
    let cond_true = builder.if_true(cond_branch)?;
    let cond_false = builder.if_false(cond_branch)?;
    let exception = builder.exception_constant(GateType::any())?;
    let equal = builder.binary_logic(OpCode::Eq, call, exception)?;
    let exception_branch = builder.branch(cond_true, equal)?;
    let exception_false = builder.if_false(exception_branch)?;
    let state_merge = builder.merge(&[cond_false, exception_false])?;

    // Depend wiring: the call runs under the taken side only; the skipped
    // side relays the incoming depend, and both meet in a selector.
    let cond_true_relay = builder.depend_relay(cond_true, depend_in)?;
    acc.set_dep(call, cond_true_relay);
    let mut builder = CircuitBuilder::new(acc.circuit_mut());
    let cond_false_relay = builder.depend_relay(cond_false, depend_in)?;
    let depend_phi = builder.depend_selector(state_merge, &[call, cond_false_relay])?;

    let mut uses = acc.uses(hir);
    while let Some(edge) = uses.step(&acc) {
        match acc.opcode(edge.gate) {
            OpCode::IfSuccess => {
                // The success continuation dissolves into the merge.
                let mut successor_uses = acc.uses(edge.gate);
                while let Some(successor) = successor_uses.step(&acc) {
                    acc.replace_in(&successor, state_merge);
                }
                let dead = edge.gate;
                acc.delete_gate(dead);
            }
            OpCode::IfException => {
                acc.set_opcode(edge.gate, OpCode::IfTrue);
                acc.replace_in(&edge, exception_branch);
            }
            OpCode::DependSelector | OpCode::DependRelay => {
                // Exception-path depend consumers keep reading the call
                // itself; only the fall-through world sees the merged depend.
                let control = acc.get_state(edge.gate, 0);
                let control_op = acc.opcode(control);
                if control_op == OpCode::IfException || control_op == OpCode::IfTrue {
                    acc.replace_in(&edge, call);
                } else {
                    acc.replace_in(&edge, depend_phi);
                }
            }
            _ => acc.replace_in(&edge, call),
        }
    }
    circuit.delete_gate(hir);
    Ok(())
}

/// Lowers every remaining bytecode gate to a runtime call.
pub struct SlowPathLowering<'a> {
    circuit: &'a mut Circuit,
    info: &'a FrontendInfo,
    enable_log: bool,
}

impl<'a> SlowPathLowering<'a> {
    pub fn new(circuit: &'a mut Circuit, info: &'a FrontendInfo, enable_log: bool) -> Self {
        SlowPathLowering {
            circuit,
            info,
            enable_log,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        for gate in self.circuit.all_gates() {
            if self.circuit.opcode(gate) != OpCode::JsBytecode {
                continue;
            }
            let Some(&bc) = self.info.bytecode_of(gate) else {
                continue;
            };
            self.lower(gate, &bc)?;
        }
        if self.enable_log {
            visualizer::print_circuit(self.circuit, "slow path lowering");
        }
        Ok(())
    }

    fn lower(&mut self, gate: GateRef, bc: &Bytecode) -> Result<()> {
        let Some(stub) = stub_for_bytecode(bc) else {
            return Ok(());
        };
        let glue = ArgumentAccessor::new(self.circuit).common_arg(CommonArgIdx::Glue);
        match *bc {
            // Constant-pool reads go through the pool-load trampoline with
            // the owning function and the string index.
            Bytecode::LdaStr { str_id }
            | Bytecode::TryLdGlobalByName { str_id }
            | Bytecode::LdGlobalVar { str_id }
            | Bytecode::StGlobalVar { str_id }
            | Bytecode::LdObjByName { str_id, .. } => {
                let func = ArgumentAccessor::new(self.circuit).common_arg(CommonArgIdx::Func);
                let mut builder = CircuitBuilder::new(self.circuit);
                let string_id = builder.int64_constant(str_id as i64)?;
                let pool_id =
                    builder.int64_constant(StubId::LoadValueFromConstantPool.as_i64())?;
                let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
                let property =
                    builder.runtime_call(glue, pool_id, depend_entry, &[func, string_id])?;
                let mut args = vec![property];
                args.extend(self.value_ins(gate));
                self.lower_to_call(gate, glue, stub, &args, false)
            }
            Bytecode::AsyncFunctionResolve { .. } => {
                let resolve = CircuitBuilder::new(self.circuit).boolean_constant(true)?;
                let mut args = self.value_ins(gate);
                args.push(resolve);
                self.lower_to_call(gate, glue, stub, &args, false)
            }
            Bytecode::AsyncFunctionReject { .. } => {
                let resolve = CircuitBuilder::new(self.circuit).boolean_constant(false)?;
                let mut args = self.value_ins(gate);
                args.push(resolve);
                self.lower_to_call(gate, glue, stub, &args, false)
            }
            // The suspend gate carries its resume offset as value input 0;
            // the runtime only needs the generator and the sent value.
            Bytecode::SuspendGenerator { .. } => {
                let args = self.value_ins(gate)[1..].to_vec();
                self.lower_to_call(gate, glue, stub, &args, false)
            }
            // The iterator fetch is guarded: generator objects skip the
            // generic protocol call.
            Bytecode::GetIterator => {
                let args = self.value_ins(gate);
                let call = self.new_runtime_call(glue, stub, &args)?;
                let condition = CircuitBuilder::new(self.circuit).boolean_constant(true)?;
                replace_hir_to_condition_call(self.circuit, gate, condition, call)
            }
            _ => {
                let args = self.value_ins(gate);
                self.lower_to_call(gate, glue, stub, &args, false)
            }
        }
    }

    fn value_ins(&self, gate: GateRef) -> Vec<GateRef> {
        let base = self.circuit.state_count(gate) + self.circuit.depend_count(gate);
        (0..self.circuit.value_count(gate))
            .map(|idx| self.circuit.get_in(gate, base + idx))
            .collect()
    }

    fn new_runtime_call(
        &mut self,
        glue: GateRef,
        stub: StubId,
        args: &[GateRef],
    ) -> Result<GateRef> {
        let mut builder = CircuitBuilder::new(self.circuit);
        let id = builder.int64_constant(stub.as_i64())?;
        let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
        builder.runtime_call(glue, id, depend_entry, args)
    }

    fn lower_to_call(
        &mut self,
        gate: GateRef,
        glue: GateRef,
        stub: StubId,
        args: &[GateRef],
        no_throw: bool,
    ) -> Result<()> {
        let call = self.new_runtime_call(glue, stub, args)?;
        replace_hir_to_call(self.circuit, gate, call, no_throw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeTranslationInfo, MethodInfo};
    use crate::frontend::BytecodeCircuitBuilder;
    use crate::ir::verifier::Verifier;

    fn lowered(bytecodes: Vec<Bytecode>, num_vregs: u16) -> (Circuit, FrontendInfo) {
        let method = MethodInfo {
            num_vregs,
            ..MethodInfo::default()
        };
        let translation = BytecodeTranslationInfo::new(method, bytecodes);
        let (mut circuit, info) = BytecodeCircuitBuilder::build(translation, false).unwrap();
        Verifier::run(&circuit).unwrap();
        SlowPathLowering::new(&mut circuit, &info, false).run().unwrap();
        (circuit, info)
    }

    fn count_opcodes(circuit: &Circuit, opcode: OpCode) -> usize {
        circuit
            .all_gates()
            .iter()
            .filter(|g| circuit.opcode(**g) == opcode)
            .count()
    }

    #[test]
    fn add_lowering_preserves_the_control_split() {
        use Bytecode::*;
        let (circuit, info) = lowered(
            vec![
                LdaiInt { imm: 1 },
                Sta { dst: 0 },
                Add2 { lhs: 0 },
                ReturnAcc,
            ],
            1,
        );
        Verifier::run(&circuit).unwrap();
        // The bytecode gate is gone; a runtime call took its place.
        assert_eq!(count_opcodes(&circuit, OpCode::JsBytecode), 0);
        assert_eq!(count_opcodes(&circuit, OpCode::RuntimeCall), 1);
        let old_add = info.pc_to_gate[&2];
        assert_eq!(circuit.opcode(old_add), OpCode::Nop);
        // The old IF_SUCCESS is now the IF_FALSE of a branch on the
        // exception sentinel, and the old IF_EXCEPTION its IF_TRUE.
        assert_eq!(count_opcodes(&circuit, OpCode::IfSuccess), 0);
        assert_eq!(count_opcodes(&circuit, OpCode::IfException), 0);
        assert_eq!(count_opcodes(&circuit, OpCode::IfTrue), 1);
        assert_eq!(count_opcodes(&circuit, OpCode::IfFalse), 1);
        let branch = circuit
            .all_gates()
            .into_iter()
            .find(|g| circuit.opcode(*g) == OpCode::IfBranch)
            .unwrap();
        let condition = circuit.get_in(branch, 1);
        assert_eq!(circuit.opcode(condition), OpCode::Eq);
        // The return now reads the call's result.
        let ret = info.pc_to_gate[&3];
        let call = circuit.get_in(ret, 2);
        assert_eq!(circuit.opcode(call), OpCode::RuntimeCall);
    }

    #[test]
    fn conditional_call_merges_the_skip_path() {
        use Bytecode::*;
        let (circuit, _info) = lowered(
            vec![LdUndefined, GetIterator, ReturnAcc],
            0,
        );
        Verifier::run(&circuit).unwrap();
        assert_eq!(count_opcodes(&circuit, OpCode::JsBytecode), 0);
        // Two branches: the precondition and the exception check.
        assert_eq!(count_opcodes(&circuit, OpCode::IfBranch), 2);
        // The skip path and the no-exception path meet in a merge with a
        // depend selector over the call and the skip relay.
        assert_eq!(count_opcodes(&circuit, OpCode::Merge), 1);
        assert_eq!(count_opcodes(&circuit, OpCode::DependSelector), 1);
        let selector = circuit
            .all_gates()
            .into_iter()
            .find(|g| circuit.opcode(*g) == OpCode::DependSelector)
            .unwrap();
        assert_eq!(circuit.opcode(circuit.get_in(selector, 0)), OpCode::Merge);
        assert_eq!(
            circuit.opcode(circuit.get_in(selector, 1)),
            OpCode::RuntimeCall
        );
        assert_eq!(
            circuit.opcode(circuit.get_in(selector, 2)),
            OpCode::DependRelay
        );
    }

    #[test]
    fn every_general_bytecode_is_lowered() {
        use Bytecode::*;
        let (circuit, _info) = lowered(
            vec![
                /* 0 */ LdaiInt { imm: 3 },
                /* 1 */ Sta { dst: 0 },
                /* 2 */ LdaStr { str_id: 4 },
                /* 3 */ StGlobalVar { str_id: 9 },
                /* 4 */ LdGlobalVar { str_id: 9 },
                /* 5 */ Sta { dst: 1 },
                /* 6 */ CallArg1 { func: 1, a0: 0 },
                /* 7 */ ReturnAcc,
            ],
            2,
        );
        Verifier::run(&circuit).unwrap();
        assert_eq!(count_opcodes(&circuit, OpCode::JsBytecode), 0);
    }
}
