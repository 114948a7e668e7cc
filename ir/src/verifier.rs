use anyhow::{bail, Result};
use hashbrown::HashMap;

use crate::circuit::Circuit;
use crate::gate::{GateRef, NULL_OFFSET};
use crate::machine::MachineType;
use crate::opcode::OpCode;
use crate::visualizer::gate_to_string;

/// Structural checker of a circuit against the per-opcode contracts.
///
/// A failure is a programming error in a pass, never an expected condition;
/// the returned error names the offending gate and input index and the gate
/// is also dumped through `log`.
#[derive(Debug)]
pub struct Verifier;

impl Verifier {
    pub fn run(circuit: &Circuit) -> Result<()> {
        for gate in circuit.all_gates() {
            if let Err(err) = Self::verify_gate(circuit, gate) {
                log::error!(
                    "[verifier] gate input/output schema violated: {}",
                    gate_to_string(circuit, gate)
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn verify_gate(circuit: &Circuit, gate: GateRef) -> Result<()> {
        Self::check_null_input(circuit, gate)?;
        Self::check_state_input(circuit, gate)?;
        Self::check_value_input(circuit, gate)?;
        Self::check_depend_input(circuit, gate)?;
        Self::check_root_input(circuit, gate)?;
        Self::check_state_output(circuit, gate)?;
        Self::check_branch_output(circuit, gate)?;
        Self::check_nop(circuit, gate)?;
        Self::check_selector(circuit, gate)?;
        Self::check_relay(circuit, gate)?;
        Ok(())
    }

    fn fail(circuit: &Circuit, gate: GateRef, message: &str, idx: impl Into<Option<usize>>) -> Result<()> {
        let id = circuit.id(gate);
        let opcode = circuit.opcode(gate);
        match idx.into() {
            Some(idx) => bail!("gate {id} ({opcode}): {message} (input index {idx})"),
            None => bail!("gate {id} ({opcode}): {message}"),
        }
    }

    fn check_null_input(circuit: &Circuit, gate: GateRef) -> Result<()> {
        for idx in 0..circuit.num_ins(gate) {
            if circuit.is_in_null(gate, idx) {
                return Self::fail(circuit, gate, "in list contains null", idx);
            }
        }
        Ok(())
    }

    fn check_state_input(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let opcode = circuit.opcode(gate);
        for idx in 0..circuit.state_count(gate) {
            let expected = opcode.in_state_code(idx);
            let actual = circuit.opcode(circuit.get_in(gate, idx));
            // The wildcard slot accepts any general-state producer.
            if expected == OpCode::Nop {
                if !actual.is_general_state() {
                    return Self::fail(
                        circuit,
                        gate,
                        &format!(
                            "state input does not match (expected:<general state> actual:{actual})"
                        ),
                        idx,
                    );
                }
            } else if expected != actual {
                return Self::fail(
                    circuit,
                    gate,
                    &format!("state input does not match (expected:{expected} actual:{actual})"),
                    idx,
                );
            }
        }
        Ok(())
    }

    fn check_value_input(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let opcode = circuit.opcode(gate);
        let bitfield = circuit.bit_field(gate);
        let value_start = circuit.state_count(gate) + circuit.depend_count(gate);
        let value_end = value_start + circuit.value_count(gate);
        for idx in value_start..value_end {
            let mut expected = opcode.in_machine_type(bitfield, idx);
            if expected == MachineType::Flex {
                expected = circuit.machine_type(gate);
            }
            let actual = circuit.machine_type(circuit.get_in(gate, idx));
            if expected != actual && expected != MachineType::AnyValue {
                return Self::fail(
                    circuit,
                    gate,
                    &format!("value input does not match (expected:{expected} actual:{actual})"),
                    idx,
                );
            }
        }
        Ok(())
    }

    fn check_depend_input(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let depend_start = circuit.state_count(gate);
        let depend_end = depend_start + circuit.depend_count(gate);
        for idx in depend_start..depend_end {
            let producer = circuit.get_in(gate, idx);
            if circuit.depend_count(producer) == 0
                && circuit.opcode(producer) != OpCode::DependEntry
            {
                return Self::fail(circuit, gate, "depend input is side-effect free", idx);
            }
        }
        Ok(())
    }

    fn check_root_input(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let opcode = circuit.opcode(gate);
        if let Some(root) = opcode.properties().root {
            let idx = circuit.num_ins(gate) - 1;
            let actual = circuit.opcode(circuit.get_in(gate, idx));
            if actual != root {
                return Self::fail(
                    circuit,
                    gate,
                    &format!("root input does not match (expected:{root} actual:{actual})"),
                    idx,
                );
            }
        }
        Ok(())
    }

    fn check_state_output(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let opcode = circuit.opcode(gate);
        if !opcode.is_state() {
            return Ok(());
        }
        let count = Self::state_users(circuit, gate).len();
        let expected = if opcode.is_terminal_state() {
            0
        } else if opcode == OpCode::IfBranch || opcode == OpCode::JsBytecode {
            2
        } else if opcode == OpCode::SwitchBranch {
            return Ok(()); // fan-out unrestricted
        } else {
            1
        };
        if count != expected {
            return Self::fail(
                circuit,
                gate,
                &format!("invalid number of state out branches (expected:{expected} actual:{count})"),
                None,
            );
        }
        Ok(())
    }

    fn check_branch_output(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let opcode = circuit.opcode(gate);
        if opcode != OpCode::IfBranch && opcode != OpCode::SwitchBranch {
            return Ok(());
        }
        let users = Self::state_users(circuit, gate);
        let mut keys: HashMap<(OpCode, u64), usize> = HashMap::new();
        for &user in &users {
            *keys
                .entry((circuit.opcode(user), circuit.bit_field(user)))
                .or_default() += 1;
        }
        if keys.len() != users.len() {
            return Self::fail(circuit, gate, "duplicate state out branches", None);
        }
        Ok(())
    }

    fn check_nop(circuit: &Circuit, gate: GateRef) -> Result<()> {
        if circuit.opcode(gate) == OpCode::Nop && circuit.has_uses(gate) {
            return Self::fail(circuit, gate, "NOP gate used by other gates", None);
        }
        Ok(())
    }

    fn check_selector(circuit: &Circuit, gate: GateRef) -> Result<()> {
        let opcode = circuit.opcode(gate);
        if opcode != OpCode::ValueSelector && opcode != OpCode::DependSelector {
            return Ok(());
        }
        let control = circuit.get_in(gate, 0);
        let control_op = circuit.opcode(control);
        if control_op != OpCode::Merge && control_op != OpCode::LoopBegin {
            return Self::fail(
                circuit,
                gate,
                &format!(
                    "state input does not match (expected:[MERGE|LOOP_BEGIN] actual:{control_op})"
                ),
                0,
            );
        }
        let control_arity = circuit.num_ins(control);
        let operand_arity = circuit.num_ins(gate) - 1;
        if control_arity != operand_arity {
            let flows = if opcode == OpCode::DependSelector {
                "depend"
            } else {
                "data"
            };
            return Self::fail(
                circuit,
                gate,
                &format!(
                    "number of {flows} flows does not match control flows (expected:{control_arity} actual:{operand_arity})"
                ),
                None,
            );
        }
        Ok(())
    }

    fn check_relay(circuit: &Circuit, gate: GateRef) -> Result<()> {
        if circuit.opcode(gate) != OpCode::DependRelay {
            return Ok(());
        }
        let control_op = circuit.opcode(circuit.get_in(gate, 0));
        let allowed = matches!(
            control_op,
            OpCode::IfTrue
                | OpCode::IfFalse
                | OpCode::SwitchCase
                | OpCode::DefaultCase
                | OpCode::IfSuccess
                | OpCode::IfException
                | OpCode::OrdinaryBlock
        );
        if !allowed {
            return Self::fail(
                circuit,
                gate,
                &format!(
                    "state input does not match (expected:[IF_TRUE|IF_FALSE|SWITCH_CASE|DEFAULT_CASE|IF_SUCCESS|IF_EXCEPTION|ORDINARY_BLOCK] actual:{control_op})"
                ),
                0,
            );
        }
        Ok(())
    }

    /// State-edge users: out records landing in a state slot of a state
    /// gate, one entry per edge.
    fn state_users(circuit: &Circuit, gate: GateRef) -> Vec<GateRef> {
        let mut users = Vec::new();
        let mut out = circuit.first_out(gate);
        while out != NULL_OFFSET {
            let user = circuit.user_of_out(out);
            let idx = circuit.read_u32(out) as usize;
            if circuit.opcode(user).is_state() && idx < circuit.state_count(user) {
                users.push(user);
            }
            out = circuit.next_out(out);
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CircuitBuilder;
    use crate::gate_type::GateType;

    #[test]
    fn broken_selector_is_reported_with_input_index() -> Result<()> {
        let mut circuit = Circuit::new();
        let mut builder = CircuitBuilder::new(&mut circuit);
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        let cond = builder.boolean_constant(true)?;
        let branch = builder.branch(state, cond)?;
        let if_true = builder.if_true(branch)?;
        let if_false = builder.if_false(branch)?;
        let merge = builder.merge(&[if_true, if_false])?;
        let a = builder.int64_constant(1)?;
        let b = builder.int64_constant(2)?;
        let phi = builder.selector(MachineType::I64, merge, &[a, b], GateType::any())?;
        builder.return_value(merge, depend, phi)?;
        Verifier::run(&circuit)?;

        // Break the selector: its state input becomes the IF_TRUE.
        circuit.modify_in(phi, 0, if_true);
        let err = Verifier::run(&circuit).unwrap_err().to_string();
        assert!(err.contains("expected:[MERGE|LOOP_BEGIN]"), "{err}");
        assert!(err.contains("input index 0"), "{err}");
        Ok(())
    }

    #[test]
    fn nop_with_users_is_rejected() -> Result<()> {
        let mut circuit = Circuit::new();
        let a = circuit.get_constant_gate(MachineType::I64, 1, GateType::any())?;
        let b = circuit.get_constant_gate(MachineType::I64, 2, GateType::any())?;
        let add = circuit.new_gate(OpCode::Add, MachineType::I64, 0, &[a, b], GateType::any())?;
        let _use = circuit.new_gate(OpCode::Rev, MachineType::I64, 0, &[add], GateType::any())?;
        // Flip the opcode without detaching users.
        circuit.set_opcode(add, OpCode::Nop);
        let err = Verifier::run(&circuit).unwrap_err().to_string();
        assert!(err.contains("NOP gate used"), "{err}");
        Ok(())
    }

    #[test]
    fn duplicate_branch_cases_are_rejected() -> Result<()> {
        let mut circuit = Circuit::new();
        let mut builder = CircuitBuilder::new(&mut circuit);
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let cond = builder.boolean_constant(false)?;
        let branch = builder.branch(state, cond)?;
        let _t1 = builder.if_true(branch)?;
        let _t2 = builder.if_true(branch)?;
        let err = Verifier::run(&circuit).unwrap_err().to_string();
        assert!(err.contains("duplicate state out branches"), "{err}");
        Ok(())
    }

    #[test]
    fn side_effect_free_depend_is_rejected() -> Result<()> {
        let mut circuit = Circuit::new();
        let a = circuit.get_constant_gate(MachineType::I64, 1, GateType::any())?;
        let ptr = circuit.get_constant_gate(MachineType::I64, 0x1000, GateType::any())?;
        // LOAD whose depend input is a pure constant.
        let load = circuit.new_gate(OpCode::Load, MachineType::I64, 0, &[a, ptr], GateType::any())?;
        let err = Verifier::run(&circuit).unwrap_err().to_string();
        assert!(err.contains("side-effect free"), "{err}");
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        circuit.modify_in(load, 0, depend);
        Verifier::run(&circuit)?;
        Ok(())
    }
}
