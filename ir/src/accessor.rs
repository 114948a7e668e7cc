use anyhow::Result;

use crate::circuit::Circuit;
use crate::gate::{GateId, GateRef, NULL_OFFSET};
use crate::gate_type::GateType;
use crate::machine::MachineType;
use crate::opcode::OpCode;

/// One use edge: `gate`'s in-slot `index` reads the iterated producer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct UseEdge {
    pub gate: GateRef,
    pub index: usize,
}

/// Cursor over the users of a gate.
///
/// The cursor reads the next out-record *before* yielding the current edge,
/// so the caller may retarget (or delete) the current edge through
/// [`GateAccessor::replace_in`] without invalidating the traversal. Edges
/// added to the producer during iteration are not visited.
#[derive(Debug)]
pub struct UseIterator {
    next: u32,
}

impl UseIterator {
    fn new(circuit: &Circuit, gate: GateRef) -> Self {
        UseIterator {
            next: circuit.first_out(gate),
        }
    }

    /// Yields the next use edge, pre-reading its successor.
    pub fn step(&mut self, acc: &GateAccessor<'_>) -> Option<UseEdge> {
        if self.next == NULL_OFFSET {
            return None;
        }
        let record = self.next;
        self.next = acc.circuit.next_out(record);
        let gate = acc.circuit.user_of_out(record);
        let index = acc.circuit.read_u32(record) as usize;
        Some(UseEdge { gate, index })
    }
}

/// Read/mutation facade over a circuit used by every pass.
#[derive(Debug)]
pub struct GateAccessor<'a> {
    circuit: &'a mut Circuit,
}

impl<'a> GateAccessor<'a> {
    pub fn new(circuit: &'a mut Circuit) -> Self {
        GateAccessor { circuit }
    }

    pub fn circuit(&self) -> &Circuit {
        self.circuit
    }

    pub fn circuit_mut(&mut self) -> &mut Circuit {
        self.circuit
    }

    // ---- reads ----

    pub fn opcode(&self, gate: GateRef) -> OpCode {
        self.circuit.opcode(gate)
    }

    pub fn id(&self, gate: GateRef) -> GateId {
        self.circuit.id(gate)
    }

    pub fn bit_field(&self, gate: GateRef) -> u64 {
        self.circuit.bit_field(gate)
    }

    pub fn machine_type(&self, gate: GateRef) -> MachineType {
        self.circuit.machine_type(gate)
    }

    pub fn gate_type(&self, gate: GateRef) -> GateType {
        self.circuit.gate_type(gate)
    }

    pub fn num_ins(&self, gate: GateRef) -> usize {
        self.circuit.num_ins(gate)
    }

    pub fn num_value_ins(&self, gate: GateRef) -> usize {
        self.circuit.value_count(gate)
    }

    pub fn get_in(&self, gate: GateRef, idx: usize) -> GateRef {
        self.circuit.get_in(gate, idx)
    }

    /// The `idx`-th state input.
    pub fn get_state(&self, gate: GateRef, idx: usize) -> GateRef {
        debug_assert!(idx < self.circuit.state_count(gate));
        self.circuit.get_in(gate, idx)
    }

    /// The first depend input.
    pub fn get_dep(&self, gate: GateRef) -> GateRef {
        debug_assert!(self.circuit.depend_count(gate) > 0);
        self.circuit.get_in(gate, self.circuit.state_count(gate))
    }

    /// The `idx`-th value input.
    pub fn get_value_in(&self, gate: GateRef, idx: usize) -> GateRef {
        debug_assert!(idx < self.circuit.value_count(gate));
        let base = self.circuit.state_count(gate) + self.circuit.depend_count(gate);
        self.circuit.get_in(gate, base + idx)
    }

    pub fn has_use(&self, gate: GateRef) -> bool {
        self.circuit.has_uses(gate)
    }

    /// Users as a plain vector; safe for read-only traversal only.
    pub fn const_uses(&self, gate: GateRef) -> Vec<GateRef> {
        self.circuit.outs(gate)
    }

    pub fn const_ins(&self, gate: GateRef) -> Vec<GateRef> {
        self.circuit.ins(gate)
    }

    /// Mutation-tolerant use cursor; see [`UseIterator`].
    pub fn uses(&self, gate: GateRef) -> UseIterator {
        UseIterator::new(self.circuit, gate)
    }

    // ---- mutation ----

    pub fn set_opcode(&mut self, gate: GateRef, opcode: OpCode) {
        self.circuit.set_opcode(gate, opcode);
    }

    pub fn set_bit_field(&mut self, gate: GateRef, bitfield: u64) {
        self.circuit.set_bit_field(gate, bitfield);
    }

    pub fn set_gate_type(&mut self, gate: GateRef, gate_type: GateType) {
        self.circuit.set_gate_type(gate, gate_type);
    }

    pub fn set_machine_type(&mut self, gate: GateRef, machine_type: MachineType) {
        self.circuit.set_machine_type(gate, machine_type);
    }

    /// Retargets the first depend input.
    pub fn set_dep(&mut self, gate: GateRef, depend: GateRef) {
        debug_assert!(self.circuit.depend_count(gate) > 0);
        let idx = self.circuit.state_count(gate);
        self.circuit.modify_in(gate, idx, depend);
    }

    /// Retargets the first state input.
    pub fn replace_state_in(&mut self, gate: GateRef, new_state: GateRef) {
        debug_assert!(self.circuit.state_count(gate) > 0);
        self.circuit.modify_in(gate, 0, new_state);
    }

    /// Retargets the first value input.
    pub fn replace_value_in(&mut self, gate: GateRef, new_value: GateRef) {
        debug_assert!(self.circuit.value_count(gate) > 0);
        let base = self.circuit.state_count(gate) + self.circuit.depend_count(gate);
        self.circuit.modify_in(gate, base, new_value);
    }

    /// Retargets the first depend input.
    pub fn replace_depend_in(&mut self, gate: GateRef, new_depend: GateRef) {
        self.set_dep(gate, new_depend);
    }

    /// Retargets the edge currently yielded by a use cursor.
    pub fn replace_in(&mut self, edge: &UseEdge, new_gate: GateRef) {
        self.circuit.modify_in(edge.gate, edge.index, new_gate);
    }

    pub fn modify_in(&mut self, gate: GateRef, idx: usize, input: GateRef) {
        self.circuit.modify_in(gate, idx, input);
    }

    pub fn delete_gate(&mut self, gate: GateRef) {
        self.circuit.delete_gate(gate);
    }

    pub fn get_constant_gate(
        &mut self,
        machine_type: MachineType,
        bitfield: u64,
        gate_type: GateType,
    ) -> Result<GateRef> {
        self.circuit.get_constant_gate(machine_type, bitfield, gate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;

    #[test]
    fn value_and_depend_views() {
        let mut circuit = Circuit::new();
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        let arg_list = Circuit::get_circuit_root(OpCode::ArgList);
        let a = circuit
            .new_gate(OpCode::Arg, MachineType::I64, 0, &[arg_list], GateType::any())
            .unwrap();
        let b = circuit
            .new_gate(OpCode::Arg, MachineType::I64, 1, &[arg_list], GateType::any())
            .unwrap();
        let bytecode = circuit
            .new_gate(
                OpCode::JsBytecode,
                MachineType::I64,
                2,
                &[state, depend, a, b],
                GateType::any(),
            )
            .unwrap();
        let acc = GateAccessor::new(&mut circuit);
        assert_eq!(acc.get_state(bytecode, 0), state);
        assert_eq!(acc.get_dep(bytecode), depend);
        assert_eq!(acc.num_value_ins(bytecode), 2);
        assert_eq!(acc.get_value_in(bytecode, 0), a);
        assert_eq!(acc.get_value_in(bytecode, 1), b);
    }

    #[test]
    fn use_cursor_survives_retargeting() {
        let mut circuit = Circuit::new();
        let a = circuit
            .get_constant_gate(MachineType::I64, 1, GateType::any())
            .unwrap();
        let b = circuit
            .get_constant_gate(MachineType::I64, 2, GateType::any())
            .unwrap();
        // Three independent users of `a`.
        let users: Vec<_> = (0..3)
            .map(|_| {
                circuit
                    .new_gate(OpCode::Rev, MachineType::I64, 0, &[a], GateType::any())
                    .unwrap()
            })
            .collect();
        let mut acc = GateAccessor::new(&mut circuit);
        let mut it = acc.uses(a);
        let mut seen = Vec::new();
        while let Some(edge) = it.step(&acc) {
            seen.push(edge.gate);
            // Retargeting the current edge must not break the walk.
            acc.replace_in(&edge, b);
        }
        seen.sort();
        let mut expected = users.clone();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(!acc.has_use(a));
        assert_eq!(acc.const_uses(b).len(), 3);
    }
}
