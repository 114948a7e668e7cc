use itertools::Itertools;

use crate::circuit::Circuit;
use crate::gate::GateRef;
use crate::opcode::OpCode;

/// Renders one gate in the structured dump format: id, opcode, machine
/// type, gate type, bitfield, in-list split by edge category, out-list.
pub fn gate_to_string(circuit: &Circuit, gate: GateRef) -> String {
    let opcode = circuit.opcode(gate);
    let bitfield = circuit.bit_field(gate);
    let state_count = circuit.state_count(gate);
    let depend_count = circuit.depend_count(gate);
    let value_count = circuit.value_count(gate);
    let num_ins = circuit.num_ins(gate);

    let slot = |idx: usize| {
        let input = circuit.get_in(gate, idx);
        if input.is_null() {
            "N".to_string()
        } else {
            format!("{}", circuit.id(input))
        }
    };
    let range = |lo: usize, hi: usize| (lo..hi).map(slot).join(" ");

    let states = range(0, state_count);
    let depends = range(state_count, state_count + depend_count);
    let values = range(state_count + depend_count, state_count + depend_count + value_count);
    let roots = range(state_count + depend_count + value_count, num_ins);
    let outs = circuit
        .outs(gate)
        .iter()
        .map(|&user| format!("{}", circuit.id(user)))
        .join(" ");

    format!(
        "(id={}, op={}, machineType={}, bitfield={}, type={:?}, in=[[{states}], [{depends}], [{values}], [{roots}]], out=[{outs}])",
        circuit.id(gate),
        opcode,
        circuit.machine_type(gate),
        bitfield,
        circuit.gate_type(gate),
    )
}

/// Logs the whole circuit, one gate per line, NOPs omitted.
pub fn print_circuit(circuit: &Circuit, header: &str) {
    log::info!("================== {header} ==================");
    for gate in circuit.all_gates() {
        if circuit.opcode(gate) != OpCode::Nop {
            log::info!("{}", gate_to_string(circuit, gate));
        }
    }
}
