//! Worklist-driven local subgraph rewriting to a fixed point.

use std::collections::VecDeque;

use anyhow::Result;
use kestrel_util::BitMap;

use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::opcode::OpCode;
use crate::ir::visualizer;

/// One local rewrite: returns whether it changed the gate. A firing rule
/// re-enqueues the gate's users.
pub trait SubgraphRewriteRule {
    fn run(&mut self, circuit: &mut Circuit, gate: GateRef) -> Result<bool>;
}

/// Folds ADD/SUB over two constants of the same root in place: the gate
/// becomes a CONSTANT re-rooted into the constant list carrying the folded
/// bit pattern.
#[derive(Debug, Default)]
pub struct ConstantFoldRule;

impl ConstantFoldRule {
    fn fold(
        &self,
        circuit: &mut Circuit,
        gate: GateRef,
        f: impl Fn(u64, u64) -> u64,
    ) -> Result<bool> {
        let lhs = circuit.get_in(gate, 0);
        let rhs = circuit.get_in(gate, 1);
        if circuit.opcode(lhs) != OpCode::Constant || circuit.opcode(rhs) != OpCode::Constant {
            return Ok(false);
        }
        if circuit.get_in(lhs, 0) != circuit.get_in(rhs, 0) {
            return Ok(false);
        }
        let folded = f(circuit.bit_field(lhs), circuit.bit_field(rhs));
        circuit.delete_in(gate, 0);
        circuit.delete_in(gate, 1);
        circuit.set_opcode(gate, OpCode::Constant);
        circuit.new_in(gate, 0, Circuit::get_circuit_root(OpCode::ConstantList));
        circuit.set_bit_field(gate, folded);
        Ok(true)
    }
}

impl SubgraphRewriteRule for ConstantFoldRule {
    fn run(&mut self, circuit: &mut Circuit, gate: GateRef) -> Result<bool> {
        match circuit.opcode(gate) {
            OpCode::Add => self.fold(circuit, gate, u64::wrapping_add),
            OpCode::Sub => self.fold(circuit, gate, u64::wrapping_sub),
            _ => Ok(false),
        }
    }
}

/// Applies a rule over the whole circuit until nothing fires; reports the
/// number of rewrites so a caller can observe the fixed point.
pub struct SubgraphRewriteFramework;

impl SubgraphRewriteFramework {
    pub fn run(circuit: &mut Circuit, rule: &mut dyn SubgraphRewriteRule) -> Result<usize> {
        let mut rewrites = 0;
        let mut worklist: VecDeque<GateRef> = VecDeque::new();
        let mut workset = BitMap::with_capacity(circuit.gate_count() as usize);
        for gate in circuit.all_gates() {
            worklist.push_back(gate);
            workset.set(circuit.id(gate) as usize);
        }
        while let Some(gate) = worklist.pop_front() {
            workset.unset(circuit.id(gate) as usize);
            if rule.run(circuit, gate)? {
                rewrites += 1;
                // Depth-first flavor: a rewritten gate's users go to the
                // front so cascades collapse immediately.
                for user in circuit.outs(gate) {
                    if workset.insert(circuit.id(user) as usize) {
                        worklist.push_front(user);
                    }
                }
            }
        }
        log::debug!("peephole: {rewrites} rewrites");
        Ok(rewrites)
    }
}

/// The default peephole pass.
pub struct Peephole<'a> {
    circuit: &'a mut Circuit,
    enable_log: bool,
}

impl<'a> Peephole<'a> {
    pub fn new(circuit: &'a mut Circuit, enable_log: bool) -> Self {
        Peephole {
            circuit,
            enable_log,
        }
    }

    pub fn run(&mut self) -> Result<usize> {
        let mut rule = ConstantFoldRule;
        let rewrites = SubgraphRewriteFramework::run(self.circuit, &mut rule)?;
        if self.enable_log {
            visualizer::print_circuit(self.circuit, "peephole");
        }
        Ok(rewrites)
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::ir::builder::CircuitBuilder;
    use crate::ir::gate_type::GateType;
    use crate::ir::machine::MachineType;
    use crate::ir::verifier::Verifier;

    #[test]
    fn folds_a_single_addition() -> Result<()> {
        let mut circuit = Circuit::new();
        let a = circuit.get_constant_gate(MachineType::I64, 30, GateType::any())?;
        let b = circuit.get_constant_gate(MachineType::I64, 12, GateType::any())?;
        let add = circuit.new_gate(OpCode::Add, MachineType::I64, 0, &[a, b], GateType::any())?;
        let rewrites = Peephole::new(&mut circuit, false).run()?;
        assert_eq!(rewrites, 1);
        assert_eq!(circuit.opcode(add), OpCode::Constant);
        assert_eq!(circuit.bit_field(add), 42);
        assert_eq!(
            circuit.get_in(add, 0),
            Circuit::get_circuit_root(OpCode::ConstantList)
        );
        Ok(())
    }

    #[test]
    fn subtraction_wraps() -> Result<()> {
        let mut circuit = Circuit::new();
        let a = circuit.get_constant_gate(MachineType::I64, 1, GateType::any())?;
        let b = circuit.get_constant_gate(MachineType::I64, 2, GateType::any())?;
        let sub = circuit.new_gate(OpCode::Sub, MachineType::I64, 0, &[a, b], GateType::any())?;
        Peephole::new(&mut circuit, false).run()?;
        assert_eq!(circuit.opcode(sub), OpCode::Constant);
        assert_eq!(circuit.bit_field(sub), u64::MAX);
        Ok(())
    }

    #[test]
    fn non_constant_operands_are_left_alone() -> Result<()> {
        let mut circuit = Circuit::new();
        let mut builder = CircuitBuilder::new(&mut circuit);
        let arg = builder.arg(0)?;
        let one = builder.int64_constant(1)?;
        let add = builder.binary_arithmetic(OpCode::Add, arg, one)?;
        let rewrites = Peephole::new(&mut circuit, false).run()?;
        assert_eq!(rewrites, 0);
        assert_eq!(circuit.opcode(add), OpCode::Add);
        Ok(())
    }

    /// A randomized balanced tree of additions over 100 x 10 pooled
    /// constants collapses to the closed-form sum, and a re-run after the
    /// fixed point performs zero rewrites.
    #[test]
    fn random_addition_tree_collapses_to_the_sum() -> Result<()> {
        const NUM_CONSTANTS: u64 = 100;
        const NUM_USES: u64 = 10;
        let mut circuit = Circuit::new();
        let mut nodes = Vec::new();
        for _ in 0..NUM_USES {
            for value in 0..NUM_CONSTANTS {
                nodes.push(circuit.get_constant_gate(
                    MachineType::I64,
                    value,
                    GateType::any(),
                )?);
            }
        }
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        while nodes.len() > 1 {
            nodes.shuffle(&mut rng);
            let a = nodes.pop().unwrap();
            let b = nodes.pop().unwrap();
            nodes.push(circuit.new_gate(
                OpCode::Add,
                MachineType::I64,
                0,
                &[a, b],
                GateType::any(),
            )?);
        }
        let root = nodes[0];
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        let ret = CircuitBuilder::new(&mut circuit).return_value(state, depend, root)?;
        Verifier::run(&circuit)?;

        let rewrites = Peephole::new(&mut circuit, false).run()?;
        assert!(rewrites > 0);
        let folded = circuit.get_in(ret, 2);
        assert_eq!(circuit.opcode(folded), OpCode::Constant);
        assert_eq!(
            circuit.bit_field(folded),
            NUM_USES * (NUM_CONSTANTS * (NUM_CONSTANTS - 1) / 2)
        );
        Verifier::run(&circuit)?;

        // Convergence: a second run finds nothing to do.
        let again = Peephole::new(&mut circuit, false).run()?;
        assert_eq!(again, 0);
        Ok(())
    }
}
