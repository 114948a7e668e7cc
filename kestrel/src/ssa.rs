//! SSA-construction helper used by lowering passes to splice new sub-graphs
//! into the circuit: straight-line writes through [`Variable`]s, labels with
//! jumps/branches/loops, and on-the-fly phi insertion with trivial-phi
//! removal at seal time.

use anyhow::Result;
use hashbrown::HashMap;

use crate::ir::accessor::GateAccessor;
use crate::ir::builder::CircuitBuilder;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::gate_type::GateType;
use crate::ir::machine::MachineType;
use crate::ir::opcode::OpCode;

/// Handle to a label owned by a [`LabelManager`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Label(usize);

/// An SSA variable: reads insert selectors across label predecessors as
/// needed, writes are local to the current label.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Variable {
    id: u32,
    machine_type: MachineType,
    gate_type: GateType,
}

#[derive(Debug)]
struct LabelData {
    /// Control gate at the current end of the label.
    control: GateRef,
    /// Merged control at the head, populated when the label is bound.
    pre_control: GateRef,
    depend: GateRef,
    depend_relay: GateRef,
    /// Depend selector of a loop head, created at bind.
    loop_depend: GateRef,
    other_pre_controls: Vec<GateRef>,
    sealed: bool,
    value_map: HashMap<u32, GateRef>,
    incomplete_phis: Vec<(Variable, GateRef)>,
    predecessors: Vec<Label>,
}

impl LabelData {
    fn new(control: GateRef) -> Self {
        LabelData {
            control,
            pre_control: GateRef::NULL,
            depend: GateRef::NULL,
            depend_relay: GateRef::NULL,
            loop_depend: GateRef::NULL,
            other_pre_controls: Vec::new(),
            sealed: false,
            value_map: HashMap::new(),
            incomplete_phis: Vec::new(),
            predecessors: Vec::new(),
        }
    }
}

/// Owns the labels of one splice site and the insertion cursor.
#[derive(Debug)]
pub struct LabelManager<'a> {
    circuit: &'a mut Circuit,
    labels: Vec<LabelData>,
    current: Option<Label>,
    stack: Vec<Option<Label>>,
    phi_to_label: HashMap<GateRef, Label>,
    inputs: Vec<GateRef>,
    entry: Label,
    next_variable_id: u32,
}

impl<'a> LabelManager<'a> {
    /// An environment rooted at a hir gate: the entry label adopts the
    /// gate's state and depend inputs, and the remaining inputs become the
    /// environment's value inputs.
    pub fn for_hir(circuit: &'a mut Circuit, hir: GateRef) -> Self {
        let state = circuit.get_in(hir, 0);
        let depend = circuit.get_in(hir, 1);
        let inputs = (2..circuit.num_ins(hir))
            .map(|idx| circuit.get_in(hir, idx))
            .collect();
        Self::with_entry(circuit, state, depend, inputs)
    }

    pub fn with_entry(
        circuit: &'a mut Circuit,
        state_entry: GateRef,
        depend_entry: GateRef,
        inputs: Vec<GateRef>,
    ) -> Self {
        let mut entry_data = LabelData::new(state_entry);
        entry_data.pre_control = state_entry;
        entry_data.sealed = true;
        entry_data.depend = depend_entry;
        let entry = Label(0);
        LabelManager {
            circuit,
            labels: vec![entry_data],
            current: Some(entry),
            stack: Vec::new(),
            phi_to_label: HashMap::new(),
            inputs,
            entry,
            next_variable_id: 0,
        }
    }

    pub fn entry(&self) -> Label {
        self.entry
    }

    pub fn input(&self, index: usize) -> GateRef {
        self.inputs[index]
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn current_label(&self) -> Option<Label> {
        self.current
    }

    pub fn set_current(&mut self, label: Option<Label>) {
        self.current = label;
    }

    pub fn push_current(&mut self, label: Label) {
        self.stack.push(self.current);
        self.current = Some(label);
    }

    pub fn pop_current(&mut self) {
        self.current = self.stack.pop().flatten();
    }

    pub fn control(&self, label: Label) -> GateRef {
        self.labels[label.0].control
    }

    pub fn depend(&self, label: Label) -> GateRef {
        self.labels[label.0].depend
    }

    pub fn set_depend(&mut self, depend: GateRef) {
        let cur = self.expect_current();
        self.labels[cur.0].depend = depend;
    }

    pub fn circuit(&self) -> &Circuit {
        self.circuit
    }

    pub fn circuit_mut(&mut self) -> &mut Circuit {
        self.circuit
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelData::new(GateRef::NULL));
        Label(self.labels.len() - 1)
    }

    pub fn new_variable(
        &mut self,
        machine_type: MachineType,
        gate_type: GateType,
        init: GateRef,
    ) -> Variable {
        let var = Variable {
            id: self.next_variable_id,
            machine_type,
            gate_type,
        };
        self.next_variable_id += 1;
        let cur = self.expect_current();
        self.labels[cur.0].value_map.insert(var.id, init);
        var
    }

    pub fn read(&mut self, var: Variable) -> Result<GateRef> {
        let cur = self.expect_current();
        self.read_at(var, cur)
    }

    pub fn write(&mut self, var: Variable, value: GateRef) {
        let cur = self.expect_current();
        self.labels[cur.0].value_map.insert(var.id, value);
    }

    // ---- structured control flow ----

    pub fn jump(&mut self, to: Label) -> Result<()> {
        let cur = self.expect_current();
        let control = self.labels[cur.0].control;
        let jump = CircuitBuilder::new(self.circuit).goto_block(control)?;
        self.labels[cur.0].control = jump;
        self.append_predecessor(to, cur);
        self.merge_control(to, jump);
        self.current = None;
        Ok(())
    }

    pub fn branch(&mut self, condition: GateRef, if_true: Label, if_false: Label) -> Result<()> {
        let cur = self.expect_current();
        let control = self.labels[cur.0].control;
        let mut builder = CircuitBuilder::new(self.circuit);
        let branch = builder.branch(control, condition)?;
        let true_gate = builder.if_true(branch)?;
        let false_gate = builder.if_false(branch)?;
        self.labels[cur.0].control = branch;
        self.append_predecessor(if_true, cur);
        self.merge_control(if_true, true_gate);
        self.append_predecessor(if_false, cur);
        self.merge_control(if_false, false_gate);
        self.current = None;
        Ok(())
    }

    pub fn switch_to(
        &mut self,
        index: GateRef,
        default: Label,
        keys: &[u64],
        cases: &[Label],
    ) -> Result<()> {
        debug_assert_eq!(keys.len(), cases.len());
        let cur = self.expect_current();
        let control = self.labels[cur.0].control;
        let mut builder = CircuitBuilder::new(self.circuit);
        let switch = builder.switch_branch(control, index, keys.len() as u64)?;
        self.labels[cur.0].control = switch;
        for (key, case) in keys.iter().zip(cases) {
            let case_gate = CircuitBuilder::new(self.circuit).switch_case(switch, *key)?;
            self.append_predecessor(*case, cur);
            self.merge_control(*case, case_gate);
        }
        let default_gate = CircuitBuilder::new(self.circuit).default_case(switch)?;
        self.append_predecessor(default, cur);
        self.merge_control(default, default_gate);
        self.current = None;
        Ok(())
    }

    /// Turns `head`'s single incoming jump into a loop head and binds it.
    pub fn loop_begin(&mut self, head: Label) -> Result<()> {
        let control = self.labels[head.0].control;
        let loop_control = CircuitBuilder::new(self.circuit).loop_begin(control)?;
        self.labels[head.0].control = loop_control;
        self.labels[head.0].pre_control = loop_control;
        self.bind(head)
    }

    /// Closes the back edge of `head` from the current label and seals it.
    pub fn loop_end(&mut self, head: Label) -> Result<()> {
        let cur = self.expect_current();
        let control = self.labels[cur.0].control;
        let back = CircuitBuilder::new(self.circuit).loop_end(control)?;
        self.labels[cur.0].control = back;
        self.append_predecessor(head, cur);
        self.merge_control(head, back);
        self.seal(head)?;
        self.merge_all_control(head)?;
        self.merge_all_depend(head)?;
        self.current = None;
        Ok(())
    }

    /// Makes `label` the insertion point, merging its predecessors' control
    /// and depend flows if every predecessor is now known.
    pub fn bind(&mut self, label: Label) -> Result<()> {
        debug_assert!(
            !self.labels[label.0].predecessors.is_empty(),
            "binding a label with no predecessors"
        );
        if self.circuit.is_loop_head(self.labels[label.0].pre_control) {
            let pre_control = self.labels[label.0].pre_control;
            // Two slots: the forward depend and the back-edge depend.
            let loop_depend = CircuitBuilder::new(self.circuit).pending_selector(
                MachineType::NoValue,
                pre_control,
                2,
                GateType::empty(),
            )?;
            let first_pred = self.labels[label.0].predecessors[0];
            let forward_depend = self.labels[first_pred.0].depend;
            self.circuit.new_in(loop_depend, 1, forward_depend);
            self.labels[label.0].loop_depend = loop_depend;
            self.labels[label.0].depend = loop_depend;
        }
        if self.is_need_seal(label) {
            self.seal(label)?;
            self.merge_all_control(label)?;
            self.merge_all_depend(label)?;
        }
        self.current = Some(label);
        Ok(())
    }

    /// Completes every phi created while the label was open. After sealing,
    /// no further predecessor may be added.
    pub fn seal(&mut self, label: Label) -> Result<()> {
        let pending = core::mem::take(&mut self.labels[label.0].incomplete_phis);
        for (var, phi) in pending {
            self.add_phi_operand(var, phi)?;
        }
        self.labels[label.0].sealed = true;
        Ok(())
    }

    // ---- internals ----

    fn expect_current(&self) -> Label {
        self.current.expect("no label is bound")
    }

    fn append_predecessor(&mut self, label: Label, predecessor: Label) {
        debug_assert!(!self.labels[label.0].sealed, "predecessor added after seal");
        self.labels[label.0].predecessors.push(predecessor);
    }

    fn merge_control(&mut self, label: Label, control: GateRef) {
        let data = &mut self.labels[label.0];
        if data.pre_control.is_null() {
            data.pre_control = control;
            data.control = control;
        } else {
            data.other_pre_controls.push(control);
        }
    }

    fn is_need_seal(&self, label: Label) -> bool {
        let pre_control = self.labels[label.0].pre_control;
        let state_count = self.circuit.state_count(pre_control);
        self.labels[label.0].predecessors.len() >= state_count
    }

    fn merge_all_control(&mut self, label: Label) -> Result<()> {
        if self.labels[label.0].predecessors.len() < 2 {
            return Ok(());
        }
        let pre_control = self.labels[label.0].pre_control;
        if self.circuit.is_loop_head(pre_control) {
            debug_assert_eq!(self.labels[label.0].predecessors.len(), 2);
            debug_assert_eq!(self.labels[label.0].other_pre_controls.len(), 1);
            let back = self.labels[label.0].other_pre_controls[0];
            self.circuit.new_in(pre_control, 1, back);
            return Ok(());
        }
        let mut ins = vec![pre_control];
        ins.extend_from_slice(&self.labels[label.0].other_pre_controls);
        let merge = CircuitBuilder::new(self.circuit).merge(&ins)?;
        self.labels[label.0].pre_control = merge;
        self.labels[label.0].control = merge;
        Ok(())
    }

    fn merge_all_depend(&mut self, label: Label) -> Result<()> {
        let pre_control = self.labels[label.0].pre_control;
        if self.circuit.is_control_case(pre_control) {
            let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
            let relay = CircuitBuilder::new(self.circuit).depend_relay(pre_control, depend_entry)?;
            self.labels[label.0].depend_relay = relay;
        }
        let predecessors = self.labels[label.0].predecessors.clone();
        if predecessors.len() < 2 {
            let mut depend = self.labels[predecessors[0].0].depend;
            let relay = self.labels[label.0].depend_relay;
            if !relay.is_null() {
                depend = CircuitBuilder::new(self.circuit).depend_and(&[depend, relay])?;
            }
            self.labels[label.0].depend = depend;
            return Ok(());
        }
        if self.circuit.is_loop_head(pre_control) {
            let loop_depend = self.labels[label.0].loop_depend;
            let back_depend = self.labels[predecessors[1].0].depend;
            self.circuit.new_in(loop_depend, 2, back_depend);
            return Ok(());
        }
        let depends: Vec<GateRef> = predecessors
            .iter()
            .map(|p| self.labels[p.0].depend)
            .collect();
        let selector = CircuitBuilder::new(self.circuit).depend_selector(pre_control, &depends)?;
        self.labels[label.0].depend = selector;
        Ok(())
    }

    fn read_at(&mut self, var: Variable, label: Label) -> Result<GateRef> {
        if let Some(&value) = self.labels[label.0].value_map.get(&var.id) {
            if !self.circuit.opcode(value).is_nop() {
                return Ok(value);
            }
        }
        self.read_recursive(var, label)
    }

    fn read_recursive(&mut self, var: Variable, label: Label) -> Result<GateRef> {
        let value;
        if !self.labels[label.0].sealed {
            // Only loop heads stay unsealed; reserve a slot for the back
            // edge on top of the predecessors known so far.
            let arity = self.labels[label.0].predecessors.len() + 1;
            let pre_control = self.labels[label.0].pre_control;
            value = CircuitBuilder::new(self.circuit).pending_selector(
                var.machine_type,
                pre_control,
                arity,
                var.gate_type,
            )?;
            self.phi_to_label.insert(value, label);
            self.labels[label.0].incomplete_phis.push((var, value));
        } else if self.labels[label.0].predecessors.len() == 1 {
            let pred = self.labels[label.0].predecessors[0];
            value = self.read_at(var, pred)?;
        } else {
            let arity = self.labels[label.0].predecessors.len();
            let pre_control = self.labels[label.0].pre_control;
            let phi = CircuitBuilder::new(self.circuit).pending_selector(
                var.machine_type,
                pre_control,
                arity,
                var.gate_type,
            )?;
            self.phi_to_label.insert(phi, label);
            // Publish before recursing so reads that cycle back here
            // terminate on the phi itself.
            self.labels[label.0].value_map.insert(var.id, phi);
            value = self.add_phi_operand(var, phi)?;
        }
        self.labels[label.0].value_map.insert(var.id, value);
        Ok(value)
    }

    fn add_phi_operand(&mut self, var: Variable, phi: GateRef) -> Result<GateRef> {
        let label = self.phi_to_label[&phi];
        let predecessors = self.labels[label.0].predecessors.clone();
        for (idx, pred) in predecessors.iter().enumerate() {
            let value = self.read_at(var, *pred)?;
            debug_assert!(!self.circuit.opcode(value).is_nop());
            self.circuit.new_in(phi, idx + 1, value);
        }
        self.try_remove_trivial_phi(phi)
    }

    /// A phi with at most one distinct non-self operand is replaced by that
    /// operand (or an undefined constant when it has none), and selector
    /// users are retried recursively.
    pub fn try_remove_trivial_phi(&mut self, phi: GateRef) -> Result<GateRef> {
        let mut same: Option<GateRef> = None;
        for idx in 1..self.circuit.num_ins(phi) {
            if self.circuit.is_in_null(phi, idx) {
                continue;
            }
            let operand = self.circuit.get_in(phi, idx);
            if Some(operand) == same || operand == phi {
                continue;
            }
            if same.is_some() {
                return Ok(phi); // merges at least two values: not trivial
            }
            same = Some(operand);
        }
        let mut same = match same {
            Some(gate) => gate,
            // Unreachable or entry phi.
            None if self.circuit.machine_type(phi) == MachineType::NoValue => {
                Circuit::get_circuit_root(OpCode::DependEntry)
            }
            None => {
                let gate_type = self.circuit.gate_type(phi);
                CircuitBuilder::new(self.circuit).undefined_constant(gate_type)?
            }
        };

        let mut edges = Vec::new();
        {
            let acc = GateAccessor::new(self.circuit);
            let mut uses = acc.uses(phi);
            while let Some(edge) = uses.step(&acc) {
                if edge.gate != phi {
                    edges.push(edge);
                }
            }
        }
        for edge in &edges {
            self.circuit.modify_in(edge.gate, edge.index, same);
        }
        self.circuit.delete_gate(phi);

        for edge in &edges {
            if self.circuit.is_selector(edge.gate) {
                let replaced = self.try_remove_trivial_phi(edge.gate)?;
                if same == edge.gate {
                    same = replaced;
                }
            }
        }
        Ok(same)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tagged::VALUE_UNDEFINED;
    use crate::ir::verifier::Verifier;

    fn fresh_circuit() -> Circuit {
        Circuit::new()
    }

    fn entry_manager(circuit: &mut Circuit) -> LabelManager<'_> {
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        LabelManager::with_entry(circuit, state, depend, Vec::new())
    }

    #[test]
    fn diamond_inserts_one_phi() -> Result<()> {
        let mut circuit = fresh_circuit();
        let mut lm = entry_manager(&mut circuit);
        let one = CircuitBuilder::new(lm.circuit_mut()).int64_constant(1)?;
        let two = CircuitBuilder::new(lm.circuit_mut()).int64_constant(2)?;
        let cond = CircuitBuilder::new(lm.circuit_mut()).boolean_constant(true)?;

        let var = lm.new_variable(MachineType::I64, GateType::any(), one);
        let then_label = lm.new_label();
        let else_label = lm.new_label();
        let join = lm.new_label();

        lm.branch(cond, then_label, else_label)?;
        lm.bind(then_label)?;
        lm.write(var, two);
        lm.jump(join)?;
        lm.bind(else_label)?;
        lm.jump(join)?;
        lm.bind(join)?;
        let merged = lm.read(var)?;
        assert_eq!(lm.circuit_mut().opcode(merged), OpCode::ValueSelector);
        let control = lm.control(join);
        let depend = lm.depend(join);
        let mut builder = CircuitBuilder::new(lm.circuit_mut());
        builder.return_value(control, depend, merged)?;
        Verifier::run(&circuit)?;
        Ok(())
    }

    #[test]
    fn same_write_on_both_arms_folds_to_the_value() -> Result<()> {
        let mut circuit = fresh_circuit();
        let mut lm = entry_manager(&mut circuit);
        let one = CircuitBuilder::new(lm.circuit_mut()).int64_constant(1)?;
        let two = CircuitBuilder::new(lm.circuit_mut()).int64_constant(2)?;
        let cond = CircuitBuilder::new(lm.circuit_mut()).boolean_constant(false)?;

        let var = lm.new_variable(MachineType::I64, GateType::any(), one);
        let then_label = lm.new_label();
        let else_label = lm.new_label();
        let join = lm.new_label();
        lm.branch(cond, then_label, else_label)?;
        lm.bind(then_label)?;
        lm.write(var, two);
        lm.jump(join)?;
        lm.bind(else_label)?;
        lm.write(var, two);
        lm.jump(join)?;
        lm.bind(join)?;
        // Both arms agree: the trivial phi collapses to the operand.
        assert_eq!(lm.read(var)?, two);
        Ok(())
    }

    #[test]
    fn loop_carried_variable_gets_a_loop_phi() -> Result<()> {
        let mut circuit = fresh_circuit();
        let mut lm = entry_manager(&mut circuit);
        let zero = CircuitBuilder::new(lm.circuit_mut()).int64_constant(0)?;
        let one = CircuitBuilder::new(lm.circuit_mut()).int64_constant(1)?;

        let var = lm.new_variable(MachineType::I64, GateType::any(), zero);
        let head = lm.new_label();
        let body = lm.new_label();
        let exit = lm.new_label();

        lm.jump(head)?;
        lm.loop_begin(head)?;
        let at_head = lm.read(var)?;
        let cond = CircuitBuilder::new(lm.circuit_mut()).binary_logic(OpCode::Ne, at_head, zero)?;
        lm.branch(cond, body, exit)?;
        lm.bind(body)?;
        let in_body = lm.read(var)?;
        let next = CircuitBuilder::new(lm.circuit_mut()).binary_arithmetic(OpCode::Add, in_body, one)?;
        lm.write(var, next);
        lm.loop_end(head)?;
        lm.bind(exit)?;
        let out = lm.read(var)?;

        // The loop-carried value is a selector on the loop begin.
        assert_eq!(lm.circuit_mut().opcode(out), OpCode::ValueSelector);
        let loop_head_control = lm.circuit_mut().get_in(out, 0);
        assert_eq!(lm.circuit_mut().opcode(loop_head_control), OpCode::LoopBegin);
        let control = lm.control(exit);
        let depend = lm.depend(exit);
        let mut builder = CircuitBuilder::new(lm.circuit_mut());
        builder.return_value(control, depend, out)?;
        Verifier::run(&circuit)?;
        Ok(())
    }

    #[test]
    fn loop_invariant_phi_is_removed() -> Result<()> {
        let mut circuit = fresh_circuit();
        let mut lm = entry_manager(&mut circuit);
        let seven = CircuitBuilder::new(lm.circuit_mut()).int64_constant(7)?;
        let zero = CircuitBuilder::new(lm.circuit_mut()).int64_constant(0)?;

        let var = lm.new_variable(MachineType::I64, GateType::any(), seven);
        let head = lm.new_label();
        let body = lm.new_label();
        let exit = lm.new_label();
        lm.jump(head)?;
        lm.loop_begin(head)?;
        let at_head = lm.read(var)?;
        let cond = CircuitBuilder::new(lm.circuit_mut()).binary_logic(OpCode::Ne, at_head, zero)?;
        lm.branch(cond, body, exit)?;
        lm.bind(body)?;
        // The body never writes the variable: the incomplete phi created at
        // the unsealed head must collapse back to the constant.
        lm.loop_end(head)?;
        lm.bind(exit)?;
        assert_eq!(lm.read(var)?, seven);
        Ok(())
    }

    #[test]
    fn switch_cases_merge_three_ways() -> Result<()> {
        let mut circuit = fresh_circuit();
        let mut lm = entry_manager(&mut circuit);
        let zero = CircuitBuilder::new(lm.circuit_mut()).int64_constant(0)?;
        let one = CircuitBuilder::new(lm.circuit_mut()).int64_constant(1)?;
        let two = CircuitBuilder::new(lm.circuit_mut()).int64_constant(2)?;
        let index = CircuitBuilder::new(lm.circuit_mut()).int64_constant(10)?;

        let var = lm.new_variable(MachineType::I64, GateType::any(), zero);
        let case_a = lm.new_label();
        let case_b = lm.new_label();
        let default = lm.new_label();
        let join = lm.new_label();
        lm.switch_to(index, default, &[10, 20], &[case_a, case_b])?;
        lm.bind(case_a)?;
        lm.write(var, one);
        lm.jump(join)?;
        lm.bind(case_b)?;
        lm.write(var, two);
        lm.jump(join)?;
        lm.bind(default)?;
        lm.jump(join)?;
        lm.bind(join)?;
        let merged = lm.read(var)?;
        assert_eq!(lm.circuit_mut().opcode(merged), OpCode::ValueSelector);
        assert_eq!(lm.circuit_mut().num_ins(merged), 4);
        let control = lm.control(join);
        let depend = lm.depend(join);
        let mut builder = CircuitBuilder::new(lm.circuit_mut());
        builder.return_value(control, depend, merged)?;
        Verifier::run(&circuit)?;
        Ok(())
    }

    #[test]
    fn unreachable_self_phi_becomes_undefined() -> Result<()> {
        let mut circuit = fresh_circuit();
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let head = CircuitBuilder::new(&mut circuit).loop_begin(state)?;
        // A self-referencing one-operand phi with no other value.
        let phi = CircuitBuilder::new(&mut circuit).pending_selector(
            MachineType::I64,
            head,
            2,
            GateType::any(),
        )?;
        circuit.new_in(phi, 1, phi);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        let mut lm = LabelManager::with_entry(&mut circuit, state, depend, Vec::new());
        let replaced = lm.try_remove_trivial_phi(phi)?;
        let circuit = lm.circuit_mut();
        assert_eq!(circuit.opcode(replaced), OpCode::Constant);
        assert_eq!(circuit.bit_field(replaced), VALUE_UNDEFINED);
        assert_eq!(circuit.opcode(phi), OpCode::Nop);
        Ok(())
    }
}
