use anyhow::Result;

use crate::circuit::Circuit;
use crate::gate::GateRef;
use crate::gate_type::GateType;
use crate::machine::{js_machine_type, ptr_machine_type, MachineType};
use crate::opcode::OpCode;
use crate::tagged;

/// Typed constructors over [`Circuit::new_gate`].
///
/// Every constructor wires the root input of the produced gate and resolves
/// `FLEX` machine types from its operands, so callers only describe shape.
/// All constructors propagate arena exhaustion.
#[derive(Debug)]
pub struct CircuitBuilder<'a> {
    circuit: &'a mut Circuit,
}

impl<'a> CircuitBuilder<'a> {
    pub fn new(circuit: &'a mut Circuit) -> Self {
        CircuitBuilder { circuit }
    }

    pub fn circuit(&mut self) -> &mut Circuit {
        self.circuit
    }

    // ---- prolog ----

    /// A tagged-value argument at `index` in the argument list.
    pub fn arg(&mut self, index: u64) -> Result<GateRef> {
        self.typed_arg(js_machine_type(), index, GateType::any())
    }

    pub fn typed_arg(
        &mut self,
        machine_type: MachineType,
        index: u64,
        gate_type: GateType,
    ) -> Result<GateRef> {
        let arg_list = Circuit::get_circuit_root(OpCode::ArgList);
        self.circuit
            .new_gate(OpCode::Arg, machine_type, index, &[arg_list], gate_type)
    }

    // ---- constants ----

    pub fn int32_constant(&mut self, value: i32) -> Result<GateRef> {
        self.circuit
            .get_constant_gate(MachineType::I32, value as u32 as u64, GateType::empty())
    }

    pub fn int64_constant(&mut self, value: i64) -> Result<GateRef> {
        self.circuit
            .get_constant_gate(MachineType::I64, value as u64, GateType::empty())
    }

    pub fn float64_constant(&mut self, value: f64) -> Result<GateRef> {
        self.circuit
            .get_constant_gate(MachineType::F64, value.to_bits(), GateType::empty())
    }

    pub fn boolean_constant(&mut self, value: bool) -> Result<GateRef> {
        self.circuit
            .get_constant_gate(MachineType::I1, u64::from(value), GateType::boolean())
    }

    /// A pointer-sized constant, used for field offsets.
    pub fn ptr_constant(&mut self, value: u64) -> Result<GateRef> {
        self.circuit
            .get_constant_gate(ptr_machine_type(), value, GateType::empty())
    }

    /// A raw tagged-value constant.
    pub fn tagged_constant(&mut self, bits: u64, gate_type: GateType) -> Result<GateRef> {
        self.circuit
            .get_constant_gate(js_machine_type(), bits, gate_type)
    }

    pub fn undefined_constant(&mut self, gate_type: GateType) -> Result<GateRef> {
        self.tagged_constant(tagged::VALUE_UNDEFINED, gate_type)
    }

    pub fn null_constant(&mut self, gate_type: GateType) -> Result<GateRef> {
        self.tagged_constant(tagged::VALUE_NULL, gate_type)
    }

    pub fn hole_constant(&mut self, gate_type: GateType) -> Result<GateRef> {
        self.tagged_constant(tagged::VALUE_HOLE, gate_type)
    }

    pub fn exception_constant(&mut self, gate_type: GateType) -> Result<GateRef> {
        self.tagged_constant(tagged::VALUE_EXCEPTION, gate_type)
    }

    // ---- control ----

    pub fn merge(&mut self, states: &[GateRef]) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::Merge,
            MachineType::NoValue,
            states.len() as u64,
            states,
            GateType::empty(),
        )
    }

    /// A merge with `arity` unfilled state slots.
    pub fn pending_merge(&mut self, arity: usize) -> Result<GateRef> {
        let holes = vec![GateRef::NULL; arity];
        self.circuit.new_gate(
            OpCode::Merge,
            MachineType::NoValue,
            arity as u64,
            &holes,
            GateType::empty(),
        )
    }

    pub fn branch(&mut self, state: GateRef, condition: GateRef) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::IfBranch,
            MachineType::NoValue,
            0,
            &[state, condition],
            GateType::empty(),
        )
    }

    pub fn switch_branch(
        &mut self,
        state: GateRef,
        index: GateRef,
        case_count: u64,
    ) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::SwitchBranch,
            MachineType::NoValue,
            case_count,
            &[state, index],
            GateType::empty(),
        )
    }

    pub fn if_true(&mut self, branch: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::IfTrue, branch, 0)
    }

    pub fn if_false(&mut self, branch: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::IfFalse, branch, 0)
    }

    pub fn switch_case(&mut self, switch_branch: GateRef, key: u64) -> Result<GateRef> {
        self.control_case(OpCode::SwitchCase, switch_branch, key)
    }

    pub fn default_case(&mut self, switch_branch: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::DefaultCase, switch_branch, 0)
    }

    pub fn if_success(&mut self, state: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::IfSuccess, state, 0)
    }

    pub fn if_exception(&mut self, state: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::IfException, state, 0)
    }

    fn control_case(&mut self, opcode: OpCode, state: GateRef, bitfield: u64) -> Result<GateRef> {
        self.circuit.new_gate(
            opcode,
            MachineType::NoValue,
            bitfield,
            &[state],
            GateType::empty(),
        )
    }

    pub fn goto_block(&mut self, state: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::OrdinaryBlock, state, 0)
    }

    /// A loop head whose back edge is left as a hole for `loop_end`.
    pub fn loop_begin(&mut self, state: GateRef) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::LoopBegin,
            MachineType::NoValue,
            0,
            &[state, Circuit::null_gate()],
            GateType::empty(),
        )
    }

    pub fn loop_end(&mut self, state: GateRef) -> Result<GateRef> {
        self.control_case(OpCode::LoopBack, state, 0)
    }

    pub fn return_value(
        &mut self,
        state: GateRef,
        depend: GateRef,
        value: GateRef,
    ) -> Result<GateRef> {
        let return_list = Circuit::get_circuit_root(OpCode::ReturnList);
        self.circuit.new_gate(
            OpCode::Return,
            MachineType::NoValue,
            0,
            &[state, depend, value, return_list],
            GateType::empty(),
        )
    }

    pub fn return_void(&mut self, state: GateRef, depend: GateRef) -> Result<GateRef> {
        let return_list = Circuit::get_circuit_root(OpCode::ReturnList);
        self.circuit.new_gate(
            OpCode::ReturnVoid,
            MachineType::NoValue,
            0,
            &[state, depend, return_list],
            GateType::empty(),
        )
    }

    pub fn throw_value(
        &mut self,
        state: GateRef,
        depend: GateRef,
        value: GateRef,
    ) -> Result<GateRef> {
        let throw_list = Circuit::get_circuit_root(OpCode::ThrowList);
        self.circuit.new_gate(
            OpCode::Throw,
            MachineType::NoValue,
            0,
            &[state, depend, value, throw_list],
            GateType::empty(),
        )
    }

    // ---- selectors & depend plumbing ----

    /// The selector family matching a machine type: depend selectors carry
    /// no value, everything else is a value selector.
    pub fn select_opcode(machine_type: MachineType) -> OpCode {
        if machine_type == MachineType::NoValue {
            OpCode::DependSelector
        } else {
            OpCode::ValueSelector
        }
    }

    /// A selector over `control` with `arity` unfilled operands.
    pub fn pending_selector(
        &mut self,
        machine_type: MachineType,
        control: GateRef,
        arity: usize,
        gate_type: GateType,
    ) -> Result<GateRef> {
        let mut ins = vec![GateRef::NULL; arity + 1];
        ins[0] = control;
        self.circuit.new_gate(
            Self::select_opcode(machine_type),
            machine_type,
            arity as u64,
            &ins,
            gate_type,
        )
    }

    pub fn selector(
        &mut self,
        machine_type: MachineType,
        control: GateRef,
        values: &[GateRef],
        gate_type: GateType,
    ) -> Result<GateRef> {
        let mut ins = Vec::with_capacity(values.len() + 1);
        ins.push(control);
        ins.extend_from_slice(values);
        self.circuit.new_gate(
            Self::select_opcode(machine_type),
            machine_type,
            values.len() as u64,
            &ins,
            gate_type,
        )
    }

    pub fn depend_selector(&mut self, control: GateRef, depends: &[GateRef]) -> Result<GateRef> {
        self.selector(MachineType::NoValue, control, depends, GateType::empty())
    }

    pub fn depend_relay(&mut self, state: GateRef, depend: GateRef) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::DependRelay,
            MachineType::NoValue,
            0,
            &[state, depend],
            GateType::empty(),
        )
    }

    pub fn depend_and(&mut self, depends: &[GateRef]) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::DependAnd,
            MachineType::NoValue,
            depends.len() as u64,
            depends,
            GateType::empty(),
        )
    }

    // ---- data ----

    /// Binary arithmetic/logic over same-typed operands; the result type
    /// follows the left operand (`FLEX` resolution).
    pub fn binary_arithmetic(
        &mut self,
        opcode: OpCode,
        left: GateRef,
        right: GateRef,
    ) -> Result<GateRef> {
        let machine_type = self.circuit.machine_type(left);
        let gate_type = self.circuit.gate_type(left);
        self.circuit
            .new_gate(opcode, machine_type, 0, &[left, right], gate_type)
    }

    /// A comparison producing I1.
    pub fn binary_logic(&mut self, opcode: OpCode, left: GateRef, right: GateRef) -> Result<GateRef> {
        debug_assert_eq!(opcode.machine_type(), MachineType::I1);
        self.circuit
            .new_gate(opcode, MachineType::I1, 0, &[left, right], GateType::boolean())
    }

    pub fn equal(&mut self, left: GateRef, right: GateRef) -> Result<GateRef> {
        self.binary_logic(OpCode::Eq, left, right)
    }

    /// A unary cast or negation; `FLEX` opcodes inherit the operand type.
    pub fn unary_arithmetic(&mut self, opcode: OpCode, value: GateRef) -> Result<GateRef> {
        let machine_type = match opcode.machine_type() {
            MachineType::Flex => self.circuit.machine_type(value),
            fixed => fixed,
        };
        let gate_type = self.circuit.gate_type(value);
        self.circuit
            .new_gate(opcode, machine_type, 0, &[value], gate_type)
    }

    pub fn load(
        &mut self,
        machine_type: MachineType,
        depend: GateRef,
        pointer: GateRef,
        gate_type: GateType,
    ) -> Result<GateRef> {
        self.circuit
            .new_gate(OpCode::Load, machine_type, 0, &[depend, pointer], gate_type)
    }

    pub fn store(&mut self, depend: GateRef, value: GateRef, pointer: GateRef) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::Store,
            MachineType::NoValue,
            0,
            &[depend, value, pointer],
            GateType::empty(),
        )
    }

    pub fn alloca(&mut self, size: u64) -> Result<GateRef> {
        let alloca_list = Circuit::get_circuit_root(OpCode::AllocaList);
        self.circuit.new_gate(
            OpCode::Alloca,
            ptr_machine_type(),
            size,
            &[alloca_list],
            GateType::empty(),
        )
    }

    /// Pointer arithmetic helper used when addressing runtime structures.
    pub fn ptr_add(&mut self, base: GateRef, offset: GateRef) -> Result<GateRef> {
        self.binary_arithmetic(OpCode::Add, base, offset)
    }

    // ---- calls ----

    /// A runtime trampoline call: value inputs are the stub id, the glue
    /// pointer, then the arguments. Returns a tagged value.
    pub fn runtime_call(
        &mut self,
        glue: GateRef,
        stub_id: GateRef,
        depend: GateRef,
        args: &[GateRef],
    ) -> Result<GateRef> {
        self.call_gate(OpCode::RuntimeCall, js_machine_type(), glue, stub_id, depend, args)
    }

    /// A direct call to a compiled stub with a known signature.
    pub fn call(
        &mut self,
        return_type: MachineType,
        glue: GateRef,
        target: GateRef,
        depend: GateRef,
        args: &[GateRef],
    ) -> Result<GateRef> {
        self.call_gate(OpCode::Call, return_type, glue, target, depend, args)
    }

    fn call_gate(
        &mut self,
        opcode: OpCode,
        return_type: MachineType,
        glue: GateRef,
        target: GateRef,
        depend: GateRef,
        args: &[GateRef],
    ) -> Result<GateRef> {
        let mut ins = Vec::with_capacity(args.len() + 3);
        ins.push(depend);
        ins.push(target);
        ins.push(glue);
        ins.extend_from_slice(args);
        let num_values = (ins.len() - 1) as u64;
        self.circuit
            .new_gate(opcode, return_type, num_values, &ins, GateType::any())
    }

    // ---- generator bookkeeping ----

    pub fn save_register(&mut self, depend: GateRef, value: GateRef, vreg: u64) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::SaveRegister,
            MachineType::NoValue,
            vreg,
            &[depend, value],
            GateType::empty(),
        )
    }

    pub fn restore_register(&mut self, depend: GateRef, vreg: u64) -> Result<GateRef> {
        self.circuit.new_gate(
            OpCode::RestoreRegister,
            MachineType::I64,
            vreg,
            &[depend],
            GateType::any(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::Verifier;

    #[test]
    fn diamond_verifies() -> Result<()> {
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
        Ok(())
    }

    #[test]
    fn loop_with_selector_verifies() -> Result<()> {
        let mut circuit = Circuit::new();
        let mut builder = CircuitBuilder::new(&mut circuit);
        let state = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        let head = builder.loop_begin(state)?;
        let zero = builder.int64_constant(0)?;
        let one = builder.int64_constant(1)?;
        let phi = builder.pending_selector(MachineType::I64, head, 2, GateType::any())?;
        let next = builder.binary_arithmetic(OpCode::Add, phi, one)?;
        let cond = builder.binary_logic(OpCode::Ne, phi, zero)?;
        let branch = builder.branch(head, cond)?;
        let if_true = builder.if_true(branch)?;
        let if_false = builder.if_false(branch)?;
        let back = builder.loop_end(if_true)?;
        let circuit = builder.circuit();
        circuit.new_in(head, 1, back);
        circuit.new_in(phi, 1, zero);
        circuit.new_in(phi, 2, next);
        let mut builder = CircuitBuilder::new(circuit);
        builder.return_value(if_false, depend, phi)?;
        Verifier::run(builder.circuit())?;
        Ok(())
    }

    #[test]
    fn runtime_call_shape() -> Result<()> {
        let mut circuit = Circuit::new();
        let mut builder = CircuitBuilder::new(&mut circuit);
        let depend = Circuit::get_circuit_root(OpCode::DependEntry);
        let glue = builder.typed_arg(MachineType::I64, 0, GateType::empty())?;
        let id = builder.int64_constant(17)?;
        let x = builder.int64_constant(1)?;
        let call = builder.runtime_call(glue, id, depend, &[x])?;
        let circuit = builder.circuit();
        assert_eq!(circuit.opcode(call), OpCode::RuntimeCall);
        assert_eq!(circuit.value_count(call), 3);
        assert_eq!(circuit.depend_count(call), 1);
        assert_eq!(circuit.get_in(call, 0), depend);
        assert_eq!(circuit.get_in(call, 1), id);
        assert_eq!(circuit.get_in(call, 2), glue);
        assert_eq!(circuit.get_in(call, 3), x);
        Ok(())
    }
}
