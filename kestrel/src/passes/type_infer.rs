//! Forward propagation of abstract types over the circuit.
//!
//! The inferencer walks from the circuit root through use edges,
//! re-enqueueing whenever a gate's type refines. Only constants, selectors,
//! returns and un-lowered bytecode gates carry interesting types; everything
//! else is transparent.

use std::collections::VecDeque;

use hashbrown::HashMap;
use kestrel_util::BitMap;

use crate::bytecode::{Bytecode, StringId};
use crate::frontend::FrontendInfo;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::gate_type::GateType;
use crate::ir::opcode::OpCode;
use crate::ir::visualizer;
use crate::type_loader::TypeLoader;

pub struct TypeInfer<'a> {
    circuit: &'a mut Circuit,
    info: &'a FrontendInfo,
    loader: &'a mut dyn TypeLoader,
    /// Types observed flowing into global stores, keyed by name id.
    global_types: HashMap<StringId, GateType>,
    enable_log: bool,
}

impl<'a> TypeInfer<'a> {
    pub fn new(
        circuit: &'a mut Circuit,
        info: &'a FrontendInfo,
        loader: &'a mut dyn TypeLoader,
        enable_log: bool,
    ) -> Self {
        TypeInfer {
            circuit,
            info,
            loader,
            global_types: HashMap::new(),
            enable_log,
        }
    }

    pub fn run(&mut self) {
        let root = Circuit::get_circuit_root(OpCode::CircuitRoot);
        let mut worklist = VecDeque::new();
        worklist.push_back(root);
        let mut visited = BitMap::with_capacity(self.circuit.gate_count() as usize);
        while let Some(front) = worklist.pop_front() {
            visited.clear();
            // Breadth-first over uses; a refinement restarts propagation
            // from the refined gate.
            let mut pending = VecDeque::new();
            pending.push_back(front);
            visited.set(self.circuit.id(front) as usize);
            while let Some(gate) = pending.pop_front() {
                for user in self.circuit.outs(gate) {
                    let id = self.circuit.id(user) as usize;
                    if visited.insert(id) {
                        if self.infer(user) {
                            worklist.push_back(user);
                        }
                        pending.push_back(user);
                    }
                }
            }
        }
        if self.enable_log {
            visualizer::print_circuit(self.circuit, "type inference");
        }
    }

    fn update_type(&mut self, gate: GateRef, ty: GateType) -> bool {
        if self.circuit.gate_type(gate) != ty {
            self.circuit.set_gate_type(gate, ty);
            return true;
        }
        false
    }

    fn should_infer(&self, gate: GateRef) -> bool {
        match self.circuit.opcode(gate) {
            OpCode::ValueSelector => true,
            OpCode::JsBytecode | OpCode::Constant | OpCode::Return => {
                self.info.gate_to_pc.contains_key(&gate)
            }
            _ => false,
        }
    }

    fn infer(&mut self, gate: GateRef) -> bool {
        if !self.should_infer(gate) {
            return false;
        }
        if self.circuit.opcode(gate) == OpCode::ValueSelector {
            return self.infer_phi(gate);
        }
        let Some(&bc) = self.info.bytecode_of(gate) else {
            return false;
        };
        match bc {
            Bytecode::LdaiInt { .. }
            | Bytecode::FldaiDouble { .. }
            | Bytecode::LdNan
            | Bytecode::LdInfinity
            | Bytecode::Sub2 { .. }
            | Bytecode::Mul2 { .. }
            | Bytecode::Div2 { .. }
            | Bytecode::Mod2 { .. }
            | Bytecode::Exp { .. }
            | Bytecode::Shl2 { .. }
            | Bytecode::Shr2 { .. }
            | Bytecode::Ashr2 { .. }
            | Bytecode::And2 { .. }
            | Bytecode::Or2 { .. }
            | Bytecode::Xor2 { .. }
            | Bytecode::NegDyn
            | Bytecode::IncDyn
            | Bytecode::DecDyn
            | Bytecode::ToNumber { .. } => self.update_type(gate, GateType::number()),
            Bytecode::LdTrue
            | Bytecode::LdFalse
            | Bytecode::EqDyn { .. }
            | Bytecode::NotEqDyn { .. }
            | Bytecode::LessDyn { .. }
            | Bytecode::LessEqDyn { .. }
            | Bytecode::GreaterDyn { .. }
            | Bytecode::GreaterEqDyn { .. } => self.update_type(gate, GateType::boolean()),
            Bytecode::LdUndefined => self.update_type(gate, GateType::undefined()),
            Bytecode::LdNull => self.update_type(gate, GateType::null_type()),
            Bytecode::LdaStr { .. } => self.update_type(gate, GateType::string()),
            Bytecode::ThrowAcc | Bytecode::ReturnAcc => {
                let ty = self.value_in_type(gate, 0);
                self.update_type(gate, ty)
            }
            Bytecode::ReturnUndefined => self.update_type(gate, GateType::undefined()),
            Bytecode::Add2 { .. } => self.infer_add(gate),
            Bytecode::LdObjByIndex { .. } => {
                let object = self.value_in_type(gate, 0);
                if object.is_array_kind() {
                    let ty = self.loader.array_element_type(object);
                    return self.update_type(gate, ty);
                }
                false
            }
            Bytecode::LdObjByName { str_id, .. } => {
                let object = self.value_in_type(gate, 0);
                if object.is_object_kind() || object.is_class_kind() {
                    let ty = self.loader.property_type(object, str_id);
                    return self.update_type(gate, ty);
                }
                false
            }
            Bytecode::StGlobalVar { str_id } => {
                let stored = self.value_in_type(gate, 0);
                self.global_types.insert(str_id, stored);
                self.update_type(gate, stored)
            }
            Bytecode::LdGlobalVar { str_id } | Bytecode::TryLdGlobalByName { str_id } => {
                if let Some(&ty) = self.global_types.get(&str_id) {
                    return self.update_type(gate, ty);
                }
                if let Some(ty) = self.loader.type_by_string_id(str_id) {
                    return self.update_type(gate, ty);
                }
                false
            }
            Bytecode::CallArg0 { .. }
            | Bytecode::CallArg1 { .. }
            | Bytecode::CallArgs2 { .. }
            | Bytecode::CallArgs3 { .. } => {
                let callee = self.value_in_type(gate, 0);
                if callee.is_function_kind() {
                    let ty = self.loader.function_return_type(callee);
                    return self.update_type(gate, ty);
                }
                false
            }
            _ => false,
        }
    }

    /// The union of the operand types, deduplicated, with `AnyType` as the
    /// absorbing ceiling.
    fn infer_phi(&mut self, gate: GateRef) -> bool {
        let mut types: Vec<GateType> = Vec::new();
        for idx in 1..self.circuit.num_ins(gate) {
            if self.circuit.is_in_null(gate, idx) {
                continue;
            }
            let ty = self.circuit.gate_type(self.circuit.get_in(gate, idx));
            if ty.is_any() {
                return self.update_type(gate, GateType::any());
            }
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        match types.len() {
            0 => false,
            1 => self.update_type(gate, types[0]),
            _ => {
                let union = self.loader.union_of(&types);
                self.update_type(gate, union)
            }
        }
    }

    fn infer_add(&mut self, gate: GateRef) -> bool {
        let lhs = self.value_in_type(gate, 0);
        let rhs = self.value_in_type(gate, 1);
        if lhs.is_string() || rhs.is_string() {
            return self.update_type(gate, GateType::string());
        }
        if lhs.is_number() && rhs.is_number() {
            return self.update_type(gate, GateType::number());
        }
        self.update_type(gate, GateType::any())
    }

    fn value_in_type(&self, gate: GateRef, idx: usize) -> GateType {
        let base = self.circuit.state_count(gate) + self.circuit.depend_count(gate);
        self.circuit.gate_type(self.circuit.get_in(gate, base + idx))
    }
}
