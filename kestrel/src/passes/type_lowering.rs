//! Type-directed lowering: bytecode gates whose operand types were refined
//! by inference are rewritten into specialized calls ahead of the generic
//! slow path.

use anyhow::Result;

use crate::bytecode::{Bytecode, CommonArgIdx};
use crate::frontend::args::ArgumentAccessor;
use crate::frontend::FrontendInfo;
use crate::ir::builder::CircuitBuilder;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::opcode::OpCode;
use crate::ir::visualizer;
use crate::passes::slowpath_lowering::replace_hir_to_call;
use crate::ssa::LabelManager;
use crate::stubs::{StubId, StubTable};
use crate::type_loader::TypeLoader;

pub struct TypeLowering<'a> {
    circuit: &'a mut Circuit,
    info: &'a FrontendInfo,
    loader: &'a dyn TypeLoader,
    enable_log: bool,
}

impl<'a> TypeLowering<'a> {
    pub fn new(
        circuit: &'a mut Circuit,
        info: &'a FrontendInfo,
        loader: &'a dyn TypeLoader,
        enable_log: bool,
    ) -> Self {
        TypeLowering {
            circuit,
            info,
            loader,
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
            match bc {
                Bytecode::NewObjRange { .. } => self.lower_typed_new_obj(gate)?,
                Bytecode::Add2 { .. } => self.lower_typed_add(gate)?,
                _ => {}
            }
        }
        if self.enable_log {
            visualizer::print_circuit(self.circuit, "type lowering");
        }
        Ok(())
    }

    /// `new C(...)` with a class-typed constructor allocates through the
    /// snapshotted hidden class instead of the generic range call.
    fn lower_typed_new_obj(&mut self, gate: GateRef) -> Result<()> {
        let env = LabelManager::for_hir(self.circuit, gate);
        let ctor = env.input(0);
        let ctor_type = env.circuit().gate_type(ctor);
        if !ctor_type.is_class_kind() {
            return Ok(());
        }
        let Some(hclass_index) = self.loader.class_hclass_index(ctor_type) else {
            return Ok(());
        };
        let mut args: Vec<GateRef> = (0..env.num_inputs()).map(|i| env.input(i)).collect();
        drop(env);
        let mut builder = CircuitBuilder::new(self.circuit);
        let index = builder.int64_constant(hclass_index as i64)?;
        args.push(index);
        let glue = ArgumentAccessor::new(self.circuit).common_arg(CommonArgIdx::Glue);
        let mut builder = CircuitBuilder::new(self.circuit);
        let id = builder.int64_constant(StubId::NewObjWithHClass.as_i64())?;
        let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
        let call = builder.runtime_call(glue, id, depend_entry, &args)?;
        replace_hir_to_call(self.circuit, gate, call, false)
    }

    /// Addition over two number-typed operands goes straight to the
    /// non-observing arithmetic stub, which cannot throw.
    fn lower_typed_add(&mut self, gate: GateRef) -> Result<()> {
        let env = LabelManager::for_hir(self.circuit, gate);
        let lhs = env.input(0);
        let rhs = env.input(1);
        let circuit = env.circuit();
        if !circuit.gate_type(lhs).is_number() || !circuit.gate_type(rhs).is_number() {
            return Ok(());
        }
        drop(env);
        let glue = ArgumentAccessor::new(self.circuit).common_arg(CommonArgIdx::Glue);
        let descriptor = StubTable::get(StubId::FastAdd2);
        let mut builder = CircuitBuilder::new(self.circuit);
        let target = builder.int64_constant(StubId::FastAdd2.as_i64())?;
        let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
        let call = builder.call(
            descriptor.return_type,
            glue,
            target,
            depend_entry,
            &[lhs, rhs],
        )?;
        replace_hir_to_call(self.circuit, gate, call, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeTranslationInfo, MethodInfo};
    use crate::frontend::BytecodeCircuitBuilder;
    use crate::ir::verifier::Verifier;
    use crate::passes::type_infer::TypeInfer;
    use crate::type_loader::SimpleTypeLoader;

    fn count_opcodes(circuit: &Circuit, opcode: OpCode) -> usize {
        circuit
            .all_gates()
            .iter()
            .filter(|g| circuit.opcode(**g) == opcode)
            .count()
    }

    #[test]
    fn number_typed_add_uses_the_fast_stub() -> Result<()> {
        use Bytecode::*;
        let method = MethodInfo {
            num_vregs: 1,
            ..MethodInfo::default()
        };
        let translation = BytecodeTranslationInfo::new(
            method,
            vec![
                LdaiInt { imm: 1 },
                Sta { dst: 0 },
                LdaiInt { imm: 2 },
                Add2 { lhs: 0 },
                ReturnAcc,
            ],
        );
        let (mut circuit, info) = BytecodeCircuitBuilder::build(translation, false)?;
        let mut loader = SimpleTypeLoader::new();
        TypeInfer::new(&mut circuit, &info, &mut loader, false).run();
        TypeLowering::new(&mut circuit, &info, &loader, false).run()?;
        Verifier::run(&circuit)?;
        assert_eq!(count_opcodes(&circuit, OpCode::JsBytecode), 0);
        assert_eq!(count_opcodes(&circuit, OpCode::Call), 1);
        // The no-throw split branches on a constant false condition.
        let branch = circuit
            .all_gates()
            .into_iter()
            .find(|g| circuit.opcode(*g) == OpCode::IfBranch)
            .unwrap();
        let condition = circuit.get_in(branch, 1);
        assert_eq!(circuit.opcode(condition), OpCode::Constant);
        assert_eq!(circuit.bit_field(condition), 0);
        Ok(())
    }

    #[test]
    fn untyped_add_is_left_alone() -> Result<()> {
        use Bytecode::*;
        let method = MethodInfo {
            num_vregs: 1,
            num_args: 1,
            have_this: true,
            ..MethodInfo::default()
        };
        // The left operand is an untyped parameter.
        let translation = BytecodeTranslationInfo::new(
            method,
            vec![
                Lda { src: 2 },
                Sta { dst: 0 },
                LdaiInt { imm: 2 },
                Add2 { lhs: 0 },
                ReturnAcc,
            ],
        );
        let (mut circuit, info) = BytecodeCircuitBuilder::build(translation, false)?;
        let mut loader = SimpleTypeLoader::new();
        TypeInfer::new(&mut circuit, &info, &mut loader, false).run();
        TypeLowering::new(&mut circuit, &info, &loader, false).run()?;
        Verifier::run(&circuit)?;
        assert_eq!(count_opcodes(&circuit, OpCode::JsBytecode), 1);
        Ok(())
    }

    #[test]
    fn class_typed_construction_uses_the_hclass_stub() -> Result<()> {
        use Bytecode::*;
        let mut loader = SimpleTypeLoader::new();
        let class_ty = loader.add_class(42);
        loader.set_named_type(3, class_ty);
        let method = MethodInfo {
            num_vregs: 1,
            ..MethodInfo::default()
        };
        let translation = BytecodeTranslationInfo::new(
            method,
            vec![
                /* 0 */ LdGlobalVar { str_id: 3 },
                /* 1 */ Sta { dst: 0 },
                /* 2 */ NewObjRange { first: 0, count: 1 },
                /* 3 */ ReturnAcc,
            ],
        );
        let (mut circuit, info) = BytecodeCircuitBuilder::build(translation, false)?;
        TypeInfer::new(&mut circuit, &info, &mut loader, false).run();
        TypeLowering::new(&mut circuit, &info, &loader, false).run()?;
        Verifier::run(&circuit)?;
        // The construction gate was replaced; the global load remains for
        // the slow path.
        let new_obj = info.pc_to_gate[&2];
        assert_eq!(circuit.opcode(new_obj), OpCode::Nop);
        assert_eq!(count_opcodes(&circuit, OpCode::JsBytecode), 1);
        let call = circuit
            .all_gates()
            .into_iter()
            .find(|g| circuit.opcode(*g) == OpCode::RuntimeCall)
            .unwrap();
        // Stub id, glue, ctor, hclass index.
        assert_eq!(circuit.value_count(call), 4);
        Ok(())
    }
}
