//! The compilation pipeline: frontend, then the passes in their contractual
//! order, with the verifier run after every stage.

use anyhow::Result;

use crate::bytecode::BytecodeTranslationInfo;
use crate::frontend::{BytecodeCircuitBuilder, FrontendInfo};
use crate::ir::circuit::Circuit;
use crate::ir::verifier::Verifier;
use crate::passes::async_lowering::AsyncFunctionLowering;
use crate::passes::peephole::Peephole;
use crate::passes::sccp::SccpSolver;
use crate::passes::slowpath_lowering::SlowPathLowering;
use crate::passes::type_infer::TypeInfer;
use crate::passes::type_lowering::TypeLowering;
use crate::type_loader::TypeLoader;

/// Everything the pipeline threads between passes.
pub struct PassData {
    pub circuit: Circuit,
    pub info: FrontendInfo,
}

/// Drives one method through the whole pipeline. The finalized circuit is
/// handed to an external code generator by the caller.
pub struct PassRunner<'a> {
    loader: &'a mut dyn TypeLoader,
    enable_log: bool,
}

impl<'a> PassRunner<'a> {
    pub fn new(loader: &'a mut dyn TypeLoader, enable_log: bool) -> Self {
        PassRunner { loader, enable_log }
    }

    pub fn compile(&mut self, translation: BytecodeTranslationInfo) -> Result<PassData> {
        let (circuit, info) = BytecodeCircuitBuilder::build(translation, self.enable_log)?;
        let mut data = PassData { circuit, info };
        Verifier::run(&data.circuit)?;

        TypeInfer::new(&mut data.circuit, &data.info, self.loader, self.enable_log).run();
        Verifier::run(&data.circuit)?;

        TypeLowering::new(&mut data.circuit, &data.info, self.loader, self.enable_log).run()?;
        Verifier::run(&data.circuit)?;

        let mut async_lowering =
            AsyncFunctionLowering::new(&mut data.circuit, &data.info, self.enable_log);
        if async_lowering.is_async_related() {
            async_lowering.run()?;
            Verifier::run(&data.circuit)?;
        }

        SlowPathLowering::new(&mut data.circuit, &data.info, self.enable_log).run()?;
        Verifier::run(&data.circuit)?;

        let mut solver = SccpSolver::new(&data.circuit, self.enable_log);
        solver.run();

        Peephole::new(&mut data.circuit, self.enable_log).run()?;
        Verifier::run(&data.circuit)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Bytecode, MethodInfo};
    use crate::ir::opcode::OpCode;
    use crate::type_loader::SimpleTypeLoader;

    fn count_opcodes(circuit: &Circuit, opcode: OpCode) -> usize {
        circuit
            .all_gates()
            .iter()
            .filter(|g| circuit.opcode(**g) == opcode)
            .count()
    }

    #[test]
    fn whole_pipeline_on_a_branchy_method() -> Result<()> {
        use Bytecode::*;
        let _ = env_logger::builder().is_test(true).try_init();
        let method = MethodInfo {
            num_vregs: 2,
            num_args: 1,
            have_func: true,
            have_new_target: true,
            have_this: true,
        };
        let translation = BytecodeTranslationInfo::new(
            method,
            vec![
                /* 0 */ LdaiInt { imm: 5 },
                /* 1 */ Sta { dst: 0 },
                /* 2 */ LdaiInt { imm: 2 },
                /* 3 */ Add2 { lhs: 0 },
                /* 4 */ Jeqz { offset: 3 },
                /* 5 */ LdaiInt { imm: 1 },
                /* 6 */ Jmp { offset: 2 },
                /* 7 */ LdaiInt { imm: 0 },
                /* 8 */ Sta { dst: 1 },
                /* 9 */ Lda { src: 1 },
                /* 10 */ ReturnAcc,
            ],
        );
        let mut loader = SimpleTypeLoader::new();
        let data = PassRunner::new(&mut loader, false).compile(translation)?;
        // Every bytecode gate was lowered away.
        assert_eq!(count_opcodes(&data.circuit, OpCode::JsBytecode), 0);
        // The number-typed addition became a fast call; nothing else calls.
        assert_eq!(count_opcodes(&data.circuit, OpCode::Call), 1);
        assert_eq!(count_opcodes(&data.circuit, OpCode::RuntimeCall), 0);
        Ok(())
    }

    #[test]
    fn whole_pipeline_on_a_generator() -> Result<()> {
        use Bytecode::*;
        let method = MethodInfo {
            num_vregs: 1,
            ..MethodInfo::default()
        };
        let translation = BytecodeTranslationInfo::new(
            method,
            vec![
                /* 0 */ LdUndefined,
                /* 1 */ Sta { dst: 0 },
                /* 2 */ SuspendGenerator { gen: 0, value: 0 },
                /* 3 */ ResumeGenerator { gen: 0 },
                /* 4 */ ReturnAcc,
            ],
        );
        let mut loader = SimpleTypeLoader::new();
        let data = PassRunner::new(&mut loader, false).compile(translation)?;
        assert_eq!(count_opcodes(&data.circuit, OpCode::JsBytecode), 0);
        // Suspend and resume both became runtime calls.
        assert_eq!(count_opcodes(&data.circuit, OpCode::RuntimeCall), 2);
        Ok(())
    }
}
