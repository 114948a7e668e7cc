//! Installation and lookup of the method's argument gates: the fixed
//! prelude GLUE, LEXENV, ACTUAL_ARGC, FUNC, NEW_TARGET, THIS followed by the
//! declared parameters.

use anyhow::Result;

use crate::bytecode::{CommonArgIdx, MethodInfo, VRegId, NUM_COMMON_ARGS};
use crate::ir::builder::CircuitBuilder;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::gate_type::GateType;
use crate::ir::machine::{js_machine_type, ptr_machine_type};
use crate::ir::opcode::OpCode;

/// Creates the common argument gates and the declared parameter gates, in
/// index order.
pub fn install_args(circuit: &mut Circuit, method: &MethodInfo) -> Result<()> {
    let mut builder = CircuitBuilder::new(circuit);
    builder.typed_arg(ptr_machine_type(), CommonArgIdx::Glue as u64, GateType::empty())?;
    builder.typed_arg(js_machine_type(), CommonArgIdx::LexEnv as u64, GateType::any())?;
    builder.typed_arg(js_machine_type(), CommonArgIdx::ActualArgc as u64, GateType::number())?;
    builder.typed_arg(js_machine_type(), CommonArgIdx::Func as u64, GateType::any())?;
    builder.typed_arg(js_machine_type(), CommonArgIdx::NewTarget as u64, GateType::any())?;
    builder.typed_arg(js_machine_type(), CommonArgIdx::This as u64, GateType::any())?;
    for declared in 0..method.num_args {
        builder.arg((NUM_COMMON_ARGS + declared as usize) as u64)?;
    }
    Ok(())
}

/// Read-only view over the installed argument gates.
#[derive(Debug)]
pub struct ArgumentAccessor<'a> {
    circuit: &'a Circuit,
}

impl<'a> ArgumentAccessor<'a> {
    pub fn new(circuit: &'a Circuit) -> Self {
        ArgumentAccessor { circuit }
    }

    /// All argument gates in installation order: the arg root's use list
    /// reports the most recent first, so it is reversed here.
    pub fn function_args(&self) -> Vec<GateRef> {
        let arg_root = Circuit::get_circuit_root(OpCode::ArgList);
        let mut args = self.circuit.outs(arg_root);
        args.reverse();
        args
    }

    pub fn common_arg(&self, idx: CommonArgIdx) -> GateRef {
        self.function_args()[idx as usize]
    }

    /// The argument gate backing a vreg of the argument window.
    ///
    /// The bytecode numbers only the implicit arguments the method actually
    /// uses, so the mapping shifts by which of func/new-target/this exist.
    pub fn arg_gate(&self, method: &MethodInfo, vreg: VRegId) -> GateRef {
        debug_assert!(method.is_arg_vreg(vreg));
        let reg = (vreg - method.num_vregs) as usize;
        let index =
            function_arg_index(reg, method.have_func, method.have_new_target, method.have_this);
        self.function_args()[index]
    }
}

fn function_arg_index(reg: usize, have_func: bool, have_new_target: bool, have_this: bool) -> usize {
    let num_common = usize::from(have_func) + usize::from(have_new_target) + usize::from(have_this);
    if num_common == 2 {
        if !have_func && reg == 0 {
            return CommonArgIdx::NewTarget as usize;
        }
        if !have_func && reg == 1 {
            return CommonArgIdx::This as usize;
        }
        if !have_new_target && reg == 0 {
            return CommonArgIdx::Func as usize;
        }
        if !have_new_target && reg == 1 {
            return CommonArgIdx::This as usize;
        }
        if !have_this && reg == 0 {
            return CommonArgIdx::Func as usize;
        }
        if !have_this && reg == 1 {
            return CommonArgIdx::NewTarget as usize;
        }
    }
    if num_common == 1 && reg == 0 {
        if have_func {
            return CommonArgIdx::Func as usize;
        }
        if have_new_target {
            return CommonArgIdx::NewTarget as usize;
        }
        if have_this {
            return CommonArgIdx::This as usize;
        }
    }
    reg + NUM_COMMON_ARGS - num_common
}
