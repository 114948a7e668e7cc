//! The decoded bytecode model: exactly the slice of the instruction set the
//! IR constructor needs, plus the method/try-range descriptors handed in by
//! the embedder.

use serde::{Deserialize, Serialize};

/// Virtual register index. Locals occupy `[0, num_vregs)`; the argument
/// window follows at `[num_vregs, num_vregs + implicit + declared)`.
pub type VRegId = u16;
/// Index into the embedder's string table.
pub type StringId = u32;
/// Index into the embedder's method table.
pub type MethodId = u16;
/// Program counter: an index into the instruction array.
pub type PcIndex = usize;

/// One decoded operand read by an instruction, in operand order.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Operand {
    VReg(VRegId),
    Imm(u64),
    Str(StringId),
    Method(MethodId),
}

/// A decoded instruction. Jump offsets are relative instruction counts.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Bytecode {
    // Register moves; folded away by renaming, never emitted as gates.
    Mov { dst: VRegId, src: VRegId },
    Lda { src: VRegId },
    Sta { dst: VRegId },
    // Constants into the accumulator.
    LdaiInt { imm: i32 },
    FldaiDouble { imm: f64 },
    LdUndefined,
    LdNull,
    LdTrue,
    LdFalse,
    LdHole,
    LdNan,
    LdInfinity,
    // Control flow.
    Jmp { offset: i32 },
    Jeqz { offset: i32 },
    Jnez { offset: i32 },
    ReturnAcc,
    ReturnUndefined,
    ThrowAcc,
    // Binary dynamic operators: left operand in a vreg, right in acc.
    Add2 { lhs: VRegId },
    Sub2 { lhs: VRegId },
    Mul2 { lhs: VRegId },
    Div2 { lhs: VRegId },
    Mod2 { lhs: VRegId },
    Exp { lhs: VRegId },
    Shl2 { lhs: VRegId },
    Shr2 { lhs: VRegId },
    Ashr2 { lhs: VRegId },
    And2 { lhs: VRegId },
    Or2 { lhs: VRegId },
    Xor2 { lhs: VRegId },
    EqDyn { lhs: VRegId },
    NotEqDyn { lhs: VRegId },
    LessDyn { lhs: VRegId },
    LessEqDyn { lhs: VRegId },
    GreaterDyn { lhs: VRegId },
    GreaterEqDyn { lhs: VRegId },
    // Unary dynamic operators over the accumulator.
    NegDyn,
    IncDyn,
    DecDyn,
    ToNumber { src: VRegId },
    // Globals and the constant pool.
    LdaStr { str_id: StringId },
    LdGlobalVar { str_id: StringId },
    StGlobalVar { str_id: StringId },
    TryLdGlobalByName { str_id: StringId },
    LdLexEnv,
    // Objects.
    LdObjByName { obj: VRegId, str_id: StringId },
    LdObjByValue { obj: VRegId, key: VRegId },
    LdObjByIndex { obj: VRegId, index: u32 },
    NewObjRange { first: VRegId, count: u16 },
    // Calls: callee in a vreg, arguments in consecutive vregs.
    CallArg0 { func: VRegId },
    CallArg1 { func: VRegId, a0: VRegId },
    CallArgs2 { func: VRegId, a0: VRegId, a1: VRegId },
    CallArgs3 { func: VRegId, a0: VRegId, a1: VRegId, a2: VRegId },
    // Iterators.
    GetIterator,
    CreateIterResultObj { value: VRegId, done: VRegId },
    // Generators and async functions.
    SuspendGenerator { gen: VRegId, value: VRegId },
    ResumeGenerator { gen: VRegId },
    AsyncFunctionAwaitUncaught { func: VRegId, value: VRegId },
    AsyncFunctionResolve { func: VRegId, value: VRegId },
    AsyncFunctionReject { func: VRegId, value: VRegId },
    // Ignored entirely during construction.
    Debugger,
}

/// Register/accumulator footprint of one instruction.
#[derive(Clone, Debug, Default)]
pub struct BytecodeInfo {
    /// Operands read, in order; vreg entries become renamed value inputs.
    pub inputs: Vec<Operand>,
    /// Vregs written.
    pub vreg_out: Vec<VRegId>,
    pub acc_in: bool,
    pub acc_out: bool,
}

impl BytecodeInfo {
    pub fn vreg_reads(&self) -> impl Iterator<Item = VRegId> + '_ {
        self.inputs.iter().filter_map(|operand| match operand {
            Operand::VReg(v) => Some(*v),
            _ => None,
        })
    }
}

impl Bytecode {
    pub fn info(&self) -> BytecodeInfo {
        use Bytecode::*;
        use Operand::*;
        let mut info = BytecodeInfo::default();
        match *self {
            Mov { dst, src } => {
                info.inputs.push(VReg(src));
                info.vreg_out.push(dst);
            }
            Lda { src } => {
                info.inputs.push(VReg(src));
                info.acc_out = true;
            }
            Sta { dst } => {
                info.acc_in = true;
                info.vreg_out.push(dst);
            }
            LdaiInt { imm } => {
                info.inputs.push(Imm(imm as u32 as u64));
                info.acc_out = true;
            }
            FldaiDouble { imm } => {
                info.inputs.push(Imm(imm.to_bits()));
                info.acc_out = true;
            }
            LdUndefined | LdNull | LdTrue | LdFalse | LdHole | LdNan | LdInfinity => {
                info.acc_out = true;
            }
            Jmp { .. } => {}
            Jeqz { .. } | Jnez { .. } => info.acc_in = true,
            ReturnAcc | ThrowAcc => info.acc_in = true,
            ReturnUndefined => {}
            Add2 { lhs } | Sub2 { lhs } | Mul2 { lhs } | Div2 { lhs } | Mod2 { lhs }
            | Exp { lhs } | Shl2 { lhs } | Shr2 { lhs } | Ashr2 { lhs } | And2 { lhs }
            | Or2 { lhs } | Xor2 { lhs } | EqDyn { lhs } | NotEqDyn { lhs } | LessDyn { lhs }
            | LessEqDyn { lhs } | GreaterDyn { lhs } | GreaterEqDyn { lhs } => {
                info.inputs.push(VReg(lhs));
                info.acc_in = true;
                info.acc_out = true;
            }
            NegDyn | IncDyn | DecDyn => {
                info.acc_in = true;
                info.acc_out = true;
            }
            ToNumber { src } => {
                info.inputs.push(VReg(src));
                info.acc_out = true;
            }
            LdaStr { str_id } | LdGlobalVar { str_id } | TryLdGlobalByName { str_id } => {
                info.inputs.push(Str(str_id));
                info.acc_out = true;
            }
            StGlobalVar { str_id } => {
                info.inputs.push(Str(str_id));
                info.acc_in = true;
            }
            LdLexEnv => info.acc_out = true,
            LdObjByName { obj, str_id } => {
                info.inputs.push(Str(str_id));
                info.inputs.push(VReg(obj));
                info.acc_out = true;
            }
            LdObjByValue { obj, key } => {
                info.inputs.push(VReg(obj));
                info.inputs.push(VReg(key));
                info.acc_out = true;
            }
            LdObjByIndex { obj, index } => {
                info.inputs.push(VReg(obj));
                info.inputs.push(Imm(index as u64));
                info.acc_out = true;
            }
            NewObjRange { first, count } => {
                for v in first..first + count {
                    info.inputs.push(VReg(v));
                }
                info.acc_out = true;
            }
            CallArg0 { func } => {
                info.inputs.push(VReg(func));
                info.acc_out = true;
            }
            CallArg1 { func, a0 } => {
                info.inputs.extend([VReg(func), VReg(a0)]);
                info.acc_out = true;
            }
            CallArgs2 { func, a0, a1 } => {
                info.inputs.extend([VReg(func), VReg(a0), VReg(a1)]);
                info.acc_out = true;
            }
            CallArgs3 { func, a0, a1, a2 } => {
                info.inputs.extend([VReg(func), VReg(a0), VReg(a1), VReg(a2)]);
                info.acc_out = true;
            }
            GetIterator => {
                info.acc_in = true;
                info.acc_out = true;
            }
            CreateIterResultObj { value, done } => {
                info.inputs.extend([VReg(value), VReg(done)]);
                info.acc_out = true;
            }
            SuspendGenerator { gen, value } => {
                info.inputs.extend([VReg(gen), VReg(value)]);
                info.acc_out = true;
            }
            ResumeGenerator { gen } => {
                info.inputs.push(VReg(gen));
                info.acc_out = true;
            }
            AsyncFunctionAwaitUncaught { func, value }
            | AsyncFunctionResolve { func, value }
            | AsyncFunctionReject { func, value } => {
                info.inputs.extend([VReg(func), VReg(value)]);
                info.acc_out = true;
            }
            Debugger => {}
        }
        info
    }

    pub fn is_mov(&self) -> bool {
        matches!(self, Bytecode::Mov { .. } | Bytecode::Lda { .. } | Bytecode::Sta { .. })
    }

    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Bytecode::Jmp { .. } | Bytecode::Jeqz { .. } | Bytecode::Jnez { .. }
        )
    }

    pub fn is_cond_jump(&self) -> bool {
        matches!(self, Bytecode::Jeqz { .. } | Bytecode::Jnez { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Bytecode::ReturnAcc | Bytecode::ReturnUndefined)
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Bytecode::ThrowAcc)
    }

    pub fn is_set_constant(&self) -> bool {
        matches!(
            self,
            Bytecode::LdaiInt { .. }
                | Bytecode::FldaiDouble { .. }
                | Bytecode::LdUndefined
                | Bytecode::LdNull
                | Bytecode::LdTrue
                | Bytecode::LdFalse
                | Bytecode::LdHole
                | Bytecode::LdNan
                | Bytecode::LdInfinity
        )
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, Bytecode::Debugger)
    }

    /// Anything that survives to a `JS_BYTECODE` gate.
    pub fn is_general(&self) -> bool {
        !self.is_mov()
            && !self.is_jump()
            && !self.is_return()
            && !self.is_throw()
            && !self.is_set_constant()
            && !self.is_discarded()
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Bytecode::CallArg0 { .. }
                | Bytecode::CallArg1 { .. }
                | Bytecode::CallArgs2 { .. }
                | Bytecode::CallArgs3 { .. }
        )
    }

    pub fn is_suspend(&self) -> bool {
        matches!(self, Bytecode::SuspendGenerator { .. })
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Bytecode::ResumeGenerator { .. })
    }

    /// Terminates a basic block.
    pub fn is_terminator(&self) -> bool {
        self.is_jump() || self.is_return() || self.is_throw()
    }

    /// Absolute target of a jump at `pc`.
    pub fn jump_target(&self, pc: PcIndex) -> Option<PcIndex> {
        let offset = match self {
            Bytecode::Jmp { offset } | Bytecode::Jeqz { offset } | Bytecode::Jnez { offset } => {
                *offset
            }
            _ => return None,
        };
        Some((pc as isize + offset as isize) as PcIndex)
    }
}

/// Common (implicit) argument indices, installed before declared parameters.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum CommonArgIdx {
    Glue = 0,
    LexEnv,
    ActualArgc,
    Func,
    NewTarget,
    This,
}

/// Number of implicit arguments preceding the declared ones.
pub const NUM_COMMON_ARGS: usize = 6;

/// Static description of the compiled method.
#[derive(Copy, Clone, Debug, Default)]
pub struct MethodInfo {
    /// Local virtual registers; the argument window starts right above.
    pub num_vregs: u16,
    /// Declared parameters.
    pub num_args: u16,
    pub have_func: bool,
    pub have_new_target: bool,
    pub have_this: bool,
}

impl MethodInfo {
    /// Vregs in the argument window map to argument gates.
    pub fn is_arg_vreg(&self, vreg: VRegId) -> bool {
        vreg >= self.num_vregs
    }
}

/// One protected region: `[try_start, try_end)` dispatches its exceptions to
/// the block starting at `catch_start`.
#[derive(Copy, Clone, Debug)]
pub struct TryCatchRange {
    pub try_start: PcIndex,
    pub try_end: PcIndex,
    pub catch_start: PcIndex,
}

/// Opaque handle to the embedder's constant pool.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ConstantPoolRef(pub u64);

/// Everything the frontend needs to translate one method.
#[derive(Clone, Debug)]
pub struct BytecodeTranslationInfo {
    pub method: MethodInfo,
    pub bytecodes: Vec<Bytecode>,
    pub try_catch: Vec<TryCatchRange>,
    pub constant_pool: ConstantPoolRef,
}

impl BytecodeTranslationInfo {
    pub fn new(method: MethodInfo, bytecodes: Vec<Bytecode>) -> Self {
        BytecodeTranslationInfo {
            method,
            bytecodes,
            try_catch: Vec::new(),
            constant_pool: ConstantPoolRef::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_op_footprint() {
        let info = Bytecode::Add2 { lhs: 3 }.info();
        assert_eq!(info.vreg_reads().collect::<Vec<_>>(), vec![3]);
        assert!(info.acc_in);
        assert!(info.acc_out);
        assert!(info.vreg_out.is_empty());
        assert!(Bytecode::Add2 { lhs: 3 }.is_general());
    }

    #[test]
    fn mov_and_constant_classification() {
        assert!(Bytecode::Mov { dst: 0, src: 1 }.is_mov());
        assert!(Bytecode::Lda { src: 0 }.is_mov());
        assert!(Bytecode::LdaiInt { imm: -1 }.is_set_constant());
        assert!(!Bytecode::LdaiInt { imm: -1 }.is_general());
        assert!(Bytecode::Debugger.is_discarded());
    }

    #[test]
    fn jump_targets_are_relative() {
        assert_eq!(Bytecode::Jmp { offset: -2 }.jump_target(5), Some(3));
        assert_eq!(Bytecode::Jeqz { offset: 4 }.jump_target(1), Some(5));
        assert_eq!(Bytecode::ReturnAcc.jump_target(1), None);
    }

    #[test]
    fn new_obj_reads_a_register_range() {
        let info = Bytecode::NewObjRange { first: 2, count: 3 }.info();
        assert_eq!(info.vreg_reads().collect::<Vec<_>>(), vec![2, 3, 4]);
    }
}
