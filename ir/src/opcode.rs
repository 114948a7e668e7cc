use core::fmt;

use serde::{Deserialize, Serialize};

use crate::machine::{js_machine_type, ptr_machine_type, MachineType};

/// Number of depend inputs an opcode declares. `Many` means the count is the
/// gate's bitfield.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DependCount {
    Zero,
    One,
    Many,
}

/// The static contract of an opcode.
///
/// The in-list of every gate instance is laid out as
/// `[states] [depends] [values] [root]`; the four counts are derived from
/// this record together with the instance's bitfield.
#[derive(Clone, Debug)]
pub struct Properties {
    pub machine_type: MachineType,
    /// Expected state predecessors. `OpCode::Nop` in a slot is the wildcard
    /// "any general state"; the flag repeats the schema `bitfield` times.
    pub states_in: Option<(&'static [OpCode], bool)>,
    pub depends_in: DependCount,
    /// Expected value-input machine types; the flag repeats the schema
    /// `bitfield` times.
    pub values_in: Option<(&'static [MachineType], bool)>,
    pub root: Option<OpCode>,
}

/// Wildcard state schema: any general-state opcode is accepted.
const GENERAL: &[OpCode] = &[OpCode::Nop];
const FROM_IF_BRANCH: &[OpCode] = &[OpCode::IfBranch];
const FROM_SWITCH_BRANCH: &[OpCode] = &[OpCode::SwitchBranch];
const LOOP_HEAD_STATES: &[OpCode] = &[OpCode::Nop, OpCode::LoopBack];

const V_ANY: &[MachineType] = &[MachineType::AnyValue];
const V_ANY2: &[MachineType] = &[MachineType::AnyValue, MachineType::AnyValue];
const V_FLEX: &[MachineType] = &[MachineType::Flex];
const V_FLEX2: &[MachineType] = &[MachineType::Flex, MachineType::Flex];
const V_I1: &[MachineType] = &[MachineType::I1];
const V_I64: &[MachineType] = &[MachineType::I64];
const V_TAGGED: &[MachineType] = &[js_machine_type()];
const V_PTR: &[MachineType] = &[ptr_machine_type()];
const V_ANY_PTR: &[MachineType] = &[MachineType::AnyValue, ptr_machine_type()];

/// Every opcode of the IR. Discriminants are stable and used as dispatch
/// keys by external tooling.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,
    // Roots.
    CircuitRoot,
    StateEntry,
    DependEntry,
    FrameStateEntry,
    ReturnList,
    ThrowList,
    ConstantList,
    AllocaList,
    ArgList,
    // Terminal states.
    Return,
    ReturnVoid,
    Throw,
    // Control structure.
    OrdinaryBlock,
    IfBranch,
    SwitchBranch,
    IfTrue,
    IfFalse,
    SwitchCase,
    DefaultCase,
    Merge,
    LoopBegin,
    LoopBack,
    // Selectors.
    ValueSelector,
    DependSelector,
    DependRelay,
    DependAnd,
    // High-level IR.
    JsBytecode,
    IfSuccess,
    IfException,
    GetException,
    FrameState,
    SaveRegister,
    RestoreRegister,
    // Mid-level calls.
    RuntimeCall,
    NogcRuntimeCall,
    BytecodeCall,
    DebuggerBytecodeCall,
    Call,
    RuntimeCallWithArgv,
    // Leaves.
    Alloca,
    Arg,
    MutableData,
    ConstData,
    RelocatableData,
    Constant,
    // Casts.
    ZextToInt64,
    ZextToInt32,
    ZextToInt16,
    SextToInt64,
    SextToInt32,
    TruncToInt32,
    TruncToInt16,
    TruncToInt1,
    // Pure arithmetic.
    Rev,
    Add,
    Sub,
    Mul,
    Exp,
    Sdiv,
    Smod,
    Udiv,
    Umod,
    Fdiv,
    Fmod,
    And,
    Xor,
    Or,
    Lsl,
    Lsr,
    Asr,
    // Comparisons.
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
    Flt,
    Fle,
    Fgt,
    Fge,
    Eq,
    Ne,
    // Memory.
    Load,
    Store,
    // Tagged-value conversions.
    TaggedToInt64,
    Int64ToTagged,
    SignedIntToFloat,
    UnsignedIntToFloat,
    FloatToSignedInt,
    UnsignedFloatToInt,
    Bitcast,
}

impl OpCode {
    /// The static contract of this opcode. The in-list layout is
    /// `[states] [depends] [values] [root]`.
    pub fn properties(self) -> Properties {
        use DependCount::{Many, One, Zero};
        use MachineType::{Flex, NoValue, F64, I1, I16, I32, I64};
        use OpCode::*;

        let p = |machine_type: MachineType,
                 states_in: Option<(&'static [OpCode], bool)>,
                 depends_in: DependCount,
                 values_in: Option<(&'static [MachineType], bool)>,
                 root: Option<OpCode>| Properties {
            machine_type,
            states_in,
            depends_in,
            values_in,
            root,
        };
        let state = |s: &'static [OpCode]| Some((s, false));
        let many_state = |s: &'static [OpCode]| Some((s, true));
        let value = |v: &'static [MachineType]| Some((v, false));
        let many_value = |v: &'static [MachineType]| Some((v, true));

        match self {
            Nop | CircuitRoot => p(NoValue, None, Zero, None, None),
            StateEntry | DependEntry | FrameStateEntry | ReturnList | ThrowList | ConstantList
            | AllocaList | ArgList => p(NoValue, None, Zero, None, Some(CircuitRoot)),
            Return => p(NoValue, state(GENERAL), One, value(V_ANY), Some(ReturnList)),
            ReturnVoid => p(NoValue, state(GENERAL), One, None, Some(ReturnList)),
            Throw => p(NoValue, state(GENERAL), One, value(V_TAGGED), Some(ThrowList)),
            OrdinaryBlock => p(NoValue, state(GENERAL), Zero, None, None),
            IfBranch => p(NoValue, state(GENERAL), Zero, value(V_I1), None),
            SwitchBranch => p(NoValue, state(GENERAL), Zero, value(V_ANY), None),
            IfTrue | IfFalse => p(NoValue, state(FROM_IF_BRANCH), Zero, None, None),
            SwitchCase | DefaultCase => p(NoValue, state(FROM_SWITCH_BRANCH), Zero, None, None),
            Merge => p(NoValue, many_state(GENERAL), Zero, None, None),
            LoopBegin => p(NoValue, state(LOOP_HEAD_STATES), Zero, None, None),
            LoopBack => p(NoValue, state(GENERAL), Zero, None, None),
            ValueSelector => p(Flex, state(GENERAL), Zero, many_value(V_FLEX), None),
            DependSelector => p(NoValue, state(GENERAL), Many, None, None),
            DependRelay => p(NoValue, state(GENERAL), One, None, None),
            DependAnd => p(NoValue, None, Many, None, None),
            JsBytecode => p(Flex, state(GENERAL), One, many_value(V_ANY), None),
            IfSuccess | IfException => p(NoValue, state(GENERAL), Zero, None, None),
            GetException => p(I64, None, One, None, None),
            FrameState => p(NoValue, None, Zero, many_value(V_ANY), None),
            SaveRegister => p(NoValue, None, One, value(V_ANY), None),
            RestoreRegister => p(I64, None, One, None, None),
            RuntimeCall | NogcRuntimeCall | BytecodeCall | DebuggerBytecodeCall | Call
            | RuntimeCallWithArgv => p(Flex, None, One, many_value(V_ANY2), None),
            Alloca => p(ptr_machine_type(), None, Zero, None, Some(AllocaList)),
            Arg => p(Flex, None, Zero, None, Some(ArgList)),
            MutableData | ConstData | RelocatableData => {
                p(ptr_machine_type(), None, Zero, None, Some(ConstantList))
            }
            Constant => p(Flex, None, Zero, None, Some(ConstantList)),
            ZextToInt64 | SextToInt64 => p(I64, None, Zero, value(V_ANY), None),
            ZextToInt32 | SextToInt32 | TruncToInt32 => p(I32, None, Zero, value(V_ANY), None),
            ZextToInt16 | TruncToInt16 => p(I16, None, Zero, value(V_ANY), None),
            TruncToInt1 => p(I1, None, Zero, value(V_ANY), None),
            Rev => p(Flex, None, Zero, value(V_FLEX), None),
            Add | Sub | Mul | Exp | Sdiv | Smod | Udiv | Umod | Fdiv | Fmod | And | Xor | Or
            | Lsl | Lsr | Asr => p(Flex, None, Zero, value(V_FLEX2), None),
            Slt | Sle | Sgt | Sge | Ult | Ule | Ugt | Uge | Flt | Fle | Fgt | Fge | Eq | Ne => {
                p(I1, None, Zero, value(V_ANY2), None)
            }
            Load => p(Flex, None, One, value(V_PTR), None),
            Store => p(NoValue, None, One, value(V_ANY_PTR), None),
            TaggedToInt64 | Int64ToTagged => p(I64, None, Zero, value(V_I64), None),
            SignedIntToFloat | UnsignedIntToFloat | FloatToSignedInt | UnsignedFloatToInt => {
                p(F64, None, Zero, value(V_ANY), None)
            }
            Bitcast => p(Flex, None, Zero, value(V_ANY), None),
        }
    }

    pub fn machine_type(self) -> MachineType {
        self.properties().machine_type
    }

    pub fn state_count(self, bitfield: u64) -> usize {
        match self.properties().states_in {
            Some((schema, true)) => {
                debug_assert_eq!(schema.len(), 1);
                bitfield as usize
            }
            Some((schema, false)) => schema.len(),
            None => 0,
        }
    }

    pub fn depend_count(self, bitfield: u64) -> usize {
        match self.properties().depends_in {
            DependCount::Zero => 0,
            DependCount::One => 1,
            DependCount::Many => bitfield as usize,
        }
    }

    pub fn value_count(self, bitfield: u64) -> usize {
        match self.properties().values_in {
            Some((schema, true)) => {
                debug_assert!(schema.len() <= 2);
                bitfield as usize
            }
            Some((schema, false)) => schema.len(),
            None => 0,
        }
    }

    pub fn root_count(self) -> usize {
        usize::from(self.properties().root.is_some())
    }

    pub fn num_ins(self, bitfield: u64) -> usize {
        self.state_count(bitfield)
            + self.depend_count(bitfield)
            + self.value_count(bitfield)
            + self.root_count()
    }

    /// Expected opcode of the `idx`-th state predecessor. `OpCode::Nop`
    /// stands for the general-state wildcard.
    pub fn in_state_code(self, idx: usize) -> OpCode {
        let (schema, repeats) = self.properties().states_in.expect("opcode has no state inputs");
        if repeats {
            schema[idx.min(schema.len() - 1)]
        } else {
            schema[idx]
        }
    }

    /// Expected machine type of the in-slot `idx` (an absolute in-list
    /// index), before `Flex` resolution.
    pub fn in_machine_type(self, bitfield: u64, idx: usize) -> MachineType {
        let (schema, repeats) = self.properties().values_in.expect("opcode has no value inputs");
        let idx = idx - self.state_count(bitfield) - self.depend_count(bitfield);
        if repeats {
            schema[idx.min(schema.len() - 1)]
        } else {
            schema[idx]
        }
    }

    pub fn is_root(self) -> bool {
        self == OpCode::CircuitRoot || self.properties().root == Some(OpCode::CircuitRoot)
    }

    pub fn is_prolog(self) -> bool {
        self.properties().root == Some(OpCode::ArgList)
    }

    pub fn is_fixed(self) -> bool {
        matches!(
            self,
            OpCode::ValueSelector | OpCode::DependSelector | OpCode::DependRelay
        )
    }

    pub fn is_schedulable(self) -> bool {
        self != OpCode::Nop
            && !self.is_prolog()
            && !self.is_root()
            && !self.is_fixed()
            && self.state_count(1) == 0
    }

    /// Note: `StateEntry` is a root, so `is_state(StateEntry)` is false even
    /// though it is accepted as a general state predecessor.
    pub fn is_state(self) -> bool {
        self != OpCode::Nop
            && !self.is_prolog()
            && !self.is_root()
            && !self.is_fixed()
            && self.state_count(1) > 0
    }

    pub fn is_general_state(self) -> bool {
        matches!(
            self,
            OpCode::IfTrue
                | OpCode::IfFalse
                | OpCode::JsBytecode
                | OpCode::IfSuccess
                | OpCode::IfException
                | OpCode::SwitchCase
                | OpCode::DefaultCase
                | OpCode::Merge
                | OpCode::LoopBegin
                | OpCode::OrdinaryBlock
                | OpCode::StateEntry
        )
    }

    pub fn is_terminal_state(self) -> bool {
        matches!(self, OpCode::Return | OpCode::ReturnVoid | OpCode::Throw)
    }

    pub fn is_cfg_merge(self) -> bool {
        matches!(self, OpCode::Merge | OpCode::LoopBegin)
    }

    pub fn is_control_case(self) -> bool {
        matches!(
            self,
            OpCode::IfBranch
                | OpCode::SwitchBranch
                | OpCode::IfTrue
                | OpCode::IfFalse
                | OpCode::IfSuccess
                | OpCode::IfException
                | OpCode::SwitchCase
                | OpCode::DefaultCase
        )
    }

    pub fn is_loop_head(self) -> bool {
        self == OpCode::LoopBegin
    }

    pub fn is_nop(self) -> bool {
        self == OpCode::Nop
    }

    pub fn name(self) -> &'static str {
        // Keep in sync with the enum; the verifier and visualizer print
        // these in diagnostics.
        match self {
            OpCode::Nop => "NOP",
            OpCode::CircuitRoot => "CIRCUIT_ROOT",
            OpCode::StateEntry => "STATE_ENTRY",
            OpCode::DependEntry => "DEPEND_ENTRY",
            OpCode::FrameStateEntry => "FRAMESTATE_ENTRY",
            OpCode::ReturnList => "RETURN_LIST",
            OpCode::ThrowList => "THROW_LIST",
            OpCode::ConstantList => "CONSTANT_LIST",
            OpCode::AllocaList => "ALLOCA_LIST",
            OpCode::ArgList => "ARG_LIST",
            OpCode::Return => "RETURN",
            OpCode::ReturnVoid => "RETURN_VOID",
            OpCode::Throw => "THROW",
            OpCode::OrdinaryBlock => "ORDINARY_BLOCK",
            OpCode::IfBranch => "IF_BRANCH",
            OpCode::SwitchBranch => "SWITCH_BRANCH",
            OpCode::IfTrue => "IF_TRUE",
            OpCode::IfFalse => "IF_FALSE",
            OpCode::SwitchCase => "SWITCH_CASE",
            OpCode::DefaultCase => "DEFAULT_CASE",
            OpCode::Merge => "MERGE",
            OpCode::LoopBegin => "LOOP_BEGIN",
            OpCode::LoopBack => "LOOP_BACK",
            OpCode::ValueSelector => "VALUE_SELECTOR",
            OpCode::DependSelector => "DEPEND_SELECTOR",
            OpCode::DependRelay => "DEPEND_RELAY",
            OpCode::DependAnd => "DEPEND_AND",
            OpCode::JsBytecode => "JS_BYTECODE",
            OpCode::IfSuccess => "IF_SUCCESS",
            OpCode::IfException => "IF_EXCEPTION",
            OpCode::GetException => "GET_EXCEPTION",
            OpCode::FrameState => "FRAME_STATE",
            OpCode::SaveRegister => "SAVE_REGISTER",
            OpCode::RestoreRegister => "RESTORE_REGISTER",
            OpCode::RuntimeCall => "RUNTIME_CALL",
            OpCode::NogcRuntimeCall => "NOGC_RUNTIME_CALL",
            OpCode::BytecodeCall => "BYTECODE_CALL",
            OpCode::DebuggerBytecodeCall => "DEBUGGER_BYTECODE_CALL",
            OpCode::Call => "CALL",
            OpCode::RuntimeCallWithArgv => "RUNTIME_CALL_WITH_ARGV",
            OpCode::Alloca => "ALLOCA",
            OpCode::Arg => "ARG",
            OpCode::MutableData => "MUTABLE_DATA",
            OpCode::ConstData => "CONST_DATA",
            OpCode::RelocatableData => "RELOCATABLE_DATA",
            OpCode::Constant => "CONSTANT",
            OpCode::ZextToInt64 => "ZEXT_TO_INT64",
            OpCode::ZextToInt32 => "ZEXT_TO_INT32",
            OpCode::ZextToInt16 => "ZEXT_TO_INT16",
            OpCode::SextToInt64 => "SEXT_TO_INT64",
            OpCode::SextToInt32 => "SEXT_TO_INT32",
            OpCode::TruncToInt32 => "TRUNC_TO_INT32",
            OpCode::TruncToInt16 => "TRUNC_TO_INT16",
            OpCode::TruncToInt1 => "TRUNC_TO_INT1",
            OpCode::Rev => "REV",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Exp => "EXP",
            OpCode::Sdiv => "SDIV",
            OpCode::Smod => "SMOD",
            OpCode::Udiv => "UDIV",
            OpCode::Umod => "UMOD",
            OpCode::Fdiv => "FDIV",
            OpCode::Fmod => "FMOD",
            OpCode::And => "AND",
            OpCode::Xor => "XOR",
            OpCode::Or => "OR",
            OpCode::Lsl => "LSL",
            OpCode::Lsr => "LSR",
            OpCode::Asr => "ASR",
            OpCode::Slt => "SLT",
            OpCode::Sle => "SLE",
            OpCode::Sgt => "SGT",
            OpCode::Sge => "SGE",
            OpCode::Ult => "ULT",
            OpCode::Ule => "ULE",
            OpCode::Ugt => "UGT",
            OpCode::Uge => "UGE",
            OpCode::Flt => "FLT",
            OpCode::Fle => "FLE",
            OpCode::Fgt => "FGT",
            OpCode::Fge => "FGE",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Load => "LOAD",
            OpCode::Store => "STORE",
            OpCode::TaggedToInt64 => "TAGGED_TO_INT64",
            OpCode::Int64ToTagged => "INT64_TO_TAGGED",
            OpCode::SignedIntToFloat => "SIGNED_INT_TO_FLOAT",
            OpCode::UnsignedIntToFloat => "UNSIGNED_INT_TO_FLOAT",
            OpCode::FloatToSignedInt => "FLOAT_TO_SIGNED_INT",
            OpCode::UnsignedFloatToInt => "UNSIGNED_FLOAT_TO_INT",
            OpCode::Bitcast => "BITCAST",
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        assert!(raw <= OpCode::Bitcast.to_u8(), "corrupt opcode tag: {raw}");
        // Discriminants are dense starting at zero.
        unsafe { core::mem::transmute::<u8, OpCode>(raw) }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_derivation() {
        // RETURN = state + depend + value + root.
        assert_eq!(OpCode::Return.num_ins(0), 4);
        // MERGE arity tracks the bitfield.
        assert_eq!(OpCode::Merge.num_ins(3), 3);
        assert_eq!(OpCode::Merge.state_count(3), 3);
        // VALUE_SELECTOR: one state plus `bitfield` values.
        assert_eq!(OpCode::ValueSelector.num_ins(2), 3);
        // DEPEND_SELECTOR: one state plus `bitfield` depends.
        assert_eq!(OpCode::DependSelector.num_ins(2), 3);
        // LOOP_BEGIN always has two state inputs.
        assert_eq!(OpCode::LoopBegin.num_ins(0), 2);
        // JS_BYTECODE: state + depend + `bitfield` values.
        assert_eq!(OpCode::JsBytecode.num_ins(4), 6);
        // CONSTANT only carries its root edge.
        assert_eq!(OpCode::Constant.num_ins(123), 1);
    }

    #[test]
    fn state_schema_lookup() {
        assert_eq!(OpCode::IfTrue.in_state_code(0), OpCode::IfBranch);
        assert_eq!(OpCode::LoopBegin.in_state_code(1), OpCode::LoopBack);
        // Wildcard (repeated) schema.
        assert_eq!(OpCode::Merge.in_state_code(5), OpCode::Nop);
    }

    #[test]
    fn value_schema_lookup() {
        // IF_BRANCH consumes one I1 after its single state input.
        assert_eq!(OpCode::IfBranch.in_machine_type(0, 1), MachineType::I1);
        // STORE consumes a value and a pointer after one depend.
        assert_eq!(OpCode::Store.in_machine_type(0, 1), MachineType::AnyValue);
        assert_eq!(OpCode::Store.in_machine_type(0, 2), MachineType::I64);
        // Repeated schemas saturate on the last entry.
        assert_eq!(OpCode::JsBytecode.in_machine_type(3, 4), MachineType::AnyValue);
    }

    #[test]
    fn category_predicates() {
        assert!(OpCode::CircuitRoot.is_root());
        assert!(OpCode::ConstantList.is_root());
        assert!(OpCode::Arg.is_prolog());
        assert!(OpCode::ValueSelector.is_fixed());
        assert!(OpCode::Add.is_schedulable());
        assert!(!OpCode::Add.is_state());
        assert!(OpCode::IfBranch.is_state());
        assert!(!OpCode::StateEntry.is_state());
        assert!(OpCode::StateEntry.is_general_state());
        assert!(OpCode::Throw.is_terminal_state());
        assert!(OpCode::LoopBegin.is_cfg_merge());
        assert!(OpCode::IfSuccess.is_control_case());
        assert!(!OpCode::Merge.is_control_case());
    }

    #[test]
    fn raw_tag_round_trip() {
        for raw in 0..=OpCode::Bitcast.to_u8() {
            assert_eq!(OpCode::from_u8(raw).to_u8(), raw);
        }
    }
}
