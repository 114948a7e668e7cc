//! The runtime stub catalogue: the ids and signatures of the trampolines
//! the lowering passes emit calls to. The table is the contract with the
//! runtime; the core only reads it.

use crate::bytecode::Bytecode;
use crate::ir::machine::{js_machine_type, MachineType};

/// Stable identifier of a runtime stub; embedded in call gates as an i64
/// constant.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u32)]
pub enum StubId {
    Add2Dyn = 0,
    Sub2Dyn,
    Mul2Dyn,
    Div2Dyn,
    Mod2Dyn,
    ExpDyn,
    Shl2Dyn,
    Shr2Dyn,
    Ashr2Dyn,
    And2Dyn,
    Or2Dyn,
    Xor2Dyn,
    EqDyn,
    NotEqDyn,
    LessDyn,
    LessEqDyn,
    GreaterDyn,
    GreaterEqDyn,
    NegDyn,
    IncDyn,
    DecDyn,
    ToNumber,
    LoadValueFromConstantPool,
    GetLexicalEnv,
    TryLdGlobalByName,
    StGlobalVar,
    LdGlobalVar,
    LdObjByName,
    LdObjByValue,
    LdObjByIndex,
    NewObjDynRange,
    NewObjWithHClass,
    GetIterator,
    CreateIterResultObj,
    SuspendGenerator,
    ResumeGenerator,
    AsyncFunctionAwaitUncaught,
    AsyncFunctionResolveOrReject,
    CallArg0Dyn,
    CallArg1Dyn,
    CallArgs2Dyn,
    CallArgs3Dyn,
    FastAdd2,
}

impl StubId {
    pub const fn as_i64(self) -> i64 {
        self as u32 as i64
    }
}

/// How a stub is reached: `Normal` stubs are compiled code with a fixed
/// signature, `Runtime` stubs trampoline into the interpreter runtime.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StubKind {
    Normal,
    Runtime,
}

/// Signature of one stub: return representation plus per-parameter
/// representations (excluding the glue pointer, which every stub takes
/// first).
#[derive(Clone, Debug)]
pub struct StubDescriptor {
    pub name: &'static str,
    pub return_type: MachineType,
    pub params: &'static [MachineType],
    pub kind: StubKind,
}

const TAGGED: MachineType = js_machine_type();
const T1: &[MachineType] = &[TAGGED];
const T2: &[MachineType] = &[TAGGED, TAGGED];
const T3: &[MachineType] = &[TAGGED, TAGGED, TAGGED];
const T4: &[MachineType] = &[TAGGED, TAGGED, TAGGED, TAGGED];

/// Lookup table from stub id to descriptor.
#[derive(Clone, Debug, Default)]
pub struct StubTable;

impl StubTable {
    pub fn get(id: StubId) -> StubDescriptor {
        let d = |name, return_type, params, kind| StubDescriptor {
            name,
            return_type,
            params,
            kind,
        };
        use StubKind::{Normal, Runtime};
        match id {
            StubId::Add2Dyn => d("Add2Dyn", TAGGED, T2, Runtime),
            StubId::Sub2Dyn => d("Sub2Dyn", TAGGED, T2, Runtime),
            StubId::Mul2Dyn => d("Mul2Dyn", TAGGED, T2, Runtime),
            StubId::Div2Dyn => d("Div2Dyn", TAGGED, T2, Runtime),
            StubId::Mod2Dyn => d("Mod2Dyn", TAGGED, T2, Runtime),
            StubId::ExpDyn => d("ExpDyn", TAGGED, T2, Runtime),
            StubId::Shl2Dyn => d("Shl2Dyn", TAGGED, T2, Runtime),
            StubId::Shr2Dyn => d("Shr2Dyn", TAGGED, T2, Runtime),
            StubId::Ashr2Dyn => d("Ashr2Dyn", TAGGED, T2, Runtime),
            StubId::And2Dyn => d("And2Dyn", TAGGED, T2, Runtime),
            StubId::Or2Dyn => d("Or2Dyn", TAGGED, T2, Runtime),
            StubId::Xor2Dyn => d("Xor2Dyn", TAGGED, T2, Runtime),
            StubId::EqDyn => d("EqDyn", TAGGED, T2, Runtime),
            StubId::NotEqDyn => d("NotEqDyn", TAGGED, T2, Runtime),
            StubId::LessDyn => d("LessDyn", TAGGED, T2, Runtime),
            StubId::LessEqDyn => d("LessEqDyn", TAGGED, T2, Runtime),
            StubId::GreaterDyn => d("GreaterDyn", TAGGED, T2, Runtime),
            StubId::GreaterEqDyn => d("GreaterEqDyn", TAGGED, T2, Runtime),
            StubId::NegDyn => d("NegDyn", TAGGED, T1, Runtime),
            StubId::IncDyn => d("IncDyn", TAGGED, T1, Runtime),
            StubId::DecDyn => d("DecDyn", TAGGED, T1, Runtime),
            StubId::ToNumber => d("ToNumber", TAGGED, T1, Runtime),
            StubId::LoadValueFromConstantPool => {
                d("LoadValueFromConstantPool", TAGGED, T2, Runtime)
            }
            StubId::GetLexicalEnv => d("GetLexicalEnv", TAGGED, &[], Runtime),
            StubId::TryLdGlobalByName => d("TryLdGlobalByName", TAGGED, T1, Runtime),
            StubId::StGlobalVar => d("StGlobalVar", TAGGED, T2, Runtime),
            StubId::LdGlobalVar => d("LdGlobalVar", TAGGED, T2, Runtime),
            StubId::LdObjByName => d("LdObjByName", TAGGED, T2, Runtime),
            StubId::LdObjByValue => d("LdObjByValue", TAGGED, T2, Runtime),
            StubId::LdObjByIndex => d("LdObjByIndex", TAGGED, T2, Runtime),
            StubId::NewObjDynRange => d("NewObjDynRange", TAGGED, T4, Runtime),
            StubId::NewObjWithHClass => d("NewObjWithHClass", TAGGED, T3, Runtime),
            StubId::GetIterator => d("GetIterator", TAGGED, T1, Runtime),
            StubId::CreateIterResultObj => d("CreateIterResultObj", TAGGED, T2, Runtime),
            StubId::SuspendGenerator => d("SuspendGenerator", TAGGED, T2, Runtime),
            StubId::ResumeGenerator => d("ResumeGenerator", TAGGED, T1, Runtime),
            StubId::AsyncFunctionAwaitUncaught => {
                d("AsyncFunctionAwaitUncaught", TAGGED, T2, Runtime)
            }
            StubId::AsyncFunctionResolveOrReject => {
                d("AsyncFunctionResolveOrReject", TAGGED, T3, Runtime)
            }
            StubId::CallArg0Dyn => d("CallArg0Dyn", TAGGED, T1, Runtime),
            StubId::CallArg1Dyn => d("CallArg1Dyn", TAGGED, T2, Runtime),
            StubId::CallArgs2Dyn => d("CallArgs2Dyn", TAGGED, T3, Runtime),
            StubId::CallArgs3Dyn => d("CallArgs3Dyn", TAGGED, T4, Runtime),
            StubId::FastAdd2 => d("FastAdd2", TAGGED, T2, Normal),
        }
    }
}

/// Which stub lowers a given general bytecode.
pub fn stub_for_bytecode(bytecode: &Bytecode) -> Option<StubId> {
    let id = match bytecode {
        Bytecode::Add2 { .. } => StubId::Add2Dyn,
        Bytecode::Sub2 { .. } => StubId::Sub2Dyn,
        Bytecode::Mul2 { .. } => StubId::Mul2Dyn,
        Bytecode::Div2 { .. } => StubId::Div2Dyn,
        Bytecode::Mod2 { .. } => StubId::Mod2Dyn,
        Bytecode::Exp { .. } => StubId::ExpDyn,
        Bytecode::Shl2 { .. } => StubId::Shl2Dyn,
        Bytecode::Shr2 { .. } => StubId::Shr2Dyn,
        Bytecode::Ashr2 { .. } => StubId::Ashr2Dyn,
        Bytecode::And2 { .. } => StubId::And2Dyn,
        Bytecode::Or2 { .. } => StubId::Or2Dyn,
        Bytecode::Xor2 { .. } => StubId::Xor2Dyn,
        Bytecode::EqDyn { .. } => StubId::EqDyn,
        Bytecode::NotEqDyn { .. } => StubId::NotEqDyn,
        Bytecode::LessDyn { .. } => StubId::LessDyn,
        Bytecode::LessEqDyn { .. } => StubId::LessEqDyn,
        Bytecode::GreaterDyn { .. } => StubId::GreaterDyn,
        Bytecode::GreaterEqDyn { .. } => StubId::GreaterEqDyn,
        Bytecode::NegDyn => StubId::NegDyn,
        Bytecode::IncDyn => StubId::IncDyn,
        Bytecode::DecDyn => StubId::DecDyn,
        Bytecode::ToNumber { .. } => StubId::ToNumber,
        Bytecode::LdaStr { .. } => StubId::LoadValueFromConstantPool,
        Bytecode::LdLexEnv => StubId::GetLexicalEnv,
        Bytecode::TryLdGlobalByName { .. } => StubId::TryLdGlobalByName,
        Bytecode::StGlobalVar { .. } => StubId::StGlobalVar,
        Bytecode::LdGlobalVar { .. } => StubId::LdGlobalVar,
        Bytecode::LdObjByName { .. } => StubId::LdObjByName,
        Bytecode::LdObjByValue { .. } => StubId::LdObjByValue,
        Bytecode::LdObjByIndex { .. } => StubId::LdObjByIndex,
        Bytecode::NewObjRange { .. } => StubId::NewObjDynRange,
        Bytecode::GetIterator => StubId::GetIterator,
        Bytecode::CreateIterResultObj { .. } => StubId::CreateIterResultObj,
        Bytecode::SuspendGenerator { .. } => StubId::SuspendGenerator,
        Bytecode::ResumeGenerator { .. } => StubId::ResumeGenerator,
        Bytecode::AsyncFunctionAwaitUncaught { .. } => StubId::AsyncFunctionAwaitUncaught,
        Bytecode::AsyncFunctionResolve { .. } | Bytecode::AsyncFunctionReject { .. } => {
            StubId::AsyncFunctionResolveOrReject
        }
        Bytecode::CallArg0 { .. } => StubId::CallArg0Dyn,
        Bytecode::CallArg1 { .. } => StubId::CallArg1Dyn,
        Bytecode::CallArgs2 { .. } => StubId::CallArgs2Dyn,
        Bytecode::CallArgs3 { .. } => StubId::CallArgs3Dyn,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_general_bytecode_has_a_stub() {
        let general = [
            Bytecode::Add2 { lhs: 0 },
            Bytecode::NegDyn,
            Bytecode::LdaStr { str_id: 1 },
            Bytecode::GetIterator,
            Bytecode::SuspendGenerator { gen: 0, value: 1 },
            Bytecode::ResumeGenerator { gen: 0 },
            Bytecode::CallArgs3 { func: 0, a0: 1, a1: 2, a2: 3 },
            Bytecode::NewObjRange { first: 0, count: 2 },
        ];
        for bc in general {
            assert!(bc.is_general());
            let id = stub_for_bytecode(&bc).unwrap();
            let descriptor = StubTable::get(id);
            assert_eq!(descriptor.return_type, js_machine_type());
        }
    }

    #[test]
    fn movs_have_no_stub() {
        assert!(stub_for_bytecode(&Bytecode::Mov { dst: 0, src: 1 }).is_none());
        assert!(stub_for_bytecode(&Bytecode::Jmp { offset: 1 }).is_none());
    }
}
