use core::fmt;

use serde::{Deserialize, Serialize};

/// Low-level representation tag of the value a gate produces or consumes.
///
/// `Flex` means "same as the producing gate"; it appears in opcode schemas
/// and is resolved against the concrete machine type of the gate instance.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum MachineType {
    NoValue = 0,
    AnyValue,
    Flex,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl MachineType {
    pub const fn bits(self) -> usize {
        match self {
            MachineType::NoValue | MachineType::AnyValue | MachineType::Flex => 0,
            MachineType::I1 => 1,
            MachineType::I8 => 8,
            MachineType::I16 => 16,
            MachineType::I32 => 32,
            MachineType::I64 => 64,
            MachineType::F32 => 32,
            MachineType::F64 => 64,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, MachineType::F32 | MachineType::F64)
    }

    pub(crate) const fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MachineType::NoValue,
            1 => MachineType::AnyValue,
            2 => MachineType::Flex,
            3 => MachineType::I1,
            4 => MachineType::I8,
            5 => MachineType::I16,
            6 => MachineType::I32,
            7 => MachineType::I64,
            8 => MachineType::F32,
            9 => MachineType::F64,
            _ => panic!("corrupt machine type tag: {raw}"),
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineType::NoValue => "NOVALUE",
            MachineType::AnyValue => "ANYVALUE",
            MachineType::Flex => "FLEX",
            MachineType::I1 => "I1",
            MachineType::I8 => "I8",
            MachineType::I16 => "I16",
            MachineType::I32 => "I32",
            MachineType::I64 => "I64",
            MachineType::F32 => "F32",
            MachineType::F64 => "F64",
        };
        write!(f, "{name}")
    }
}

/// The representation of a tagged language value. Dynamic values travel as
/// 64-bit tagged words everywhere in the IR.
pub const fn js_machine_type() -> MachineType {
    MachineType::I64
}

/// The representation of a native pointer on the targets the compiler
/// supports.
pub const fn ptr_machine_type() -> MachineType {
    MachineType::I64
}
