use core::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Stable reference to a gate: the byte offset of its header inside the
/// circuit arena. Offsets survive arena reallocation; raw views into the
/// arena do not, so everything that outlives an allocation is a `GateRef`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateRef(pub(crate) u32);

impl GateRef {
    /// The distinguished "no gate" sentinel, usable wherever a gate slot is
    /// intentionally left empty.
    pub const NULL: GateRef = GateRef(u32::MAX);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Debug for GateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "GateRef(NULL)")
        } else {
            write!(f, "GateRef({})", self.0)
        }
    }
}

/// Monotonically increasing id assigned at allocation, dense from zero.
pub type GateId = u32;

/// Pass-local mark, valid only while the gate's stamp equals the circuit's
/// current timestamp.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MarkCode {
    Empty = 0,
    Visited,
    Finished,
}

impl MarkCode {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MarkCode::Empty,
            1 => MarkCode::Visited,
            2 => MarkCode::Finished,
            _ => panic!("corrupt mark code: {raw}"),
        }
    }
}

// Arena record layout. A gate with n inputs occupies
//
//     [Out record n-1] ... [Out record 0] [header] [In slot 0] ... [In slot n-1]
//
// and its GateRef addresses the header. Out record i is the reverse edge of
// In slot i and lives at `header - (i + 1) * OUT_BYTES`; the records of all
// users of a gate form an intrusive doubly-linked list threaded through
// absolute arena offsets, headed by the producer's `first_out` field.

/// In slot: absolute header offset of the input gate, `NULL_OFFSET` if the
/// slot is a hole.
pub(crate) const IN_BYTES: u32 = 4;

/// Out record: `{ index: u32, next: u32, prev: u32 }`, offsets absolute.
pub(crate) const OUT_BYTES: u32 = 12;

/// Header: id (u32), opcode (u8), machine type (u8), stamp (u8), mark (u8),
/// gate type (u32), first_out (u32), bitfield (u64).
pub(crate) const HEADER_BYTES: u32 = 24;

pub(crate) const NULL_OFFSET: u32 = u32::MAX;

// Field offsets within the header.
pub(crate) const HDR_ID: u32 = 0;
pub(crate) const HDR_OPCODE: u32 = 4;
pub(crate) const HDR_MACHINE_TYPE: u32 = 5;
pub(crate) const HDR_STAMP: u32 = 6;
pub(crate) const HDR_MARK: u32 = 7;
pub(crate) const HDR_GATE_TYPE: u32 = 8;
pub(crate) const HDR_FIRST_OUT: u32 = 12;
pub(crate) const HDR_BITFIELD: u32 = 16;

// Field offsets within an out record.
pub(crate) const OUT_INDEX: u32 = 0;
pub(crate) const OUT_NEXT: u32 = 4;
pub(crate) const OUT_PREV: u32 = 8;

const_assert_eq!(HDR_BITFIELD + 8, HEADER_BYTES);
const_assert_eq!(OUT_PREV + 4, OUT_BYTES);

/// Total arena bytes occupied by a gate with `num_ins` inputs.
pub(crate) const fn gate_size(num_ins: usize) -> usize {
    num_ins * (OUT_BYTES as usize + IN_BYTES as usize) + HEADER_BYTES as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(gate_size(0), 24);
        assert_eq!(gate_size(1), 40);
        assert_eq!(gate_size(4), 88);
    }

    #[test]
    fn null_ref() {
        assert!(GateRef::NULL.is_null());
        assert!(!GateRef(0).is_null());
        assert_eq!(format!("{:?}", GateRef::NULL), "GateRef(NULL)");
    }
}
