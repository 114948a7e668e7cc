use core::fmt;

use serde::{Deserialize, Serialize};

/// Abstract (language-level) type annotation carried by a gate.
///
/// A `GateType` is a 32-bit handle: the top three bits select a kind, the
/// rest is either a builtin tag or an index into tables owned by the
/// external type loader. The IR never interprets external indices itself.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GateType(u32);

const KIND_SHIFT: u32 = 29;
const INDEX_MASK: u32 = (1 << KIND_SHIFT) - 1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum TypeKind {
    Builtin = 0,
    Class,
    ClassInstance,
    Object,
    Array,
    Function,
    Union,
}

// Builtin tags (kind = Builtin).
const EMPTY: u32 = 0;
const ANY: u32 = 1;
const NUMBER: u32 = 2;
const BOOLEAN: u32 = 3;
const STRING: u32 = 4;
const UNDEFINED: u32 = 5;
const NULL: u32 = 6;
const SYMBOL: u32 = 7;

impl GateType {
    const fn builtin(tag: u32) -> Self {
        GateType(tag)
    }

    const fn tagged(kind: TypeKind, index: u32) -> Self {
        GateType(((kind as u32) << KIND_SHIFT) | (index & INDEX_MASK))
    }

    pub const fn empty() -> Self {
        Self::builtin(EMPTY)
    }

    pub const fn any() -> Self {
        Self::builtin(ANY)
    }

    pub const fn number() -> Self {
        Self::builtin(NUMBER)
    }

    pub const fn boolean() -> Self {
        Self::builtin(BOOLEAN)
    }

    pub const fn string() -> Self {
        Self::builtin(STRING)
    }

    pub const fn undefined() -> Self {
        Self::builtin(UNDEFINED)
    }

    pub const fn null_type() -> Self {
        Self::builtin(NULL)
    }

    pub const fn symbol() -> Self {
        Self::builtin(SYMBOL)
    }

    pub const fn class(index: u32) -> Self {
        Self::tagged(TypeKind::Class, index)
    }

    pub const fn class_instance(index: u32) -> Self {
        Self::tagged(TypeKind::ClassInstance, index)
    }

    pub const fn object(index: u32) -> Self {
        Self::tagged(TypeKind::Object, index)
    }

    pub const fn array(index: u32) -> Self {
        Self::tagged(TypeKind::Array, index)
    }

    pub const fn function(index: u32) -> Self {
        Self::tagged(TypeKind::Function, index)
    }

    pub const fn union(index: u32) -> Self {
        Self::tagged(TypeKind::Union, index)
    }

    pub fn kind(self) -> TypeKind {
        match self.0 >> KIND_SHIFT {
            0 => TypeKind::Builtin,
            1 => TypeKind::Class,
            2 => TypeKind::ClassInstance,
            3 => TypeKind::Object,
            4 => TypeKind::Array,
            5 => TypeKind::Function,
            6 => TypeKind::Union,
            k => panic!("corrupt gate type kind: {k}"),
        }
    }

    /// The loader-owned index of a non-builtin handle.
    pub const fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    pub fn is_empty_type(self) -> bool {
        self == Self::empty()
    }

    pub fn is_any(self) -> bool {
        self == Self::any()
    }

    pub fn is_number(self) -> bool {
        self == Self::number()
    }

    pub fn is_boolean(self) -> bool {
        self == Self::boolean()
    }

    pub fn is_string(self) -> bool {
        self == Self::string()
    }

    pub fn is_undefined(self) -> bool {
        self == Self::undefined()
    }

    pub fn is_class_kind(self) -> bool {
        self.kind() == TypeKind::Class
    }

    pub fn is_array_kind(self) -> bool {
        self.kind() == TypeKind::Array
    }

    pub fn is_function_kind(self) -> bool {
        self.kind() == TypeKind::Function
    }

    pub fn is_object_kind(self) -> bool {
        self.kind() == TypeKind::Object
    }

    pub(crate) const fn to_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_u32(raw: u32) -> Self {
        GateType(raw)
    }
}

impl fmt::Debug for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind(), self.0) {
            (TypeKind::Builtin, EMPTY) => write!(f, "EMPTY"),
            (TypeKind::Builtin, ANY) => write!(f, "ANY_TYPE"),
            (TypeKind::Builtin, NUMBER) => write!(f, "NUMBER"),
            (TypeKind::Builtin, BOOLEAN) => write!(f, "BOOLEAN"),
            (TypeKind::Builtin, STRING) => write!(f, "STRING"),
            (TypeKind::Builtin, UNDEFINED) => write!(f, "UNDEFINED"),
            (TypeKind::Builtin, NULL) => write!(f, "NULL"),
            (TypeKind::Builtin, SYMBOL) => write!(f, "SYMBOL"),
            (TypeKind::Builtin, other) => write!(f, "BUILTIN-{other}"),
            (kind, _) => write!(f, "{:?}-{}", kind, self.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_predicates() {
        assert!(GateType::any().is_any());
        assert!(GateType::number().is_number());
        assert!(!GateType::number().is_any());
        assert!(GateType::empty().is_empty_type());
    }

    #[test]
    fn tagged_handles_keep_kind_and_index() {
        let t = GateType::array(12345);
        assert!(t.is_array_kind());
        assert_eq!(t.index(), 12345);
        assert_ne!(t, GateType::object(12345));
        assert_eq!(GateType::class(7).kind(), TypeKind::Class);
    }
}
