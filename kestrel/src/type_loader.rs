//! The external type-information interface consumed by type inference and
//! type lowering. The core never owns type tables; it resolves opaque
//! [`GateType`] handles through this trait.

use hashbrown::HashMap;

use crate::bytecode::StringId;
use crate::ir::gate_type::GateType;

pub trait TypeLoader {
    /// Element type of an array-kind handle.
    fn array_element_type(&self, ty: GateType) -> GateType;

    /// Return type of a function-kind handle.
    fn function_return_type(&self, ty: GateType) -> GateType;

    /// Type of the named property of an object/class-kind handle.
    fn property_type(&self, ty: GateType, key: StringId) -> GateType;

    /// The union of `parts`, collapsing duplicates; `AnyType` is absorbing.
    fn union_of(&mut self, parts: &[GateType]) -> GateType;

    /// Resolves a string index to a type handle, if one is registered.
    fn type_by_string_id(&self, id: StringId) -> Option<GateType>;

    /// Hidden-class table index of a class-kind handle, when the class has
    /// been snapshotted for fast object construction.
    fn class_hclass_index(&self, ty: GateType) -> Option<u64>;
}

/// In-memory [`TypeLoader`] for embedding and tests.
#[derive(Debug, Default)]
pub struct SimpleTypeLoader {
    array_elements: HashMap<u32, GateType>,
    function_returns: HashMap<u32, GateType>,
    properties: HashMap<(u32, StringId), GateType>,
    named: HashMap<StringId, GateType>,
    hclass_indices: HashMap<u32, u64>,
    unions: Vec<Vec<GateType>>,
}

impl SimpleTypeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an array type and returns its handle.
    pub fn add_array(&mut self, element: GateType) -> GateType {
        let index = self.array_elements.len() as u32;
        self.array_elements.insert(index, element);
        GateType::array(index)
    }

    pub fn add_function(&mut self, return_type: GateType) -> GateType {
        let index = self.function_returns.len() as u32;
        self.function_returns.insert(index, return_type);
        GateType::function(index)
    }

    pub fn add_class(&mut self, hclass_index: u64) -> GateType {
        let index = self.hclass_indices.len() as u32;
        self.hclass_indices.insert(index, hclass_index);
        GateType::class(index)
    }

    pub fn set_property(&mut self, object: GateType, key: StringId, ty: GateType) {
        self.properties.insert((object.index(), key), ty);
    }

    pub fn set_named_type(&mut self, id: StringId, ty: GateType) {
        self.named.insert(id, ty);
    }

    pub fn union_members(&self, ty: GateType) -> Option<&[GateType]> {
        self.unions.get(ty.index() as usize).map(Vec::as_slice)
    }
}

impl TypeLoader for SimpleTypeLoader {
    fn array_element_type(&self, ty: GateType) -> GateType {
        self.array_elements
            .get(&ty.index())
            .copied()
            .unwrap_or_else(GateType::any)
    }

    fn function_return_type(&self, ty: GateType) -> GateType {
        self.function_returns
            .get(&ty.index())
            .copied()
            .unwrap_or_else(GateType::any)
    }

    fn property_type(&self, ty: GateType, key: StringId) -> GateType {
        self.properties
            .get(&(ty.index(), key))
            .copied()
            .unwrap_or_else(GateType::any)
    }

    fn union_of(&mut self, parts: &[GateType]) -> GateType {
        let mut members: Vec<GateType> = Vec::new();
        for &part in parts {
            if part.is_any() {
                return GateType::any();
            }
            if !members.contains(&part) {
                members.push(part);
            }
        }
        match members.len() {
            0 => GateType::any(),
            1 => members[0],
            _ => {
                if let Some(existing) = self.unions.iter().position(|m| *m == members) {
                    return GateType::union(existing as u32);
                }
                self.unions.push(members);
                GateType::union((self.unions.len() - 1) as u32)
            }
        }
    }

    fn type_by_string_id(&self, id: StringId) -> Option<GateType> {
        self.named.get(&id).copied()
    }

    fn class_hclass_index(&self, ty: GateType) -> Option<u64> {
        self.hclass_indices.get(&ty.index()).copied()
    }
}
