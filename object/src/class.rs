use parking_lot::RwLock;

use crate::{Value, ValueKind};

/// Index into the machine's class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ClassId(pub u32);

/// Index into the assembly's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

/// Identity of an interface declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InterfaceId(pub u32);

/// Element kind of a variable-length class (array or string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Int,
    Float,
    Ref,
    /// UTF-8 string payload, one byte per element.
    Byte,
}

impl ElementKind {
    #[inline(always)]
    pub const fn byte_size(self) -> usize {
        match self {
            ElementKind::Byte => 1,
            _ => 8,
        }
    }

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        matches!(self, ElementKind::Ref)
    }
}

/// Method table for one implemented interface, resolved at load time so
/// interface dispatch is a slot lookup rather than a search.
#[derive(Debug, Clone)]
pub struct InterfaceTable {
    pub interface: InterfaceId,
    pub methods: Vec<FunctionId>,
}

/// Per-type metadata: layout, reference offsets for tracing, single base
/// class, virtual and interface dispatch tables, static storage.
///
/// Immutable after load except for `statics`, which user code writes through
/// `StoreStatic` and the collector reads as roots.
#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub base: Option<ClassId>,
    /// Full instance layout including inherited fields, one 8-byte slot per
    /// entry. Empty for variable-length classes.
    pub fields: Vec<ValueKind>,
    /// Byte offsets (into the payload) of fields holding heap references.
    pub reference_offsets: Vec<u32>,
    pub vtable: Vec<FunctionId>,
    pub interfaces: Vec<InterfaceTable>,
    pub element: Option<ElementKind>,
    /// Declared kinds of the static slots, for the verifier.
    pub static_kinds: Vec<ValueKind>,
    pub statics: RwLock<Vec<Value>>,
}

impl Class {
    pub fn new(
        id: ClassId,
        name: impl Into<String>,
        base: Option<ClassId>,
        fields: Vec<ValueKind>,
        element: Option<ElementKind>,
        static_kinds: &[ValueKind],
    ) -> Self {
        let reference_offsets = fields
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_ref())
            .map(|(i, _)| (i * 8) as u32)
            .collect();
        let statics = static_kinds
            .iter()
            .map(|k| match k {
                ValueKind::Int => Value::Int(0),
                ValueKind::Float => Value::Float(0.0),
                ValueKind::Ref => Value::NULL,
            })
            .collect();
        Self {
            id,
            name: name.into(),
            base,
            fields,
            reference_offsets,
            vtable: Vec::new(),
            interfaces: Vec::new(),
            element,
            static_kinds: static_kinds.to_vec(),
            statics: RwLock::new(statics),
        }
    }

    #[inline]
    pub fn is_variable_length(&self) -> bool {
        self.element.is_some()
    }

    /// Fixed payload size of a plain instance.
    #[inline]
    pub fn instance_size(&self) -> usize {
        self.fields.len() * 8
    }

    /// Payload size for an instance with the given element count, rounded
    /// up so the next object in the arena stays 8-aligned.
    pub fn payload_size(&self, length: u32) -> usize {
        match self.element {
            None => self.instance_size(),
            Some(kind) => {
                (kind.byte_size() * length as usize).next_multiple_of(8)
            }
        }
    }

    #[inline]
    pub fn field_kind(&self, slot: usize) -> ValueKind {
        self.fields[slot]
    }
}

/// The immutable set of classes loaded from an assembly.
#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<Class>,
}

impl ClassTable {
    pub fn new(classes: Vec<Class>) -> Self {
        debug_assert!(
            classes.iter().enumerate().all(|(i, c)| c.id.0 as usize == i),
            "class ids must match table positions"
        );
        Self { classes }
    }

    #[inline]
    pub fn get(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter()
    }

    /// Whether `sub` is `superclass` or derives from it, walking the single
    /// inheritance chain.
    pub fn is_assignable(&self, sub: ClassId, superclass: ClassId) -> bool {
        let mut cursor = Some(sub);
        while let Some(id) = cursor {
            if id == superclass {
                return true;
            }
            cursor = self.get(id).base;
        }
        false
    }

    #[inline]
    pub fn virtual_target(&self, class: ClassId, slot: usize) -> FunctionId {
        self.get(class).vtable[slot]
    }

    pub fn interface_target(
        &self,
        class: ClassId,
        interface: InterfaceId,
        slot: usize,
    ) -> Option<FunctionId> {
        self.get(class)
            .interfaces
            .iter()
            .find(|t| t.interface == interface)
            .map(|t| t.methods[slot])
    }
}
