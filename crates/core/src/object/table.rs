//! Hash table objects.
//!
//! Keys are interned strings, so hashing the pointer address and comparing
//! by identity is exact. The probing itself is hashbrown's SIMD scheme;
//! control bytes and slots are already laid out for cache efficiency there,
//! so this object is a thin wrapper.

use hashbrown::HashMap;

use crate::memory::Tracer;
use crate::value::Value;

use super::{Gc, GcHeader, HeapObject, ObjString, ObjectKind};

#[repr(C)]
pub struct ObjTable {
    header: GcHeader,
    entries: HashMap<Gc<ObjString>, Value>,
}

impl ObjTable {
    pub fn new() -> Self {
        ObjTable {
            header: GcHeader::new(ObjectKind::Table),
            entries: HashMap::new(),
        }
    }

    #[inline]
    pub fn get(&self, key: Gc<ObjString>) -> Option<Value> {
        self.entries.get(&key).copied()
    }

    #[inline]
    pub fn set(&mut self, key: Gc<ObjString>, value: Value) {
        self.entries.insert(key, value);
    }

    #[inline]
    pub fn contains(&self, key: Gc<ObjString>) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn remove(&mut self, key: Gc<ObjString>) -> Option<Value> {
        self.entries.remove(&key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc<ObjString>, Value)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }
}

impl Default for ObjTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapObject for ObjTable {
    const KIND: ObjectKind = ObjectKind::Table;

    fn trace(&self, tracer: &mut Tracer) {
        for (key, value) in self.entries.iter() {
            tracer.visit_object(key.erased());
            tracer.visit_value(*value);
        }
    }
}
