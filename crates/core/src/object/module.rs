//! Module objects.
//!
//! A module owns an indexed globals store (bytecode addresses globals by
//! slot, names are interned to slots on first reference), an export map,
//! and an execution state the import sequencing relies on: a module seen
//! in `Executing` state hands out its partial exports instead of being
//! re-entered, which is what makes cyclic imports terminate.

use hashbrown::HashMap;

use crate::memory::Tracer;
use crate::value::Value;

use super::{Gc, GcHeader, HeapObject, ObjProto, ObjString, ObjectKind};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ModuleState {
    Loading,
    Executing,
    Executed,
}

#[repr(C)]
pub struct ObjModule {
    header: GcHeader,
    name: Gc<ObjString>,
    path: Gc<ObjString>,
    main_proto: Option<Gc<ObjProto>>,
    globals: Vec<Value>,
    global_names: HashMap<Gc<ObjString>, u32>,
    exports: HashMap<Gc<ObjString>, Value>,
    state: ModuleState,
}

impl ObjModule {
    pub fn new(name: Gc<ObjString>, path: Gc<ObjString>, main_proto: Option<Gc<ObjProto>>) -> Self {
        ObjModule {
            header: GcHeader::new(ObjectKind::Module),
            name,
            path,
            main_proto,
            globals: Vec::new(),
            global_names: HashMap::new(),
            exports: HashMap::new(),
            state: ModuleState::Loading,
        }
    }

    #[inline(always)]
    pub fn name(&self) -> Gc<ObjString> {
        self.name
    }

    #[inline(always)]
    pub fn path(&self) -> Gc<ObjString> {
        self.path
    }

    #[inline(always)]
    pub fn main_proto(&self) -> Option<Gc<ObjProto>> {
        self.main_proto
    }

    // --- Execution state ---

    #[inline(always)]
    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn set_state(&mut self, state: ModuleState) {
        self.state = state;
    }

    // --- Globals ---

    /// Slot for `name`, creating one (initialized to the valueless
    /// sentinel) on first reference.
    pub fn intern_global(&mut self, name: Gc<ObjString>) -> u32 {
        if let Some(&index) = self.global_names.get(&name) {
            return index;
        }
        let index = self.globals.len() as u32;
        self.globals.push(Value::valueless());
        self.global_names.insert(name, index);
        index
    }

    #[inline(always)]
    pub fn global_by_index(&self, index: u32) -> Value {
        self.globals[index as usize]
    }

    #[inline(always)]
    pub fn set_global_by_index(&mut self, index: u32, value: Value) {
        self.globals[index as usize] = value;
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    /// Name of the global occupying `index`, for diagnostics.
    pub fn global_name(&self, index: u32) -> Option<Gc<ObjString>> {
        self.global_names
            .iter()
            .find(|&(_, &i)| i == index)
            .map(|(&n, _)| n)
    }

    pub fn set_global(&mut self, name: Gc<ObjString>, value: Value) {
        let index = self.intern_global(name);
        self.globals[index as usize] = value;
    }

    pub fn get_global(&self, name: Gc<ObjString>) -> Option<Value> {
        self.global_names
            .get(&name)
            .map(|&i| self.globals[i as usize])
    }

    /// Copies every named global of `other` into this module,
    /// last-writer-wins. Used to inject builtin registries.
    pub fn import_all_globals(&mut self, other: &ObjModule) {
        for (&name, &index) in other.global_names.iter() {
            self.set_global(name, other.globals[index as usize]);
        }
    }

    // --- Exports ---

    pub fn set_export(&mut self, name: Gc<ObjString>, value: Value) {
        self.exports.insert(name, value);
    }

    pub fn get_export(&self, name: Gc<ObjString>) -> Option<Value> {
        self.exports.get(&name).copied()
    }

    pub fn has_export(&self, name: Gc<ObjString>) -> bool {
        self.exports.contains_key(&name)
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn exports(&self) -> impl Iterator<Item = (Gc<ObjString>, Value)> + '_ {
        self.exports.iter().map(|(&k, &v)| (k, v))
    }

    /// Merges `other`'s exports into this module's globals,
    /// last-writer-wins (the IMPORT_ALL instruction).
    pub fn import_all_exports(&mut self, other: &ObjModule) {
        for (&name, &value) in other.exports.iter() {
            self.set_global(name, value);
        }
    }
}

impl HeapObject for ObjModule {
    const KIND: ObjectKind = ObjectKind::Module;

    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit_object(self.name.erased());
        tracer.visit_object(self.path.erased());
        if let Some(proto) = self.main_proto {
            tracer.visit_object(proto.erased());
        }
        for &global in &self.globals {
            tracer.visit_value(global);
        }
        for (&name, &value) in self.exports.iter() {
            tracer.visit_object(name.erased());
            tracer.visit_value(value);
        }
        for &name in self.global_names.keys() {
            tracer.visit_object(name.erased());
        }
    }
}
