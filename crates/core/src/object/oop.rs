//! Classes, instances and bound methods.

use crate::memory::Tracer;
use crate::value::Value;

use super::{Gc, GcHeader, HeapObject, ObjString, ObjectKind, Shape};

/// A class: a name, an optional superclass and a flat method table.
/// Method lookup along the superclass chain is the interpreter's job.
#[repr(C)]
pub struct ObjClass {
    header: GcHeader,
    name: Gc<ObjString>,
    superclass: Option<Gc<ObjClass>>,
    methods: Vec<(Gc<ObjString>, Value)>,
}

impl ObjClass {
    pub fn new(name: Gc<ObjString>) -> Self {
        ObjClass {
            header: GcHeader::new(ObjectKind::Class),
            name,
            superclass: None,
            methods: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn name(&self) -> Gc<ObjString> {
        self.name
    }

    #[inline(always)]
    pub fn superclass(&self) -> Option<Gc<ObjClass>> {
        self.superclass
    }

    pub fn set_superclass(&mut self, superclass: Gc<ObjClass>) {
        self.superclass = Some(superclass);
    }

    #[inline]
    pub fn get_method(&self, name: Gc<ObjString>) -> Option<Value> {
        self.methods
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, m)| m)
    }

    pub fn set_method(&mut self, name: Gc<ObjString>, method: Value) {
        if let Some(slot) = self.methods.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = method;
        } else {
            self.methods.push((name, method));
        }
    }

    /// Walks this class and its ancestors for `name`.
    pub fn resolve_method(&self, name: Gc<ObjString>) -> Option<Value> {
        if let Some(m) = self.get_method(name) {
            return Some(m);
        }
        let mut class = self.superclass;
        while let Some(k) = class {
            if let Some(m) = k.get_method(name) {
                return Some(m);
            }
            class = k.superclass;
        }
        None
    }
}

impl HeapObject for ObjClass {
    const KIND: ObjectKind = ObjectKind::Class;

    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit_object(self.name.erased());
        if let Some(superclass) = self.superclass {
            tracer.visit_object(superclass.erased());
        }
        for &(name, method) in &self.methods {
            tracer.visit_object(name.erased());
            tracer.visit_value(method);
        }
    }
}

/// An instance: its class, its current shape, and the field buffer the
/// shape describes. `fields.len() == shape.field_count()` always.
#[repr(C)]
pub struct ObjInstance {
    header: GcHeader,
    class: Gc<ObjClass>,
    shape: Gc<Shape>,
    fields: Vec<Value>,
}

impl ObjInstance {
    pub fn new(class: Gc<ObjClass>, empty_shape: Gc<Shape>) -> Self {
        debug_assert_eq!(empty_shape.field_count(), 0);
        ObjInstance {
            header: GcHeader::new(ObjectKind::Instance),
            class,
            shape: empty_shape,
            fields: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn class(&self) -> Gc<ObjClass> {
        self.class
    }

    #[inline(always)]
    pub fn shape(&self) -> Gc<Shape> {
        self.shape
    }

    #[inline(always)]
    pub fn field(&self, offset: u32) -> Value {
        self.fields[offset as usize]
    }

    #[inline(always)]
    pub fn set_field(&mut self, offset: u32, value: Value) {
        self.fields[offset as usize] = value;
    }

    #[inline(always)]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Moves to the successor shape and appends the new property's value.
    /// Keeps the buffer length equal to the shape's field count.
    #[inline]
    pub fn transition(&mut self, successor: Gc<Shape>, value: Value) {
        debug_assert_eq!(successor.field_count() as usize, self.fields.len() + 1);
        self.shape = successor;
        self.fields.push(value);
    }

    /// Slow-path read by name, via the shape's offset table.
    pub fn get_property(&self, name: Gc<ObjString>) -> Option<Value> {
        self.shape.get_offset(name).map(|off| self.field(off))
    }
}

impl HeapObject for ObjInstance {
    const KIND: ObjectKind = ObjectKind::Instance;

    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit_object(self.class.erased());
        tracer.visit_object(self.shape.erased());
        for &field in &self.fields {
            tracer.visit_value(field);
        }
    }
}

/// A method extracted from an instance: remembers the receiver so a later
/// call can restore `self`. The method slot is a closure or a native.
#[repr(C)]
pub struct ObjBoundMethod {
    header: GcHeader,
    receiver: Value,
    method: Value,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: Value) -> Self {
        ObjBoundMethod {
            header: GcHeader::new(ObjectKind::BoundMethod),
            receiver,
            method,
        }
    }

    #[inline(always)]
    pub fn receiver(&self) -> Value {
        self.receiver
    }

    #[inline(always)]
    pub fn method(&self) -> Value {
        self.method
    }
}

impl HeapObject for ObjBoundMethod {
    const KIND: ObjectKind = ObjectKind::BoundMethod;

    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit_value(self.receiver);
        tracer.visit_value(self.method);
    }
}
