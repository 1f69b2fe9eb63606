//! Function prototypes, closures and upvalues.

use crate::bytecode::Chunk;
use crate::memory::Tracer;
use crate::value::Value;

use super::{Gc, GcHeader, HeapObject, ObjModule, ObjString, ObjectKind};

/// How a closure resolves one captured variable at creation time:
/// either a local register of the enclosing frame, or an upvalue the
/// enclosing closure already carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u32,
}

/// An immutable function prototype: code, constants and metadata. The
/// loader builds protos; the interpreter only reads them (inline-cache
/// slots inside the chunk are the one sanctioned exception).
#[repr(C)]
pub struct ObjProto {
    header: GcHeader,
    name: Option<Gc<ObjString>>,
    num_registers: u32,
    upvalue_descs: Vec<UpvalueDesc>,
    chunk: Chunk,
    module: Option<Gc<ObjModule>>,
}

impl ObjProto {
    pub fn new(
        num_registers: u32,
        name: Option<Gc<ObjString>>,
        chunk: Chunk,
        upvalue_descs: Vec<UpvalueDesc>,
    ) -> Self {
        ObjProto {
            header: GcHeader::new(ObjectKind::Proto),
            name,
            num_registers,
            upvalue_descs,
            chunk,
            module: None,
        }
    }

    #[inline(always)]
    pub fn num_registers(&self) -> u32 {
        self.num_registers
    }

    #[inline(always)]
    pub fn num_upvalues(&self) -> u32 {
        self.upvalue_descs.len() as u32
    }

    #[inline(always)]
    pub fn upvalue_desc(&self, index: usize) -> UpvalueDesc {
        self.upvalue_descs[index]
    }

    #[inline(always)]
    pub fn name(&self) -> Option<Gc<ObjString>> {
        self.name
    }

    #[inline(always)]
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    #[inline(always)]
    pub fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.chunk
    }

    #[inline(always)]
    pub fn module(&self) -> Option<Gc<ObjModule>> {
        self.module
    }

    pub fn set_module(&mut self, module: Gc<ObjModule>) {
        self.module = Some(module);
    }
}

impl HeapObject for ObjProto {
    const KIND: ObjectKind = ObjectKind::Proto;

    fn trace(&self, tracer: &mut Tracer) {
        if let Some(name) = self.name {
            tracer.visit_object(name.erased());
        }
        if let Some(module) = self.module {
            tracer.visit_object(module.erased());
        }
        for &constant in self.chunk.constants() {
            tracer.visit_value(constant);
        }
    }
}

/// A captured variable. Open while the frame that owns the register is
/// still live (the upvalue then names a stack slot); closed once the slot
/// is about to die, after which the upvalue owns the value.
#[repr(C)]
pub struct ObjUpvalue {
    header: GcHeader,
    state: UpvalueState,
}

enum UpvalueState {
    Open(usize),
    Closed(Value),
}

impl ObjUpvalue {
    pub fn open(stack_index: usize) -> Self {
        ObjUpvalue {
            header: GcHeader::new(ObjectKind::Upvalue),
            state: UpvalueState::Open(stack_index),
        }
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, UpvalueState::Closed(_))
    }

    /// Stack index of an open upvalue. Panics if closed.
    #[inline(always)]
    pub fn stack_index(&self) -> usize {
        match self.state {
            UpvalueState::Open(index) => index,
            UpvalueState::Closed(_) => panic!("closed upvalue has no stack index"),
        }
    }

    /// The owned value of a closed upvalue. Panics if open.
    #[inline(always)]
    pub fn closed_value(&self) -> Value {
        match self.state {
            UpvalueState::Closed(value) => value,
            UpvalueState::Open(_) => panic!("open upvalue owns no value"),
        }
    }

    /// Copies `value` out of the stack and takes ownership. Idempotent in
    /// effect: closing an already-closed upvalue just replaces the value.
    #[inline]
    pub fn close(&mut self, value: Value) {
        self.state = UpvalueState::Closed(value);
    }
}

impl HeapObject for ObjUpvalue {
    const KIND: ObjectKind = ObjectKind::Upvalue;

    fn trace(&self, tracer: &mut Tracer) {
        if let UpvalueState::Closed(value) = self.state {
            tracer.visit_value(value);
        }
    }
}

/// A proto bound to its captured upvalues.
#[repr(C)]
pub struct ObjClosure {
    header: GcHeader,
    proto: Gc<ObjProto>,
    upvalues: Vec<Gc<ObjUpvalue>>,
}

impl ObjClosure {
    /// The upvalue vector starts empty and is filled by the CLOSURE
    /// handler before the closure becomes visible to bytecode.
    pub fn new(proto: Gc<ObjProto>) -> Self {
        ObjClosure {
            header: GcHeader::new(ObjectKind::Closure),
            proto,
            upvalues: Vec::with_capacity(proto.num_upvalues() as usize),
        }
    }

    #[inline(always)]
    pub fn proto(&self) -> Gc<ObjProto> {
        self.proto
    }

    #[inline(always)]
    pub fn upvalue(&self, index: usize) -> Gc<ObjUpvalue> {
        self.upvalues[index]
    }

    pub fn push_upvalue(&mut self, upvalue: Gc<ObjUpvalue>) {
        self.upvalues.push(upvalue);
    }

    #[inline(always)]
    pub fn upvalues(&self) -> &[Gc<ObjUpvalue>] {
        &self.upvalues
    }
}

impl HeapObject for ObjClosure {
    const KIND: ObjectKind = ObjectKind::Closure;

    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit_object(self.proto.erased());
        for &upvalue in &self.upvalues {
            tracer.visit_object(upvalue.erased());
        }
    }
}
