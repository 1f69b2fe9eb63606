//! Generational mark-and-sweep collector.
//!
//! Objects are born young. A collection marks everything reachable from
//! the roots (value stack, call frames, open upvalues, loaded modules,
//! remembered set, permanents), then either sweeps only the young
//! generation — survivors are promoted to old — or, when the old
//! generation has outgrown its threshold, sweeps both. There is no
//! compaction; addresses are stable for an object's whole life.
//!
//! The write barrier records old objects that had a young reference stored
//! into them; those are extra roots for the next young collection, and the
//! set is cleared once a collection has consumed it.

use tracing::debug;

use crate::context::ExecutionContext;
use crate::object::{
    Gc, GcFlags, GcHeader, HeapObject, ObjArray, ObjBoundMethod, ObjClass, ObjClosure,
    ObjInstance, ObjModule, ObjProto, ObjTable, ObjUpvalue, ObjectKind, Shape,
};
use crate::value::Value;

use super::heap::Heap;

/// Mark-phase worklist. Objects are marked when pushed, so each is visited
/// exactly once per collection.
pub struct Tracer {
    gray: Vec<Gc<GcHeader>>,
}

impl Tracer {
    pub(crate) fn new() -> Self {
        Tracer { gray: Vec::with_capacity(64) }
    }

    #[inline]
    pub fn visit_value(&mut self, value: Value) {
        if value.is_object() {
            self.visit_object(value.as_object());
        }
    }

    #[inline]
    pub fn visit_object(&mut self, object: Gc<GcHeader>) {
        let mut header = object;
        if !header.flags.contains(GcFlags::MARKED) {
            header.flags.insert(GcFlags::MARKED);
            self.gray.push(object);
        }
    }

    fn drain(&mut self) {
        while let Some(object) = self.gray.pop() {
            trace_children(object, self);
        }
    }
}

/// Dispatches to the typed `trace` impl behind a header pointer.
fn trace_children(object: Gc<GcHeader>, tracer: &mut Tracer) {
    // Safety: the kind tag is written once at construction and the
    // downcast target layouts all start with the header.
    unsafe {
        match object.kind() {
            ObjectKind::String => {}
            ObjectKind::Array => object.downcast::<ObjArray>().trace(tracer),
            ObjectKind::Table => object.downcast::<ObjTable>().trace(tracer),
            ObjectKind::Class => object.downcast::<ObjClass>().trace(tracer),
            ObjectKind::Instance => object.downcast::<ObjInstance>().trace(tracer),
            ObjectKind::Shape => object.downcast::<Shape>().trace(tracer),
            ObjectKind::BoundMethod => object.downcast::<ObjBoundMethod>().trace(tracer),
            ObjectKind::Upvalue => object.downcast::<ObjUpvalue>().trace(tracer),
            ObjectKind::Proto => object.downcast::<ObjProto>().trace(tracer),
            ObjectKind::Closure => object.downcast::<ObjClosure>().trace(tracer),
            ObjectKind::Module => object.downcast::<ObjModule>().trace(tracer),
        }
    }
}

/// Runs the typed destructor of a dead object.
unsafe fn drop_object(header: *mut GcHeader) {
    unsafe {
        match (*header).kind() {
            // Strings are inline data only.
            ObjectKind::String => {}
            ObjectKind::Array => std::ptr::drop_in_place(header as *mut ObjArray),
            ObjectKind::Table => std::ptr::drop_in_place(header as *mut ObjTable),
            ObjectKind::Class => std::ptr::drop_in_place(header as *mut ObjClass),
            ObjectKind::Instance => std::ptr::drop_in_place(header as *mut ObjInstance),
            ObjectKind::Shape => std::ptr::drop_in_place(header as *mut Shape),
            ObjectKind::BoundMethod => {}
            ObjectKind::Upvalue => {}
            ObjectKind::Proto => std::ptr::drop_in_place(header as *mut ObjProto),
            ObjectKind::Closure => std::ptr::drop_in_place(header as *mut ObjClosure),
            ObjectKind::Module => std::ptr::drop_in_place(header as *mut ObjModule),
        }
    }
}

pub(crate) struct GenerationalGc {
    young_head: *mut GcHeader,
    old_head: *mut GcHeader,
    perm_head: *mut GcHeader,

    remembered: Vec<Gc<GcHeader>>,
    module_roots: Vec<Gc<ObjModule>>,
    context: *const ExecutionContext,

    young_count: usize,
    old_count: usize,
    old_threshold: usize,

    collections: u64,
    full_collections: u64,
}

const INITIAL_OLD_THRESHOLD: usize = 1024;

impl GenerationalGc {
    pub fn new() -> Self {
        GenerationalGc {
            young_head: std::ptr::null_mut(),
            old_head: std::ptr::null_mut(),
            perm_head: std::ptr::null_mut(),
            remembered: Vec::new(),
            module_roots: Vec::new(),
            context: std::ptr::null(),
            young_count: 0,
            old_count: 0,
            old_threshold: INITIAL_OLD_THRESHOLD,
            collections: 0,
            full_collections: 0,
        }
    }

    /// Installs the execution context whose stack and frames are roots.
    pub fn set_context(&mut self, context: *const ExecutionContext) {
        self.context = context;
    }

    pub fn add_module_root(&mut self, module: Gc<ObjModule>) {
        self.module_roots.push(module);
    }

    /// Links a freshly allocated object into the young generation.
    pub fn register_object(&mut self, object: Gc<GcHeader>) {
        let mut header = object;
        header.next = self.young_head;
        header.flags = GcFlags::empty();
        self.young_head = object.as_ptr();
        self.young_count += 1;
    }

    /// Links an object into the permanent list: never swept, always
    /// treated as marked, its children traced every cycle.
    pub fn register_permanent(&mut self, object: Gc<GcHeader>) {
        let mut header = object;
        header.next = self.perm_head;
        header.flags = GcFlags::OLD | GcFlags::MARKED | GcFlags::PERMANENT;
        self.perm_head = object.as_ptr();
    }

    /// Write barrier: an old object that received a young reference
    /// joins the remembered set. No-op for young owners; stack writes
    /// never come through here (the stack is a root).
    #[inline]
    pub fn write_barrier(&mut self, owner: Gc<GcHeader>, value: Value) {
        if !owner.flags.contains(GcFlags::OLD) {
            return;
        }
        if let Some(target) = value.try_object() {
            if !target.flags.contains(GcFlags::OLD) {
                self.remembered.push(owner);
            }
        }
    }

    #[inline]
    pub fn remembers(&self, owner: Gc<GcHeader>) -> bool {
        self.remembered.contains(&owner)
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn full_collections(&self) -> u64 {
        self.full_collections
    }

    pub fn live_objects(&self) -> usize {
        self.young_count + self.old_count
    }

    /// One collection cycle. Returns the number of live (non-permanent)
    /// objects afterwards.
    pub fn collect(&mut self, heap: &mut Heap) -> usize {
        let mut tracer = Tracer::new();

        // Roots: context, loaded modules, remembered set, permanents.
        if !self.context.is_null() {
            // Safety: the machine keeps the context alive for as long as
            // this collector exists.
            unsafe { (*self.context).trace(&mut tracer) };
        }
        for &module in &self.module_roots {
            tracer.visit_object(module.erased());
        }
        for &owner in &self.remembered {
            // The owner is old and stays; what matters is what it points at.
            trace_children(owner, &mut tracer);
        }
        let mut perm = self.perm_head;
        while !perm.is_null() {
            // Permanents keep their mark bit forever; their children still
            // have to be traced (the shape tree hangs off the empty shape).
            unsafe {
                trace_children(Gc::from_ptr(perm), &mut tracer);
                perm = (*perm).next;
            }
        }

        tracer.drain();

        let full = self.old_count > self.old_threshold;
        if full {
            self.sweep_old(heap);
            self.old_threshold = std::cmp::max(INITIAL_OLD_THRESHOLD, self.old_count * 2);
            self.full_collections += 1;
        }
        let promoted = self.sweep_young(heap);

        self.remembered.clear();
        self.collections += 1;

        debug!(
            full,
            promoted,
            young = self.young_count,
            old = self.old_count,
            "gc cycle complete"
        );

        self.young_count + self.old_count
    }

    /// Sweeps the young list: marked objects are promoted to old and
    /// unmarked; dead ones are dropped and their storage released.
    fn sweep_young(&mut self, heap: &mut Heap) -> usize {
        let mut promoted = 0;
        let mut cursor = self.young_head;
        self.young_head = std::ptr::null_mut();

        while !cursor.is_null() {
            unsafe {
                let next = (*cursor).next;
                if (*cursor).flags.contains(GcFlags::MARKED) {
                    (*cursor).flags = GcFlags::OLD;
                    (*cursor).next = self.old_head;
                    self.old_head = cursor;
                    self.young_count -= 1;
                    self.old_count += 1;
                    promoted += 1;
                } else {
                    drop_object(cursor);
                    heap.release(cursor);
                    self.young_count -= 1;
                }
                cursor = next;
            }
        }
        promoted
    }

    /// Sweeps the old list: unmarked objects are freed, marks are cleared
    /// on survivors.
    fn sweep_old(&mut self, heap: &mut Heap) {
        let mut cursor = self.old_head;
        self.old_head = std::ptr::null_mut();
        let mut survivors = 0;

        while !cursor.is_null() {
            unsafe {
                let next = (*cursor).next;
                if (*cursor).flags.contains(GcFlags::MARKED) {
                    (*cursor).flags = GcFlags::OLD;
                    (*cursor).next = self.old_head;
                    self.old_head = cursor;
                    survivors += 1;
                } else {
                    drop_object(cursor);
                    heap.release(cursor);
                }
                cursor = next;
            }
        }
        self.old_count = survivors;
    }
}

impl GenerationalGc {
    /// Destroys every remaining object and returns its storage. Called by
    /// the memory manager's `Drop`; the collector must not be used after.
    pub(crate) fn teardown(&mut self, heap: &mut Heap) {
        for head in [self.young_head, self.old_head, self.perm_head] {
            let mut cursor = head;
            while !cursor.is_null() {
                unsafe {
                    let next = (*cursor).next;
                    drop_object(cursor);
                    heap.release(cursor);
                    cursor = next;
                }
            }
        }
        self.young_head = std::ptr::null_mut();
        self.old_head = std::ptr::null_mut();
        self.perm_head = std::ptr::null_mut();
        self.young_count = 0;
        self.old_count = 0;
    }
}
