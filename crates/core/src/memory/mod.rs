//! Memory management: allocation front end, string interning, GC control.
//!
//! Every heap object is created through [`MemoryManager`]. Allocation is
//! the VM's only safepoint: when the live-object estimate crosses the GC
//! threshold, a collection runs *before* the new object exists, so a
//! half-constructed object can never be swept.

mod gc;
mod heap;

pub use gc::Tracer;
pub use heap::{ARENA_BLOCK_SIZE, MAX_SMALL_OBJECT, MIN_ALIGN};

use hashbrown::HashSet;

use crate::context::ExecutionContext;
use crate::object::{
    Gc, GcHeader, HeapObject, InternKey, ObjArray, ObjBoundMethod, ObjClass, ObjClosure,
    ObjInstance, ObjModule, ObjProto, ObjString, ObjTable, ObjUpvalue, Shape, UpvalueDesc,
    str_hash,
};
use crate::bytecode::Chunk;
use crate::value::Value;

use gc::GenerationalGc;
use heap::{Heap, round_up};

/// Allocations before the first collection; doubles after each cycle.
pub const DEFAULT_GC_THRESHOLD: usize = 1_000_000;

pub struct MemoryManager {
    heap: Heap,
    gc: GenerationalGc,
    strings: HashSet<InternKey>,
    empty_shape: Option<Gc<Shape>>,
    gc_threshold: usize,
    allocated: usize,
    gc_enabled: bool,
}

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager {
            heap: Heap::new(),
            gc: GenerationalGc::new(),
            strings: HashSet::with_capacity(256),
            empty_shape: None,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            allocated: 0,
            gc_enabled: true,
        }
    }

    /// Lower-than-default thresholds let tests provoke collections.
    pub fn with_gc_threshold(threshold: usize) -> Self {
        let mut mm = Self::new();
        mm.gc_threshold = threshold;
        mm
    }

    // --- Wiring ---

    /// Installs the execution context as a GC root provider. The context
    /// must outlive this manager.
    pub fn set_context(&mut self, context: *const ExecutionContext) {
        self.gc.set_context(context);
    }

    /// Registers a loaded module as a GC root for the VM's lifetime.
    pub fn add_module_root(&mut self, module: Gc<ObjModule>) {
        self.gc.add_module_root(module);
    }

    // --- Allocation core ---

    fn maybe_collect(&mut self) {
        if self.gc_enabled && self.allocated >= self.gc_threshold {
            self.collect();
            self.gc_threshold *= 2;
        }
    }

    fn allocate<T: HeapObject>(&mut self, object: T) -> Gc<T> {
        self.maybe_collect();
        let size = round_up(std::mem::size_of::<T>());
        let ptr = self.heap.allocate(size) as *mut T;
        // Safety: the heap handed us `size` writable bytes; T is repr(C)
        // with the header first, and the constructor set kind/flags.
        unsafe {
            ptr.write(object);
            (*(ptr as *mut GcHeader)).size = size as u32;
            let handle = Gc::from_ptr(ptr);
            self.gc.register_object(handle.erased());
            self.allocated += 1;
            handle
        }
    }

    // --- Strings ---

    /// Interns `s`: returns the existing string object when the contents
    /// were seen before, allocating a permanent one otherwise. Identity
    /// equality on the result implies content equality.
    pub fn new_string(&mut self, s: &str) -> Gc<ObjString> {
        if let Some(key) = self.strings.get(s) {
            return key.0;
        }

        let size = round_up(ObjString::alloc_size(s.len()));
        let ptr = self.heap.allocate(size) as *mut ObjString;
        // Safety: `size` covers the fixed fields plus the inline bytes.
        let string = unsafe {
            ObjString::init(ptr, s, str_hash(s.as_bytes()));
            (*(ptr as *mut GcHeader)).size = size as u32;
            Gc::from_ptr(ptr)
        };
        self.gc.register_permanent(string.erased());
        self.allocated += 1;
        self.strings.insert(InternKey(string));
        string
    }

    /// Looks up an already-interned string without allocating.
    pub fn find_string(&self, s: &str) -> Option<Gc<ObjString>> {
        self.strings.get(s).map(|k| k.0)
    }

    // --- Object constructors ---

    pub fn new_array(&mut self, elements: Vec<Value>) -> Gc<ObjArray> {
        self.allocate(ObjArray::new(elements))
    }

    pub fn new_table(&mut self) -> Gc<ObjTable> {
        self.allocate(ObjTable::new())
    }

    pub fn new_upvalue(&mut self, stack_index: usize) -> Gc<ObjUpvalue> {
        self.allocate(ObjUpvalue::open(stack_index))
    }

    pub fn new_proto(
        &mut self,
        num_registers: u32,
        name: Option<Gc<ObjString>>,
        chunk: Chunk,
        upvalue_descs: Vec<UpvalueDesc>,
    ) -> Gc<ObjProto> {
        self.allocate(ObjProto::new(num_registers, name, chunk, upvalue_descs))
    }

    pub fn new_closure(&mut self, proto: Gc<ObjProto>) -> Gc<ObjClosure> {
        self.allocate(ObjClosure::new(proto))
    }

    pub fn new_module(
        &mut self,
        name: Gc<ObjString>,
        path: Gc<ObjString>,
        main_proto: Option<Gc<ObjProto>>,
    ) -> Gc<ObjModule> {
        self.allocate(ObjModule::new(name, path, main_proto))
    }

    pub fn new_class(&mut self, name: Gc<ObjString>) -> Gc<ObjClass> {
        self.allocate(ObjClass::new(name))
    }

    pub fn new_instance(&mut self, class: Gc<ObjClass>) -> Gc<ObjInstance> {
        let shape = self.empty_shape();
        self.allocate(ObjInstance::new(class, shape))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: Value) -> Gc<ObjBoundMethod> {
        self.allocate(ObjBoundMethod::new(receiver, method))
    }

    // --- Shapes ---

    /// The process-wide root of the shape tree: permanent, field count 0.
    pub fn empty_shape(&mut self) -> Gc<Shape> {
        if let Some(shape) = self.empty_shape {
            return shape;
        }
        let size = round_up(std::mem::size_of::<Shape>());
        let ptr = self.heap.allocate(size) as *mut Shape;
        let shape = unsafe {
            ptr.write(Shape::new_empty());
            (*(ptr as *mut GcHeader)).size = size as u32;
            Gc::from_ptr(ptr)
        };
        self.gc.register_permanent(shape.erased());
        self.allocated += 1;
        self.empty_shape = Some(shape);
        shape
    }

    /// Idempotent shape transition: returns the existing successor for
    /// `name`, or allocates one, registers it with the parent, and
    /// returns it. Instances assigning the same properties in the same
    /// order therefore share shapes.
    pub fn add_transition(&mut self, mut parent: Gc<Shape>, name: Gc<ObjString>) -> Gc<Shape> {
        if let Some(existing) = parent.get_transition(name) {
            return existing;
        }
        let successor = self.allocate(parent.successor_with(name));
        parent.record_transition(name, successor);
        // The parent now points at a younger shape.
        self.write_barrier(parent.erased(), Value::object(successor.erased()));
        successor
    }

    // --- GC control ---

    #[inline]
    pub fn write_barrier(&mut self, owner: Gc<GcHeader>, value: Value) {
        if self.gc_enabled {
            self.gc.write_barrier(owner, value);
        }
    }

    pub fn collect(&mut self) {
        let live = self.gc.collect(&mut self.heap);
        self.allocated = live;
    }

    pub fn enable_gc(&mut self) {
        self.gc_enabled = true;
    }

    pub fn disable_gc(&mut self) {
        self.gc_enabled = false;
    }

    // --- Introspection (tests, diagnostics) ---

    /// Completed GC cycles.
    pub fn collections(&self) -> u64 {
        self.gc.collections()
    }

    /// Completed full (old-generation) collections.
    pub fn full_collections(&self) -> u64 {
        self.gc.full_collections()
    }

    /// Live non-permanent objects as of the last collection, plus
    /// allocations since.
    pub fn allocation_count(&self) -> usize {
        self.allocated
    }

    pub fn live_objects(&self) -> usize {
        self.gc.live_objects()
    }

    /// Whether the write barrier has recorded `owner` since the last
    /// collection.
    pub fn in_remembered_set(&self, owner: Gc<GcHeader>) -> bool {
        self.gc.remembers(owner)
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let MemoryManager { heap, gc, .. } = self;
        gc.teardown(heap);
    }
}
