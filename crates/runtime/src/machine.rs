//! The `Machine`: the VM facade embedders drive.
//!
//! Owns the three subsystems — execution context, memory manager, module
//! manager — wires the GC roots, and exposes the two entry points:
//! `interpret(path)` loads and runs a module through the loader, and
//! `execute(closure)` runs a prepared closure on a reset context (the
//! benchmark/embedding path). Native functions use the machine's error
//! surface to raise without unwinding through Rust.

use tracing::debug;

use meow_core::context::ExecutionContext;
use meow_core::memory::MemoryManager;
use meow_core::object::{Gc, ModuleState, ObjClosure, ObjModule, ObjString};
use meow_core::value::Value;

use crate::error::{ErrorKind, LoadError, RuntimeError};
use crate::interp;
use crate::modules::{EmptyLoader, ModuleLoader, ModuleManager};

/// Native function ABI: `(machine, args) -> value`. Natives may allocate
/// through `machine.heap_mut()` (which can trigger GC — raw pointers must
/// not be held across that) and report errors via [`Machine::raise`].
pub type NativeFn = fn(&mut Machine, &[Value]) -> Value;

/// Boxes a native function pointer into a `Value`.
pub fn native_value(f: NativeFn) -> Value {
    Value::native(f as usize)
}

/// Recovers the function pointer from a native `Value`.
///
/// # Safety
/// `value` must have been produced by [`native_value`].
pub unsafe fn native_fn(value: Value) -> NativeFn {
    debug_assert!(value.is_native());
    unsafe { std::mem::transmute::<usize, NativeFn>(value.as_native()) }
}

/// Interpreter instrumentation: slow-path counters the inline-cache tests
/// and tooling read. Cheap enough to keep unconditionally.
#[derive(Clone, Copy, Debug, Default)]
pub struct VmStats {
    /// GET_PROP/SET_PROP resolutions that had to consult the shape tables.
    pub prop_slow_lookups: u64,
    /// Call-site inline-cache misses (callee identity changed).
    pub call_ic_misses: u64,
    /// Operator-table dispatches (any slow-path binary/unary operator).
    pub operator_slow_dispatches: u64,
}

pub struct Machine {
    /// Boxed: the context holds cursors into its own buffers and the GC
    /// keeps a pointer to it.
    context: Box<ExecutionContext>,
    heap: MemoryManager,
    modules: ModuleManager,
    error: Option<RuntimeError>,
    stats: VmStats,
    /// Where a top-level RETURN deposits its value.
    result: Value,
}

impl Machine {
    pub fn new(loader: Box<dyn ModuleLoader>) -> Self {
        let context = Box::new(ExecutionContext::new());
        let mut heap = MemoryManager::new();
        heap.set_context(&*context);
        Machine {
            context,
            heap,
            modules: ModuleManager::new(loader),
            error: None,
            stats: VmStats::default(),
            result: Value::null(),
        }
    }

    /// A machine with no module loader; only `execute` is usable.
    pub fn bare() -> Self {
        Self::new(Box::new(EmptyLoader))
    }

    /// Replaces the default GC threshold, for tests that provoke cycles.
    pub fn with_gc_threshold(loader: Box<dyn ModuleLoader>, threshold: usize) -> Self {
        let context = Box::new(ExecutionContext::new());
        let mut heap = MemoryManager::with_gc_threshold(threshold);
        heap.set_context(&*context);
        Machine {
            context,
            heap,
            modules: ModuleManager::new(loader),
            error: None,
            stats: VmStats::default(),
            result: Value::null(),
        }
    }

    // --- Subsystem access ---

    pub fn heap(&self) -> &MemoryManager {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut MemoryManager {
        &mut self.heap
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleManager {
        &mut self.modules
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut VmStats {
        &mut self.stats
    }

    // --- Error surface (native ABI) ---

    /// Raises an error from a native function; the interpreter converts it
    /// into an exception at the call site.
    pub fn raise(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.error = Some(RuntimeError::new(kind, message));
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<RuntimeError> {
        self.error.take()
    }

    // --- Execution ---

    /// Resolves a module through the loader (or the cache) without
    /// executing it.
    pub fn load_module(&mut self, path: &str) -> Result<Gc<ObjModule>, LoadError> {
        let path = self.heap.new_string(path);
        self.modules.load_module(path, None, &mut self.heap)
    }

    /// Loads the entry module through the loader and runs its main proto.
    /// When `builtins` names an installed native-registry module, its
    /// globals are injected into the entry module first.
    pub fn interpret(
        &mut self,
        entry_path: &str,
        builtins: Option<&str>,
    ) -> Result<Value, RuntimeError> {
        let mut module = self.load_module(entry_path).map_err(load_error_to_runtime)?;

        if let Some(builtins) = builtins {
            let name = self.heap.new_string(builtins);
            if let Some(registry) = self.modules.get(name) {
                module.import_all_globals(&registry);
            }
        }

        let Some(main) = module.main_proto() else {
            return Err(RuntimeError::new(
                ErrorKind::Type,
                format!("module '{entry_path}' has no entry point"),
            ));
        };
        if module.state() == ModuleState::Loading {
            module.set_state(ModuleState::Executing);
        }
        let closure = self.heap.new_closure(main);
        debug!(path = entry_path, "interpreting entry module");
        let result = self.run_closure(closure, &[]);
        if result.is_ok() {
            module.set_state(ModuleState::Executed);
        }
        result
    }

    /// Runs `closure` on a reset context and returns what its top-level
    /// RETURN produced (null after a bare HALT).
    pub fn execute(&mut self, closure: Gc<ObjClosure>, args: &[Value]) -> Result<Value, RuntimeError> {
        self.run_closure(closure, args)
    }

    fn run_closure(
        &mut self,
        closure: Gc<ObjClosure>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.context.reset();
        self.error = None;
        self.result = Value::null();

        let num_regs = closure.proto().num_registers() as usize;
        if !self.context.can_reserve(num_regs) {
            return Err(RuntimeError::new(ErrorKind::StackOverflow, "stack exhausted on startup"));
        }

        interp::run(self, closure, args)?;
        Ok(self.result)
    }

    pub(crate) fn result_slot(&mut self) -> *mut Value {
        &mut self.result
    }

    /// Splits the machine into the parts the interpreter needs
    /// simultaneously. The pointers alias `self`; the dispatch loop is the
    /// only consumer and never holds them across a reentrant call.
    pub(crate) fn vm_parts(&mut self) -> (*mut ExecutionContext, *mut MemoryManager, *mut ModuleManager) {
        (&mut *self.context as *mut _, &mut self.heap as *mut _, &mut self.modules as *mut _)
    }

    // --- Convenience for embedders and tests ---

    pub fn intern(&mut self, s: &str) -> Gc<ObjString> {
        self.heap.new_string(s)
    }

    /// Roots a value on the context stack until the next execution
    /// resets it. Embedders use this to keep temporaries alive across
    /// allocations.
    pub fn push_root(&mut self, value: Value) {
        self.context.push(value);
    }

    /// Installs a native-registry module (see the module manager).
    pub fn register_natives(&mut self, name: &str, natives: &[(&str, NativeFn)]) -> Gc<ObjModule> {
        self.modules.register_native_module(name, natives, &mut self.heap)
    }
}

fn load_error_to_runtime(e: LoadError) -> RuntimeError {
    RuntimeError::new(ErrorKind::Key, e.to_string())
}
