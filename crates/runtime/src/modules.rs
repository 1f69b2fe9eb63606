//! The module manager.
//!
//! Loading itself is an external concern: the embedder supplies a
//! [`ModuleLoader`] that turns a path into a fully constructed
//! [`ObjModule`] (constant pools resolved, protos built). The manager owns
//! the path-keyed cache, registers every loaded module as a GC root, and
//! links protos back to their owning module so `GET_GLOBAL`/`EXPORT`
//! know whose tables to touch.
//!
//! Native modules are registries of native function pointers; they are
//! installed programmatically and start out already `Executed`.

use hashbrown::HashMap;
use tracing::debug;

use meow_core::memory::MemoryManager;
use meow_core::object::{Gc, ModuleState, ObjModule, ObjProto, ObjString};

use crate::error::LoadError;
use crate::machine::{NativeFn, native_value};

/// The external loader boundary: resolves a path to a
/// ready-to-execute module. Implementations must resolve inter-proto
/// references in constant pools before returning; the returned module is
/// in `Loading` state and owns its main proto.
pub trait ModuleLoader {
    fn load(
        &mut self,
        path: &str,
        importer: Option<&str>,
        heap: &mut MemoryManager,
    ) -> Result<Gc<ObjModule>, LoadError>;
}

/// A loader with nothing to offer; the default for machines that only
/// execute pre-built closures.
pub struct EmptyLoader;

impl ModuleLoader for EmptyLoader {
    fn load(
        &mut self,
        path: &str,
        _importer: Option<&str>,
        _heap: &mut MemoryManager,
    ) -> Result<Gc<ObjModule>, LoadError> {
        Err(LoadError::NotFound(path.to_string()))
    }
}

pub struct ModuleManager {
    cache: HashMap<Gc<ObjString>, Gc<ObjModule>>,
    loader: Box<dyn ModuleLoader>,
}

impl ModuleManager {
    pub fn new(loader: Box<dyn ModuleLoader>) -> Self {
        ModuleManager { cache: HashMap::new(), loader }
    }

    pub fn is_loaded(&self, path: Gc<ObjString>) -> bool {
        self.cache.contains_key(&path)
    }

    pub fn get(&self, path: Gc<ObjString>) -> Option<Gc<ObjModule>> {
        self.cache.get(&path).copied()
    }

    /// Returns the cached module for `path` or asks the loader for it.
    /// Freshly loaded modules are linked, rooted and cached; execution of
    /// their main proto is the interpreter's business.
    pub fn load_module(
        &mut self,
        path: Gc<ObjString>,
        importer: Option<Gc<ObjString>>,
        heap: &mut MemoryManager,
    ) -> Result<Gc<ObjModule>, LoadError> {
        if let Some(&module) = self.cache.get(&path) {
            return Ok(module);
        }

        let module = self.loader.load(
            path.as_str(),
            importer.map(|s| {
                // Interned strings are permanent; the borrow is detached
                // from the lookup key's lifetime.
                unsafe { (*s.as_ptr()).as_str() }
            }),
            heap,
        )?;

        self.install(path, module, heap);
        Ok(module)
    }

    /// Registers a module the embedder built by hand (tests, natives).
    pub fn install(
        &mut self,
        path: Gc<ObjString>,
        module: Gc<ObjModule>,
        heap: &mut MemoryManager,
    ) {
        if let Some(main) = module.main_proto() {
            let mut visited = Vec::new();
            link_protos(module, main, &mut visited);
        }
        heap.add_module_root(module);
        self.cache.insert(path, module);
        debug!(path = path.as_str(), "module installed");
    }

    /// Builds and installs a native registry module: every entry becomes
    /// both an export and a global, and the module starts `Executed`.
    pub fn register_native_module(
        &mut self,
        name: &str,
        natives: &[(&str, NativeFn)],
        heap: &mut MemoryManager,
    ) -> Gc<ObjModule> {
        let name_str = heap.new_string(name);
        let mut module = heap.new_module(name_str, name_str, None);
        for &(fn_name, f) in natives {
            let fn_name = heap.new_string(fn_name);
            let value = native_value(f);
            module.set_export(fn_name, value);
            module.set_global(fn_name, value);
        }
        module.set_state(ModuleState::Executed);
        self.install(name_str, module, heap);
        module
    }

    pub fn modules(&self) -> impl Iterator<Item = Gc<ObjModule>> + '_ {
        self.cache.values().copied()
    }
}

/// Points every proto reachable through constant pools at its owning
/// module. Cycles are guarded by the visited list.
fn link_protos(module: Gc<ObjModule>, proto: Gc<ObjProto>, visited: &mut Vec<Gc<ObjProto>>) {
    if visited.contains(&proto) {
        return;
    }
    visited.push(proto);
    let mut proto = proto;
    proto.set_module(module);
    for &constant in proto.chunk().constants() {
        if constant.is_proto() {
            let child = unsafe { constant.as_object().downcast::<ObjProto>() };
            link_protos(module, child, visited);
        }
    }
}
