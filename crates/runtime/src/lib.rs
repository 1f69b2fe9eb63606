//! The Meow interpreter runtime.
//!
//! Consumes the value/object/GC core from `meow-core` and adds what makes
//! bytecode run: the operator dispatch tables, the handler-per-opcode
//! interpreter with its inline caches, exception unwinding, the module
//! manager, and the [`Machine`] facade embedders drive.

pub mod cast;
pub mod dispatch;
pub mod error;
mod interp;
pub mod machine;
pub mod modules;

pub use error::{ErrorKind, LoadError, RuntimeError};
pub use machine::{Machine, NativeFn, VmStats, native_value};
pub use modules::{ModuleLoader, ModuleManager};

// Re-export the core surface so embedders and tests need one import root.
pub use meow_core::bytecode;
pub use meow_core::{CallFrame, ExecutionContext, Gc, MemoryManager, Value};
pub use meow_core::{context, memory, object, value};
