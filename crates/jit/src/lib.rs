//! Optional x86-64 template JIT.
//!
//! Translates a whitelisted subset of bytecode — integer arithmetic,
//! integer comparisons, fused compare-and-jump, LOAD_INT, MOVE, JUMP,
//! HALT — into native code sharing the interpreter's `Value` layout and
//! register-file convention. The compiled function takes the register
//! file pointer, unboxes the five pinned VM registers into callee-saved
//! machine registers on entry, and reboxes them on exit. Nothing in the
//! interpreter depends on this crate; a build without it is fully
//! conforming.
//!
//! Only available where the NaN-boxed value layout is (x86-64 Unix).

#![cfg(all(target_arch = "x86_64", unix))]

mod assembler;
mod buffer;
mod compiler;

pub use assembler::{Assembler, Condition, Reg};
pub use buffer::ExecBuf;
pub use compiler::{CompiledBlock, JitCompiler, JitError, scan_compilable};
