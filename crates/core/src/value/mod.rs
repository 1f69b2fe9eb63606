//! The runtime value representation.
//!
//! A `Value` is a single machine word carrying one of: null, a boolean, a
//! 48-bit signed integer, an IEEE-754 double, a native function pointer, an
//! opaque pointer, or a reference to a heap object. Two backends implement
//! the same surface:
//!
//! - [`nanbox`] packs everything into 64 bits using the quiet-NaN space of
//!   doubles. Selected on little-endian 64-bit targets, where pointers
//!   zero-extend into 48 bits.
//! - [`fallback`] is a plain 16-byte (tag, bits) pair for everything else.
//!
//! The interpreter, the GC and the JIT all consume the same backend; the
//! JIT additionally relies on the raw bit layout and therefore only exists
//! where the NaN box is active.

#[cfg(all(target_pointer_width = "64", target_endian = "little"))]
mod nanbox;
#[cfg(all(target_pointer_width = "64", target_endian = "little"))]
pub use nanbox::Value;

#[cfg(not(all(target_pointer_width = "64", target_endian = "little")))]
mod fallback;
#[cfg(not(all(target_pointer_width = "64", target_endian = "little")))]
pub use fallback::Value;

/// Smallest integer a `Value` can carry without truncation.
pub const MIN_INT: i64 = -(1 << 47);
/// Largest integer a `Value` can carry without truncation.
pub const MAX_INT: i64 = (1 << 47) - 1;
