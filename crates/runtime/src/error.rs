//! Runtime and loader error types.
//!
//! Errors user code can catch are a kind from the fixed taxonomy plus a
//! message; the interpreter carries one in the VM state, unwinds to the
//! nearest handler, and delivers the formatted text as an interned string.

use std::fmt;

/// The catchable error taxonomy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// Operator dispatch failed, property read on null, not-callable call.
    Type,
    /// Out-of-bounds array or string index.
    Index,
    /// Missing module export.
    Key,
    /// Unresolved global.
    Name,
    /// Frame or value stack exhausted.
    StackOverflow,
    /// Allocation failed after GC.
    OutOfMemory,
    /// User-raised value via THROW.
    Thrown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Name => "NameError",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::Thrown => "Thrown",
        };
        f.write_str(name)
    }
}

/// An error travelling through the exception machinery.
#[derive(Clone, Debug)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError { kind, message: message.into() }
    }

    /// The text delivered to a catch block. Thrown values arrive as the
    /// thrown value's own string form, without a kind prefix.
    pub fn catch_text(&self) -> String {
        match self.kind {
            ErrorKind::Thrown => self.message.clone(),
            kind => format!("{kind}: {}", self.message),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Failures at the loader boundary, before any bytecode runs.
#[derive(Debug)]
pub enum LoadError {
    /// The loader has no module for this path.
    NotFound(String),
    /// The loader rejected the module's contents.
    Malformed(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound(path) => write!(f, "module '{path}' not found"),
            LoadError::Malformed(msg) => write!(f, "malformed module: {msg}"),
        }
    }
}

impl std::error::Error for LoadError {}
