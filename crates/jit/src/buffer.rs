//! Executable code pages.
//!
//! Pages are mapped read-write for emission and flipped to read-execute
//! before the entry point is handed out (W^X). The mapping lives until
//! the buffer is dropped, so compiled blocks must not outlive it.

use std::ptr;

/// An `mmap`ed code buffer.
pub struct ExecBuf {
    ptr: *mut u8,
    capacity: usize,
    executable: bool,
}

impl ExecBuf {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        // Safety: anonymous private mapping, no fd.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ExecBuf { ptr: ptr as *mut u8, capacity, executable: false })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        debug_assert!(!self.executable, "buffer already sealed");
        self.ptr
    }

    /// Flips the pages to read-execute. No further writes are legal.
    pub fn seal(&mut self) -> std::io::Result<()> {
        // Safety: the mapping above owns exactly this range.
        let rc = unsafe { libc::mprotect(self.ptr as *mut _, self.capacity, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.executable = true;
        Ok(())
    }

    /// Entry point at `offset`.
    ///
    /// # Safety
    /// The buffer must be sealed and `offset` must be the start of a
    /// complete, well-formed function emitted into it.
    pub unsafe fn entry(&self, offset: usize) -> *const u8 {
        debug_assert!(self.executable);
        debug_assert!(offset < self.capacity);
        unsafe { self.ptr.add(offset) }
    }
}

impl Drop for ExecBuf {
    fn drop(&mut self) {
        // Safety: same range as the original mapping.
        unsafe {
            libc::munmap(self.ptr as *mut _, self.capacity);
        }
    }
}
