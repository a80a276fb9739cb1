//! Executable code storage (§4.G). The default path maps anonymous pages
//! with `mmap`, writes machine code into them while they're writable, then
//! flips them to read+execute with `mprotect` once compilation finishes —
//! the code is never both writable and executable at the same time.

use std::ptr::NonNull;

use crate::error::LinkError;

fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(n: usize, page: usize) -> usize {
    (n + page - 1) / page * page
}

/// An executable allocation for one `Store`'s worth of compiled functions.
/// Every `FuncInst::Compiled` code pointer points somewhere inside one of a
/// `Store`'s `CodeBuffer`s, which must outlive it.
pub struct CodeBuffer {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
    executable: bool,
}

// SAFETY: the mapping is never concurrently written once `mark_executable`
// has run, and `Store` (the sole owner) is itself `!Sync` (§5).
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Reserve a fresh read-write mapping large enough for `min_bytes`.
    pub fn new(min_bytes: usize) -> Result<Self, LinkError> {
        let page = page_size();
        let cap = round_up_to_page(min_bytes.max(1), page);
        // SAFETY: requests a fresh anonymous, non-file-backed mapping; the
        // returned pointer is checked for MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(LinkError::CodeBufferAlloc(std::io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: NonNull::new(addr as *mut u8).expect("mmap returned non-null on success"),
            len: 0,
            cap,
            executable: false,
        })
    }

    /// Append `bytes`, returning the offset they were written at. Panics if
    /// the buffer was already marked executable or out of reserved space —
    /// the compiler sizes buffers up front from the bytecode's length, so
    /// this is a compiler invariant, not a runtime condition.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        assert!(!self.executable, "cannot write into an executable CodeBuffer");
        assert!(self.len + bytes.len() <= self.cap, "CodeBuffer overflow");
        let off = self.len;
        // SAFETY: `off..off+bytes.len()` is within `cap`, just asserted.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(off), bytes.len());
        }
        self.len += bytes.len();
        off
    }

    /// Patch `len` bytes at `offset`, for relocation fixups applied after
    /// the function's body has already been emitted.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        assert!(!self.executable, "cannot patch an executable CodeBuffer");
        assert!(offset + bytes.len() <= self.len);
        // SAFETY: within the written prefix, just asserted.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: `len` bytes starting at `ptr` were written by `write`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Flip the mapping from RW to RX. Irreversible for the lifetime of this
    /// buffer: no more functions can be appended afterward.
    pub fn mark_executable(&mut self) -> Result<(), LinkError> {
        // SAFETY: `ptr`/`cap` describe the live mapping from `new`.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.cap, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(LinkError::CodeBufferAlloc(std::io::Error::last_os_error()));
        }
        self.executable = true;
        Ok(())
    }

    /// Absolute address of the byte at `offset`, valid once executable.
    pub fn entry_at(&self, offset: usize) -> *const u8 {
        // SAFETY: caller-supplied offsets always originate from a prior
        // `write` return value on this same buffer.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`cap` are exactly what `mmap` returned/reserved.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.cap);
        }
    }
}

/// Kernel-module code storage path, mirroring wasmjit's `vmalloc`-based
/// allocator for running inside a Linux kernel module instead of a POSIX
/// process. Not exercised by this crate's test suite — there's no kernel
/// build target here — but kept behind the `kernel` feature so the trait
/// boundary between "how code memory is obtained" and "how it's compiled
/// into" stays real rather than assumed.
#[cfg(feature = "kernel")]
pub mod kernel {
    use super::*;

    pub struct KernelCodeBuffer {
        // A real implementation would hold a `vmalloc`'d region obtained
        // through a kernel module's own allocator FFI; this crate has no
        // such allocator to bind against outside a kernel build.
        _unused: std::marker::PhantomData<()>,
    }

    impl KernelCodeBuffer {
        pub fn new(_min_bytes: usize) -> Result<Self, LinkError> {
            Err(LinkError::CodeBufferAlloc(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "kernel code buffer path requires a kernel build target",
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_mark_executable_preserves_bytes() {
        let mut buf = CodeBuffer::new(64).unwrap();
        let off = buf.write(&[0xC3]); // ret
        assert_eq!(off, 0);
        buf.mark_executable().unwrap();
        // SAFETY: reading back a single byte we just wrote and mapped RX.
        let byte = unsafe { *buf.entry_at(0) };
        assert_eq!(byte, 0xC3);
    }

    #[test]
    fn rounds_capacity_up_to_a_page() {
        let buf = CodeBuffer::new(1).unwrap();
        assert!(buf.cap >= page_size());
        assert_eq!(buf.cap % page_size(), 0);
    }
}
