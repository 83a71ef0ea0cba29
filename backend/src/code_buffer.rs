use std::io;
use std::ptr;

use crate::JitError;

/// Default executable region size: 16 MiB.
const DEFAULT_CODE_BUF_SIZE: usize = 16 * 1024 * 1024;

/// The mmap'd region all host code is emitted into.
///
/// The region is mapped read-write-execute for its whole lifetime:
/// block linking rewrites jump sites inside code that is already
/// reachable, and emission, patching and execution are serialised by
/// the caller, so a writable+executable mapping trades no safety the
/// backend relies on. Compiled blocks are addressed by absolute
/// pointer, so the mapping never moves or grows; when the cursor runs
/// out, the caller clears the cache and starts over.
pub struct CodeBuffer {
    base: *mut u8,
    len: usize,
    cursor: usize,
}

// SAFETY: the buffer exclusively owns its mapping.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Maps a fresh region of at least `size` bytes (rounded up to
    /// the page size).
    pub fn new(size: usize) -> Result<CodeBuffer, JitError> {
        // SAFETY: sysconf is always safe to call.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (size + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(JitError::CodeBufferAllocation(io::Error::last_os_error()));
        }

        Ok(CodeBuffer {
            base: base as *mut u8,
            len,
            cursor: 0,
        })
    }

    /// Maps the default 16 MiB region.
    pub fn with_default_size() -> Result<CodeBuffer, JitError> {
        CodeBuffer::new(DEFAULT_CODE_BUF_SIZE)
    }

    /// Current emission cursor.
    #[inline]
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// Repositions the cursor. The patcher rewinds into
    /// already-emitted blocks through this, then restores the cursor
    /// when done.
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.len);
        self.cursor = offset;
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    #[inline]
    pub fn current_ptr(&self) -> *const u8 {
        self.ptr_at(self.cursor)
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.len);
        // SAFETY: offset stays within the mapping.
        unsafe { self.base.add(offset) as *const u8 }
    }

    /// Everything emitted so far.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: 0..cursor has been written.
        unsafe { std::slice::from_raw_parts(self.base, self.cursor) }
    }

    // -- Emission --

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.remaining(), "code buffer exhausted");
        // SAFETY: bounds checked above; the mapping is writable.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.cursor), bytes.len());
        }
        self.cursor += bytes.len();
    }

    #[inline]
    pub fn emit_u8(&mut self, value: u8) {
        self.emit_bytes(&[value]);
    }

    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.emit_bytes(&value.to_le_bytes());
    }

    // -- In-place rewriting --

    fn patch_bytes(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);
        // SAFETY: bounds checked above; the mapping stays writable.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
    }

    /// Overwrites one byte (rel8 label fixups).
    pub fn patch_u8(&mut self, offset: usize, value: u8) {
        self.patch_bytes(offset, &[value]);
    }

    /// Overwrites a little-endian dword (rel32 label and branch
    /// fixups).
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.patch_bytes(offset, &value.to_le_bytes());
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping made in `new`, and
        // construction fails rather than producing a dangling buffer.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
