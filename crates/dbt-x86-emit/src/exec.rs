//! Executable JIT pages.
//!
//! A compiled frame is assembled into an `Emitter`'s plain `Vec<u8>` and
//! then copied into a fresh OS mapping that the CPU is allowed to execute.
//! Two strategies are supported (see `SPEC_FULL.md`'s "Executable-memory
//! portability" design note): a single RWX mapping, or a pair of mappings
//! over the same underlying memory object — one writable, one executable
//! — for hosts that refuse to hand out RWX pages.

use std::io;
use std::ptr::NonNull;

/// An executable copy of a compiled JIT frame.
///
/// Owns its mapping outright (mirrors `dbt-core`'s out-of-scope note that
/// executable pages are reference-free, owned by the per-core JIT cache)
/// and unmaps on `Drop`.
pub struct ExecutableBlock {
    ptr: NonNull<u8>,
    len: usize,
    /// Only set when dual-mapped: the writable alias of the same memory,
    /// kept around so `Drop` can unmap both halves.
    write_ptr: Option<NonNull<u8>>,
}

// SAFETY: the mapping is used strictly as executable machine code once
// built; nothing mutates it from multiple threads concurrently, and the
// pointer itself is plain heap-external memory with no interior state
// that requires synchronization to move between threads.
unsafe impl Send for ExecutableBlock {}
unsafe impl Sync for ExecutableBlock {}

impl ExecutableBlock {
    /// Allocate a single RWX mapping and copy `code` into it.
    pub fn new_rwx(code: &[u8]) -> io::Result<Self> {
        let len = page_round(code.len());
        let ptr = mmap_anon(len, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;
        // SAFETY: `ptr` is a fresh mapping of at least `len` bytes, just
        // created above, and `code.len() <= len`.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
        }
        Ok(ExecutableBlock { ptr, len, write_ptr: None })
    }

    /// Allocate a W^X pair backed by the same memory object: write through
    /// one mapping, execute through the other, matching the dual-mapping
    /// design note for hosts that forbid RWX pages.
    pub fn new_dual_mapped(code: &[u8]) -> io::Result<Self> {
        let len = page_round(code.len());
        // SAFETY: fd creation and both mmaps are checked individually below.
        let fd = unsafe { memfd_create(len)? };
        let write_ptr = mmap_shared(fd, len, libc::PROT_READ | libc::PROT_WRITE)?;
        let exec_ptr = mmap_shared(fd, len, libc::PROT_READ | libc::PROT_EXEC);
        // SAFETY: the fd's mappings retain the underlying memory object
        // independent of the fd itself, so it can be closed now.
        unsafe {
            libc::close(fd);
        }
        let exec_ptr = exec_ptr?;
        // SAFETY: `write_ptr` maps at least `len` bytes and `code.len() <= len`.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), write_ptr.as_ptr(), code.len());
        }
        Ok(ExecutableBlock { ptr: exec_ptr, len, write_ptr: Some(write_ptr) })
    }

    /// Pointer to the start of the executable mapping — the value stored
    /// in the JIT cache's `(block_ptr, block_size)` pair.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableBlock {
    fn drop(&mut self) {
        // SAFETY: `self.ptr` (and `self.write_ptr`, if set) were obtained
        // from `mmap` with exactly `self.len` bytes and are not used again
        // after this point.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
            if let Some(write_ptr) = self.write_ptr {
                libc::munmap(write_ptr.as_ptr().cast(), self.len);
            }
        }
    }
}

fn page_round(len: usize) -> usize {
    let page = 4096usize;
    (len.max(1) + page - 1) / page * page
}

fn mmap_anon(len: usize, prot: libc::c_int) -> io::Result<NonNull<u8>> {
    // SAFETY: a plain anonymous mapping request; the raw pointer is
    // checked for `MAP_FAILED` before use.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(NonNull::new(ptr.cast()).expect("mmap returned null on success"))
}

fn mmap_shared(fd: libc::c_int, len: usize, prot: libc::c_int) -> io::Result<NonNull<u8>> {
    // SAFETY: `fd` is a valid, sized memory-object descriptor created by
    // `memfd_create` just above; the result is checked for `MAP_FAILED`.
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(NonNull::new(ptr.cast()).expect("mmap returned null on success"))
}

/// Create an anonymous, sized shared memory object to back a dual mapping.
///
/// # Safety
/// Caller must eventually `close` the returned descriptor once it is done
/// mapping it (the mappings themselves keep the underlying object alive).
unsafe fn memfd_create(len: usize) -> io::Result<libc::c_int> {
    let name = c"dbt-jit-block";
    let fd = libc::memfd_create(name.as_ptr(), 0);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if libc::ftruncate(fd, len as libc::off_t) != 0 {
        let err = io::Error::last_os_error();
        libc::close(fd);
        return Err(err);
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rwx_block_contains_the_copied_code() {
        let code = [0xC3u8]; // ret
        let block = ExecutableBlock::new_rwx(&code).expect("mmap should succeed in tests");
        assert!(block.len() >= code.len());
        // SAFETY: the block is mapped PROT_READ, so reading it back is sound.
        let read_back = unsafe { std::slice::from_raw_parts(block.as_ptr(), code.len()) };
        assert_eq!(read_back, &code);
    }

    #[test]
    fn dual_mapped_block_contains_the_copied_code() {
        let code = [0x90u8, 0xC3u8]; // nop; ret
        let block =
            ExecutableBlock::new_dual_mapped(&code).expect("dual mapping should succeed in tests");
        // SAFETY: the executable mapping is also PROT_READ.
        let read_back = unsafe { std::slice::from_raw_parts(block.as_ptr(), code.len()) };
        assert_eq!(read_back, &code);
    }

    #[test]
    fn page_round_rounds_up_to_page_size() {
        assert_eq!(page_round(1), 4096);
        assert_eq!(page_round(4096), 4096);
        assert_eq!(page_round(4097), 8192);
    }
}
