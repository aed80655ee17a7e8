// Code Region - an anonymous mapping that is either writable or executable, never both
//
// States:
//   Unmapped -> Writable -> Executable -> Unmapped
//                  ^            |
//                  +------------+   (make_writable, for patching)

use crate::error::{HostError, Result};
use crate::ffi::{CallTarget, EntryPoint};
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Unmapped,
    Writable,
    Executable,
}

impl Protection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protection::Unmapped => "Unmapped",
            Protection::Writable => "Writable",
            Protection::Executable => "Executable",
        }
    }

    fn prot_flags(&self) -> libc::c_int {
        match self {
            Protection::Unmapped => libc::PROT_NONE,
            Protection::Writable => libc::PROT_READ | libc::PROT_WRITE,
            Protection::Executable => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// Round `len` up to a whole number of pages, `None` on overflow
fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}

/// A block of process memory holding loaded machine code.
///
/// The region owns its mapping: dropping it unmaps the memory on every path,
/// including error paths inside [`CodeLoader::load`](super::CodeLoader::load).
pub struct CodeRegion {
    ptr: *mut u8,
    mapped_len: usize,
    code_len: usize,
    state: Protection,
}

// The mapping is owned exclusively and mutation requires `&mut self`.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Map `len` bytes (page rounded) read/write.
    pub(crate) fn map_writable(len: usize) -> Result<Self> {
        let mapped_len = round_to_pages(len.max(1)).ok_or_else(|| HostError::Allocation {
            size: len,
            reason: "size overflows when rounded to pages".to_string(),
        })?;

        let mmap = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                Protection::Writable.prot_flags(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            return Err(HostError::allocation_os(mapped_len));
        }

        log::trace!("mapped {} bytes at {:p} (Writable)", mapped_len, mmap);

        Ok(Self {
            ptr: mmap.cast::<u8>(),
            mapped_len,
            code_len: len,
            state: Protection::Writable,
        })
    }

    pub fn state(&self) -> Protection {
        self.state
    }

    /// Number of code bytes (the size requested at load time)
    pub fn len(&self) -> usize {
        self.code_len
    }

    pub fn is_empty(&self) -> bool {
        self.code_len == 0
    }

    /// Size of the underlying mapping, a multiple of the page size
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Read back the code bytes. Both writable and executable pages are readable.
    /// Empty once the region has been unmapped.
    pub fn bytes(&self) -> &[u8] {
        if self.state == Protection::Unmapped {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.code_len) }
    }

    /// Copy `bytes` into the region at `offset`. Only allowed while `Writable`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.state != Protection::Writable {
            return Err(HostError::InvalidState(format!(
                "cannot write to a region that is {}",
                self.state
            )));
        }
        let end = offset.checked_add(bytes.len()).filter(|end| *end <= self.mapped_len);
        if end.is_none() {
            return Err(HostError::InvalidArgument(format!(
                "write of {} bytes at offset {} exceeds mapping of {} bytes",
                bytes.len(),
                offset,
                self.mapped_len
            )));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Fill `[from, mapped_len)` with `byte`.
    pub(crate) fn fill_from(&mut self, from: usize, byte: u8) {
        debug_assert_eq!(self.state, Protection::Writable);
        if from < self.mapped_len {
            unsafe { ptr::write_bytes(self.ptr.add(from), byte, self.mapped_len - from) };
        }
    }

    /// Writable -> Executable. The instruction cache is synchronised first.
    pub fn make_executable(&mut self) -> Result<()> {
        match self.state {
            Protection::Executable => return Ok(()),
            Protection::Writable => {}
            Protection::Unmapped => {
                return Err(HostError::InvalidState(
                    "cannot publish an unmapped region".to_string(),
                ))
            }
        }

        flush_icache(self.ptr, self.mapped_len);
        self.transition(Protection::Executable)
    }

    /// Executable -> Writable, so loaded code can be patched and republished.
    pub fn make_writable(&mut self) -> Result<()> {
        match self.state {
            Protection::Writable => return Ok(()),
            Protection::Executable => {}
            Protection::Unmapped => {
                return Err(HostError::InvalidState(
                    "cannot reopen an unmapped region".to_string(),
                ))
            }
        }
        self.transition(Protection::Writable)
    }

    fn transition(&mut self, to: Protection) -> Result<()> {
        #[cfg(test)]
        if test_hooks::take_refusal(to) {
            return Err(HostError::Protection {
                from: self.state.as_str(),
                to: to.as_str(),
                reason: "refused by test hook".to_string(),
            });
        }

        let rc = unsafe { libc::mprotect(self.ptr.cast(), self.mapped_len, to.prot_flags()) };
        if rc != 0 {
            // mprotect failing leaves the old protection in place
            return Err(HostError::protection_os(self.state.as_str(), to.as_str()));
        }
        log::trace!("region {:p}: {} -> {}", self.ptr, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Entry point at the start of the region
    pub fn entry(&self) -> Result<EntryPoint> {
        self.entry_at(0)
    }

    /// Entry point `offset` bytes into the code
    pub fn entry_at(&self, offset: usize) -> Result<EntryPoint> {
        if self.state != Protection::Executable {
            return Err(HostError::InvalidState(format!(
                "cannot call into a region that is {}",
                self.state
            )));
        }
        if offset >= self.code_len {
            return Err(HostError::InvalidArgument(format!(
                "entry offset {} is outside {} bytes of code",
                offset, self.code_len
            )));
        }
        EntryPoint::new(unsafe { self.ptr.add(offset) } as *const c_void)
    }

    /// Release the mapping. Safe to call more than once.
    pub(crate) fn unmap(&mut self) {
        if self.state == Protection::Unmapped {
            return;
        }
        let rc = unsafe { libc::munmap(self.ptr.cast(), self.mapped_len) };
        if rc != 0 {
            log::error!(
                "munmap of {} bytes at {:p} failed: {}",
                self.mapped_len,
                self.ptr,
                std::io::Error::last_os_error()
            );
        } else {
            log::trace!("unmapped {} bytes at {:p}", self.mapped_len, self.ptr);
        }
        #[cfg(test)]
        test_hooks::record_unmap();
        self.state = Protection::Unmapped;
    }
}

impl CallTarget for CodeRegion {
    fn entry_point(&self) -> Result<EntryPoint> {
        self.entry()
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.code_len)
            .field("mapped_len", &self.mapped_len)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        __clear_cache(ptr.cast(), ptr.add(len).cast());
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        sys_icache_invalidate(ptr.cast(), len);
    }
}

// x86 keeps instruction and data caches coherent
#[cfg(not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))))]
fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}
