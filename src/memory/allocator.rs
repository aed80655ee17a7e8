use crate::error::{HostError, Result};
use std::alloc::{alloc, dealloc, Layout};

/// A native heap the memory shim can route allocations to.
///
/// Install a custom implementation to intercept every `allocate`/`release`
/// that goes through the shim.
pub trait NativeAllocator: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate `size` bytes (`size > 0`). Null on failure.
    fn allocate(&self, size: usize) -> *mut u8;

    /// Free a block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this same allocator with
    /// the same `size`, and not released since.
    unsafe fn release(&self, ptr: *mut u8, size: usize);
}

/// Rust's global allocator with a fixed alignment for every block
#[derive(Debug, Clone, Copy)]
pub struct SystemAllocator {
    align: usize,
}

impl SystemAllocator {
    pub fn new(align: usize) -> Result<Self> {
        Layout::from_size_align(1, align)
            .map_err(|_| HostError::Config(format!("invalid allocation alignment {}", align)))?;
        Ok(Self { align })
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

impl Default for SystemAllocator {
    /// Suitably aligned for any C scalar on the platforms we build for
    fn default() -> Self {
        Self { align: 16 }
    }
}

impl NativeAllocator for SystemAllocator {
    fn name(&self) -> &str {
        "system"
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        match Layout::from_size_align(size, self.align) {
            Ok(layout) if size > 0 => unsafe { alloc(layout) },
            _ => std::ptr::null_mut(),
        }
    }

    unsafe fn release(&self, ptr: *mut u8, size: usize) {
        // Same layout as `allocate` produced, so this cannot fail
        if let Ok(layout) = Layout::from_size_align(size, self.align) {
            dealloc(ptr, layout);
        }
    }
}

/// The C library's `malloc`/`free`
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcAllocator;

impl NativeAllocator for LibcAllocator {
    fn name(&self) -> &str {
        "libc"
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        unsafe { libc::malloc(size).cast() }
    }

    unsafe fn release(&self, ptr: *mut u8, _size: usize) {
        libc::free(ptr.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_alignment() {
        let allocator = SystemAllocator::new(64).unwrap();
        let ptr = allocator.allocate(10);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);
        unsafe { allocator.release(ptr, 10) };

        assert!(SystemAllocator::new(3).is_err());
        assert!(allocator.allocate(0).is_null());
    }

    #[test]
    fn test_libc_round_trip() {
        let allocator = LibcAllocator;
        let ptr = allocator.allocate(32);
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr, 0x5A, 32);
            assert_eq!(*ptr.add(31), 0x5A);
            allocator.release(ptr, 32);
        }
    }
}
