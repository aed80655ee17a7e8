// Memory Shim - swappable allocate/release behind stable function pointers
//
// Usage:
//   let api = get_memory_api();              // same address every call
//   let ptr = (api.allocate)(64);
//   (api.release)(ptr);
//
//   MemoryShim::global().swap(Arc::new(LibcAllocator));
//
// Swap policy: swapping is always allowed. Every live block is recorded with
// the allocator that produced it, and `release` routes back to that allocator,
// so blocks allocated before a swap are freed correctly after it.

use super::allocator::{LibcAllocator, NativeAllocator, SystemAllocator};
use crate::config::{AllocatorKind, HostConfig};
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

struct Allocation {
    size: usize,
    allocator: Arc<dyn NativeAllocator>,
}

#[derive(Default)]
struct Ledger {
    live: FxHashMap<usize, Allocation>,
    live_bytes: usize,
    total_allocations: u64,
    total_releases: u64,
}

/// Snapshot of the shim's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub total_allocations: u64,
    pub total_releases: u64,
    pub swaps: u64,
}

pub struct MemoryShim {
    active: RwLock<Arc<dyn NativeAllocator>>,
    ledger: Mutex<Ledger>,
    swaps: AtomicU64,
}

impl MemoryShim {
    pub fn new(allocator: Arc<dyn NativeAllocator>) -> Self {
        Self {
            active: RwLock::new(allocator),
            ledger: Mutex::new(Ledger::default()),
            swaps: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &HostConfig) -> Result<Self> {
        Ok(Self::new(allocator_from_config(config)?))
    }

    /// The process-wide shim behind [`get_memory_api`]
    pub fn global() -> &'static Arc<MemoryShim> {
        static SHIM: OnceLock<Arc<MemoryShim>> = OnceLock::new();
        SHIM.get_or_init(|| Arc::new(MemoryShim::new(Arc::new(SystemAllocator::default()))))
    }

    /// Point the process-wide shim, and with it the C function-pointer table,
    /// at the allocator `config` describes. Returns the allocator it replaces.
    pub fn configure_global(config: &HostConfig) -> Result<Arc<dyn NativeAllocator>> {
        let allocator = allocator_from_config(config)?;
        Ok(Self::global().swap(allocator))
    }

    /// Allocate `size` bytes from the active allocator.
    /// Null when `size` is zero or the allocator fails.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }

        let allocator = self.active.read().clone();
        let ptr = allocator.allocate(size);
        if ptr.is_null() {
            log::warn!("{} allocator failed to provide {} bytes", allocator.name(), size);
            return ptr;
        }

        let mut ledger = self.ledger.lock();
        ledger.live.insert(ptr as usize, Allocation { size, allocator });
        ledger.live_bytes += size;
        ledger.total_allocations += 1;
        ptr
    }

    /// Free a block through the allocator that produced it. Null is a no-op.
    ///
    /// # Panics
    ///
    /// Releasing a pointer this shim did not hand out, or releasing one twice,
    /// is a contract violation and panics before touching any heap.
    pub fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let allocation = {
            let mut ledger = self.ledger.lock();
            let allocation = ledger.live.remove(&(ptr as usize));
            if let Some(allocation) = &allocation {
                ledger.live_bytes -= allocation.size;
                ledger.total_releases += 1;
            }
            allocation
        };

        match allocation {
            Some(allocation) => unsafe { allocation.allocator.release(ptr, allocation.size) },
            None => {
                log::error!("release of {:p}, which is not a live shim allocation", ptr);
                panic!(
                    "contract violation: {:p} was not allocated by this memory shim or was already released",
                    ptr
                );
            }
        }
    }

    /// Install `allocator` for future allocations and return the previous one.
    /// Outstanding blocks keep releasing through their original allocator.
    pub fn swap(&self, allocator: Arc<dyn NativeAllocator>) -> Arc<dyn NativeAllocator> {
        let mut active = self.active.write();
        log::info!("memory shim: {} -> {}", active.name(), allocator.name());
        self.swaps.fetch_add(1, Ordering::Relaxed);
        std::mem::replace(&mut *active, allocator)
    }

    pub fn active_name(&self) -> String {
        self.active.read().name().to_string()
    }

    /// Whether `ptr` is a live block of this shim
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.ledger.lock().live.contains_key(&(ptr as usize))
    }

    /// Size requested for a live block
    pub fn size_of(&self, ptr: *const u8) -> Option<usize> {
        self.ledger.lock().live.get(&(ptr as usize)).map(|a| a.size)
    }

    pub fn stats(&self) -> MemoryStats {
        let ledger = self.ledger.lock();
        MemoryStats {
            live_allocations: ledger.live.len(),
            live_bytes: ledger.live_bytes,
            total_allocations: ledger.total_allocations,
            total_releases: ledger.total_releases,
            swaps: self.swaps.load(Ordering::Relaxed),
        }
    }
}

fn allocator_from_config(config: &HostConfig) -> Result<Arc<dyn NativeAllocator>> {
    config.validate()?;
    Ok(match config.allocator {
        AllocatorKind::System => Arc::new(SystemAllocator::new(config.alloc_alignment)?),
        AllocatorKind::Libc => Arc::new(LibcAllocator),
    })
}

impl fmt::Debug for MemoryShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryShim")
            .field("active", &self.active_name())
            .field("stats", &self.stats())
            .finish()
    }
}

// ==================== C ABI ====================

/// The native heap hooks as a C struct of two function pointers.
///
/// Both pointers route through [`MemoryShim::global`]. A contract violation in
/// `release` (foreign or double-freed pointer) panics inside an `extern "C"`
/// function, which aborts the process.
#[repr(C)]
pub struct MemoryApi {
    pub allocate: extern "C" fn(size: usize) -> *mut c_void,
    pub release: extern "C" fn(ptr: *mut c_void),
}

impl fmt::Debug for MemoryApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryApi")
            .field("allocate", &(self.allocate as *const c_void))
            .field("release", &(self.release as *const c_void))
            .finish()
    }
}

extern "C" fn shim_allocate(size: usize) -> *mut c_void {
    MemoryShim::global().allocate(size).cast()
}

extern "C" fn shim_release(ptr: *mut c_void) {
    MemoryShim::global().release(ptr.cast())
}

static MEMORY_API: MemoryApi = MemoryApi {
    allocate: shim_allocate,
    release: shim_release,
};

/// The singleton function-pointer table; the same address on every call.
pub fn get_memory_api() -> &'static MemoryApi {
    &MEMORY_API
}

/// C entry point for hosts that look the memory hooks up by symbol
#[no_mangle]
pub extern "C" fn nativehost_get_memory_api() -> *const MemoryApi {
    &MEMORY_API
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls and forwards to libc
    #[derive(Default)]
    struct Intercepting {
        allocs: AtomicUsize,
        frees: AtomicUsize,
    }

    impl NativeAllocator for Intercepting {
        fn name(&self) -> &str {
            "intercepting"
        }

        fn allocate(&self, size: usize) -> *mut u8 {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            LibcAllocator.allocate(size)
        }

        unsafe fn release(&self, ptr: *mut u8, size: usize) {
            self.frees.fetch_add(1, Ordering::SeqCst);
            LibcAllocator.release(ptr, size)
        }
    }

    fn local_shim() -> MemoryShim {
        MemoryShim::from_config(&HostConfig::default()).unwrap()
    }

    #[test]
    fn test_api_is_singleton() {
        let a = get_memory_api();
        let b = get_memory_api();
        assert!(std::ptr::eq(a, b));
        assert!(std::ptr::eq(a, nativehost_get_memory_api()));
    }

    #[test]
    fn test_api_cycles_through_global_shim() {
        let api = get_memory_api();
        for _ in 0..1000 {
            let ptr = (api.allocate)(64);
            assert!(!ptr.is_null());
            assert!(MemoryShim::global().owns(ptr.cast()));
            unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0xEE, 64) };
            (api.release)(ptr);
        }
        (api.release)(std::ptr::null_mut());
    }

    #[test]
    fn test_configure_global_reroutes_api() {
        let config = HostConfig::from_json(r#"{ "allocator": "libc" }"#).unwrap();
        let api = get_memory_api();
        let before = (api.allocate)(24);

        let previous = MemoryShim::configure_global(&config).unwrap();
        let after = (api.allocate)(48);
        assert!(MemoryShim::global().owns(after.cast()));
        assert_eq!(MemoryShim::global().size_of(after.cast()), Some(48));

        // each block goes back to the allocator that produced it
        (api.release)(before);
        (api.release)(after);
        MemoryShim::global().swap(previous);

        let bad = HostConfig {
            alloc_alignment: 3,
            ..HostConfig::default()
        };
        assert!(MemoryShim::configure_global(&bad).is_err());
    }

    #[test]
    fn test_cycles_leave_nothing_live() {
        let shim = local_shim();
        for _ in 0..500 {
            let ptr = shim.allocate(64);
            assert_eq!(shim.size_of(ptr), Some(64));
            shim.release(ptr);
        }
        let stats = shim.stats();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.total_allocations, 500);
        assert_eq!(stats.total_releases, 500);
    }

    #[test]
    fn test_zero_size_is_null() {
        let shim = local_shim();
        assert!(shim.allocate(0).is_null());
        assert_eq!(shim.stats().total_allocations, 0);
    }

    #[test]
    fn test_release_routes_to_original_allocator() {
        let shim = local_shim();
        let before = shim.allocate(128);

        let interceptor = Arc::new(Intercepting::default());
        let previous = shim.swap(interceptor.clone());
        assert_eq!(previous.name(), "system");
        assert_eq!(shim.active_name(), "intercepting");

        let after = shim.allocate(16);
        assert_eq!(interceptor.allocs.load(Ordering::SeqCst), 1);

        // allocated by the system allocator, must not reach the interceptor
        shim.release(before);
        assert_eq!(interceptor.frees.load(Ordering::SeqCst), 0);

        shim.release(after);
        assert_eq!(interceptor.frees.load(Ordering::SeqCst), 1);
        assert_eq!(shim.stats().swaps, 1);
        assert_eq!(shim.stats().live_allocations, 0);
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_double_release_panics() {
        let shim = local_shim();
        let ptr = shim.allocate(8);
        shim.release(ptr);
        shim.release(ptr);
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_foreign_pointer_panics() {
        let shim = local_shim();
        let mut on_stack = 0u8;
        shim.release(&mut on_stack);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let shim = Arc::new(local_shim());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shim = shim.clone();
                std::thread::spawn(move || {
                    for size in 1..200 {
                        let ptr = shim.allocate(size);
                        shim.release(ptr);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(shim.stats().live_allocations, 0);
        assert_eq!(shim.stats().total_allocations, 4 * 199);
    }
}
