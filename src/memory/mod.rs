// Native Memory
//
// The allocator shim that stands in for a managed runtime's native heap hooks.

mod allocator;
mod shim;

pub use allocator::{LibcAllocator, NativeAllocator, SystemAllocator};
pub use shim::{get_memory_api, nativehost_get_memory_api, MemoryApi, MemoryShim, MemoryStats};
