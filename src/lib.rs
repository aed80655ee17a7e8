// nativehost
// Host externally supplied machine code and dynamically declared objects in-process

pub mod config;
pub mod dynamic;
pub mod error;
pub mod ffi;
pub mod host;
pub mod loader;
pub mod memory;

pub use config::{AllocatorKind, HostConfig};
pub use dynamic::{CallbackTable, DynamicObject, DynamicObjectRegistry, ObjectId};
pub use error::{HostError, Result};
pub use ffi::{ArgValue, CType, CallTarget, EntryPoint, FunctionInvoker, NativeLibrary, ReturnSlot, ReturnValue};
pub use host::Host;
pub use loader::{CodeLoader, CodeRegion, Protection};
pub use memory::{MemoryApi, MemoryShim, NativeAllocator};

// Free functions over the process-wide default host.
// Build a `Host` directly when independent instances are needed (tests, embedding).

/// Map `bytes` into a fresh executable region of at least `size` bytes
pub fn load_code(bytes: &[u8], size: usize) -> Result<CodeRegion> {
    Host::global().load_code(bytes, size)
}

/// Unmap a region loaded with [`load_code`]
pub fn unload_code(region: CodeRegion) {
    Host::global().unload_code(region)
}

/// Call the start of a loaded region. Nothing is returned; results travel
/// through pointer arguments (see [`ArgValue::out`]).
///
/// # Safety
///
/// `args` must match the real signature of the loaded code. A mismatch is
/// undefined behaviour: it may corrupt the stack or registers or crash the
/// process. The call blocks the current thread until the code returns; code
/// that never returns hangs the thread, there is no timeout.
pub unsafe fn call_function(region: &CodeRegion, args: &[ArgValue]) -> Result<()> {
    Host::global().call_function(region, args)
}

/// Create an object answering `method_names`
pub fn create_dynamic_object<I, S>(method_names: I) -> DynamicObject
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Host::global().create_dynamic_object(method_names)
}

/// Dispatch `method` on `obj` through the callback table.
///
/// Fails with [`HostError::UnboundMethod`] if nothing is registered for a
/// declared method. Panics if `method` was never declared on `obj`.
pub fn call_dynamic_method(obj: &DynamicObject, method: &str) -> Result<()> {
    Host::global().call_dynamic_method(obj, method)
}

/// Bind `callback` to `method` for every object declaring it (last write wins)
pub fn register_callback_for_method<F>(method: &str, callback: F)
where
    F: Fn(&DynamicObject) + Send + Sync + 'static,
{
    Host::global().register_callback_for_method(method, callback)
}

/// The singleton allocate/release function-pointer table
pub fn get_memory_api() -> &'static MemoryApi {
    memory::get_memory_api()
}
