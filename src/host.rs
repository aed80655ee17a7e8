// Host - one composed instance of the loader, invoker, dispatch layer and memory shim
//
// Usage:
//   let host = Host::with_config(HostConfig::from_json(config_json)?)?;
//   let region = host.load_code(&code, code.len())?;
//   unsafe { host.call_function(&region, &[ArgValue::out(&mut counter)])? };
//
//   let obj = host.create_dynamic_object(["foo", "bar"]);
//   host.register_callback_for_method("foo", |obj| { /* ... */ });
//   host.call_dynamic_method(&obj, "foo")?;
//
// Independent hosts share nothing. The C function-pointer table routes through
// the process-wide shim, so only `Host::global()` hands it out; configure that
// shim with `MemoryShim::configure_global`.

use crate::config::HostConfig;
use crate::dynamic::{CallbackTable, DynamicObject, DynamicObjectRegistry};
use crate::error::Result;
use crate::ffi::{ArgValue, CallTarget, FunctionInvoker, ReturnSlot};
use crate::loader::{CodeLoader, CodeRegion};
use crate::memory::{get_memory_api, MemoryApi, MemoryShim, SystemAllocator};
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    loader: CodeLoader,
    invoker: FunctionInvoker,
    objects: DynamicObjectRegistry,
    memory: Arc<MemoryShim>,
}

impl Host {
    /// A host with the default configuration and its own memory shim
    pub fn new() -> Self {
        let memory = Arc::new(MemoryShim::new(Arc::new(SystemAllocator::default())));
        Self::assemble(HostConfig::default(), memory)
    }

    pub fn with_config(config: HostConfig) -> Result<Self> {
        let memory = Arc::new(MemoryShim::from_config(&config)?);
        Ok(Self::assemble(config, memory))
    }

    /// The process-wide default host behind the crate-level free functions.
    /// Its memory shim is [`MemoryShim::global`].
    pub fn global() -> &'static Host {
        static HOST: OnceLock<Host> = OnceLock::new();
        HOST.get_or_init(|| Self::assemble(HostConfig::default(), MemoryShim::global().clone()))
    }

    fn assemble(config: HostConfig, memory: Arc<MemoryShim>) -> Self {
        Self {
            loader: CodeLoader::new(config.fill_byte),
            invoker: FunctionInvoker::new(),
            objects: DynamicObjectRegistry::new(Arc::new(CallbackTable::new())),
            memory,
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn loader(&self) -> &CodeLoader {
        &self.loader
    }

    pub fn invoker(&self) -> &FunctionInvoker {
        &self.invoker
    }

    pub fn objects(&self) -> &DynamicObjectRegistry {
        &self.objects
    }

    pub fn callbacks(&self) -> &Arc<CallbackTable> {
        self.objects.callbacks()
    }

    pub fn memory(&self) -> &Arc<MemoryShim> {
        &self.memory
    }

    // ==================== Code ====================

    pub fn load_code(&self, bytes: &[u8], size: usize) -> Result<CodeRegion> {
        self.loader.load(bytes, size)
    }

    pub fn unload_code(&self, region: CodeRegion) {
        self.loader.unload(region)
    }

    /// Call the start of `region` with `args`, ignoring any return value.
    /// Results come back through pointer slots the caller arranges.
    ///
    /// # Safety
    ///
    /// See [`FunctionInvoker::call`]: `args` must match the loaded code's real
    /// signature, and the code must be correct for this platform. The calling
    /// thread blocks until the code returns, with no timeout.
    pub unsafe fn call_function(&self, region: &CodeRegion, args: &[ArgValue]) -> Result<()> {
        self.invoker.call_void(region, args)
    }

    /// Call any target and capture its return value in `ret`.
    ///
    /// # Safety
    ///
    /// See [`FunctionInvoker::call`].
    pub unsafe fn call_function_with_result<T: CallTarget + ?Sized>(
        &self,
        target: &T,
        args: &[ArgValue],
        ret: &mut ReturnSlot,
    ) -> Result<()> {
        self.invoker.call(target, args, ret)
    }

    // ==================== Dynamic objects ====================

    pub fn create_dynamic_object<I, S>(&self, method_names: I) -> DynamicObject
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.objects.create(method_names)
    }

    /// # Panics
    ///
    /// On contract violations, see [`DynamicObjectRegistry::invoke`].
    pub fn call_dynamic_method(&self, obj: &DynamicObject, method: &str) -> Result<()> {
        self.objects.invoke(obj, method)
    }

    pub fn register_callback_for_method<F>(&self, method: &str, callback: F)
    where
        F: Fn(&DynamicObject) + Send + Sync + 'static,
    {
        self.callbacks().register(method, callback)
    }

    pub fn release_dynamic_object(&self, obj: &DynamicObject) -> bool {
        self.objects.release(obj)
    }

    // ==================== Memory ====================

    /// The C function-pointer table, if this host's shim is the one behind it.
    ///
    /// The table is a process-wide singleton bound to [`MemoryShim::global`], so
    /// a host built with its own shim (`new`, `with_config`) gets `None`.
    pub fn memory_api(&self) -> Option<&'static MemoryApi> {
        if Arc::ptr_eq(&self.memory, MemoryShim::global()) {
            Some(get_memory_api())
        } else {
            None
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}
