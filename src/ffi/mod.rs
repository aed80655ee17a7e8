// Foreign Function Interface
//
// Typed argument slots, the libffi trampoline, and shared library symbols.
// `invoker` is the only module here that performs foreign calls.

mod invoker;
mod library;
mod types;

pub use invoker::{FunctionInvoker, InvocationDescriptor};
pub use library::{NativeLibrary, Symbol};
pub use types::{ArgValue, CType, CallTarget, EntryPoint, ReturnSlot, ReturnValue, SlotClass};
