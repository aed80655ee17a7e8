// Dynamic Dispatch
//
// Objects synthesized at run time with a fixed set of method names, and the
// name-keyed callback table their invocations resolve through.

mod callbacks;
mod object;

pub use callbacks::{Callback, CallbackTable};
pub use object::{DynamicObject, DynamicObjectRegistry, ObjectId};
