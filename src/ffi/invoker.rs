// Function Invoker - the one place that crosses the native calling convention
//
// Usage:
//   let mut counter = 41i64;
//   let mut ret = ReturnSlot::void();
//   unsafe { invoker.call(&region, &[ArgValue::out(&mut counter)], &mut ret)? };
//
// Everything unsafe about foreign calls lives in this file. Other modules only
// build `ArgValue`s and `ReturnSlot`s.

use super::types::{ArgValue, CType, CallTarget, EntryPoint, ReturnSlot, ReturnValue, SlotClass};
use crate::error::{HostError, Result};
use libffi::middle::{Arg, Cif, CodePtr};
use smallvec::SmallVec;
use std::ffi::{c_char, c_void, CString};

/// Transient description of one foreign call: where, with what, returning what.
#[derive(Debug, Clone, Copy)]
pub struct InvocationDescriptor<'a> {
    entry: EntryPoint,
    args: &'a [ArgValue],
    returns: CType,
}

impl<'a> InvocationDescriptor<'a> {
    pub fn new(entry: EntryPoint, args: &'a [ArgValue], returns: CType) -> Self {
        Self {
            entry,
            args,
            returns,
        }
    }

    pub fn entry(&self) -> EntryPoint {
        self.entry
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn returns(&self) -> CType {
        self.returns
    }

    /// Register class per argument slot, in order
    pub fn classes(&self) -> SmallVec<[SlotClass; 8]> {
        self.args.iter().map(ArgValue::class).collect()
    }

    fn cif(&self) -> Cif {
        Cif::new(
            self.args.iter().map(|arg| arg.ctype().to_ffi_type()),
            self.returns.to_ffi_type(),
        )
    }
}

/// Performs synchronous foreign calls through libffi.
///
/// There is no timeout and no cancellation: the calling thread is blocked until
/// the native code returns. Code that loops forever hangs that thread forever,
/// and code that faults takes the process down with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionInvoker;

impl FunctionInvoker {
    pub fn new() -> Self {
        Self
    }

    /// Call `target` with `args`, storing the native result in `ret`.
    ///
    /// # Safety
    ///
    /// The argument slots and the return slot type MUST match the real signature
    /// of the code at the entry point, under the platform's C calling convention.
    /// Nothing checks this. A mismatch is a contract violation whose effect is
    /// undefined: it may corrupt registers or the stack, or crash the process.
    /// Pointer slots must be valid for whatever the callee does with them, and
    /// the code must stay mapped (and executable) for the duration of the call.
    pub unsafe fn call<T: CallTarget + ?Sized>(
        &self,
        target: &T,
        args: &[ArgValue],
        ret: &mut ReturnSlot,
    ) -> Result<()> {
        let descriptor = InvocationDescriptor::new(target.entry_point()?, args, ret.ctype());
        let value = self.invoke(&descriptor)?;
        ret.store(value);
        Ok(())
    }

    /// Call `target` discarding any result. Results must come back through
    /// pointer slots (see [`ArgValue::out`]).
    ///
    /// # Safety
    ///
    /// Same contract as [`FunctionInvoker::call`], with a `void` return.
    pub unsafe fn call_void<T: CallTarget + ?Sized>(&self, target: &T, args: &[ArgValue]) -> Result<()> {
        let mut ret = ReturnSlot::void();
        self.call(target, args, &mut ret)
    }

    /// Run one descriptor.
    ///
    /// # Safety
    ///
    /// See [`FunctionInvoker::call`].
    pub unsafe fn invoke(&self, descriptor: &InvocationDescriptor<'_>) -> Result<Option<ReturnValue>> {
        // FIRST: build every C string so the buffers outlive the call
        let mut cstrings: SmallVec<[CString; 2]> = SmallVec::new();
        for (idx, arg) in descriptor.args.iter().enumerate() {
            if let ArgValue::CStr(s) = arg {
                let c_str = CString::new(s.as_str()).map_err(|_| {
                    HostError::InvalidArgument(format!(
                        "args[{}]: C string contains an interior NUL byte",
                        idx
                    ))
                })?;
                cstrings.push(c_str);
            }
        }
        let cstring_ptrs: SmallVec<[*const c_char; 2]> =
            cstrings.iter().map(|c| c.as_ptr()).collect();

        let mut cstring_idx = 0;
        let mut ffi_args: SmallVec<[Arg; 8]> = SmallVec::with_capacity(descriptor.args.len());
        for arg in descriptor.args {
            let arg_ref = match arg {
                ArgValue::I8(v) => Arg::new(v),
                ArgValue::U8(v) => Arg::new(v),
                ArgValue::I16(v) => Arg::new(v),
                ArgValue::U16(v) => Arg::new(v),
                ArgValue::I32(v) => Arg::new(v),
                ArgValue::U32(v) => Arg::new(v),
                ArgValue::I64(v) => Arg::new(v),
                ArgValue::U64(v) => Arg::new(v),
                ArgValue::F32(v) => Arg::new(v),
                ArgValue::F64(v) => Arg::new(v),
                ArgValue::Ptr(v) => Arg::new(v),
                ArgValue::CStr(_) => {
                    let arg = Arg::new(&cstring_ptrs[cstring_idx]);
                    cstring_idx += 1;
                    arg
                }
            };
            ffi_args.push(arg_ref);
        }

        let cif = descriptor.cif();
        let code_ptr = CodePtr::from_ptr(descriptor.entry.as_ptr());

        log::trace!(
            "ffi call {:p} ({} args, {:?}) -> {}",
            descriptor.entry.as_ptr(),
            descriptor.arity(),
            descriptor.classes(),
            descriptor.returns
        );

        // libffi widens integer results narrower than a register to a full
        // `ffi_arg`, so those are read as u64 and truncated.
        let result = match descriptor.returns {
            CType::Void => {
                cif.call::<()>(code_ptr, &ffi_args);
                None
            }
            CType::I8 => Some(ReturnValue::I8(cif.call::<u64>(code_ptr, &ffi_args) as i8)),
            CType::U8 => Some(ReturnValue::U8(cif.call::<u64>(code_ptr, &ffi_args) as u8)),
            CType::I16 => Some(ReturnValue::I16(cif.call::<u64>(code_ptr, &ffi_args) as i16)),
            CType::U16 => Some(ReturnValue::U16(cif.call::<u64>(code_ptr, &ffi_args) as u16)),
            CType::I32 => Some(ReturnValue::I32(cif.call::<u64>(code_ptr, &ffi_args) as i32)),
            CType::U32 => Some(ReturnValue::U32(cif.call::<u64>(code_ptr, &ffi_args) as u32)),
            CType::I64 => Some(ReturnValue::I64(cif.call(code_ptr, &ffi_args))),
            CType::U64 => Some(ReturnValue::U64(cif.call(code_ptr, &ffi_args))),
            CType::F32 => Some(ReturnValue::F32(cif.call(code_ptr, &ffi_args))),
            CType::F64 => Some(ReturnValue::F64(cif.call(code_ptr, &ffi_args))),
            CType::Pointer | CType::CString => {
                Some(ReturnValue::Ptr(cif.call::<*mut c_void>(code_ptr, &ffi_args)))
            }
        };

        drop(cstrings);
        Ok(result)
    }
}
