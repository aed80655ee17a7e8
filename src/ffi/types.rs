use crate::error::{HostError, Result};
use libffi::middle::Type as FfiType;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

// ==================== Type System ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CType {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
    CString,
}

/// Coarse register class of an argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    Integer,
    Pointer,
    Float,
}

impl CType {
    /// Parse type from string - only canonical names
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "void" => Ok(CType::Void),
            "i8" => Ok(CType::I8),
            "u8" => Ok(CType::U8),
            "i16" => Ok(CType::I16),
            "u16" => Ok(CType::U16),
            "i32" => Ok(CType::I32),
            "u32" => Ok(CType::U32),
            "i64" => Ok(CType::I64),
            "u64" => Ok(CType::U64),
            "f32" => Ok(CType::F32),
            "f64" => Ok(CType::F64),
            "ptr" => Ok(CType::Pointer),
            "cstr" => Ok(CType::CString),
            _ => Err(HostError::InvalidArgument(format!(
                "Unknown FFI type: '{}'. Valid types: void, i8, u8, i16, u16, i32, u32, i64, u64, f32, f64, ptr, cstr",
                s
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CType::Void => "void",
            CType::I8 => "i8",
            CType::U8 => "u8",
            CType::I16 => "i16",
            CType::U16 => "u16",
            CType::I32 => "i32",
            CType::U32 => "u32",
            CType::I64 => "i64",
            CType::U64 => "u64",
            CType::F32 => "f32",
            CType::F64 => "f64",
            CType::Pointer => "ptr",
            CType::CString => "cstr",
        }
    }

    pub(crate) fn to_ffi_type(self) -> FfiType {
        match self {
            CType::Void => FfiType::void(),
            CType::I8 => FfiType::i8(),
            CType::U8 => FfiType::u8(),
            CType::I16 => FfiType::i16(),
            CType::U16 => FfiType::u16(),
            CType::I32 => FfiType::i32(),
            CType::U32 => FfiType::u32(),
            CType::I64 => FfiType::i64(),
            CType::U64 => FfiType::u64(),
            CType::F32 => FfiType::f32(),
            CType::F64 => FfiType::f64(),
            CType::Pointer | CType::CString => FfiType::pointer(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            CType::Void => 0,
            CType::I8 | CType::U8 => 1,
            CType::I16 | CType::U16 => 2,
            CType::I32 | CType::U32 | CType::F32 => 4,
            CType::I64 | CType::U64 | CType::F64 => 8,
            CType::Pointer | CType::CString => std::mem::size_of::<usize>(),
        }
    }

    /// `None` for `Void`, which has no slot
    pub fn class(&self) -> Option<SlotClass> {
        match self {
            CType::Void => None,
            CType::F32 | CType::F64 => Some(SlotClass::Float),
            CType::Pointer | CType::CString => Some(SlotClass::Pointer),
            _ => Some(SlotClass::Integer),
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ==================== Argument Slots ====================

/// One typed argument of a foreign call
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
    /// Copied into a NUL-terminated buffer that lives for the duration of the call
    CStr(String),
}

impl ArgValue {
    pub fn ctype(&self) -> CType {
        match self {
            ArgValue::I8(_) => CType::I8,
            ArgValue::U8(_) => CType::U8,
            ArgValue::I16(_) => CType::I16,
            ArgValue::U16(_) => CType::U16,
            ArgValue::I32(_) => CType::I32,
            ArgValue::U32(_) => CType::U32,
            ArgValue::I64(_) => CType::I64,
            ArgValue::U64(_) => CType::U64,
            ArgValue::F32(_) => CType::F32,
            ArgValue::F64(_) => CType::F64,
            ArgValue::Ptr(_) => CType::Pointer,
            ArgValue::CStr(_) => CType::CString,
        }
    }

    pub fn class(&self) -> SlotClass {
        match self {
            ArgValue::F32(_) | ArgValue::F64(_) => SlotClass::Float,
            ArgValue::Ptr(_) | ArgValue::CStr(_) => SlotClass::Pointer,
            _ => SlotClass::Integer,
        }
    }

    /// Pointer slot for an out-parameter the native code writes through
    pub fn out<T>(target: &mut T) -> Self {
        ArgValue::Ptr((target as *mut T).cast())
    }
}

// ==================== Return Slot ====================

/// A value produced by a foreign call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
}

impl ReturnValue {
    /// Integer view of integer and pointer results
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ReturnValue::I8(v) => Some(v as i64),
            ReturnValue::U8(v) => Some(v as i64),
            ReturnValue::I16(v) => Some(v as i64),
            ReturnValue::U16(v) => Some(v as i64),
            ReturnValue::I32(v) => Some(v as i64),
            ReturnValue::U32(v) => Some(v as i64),
            ReturnValue::I64(v) => Some(v),
            ReturnValue::U64(v) => Some(v as i64),
            ReturnValue::Ptr(p) => Some(p as usize as i64),
            ReturnValue::F32(_) | ReturnValue::F64(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ReturnValue::F32(v) => Some(v as f64),
            ReturnValue::F64(v) => Some(v),
            _ => None,
        }
    }
}

/// Out-parameter that receives the native return value.
///
/// A `Void` slot discards whatever the callee leaves in the return register.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSlot {
    ctype: CType,
    value: Option<ReturnValue>,
}

impl ReturnSlot {
    pub fn new(ctype: CType) -> Self {
        Self { ctype, value: None }
    }

    pub fn void() -> Self {
        Self::new(CType::Void)
    }

    pub fn ctype(&self) -> CType {
        self.ctype
    }

    /// `None` before the call and for `Void`
    pub fn value(&self) -> Option<ReturnValue> {
        self.value
    }

    pub(crate) fn store(&mut self, value: Option<ReturnValue>) {
        self.value = value;
    }
}

// ==================== Entry Points ====================

/// Address of native code to call. Never null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(NonNull<c_void>);

// An entry point is only an address; calling it is what requires care.
unsafe impl Send for EntryPoint {}
unsafe impl Sync for EntryPoint {}

impl EntryPoint {
    pub fn new(ptr: *const c_void) -> Result<Self> {
        NonNull::new(ptr as *mut c_void)
            .map(EntryPoint)
            .ok_or_else(|| HostError::InvalidArgument("entry point is null".to_string()))
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Anything that can hand the invoker an entry point
pub trait CallTarget {
    fn entry_point(&self) -> Result<EntryPoint>;
}

impl CallTarget for EntryPoint {
    fn entry_point(&self) -> Result<EntryPoint> {
        Ok(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_names() {
        for name in [
            "void", "i8", "u8", "i16", "u16", "i32", "u32", "i64", "u64", "f32", "f64", "ptr",
            "cstr",
        ] {
            assert_eq!(CType::parse(name).unwrap().name(), name);
        }
        assert!(CType::parse("int").is_err());
    }

    #[test]
    fn test_slot_classes() {
        assert_eq!(ArgValue::I64(1).class(), SlotClass::Integer);
        assert_eq!(ArgValue::F32(1.0).class(), SlotClass::Float);
        assert_eq!(ArgValue::CStr("x".into()).class(), SlotClass::Pointer);
        assert_eq!(CType::Void.class(), None);
        assert_eq!(ArgValue::U16(3).ctype().class(), Some(SlotClass::Integer));
    }

    #[test]
    fn test_out_param_points_at_target() {
        let mut value = 5i64;
        let expected = &mut value as *mut i64 as *mut c_void;
        assert_eq!(ArgValue::out(&mut value), ArgValue::Ptr(expected));
    }

    #[test]
    fn test_null_entry_rejected() {
        assert!(EntryPoint::new(std::ptr::null()).is_err());
        let entry = EntryPoint::new(0x1000 as *const c_void).unwrap();
        assert_eq!(entry.addr(), 0x1000);
        assert_eq!(entry.entry_point().unwrap(), entry);
    }

    #[test]
    fn test_return_value_views() {
        assert_eq!(ReturnValue::I32(-4).as_i64(), Some(-4));
        assert_eq!(ReturnValue::F32(1.5).as_f64(), Some(1.5));
        assert_eq!(ReturnValue::F64(2.0).as_i64(), None);
        assert_eq!(ReturnSlot::void().value(), None);
    }
}
