// Native Library - resolve exported symbols to entry points
//
// Usage:
//   let lib = NativeLibrary::open("libm.so.6")?;
//   let cos = lib.symbol("cos")?;
//   let mut ret = ReturnSlot::new(CType::F64);
//   unsafe { invoker.call(&cos, &[ArgValue::F64(0.0)], &mut ret)? };

use super::types::{CallTarget, EntryPoint};
use crate::error::{HostError, Result};
use libloading::Library;
use std::ffi::{c_void, CString};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub struct NativeLibrary {
    library: Library,
    path: PathBuf,
}

impl NativeLibrary {
    /// Open a shared library. A bare name without an extension gets the
    /// platform's shared library suffix appended.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = with_platform_extension(path.as_ref());

        let library = unsafe {
            Library::new(&path).map_err(|e| {
                HostError::Library(format!("Failed to load library '{}': {}", path.display(), e))
            })?
        };

        log::debug!("opened native library {}", path.display());
        Ok(Self { library, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `name` to an entry point. The symbol borrows the library, so
    /// it cannot outlive it.
    pub fn symbol(&self, name: &str) -> Result<Symbol<'_>> {
        let name_c = CString::new(name)
            .map_err(|_| HostError::InvalidArgument(format!("Invalid symbol name '{}'", name)))?;

        let ptr = unsafe {
            let symbol: libloading::Symbol<'_, *const c_void> = self
                .library
                .get(name_c.as_bytes_with_nul())
                .map_err(|e| HostError::Library(format!("Symbol '{}' not found: {}", name, e)))?;
            *symbol
        };

        Ok(Symbol {
            entry: EntryPoint::new(ptr)?,
            _library: PhantomData,
        })
    }

    pub fn close(self) -> Result<()> {
        let path = self.path;
        self.library
            .close()
            .map_err(|e| HostError::Library(format!("Failed to close '{}': {}", path.display(), e)))
    }
}

/// An exported function of a [`NativeLibrary`]
#[derive(Debug, Clone, Copy)]
pub struct Symbol<'lib> {
    entry: EntryPoint,
    _library: PhantomData<&'lib NativeLibrary>,
}

impl Symbol<'_> {
    pub fn entry(&self) -> EntryPoint {
        self.entry
    }
}

impl CallTarget for Symbol<'_> {
    fn entry_point(&self) -> Result<EntryPoint> {
        Ok(self.entry)
    }
}

fn with_platform_extension(path: &Path) -> PathBuf {
    let has_extension = path
        .file_name()
        .map(|name| name.to_string_lossy().contains('.'))
        .unwrap_or(false);
    if has_extension {
        return path.to_path_buf();
    }

    let ext = if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    };
    path.with_extension(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::{ArgValue, CType, FunctionInvoker, ReturnSlot, ReturnValue};

    #[test]
    fn test_platform_extension() {
        let bare = with_platform_extension(Path::new("/usr/lib/libfoo"));
        assert!(bare.extension().is_some());
        assert_eq!(
            with_platform_extension(Path::new("libc.so.6")),
            PathBuf::from("libc.so.6")
        );
    }

    #[test]
    fn test_missing_library() {
        let err = NativeLibrary::open("/nonexistent/libnothing.so").err().unwrap();
        assert!(matches!(err, HostError::Library(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_call_libc_symbol() {
        let lib = NativeLibrary::open("libc.so.6").unwrap();
        assert!(matches!(lib.symbol("definitely_not_exported"), Err(HostError::Library(_))));

        let labs = lib.symbol("labs").unwrap();
        let mut ret = ReturnSlot::new(CType::I64);
        unsafe {
            FunctionInvoker::new()
                .call(&labs, &[ArgValue::I64(-42)], &mut ret)
                .unwrap();
        }
        assert_eq!(ret.value(), Some(ReturnValue::I64(42)));
        lib.close().unwrap();
    }
}
