// Host Error Handling
// Recoverable failures of the loader, invoker, dispatch layer and memory shim.
//
// Contract violations (undeclared method names, released objects, foreign
// pointers handed to the shim, signature mismatches) are NOT represented here.
// They panic or are undefined behaviour behind an `unsafe fn`.

use crate::dynamic::ObjectId;
use thiserror::Error;

/// Errors surfaced to callers as explicit failure results.
#[derive(Debug, Error)]
pub enum HostError {
    /// A memory mapping or heap allocation could not be obtained
    #[error("AllocationError: could not map {size} bytes: {reason}")]
    Allocation { size: usize, reason: String },

    /// The platform refused a permission transition on a mapped region
    #[error("ProtectionError: {from} -> {to} refused: {reason}")]
    Protection {
        from: &'static str,
        to: &'static str,
        reason: String,
    },

    /// The method is declared on the object but no callback is installed for it
    #[error("UnboundMethodError: '{method}' on object #{object} has no registered callback")]
    UnboundMethod { object: ObjectId, method: String },

    /// An argument was rejected before any native code ran
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// The operation is not permitted in the region's current protection state
    #[error("InvalidState: {0}")]
    InvalidState(String),

    /// A shared library or one of its symbols could not be resolved
    #[error("LibraryError: {0}")]
    Library(String),

    /// A host configuration value was rejected
    #[error("ConfigError: {0}")]
    Config(String),
}

impl HostError {
    /// Build an `Allocation` error from the current `errno`
    pub(crate) fn allocation_os(size: usize) -> Self {
        HostError::Allocation {
            size,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }

    /// Build a `Protection` error from the current `errno`
    pub(crate) fn protection_os(from: &'static str, to: &'static str) -> Self {
        HostError::Protection {
            from,
            to,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }

    /// Whether this is the "declared but nothing installed" dispatch outcome
    pub fn is_unbound(&self) -> bool {
        matches!(self, HostError::UnboundMethod { .. })
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
