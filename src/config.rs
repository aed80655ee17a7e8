// Host Configuration
//
// Usage:
//   let config = HostConfig::from_json(r#"{ "allocator": "system", "alloc_alignment": 32 }"#)?;
//   let host = Host::with_config(config)?;

use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};

/// Which native allocator backs the memory shim at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// Rust's global allocator with a fixed layout alignment
    #[default]
    System,
    /// The C library's `malloc`/`free`
    Libc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Byte written into the slack between the loaded code and the end of its mapping
    pub fill_byte: u8,
    /// Alignment of every block handed out by the memory shim
    pub alloc_alignment: usize,
    /// Allocator installed when the host is created
    pub allocator: AllocatorKind,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            fill_byte: default_fill_byte(),
            alloc_alignment: 16,
            allocator: AllocatorKind::System,
        }
    }
}

/// `int3` on x86 so a stray jump into the slack traps instead of sliding
fn default_fill_byte() -> u8 {
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        0xCC
    } else {
        0x00
    }
}

impl HostConfig {
    pub fn from_json(source: &str) -> Result<Self> {
        let config: HostConfig = serde_json::from_str(source)
            .map_err(|e| HostError::Config(format!("invalid host config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.alloc_alignment.is_power_of_two() {
            return Err(HostError::Config(format!(
                "alloc_alignment must be a power of two, got {}",
                self.alloc_alignment
            )));
        }
        if self.allocator == AllocatorKind::Libc && self.alloc_alignment > libc_max_align() {
            return Err(HostError::Config(format!(
                "the libc allocator only guarantees {}-byte alignment, {} requested",
                libc_max_align(),
                self.alloc_alignment
            )));
        }
        Ok(())
    }
}

/// What `malloc` guarantees on the platforms we build for
pub(crate) fn libc_max_align() -> usize {
    2 * std::mem::size_of::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.alloc_alignment, 16);
        assert_eq!(config.allocator, AllocatorKind::System);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = HostConfig::from_json(r#"{ "allocator": "libc", "fill_byte": 144 }"#).unwrap();
        assert_eq!(config.allocator, AllocatorKind::Libc);
        assert_eq!(config.fill_byte, 0x90);
        assert_eq!(config.alloc_alignment, 16);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let err = HostConfig::from_json(r#"{ "alloc_alignment": 24 }"#).unwrap_err();
        assert!(matches!(err, HostError::Config(_)));

        let err = HostConfig::from_json(r#"{ "allocator": "libc", "alloc_alignment": 4096 }"#)
            .unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(HostConfig::from_json("{ allocator: ").is_err());
        assert!(HostConfig::from_json(r#"{ "allocator": "jemalloc" }"#).is_err());
    }
}
