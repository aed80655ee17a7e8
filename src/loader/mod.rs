// Code Loader - maps raw machine code into W^X memory
//
// Usage:
//   let loader = CodeLoader::new(0xCC);
//   let region = loader.load(&code, code.len())?;   // Executable
//   unsafe { invoker.call(&region, &args, &mut ReturnSlot::void())? };
//   loader.unload(region);

mod region;

pub use region::{page_size, CodeRegion, Protection};

use crate::error::{HostError, Result};

#[cfg(test)]
pub(crate) use region::test_hooks;

#[derive(Debug, Clone)]
pub struct CodeLoader {
    fill_byte: u8,
}

impl CodeLoader {
    pub fn new(fill_byte: u8) -> Self {
        Self { fill_byte }
    }

    pub fn fill_byte(&self) -> u8 {
        self.fill_byte
    }

    /// Map at least `size` bytes, copy `bytes` in, and publish the region as executable.
    ///
    /// `size` may exceed `bytes.len()`; the slack is filled with the configured fill
    /// byte. The region is never writable and executable at the same time, and the
    /// caller only ever sees it once it is `Executable`. On failure the mapping is
    /// released before returning.
    pub fn load(&self, bytes: &[u8], size: usize) -> Result<CodeRegion> {
        if size == 0 {
            return Err(HostError::InvalidArgument(
                "cannot load an empty code region".to_string(),
            ));
        }
        if size < bytes.len() {
            return Err(HostError::InvalidArgument(format!(
                "size {} is smaller than the {} code bytes supplied",
                size,
                bytes.len()
            )));
        }

        // Any early return below drops `region`, which unmaps it.
        let mut region = CodeRegion::map_writable(size)?;
        region.write_at(0, bytes)?;
        region.fill_from(bytes.len(), self.fill_byte);
        region.make_executable()?;

        log::debug!(
            "loaded {} code bytes at {:p} ({} mapped)",
            bytes.len(),
            region.as_ptr(),
            region.mapped_len()
        );
        Ok(region)
    }

    /// Reverse the mapping. The region is consumed, so it cannot be used afterwards.
    pub fn unload(&self, mut region: CodeRegion) {
        log::debug!("unloading region at {:p}", region.as_ptr());
        region.unmap();
    }

    /// Transition a loaded region back to writable, apply `patch` at `offset`, and
    /// republish it.
    ///
    /// If republishing fails, the overwritten bytes are restored before the error is
    /// returned, so the region never keeps a half-applied patch. It is republished
    /// unpatched when the kernel allows it and otherwise stays `Writable`.
    pub fn patch(&self, region: &mut CodeRegion, offset: usize, patch: &[u8]) -> Result<()> {
        if offset
            .checked_add(patch.len())
            .map_or(true, |end| end > region.len())
        {
            return Err(HostError::InvalidArgument(format!(
                "patch of {} bytes at offset {} exceeds {} bytes of code",
                patch.len(),
                offset,
                region.len()
            )));
        }
        region.make_writable()?;
        let original = region.bytes()[offset..offset + patch.len()].to_vec();
        region.write_at(offset, patch)?;

        if let Err(err) = region.make_executable() {
            region.write_at(offset, &original)?;
            if let Err(again) = region.make_executable() {
                log::error!(
                    "region at {:p} left writable after a failed patch: {}",
                    region.as_ptr(),
                    again
                );
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Default for CodeLoader {
    fn default() -> Self {
        Self::new(crate::config::HostConfig::default().fill_byte)
    }
}
