//! Module for [DumbBuffer](https://01.org/linuxgraphics/gfx-docs/drm/gpu/drm-kms.html#dumb-buffer-objects) buffers

use std::fmt;
use std::io;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{dumbbuffer::DumbBuffer as Handle, Device as ControlDevice};
use tracing::warn;

use super::{Allocator, Buffer, Format, Fourcc, Modifier};
use crate::backend::drm::DrmDeviceFd;
use crate::utils::{Buffer as BufferCoords, Size};

/// Allocator creating dumb buffers on a drm device
///
/// Dumb buffers are always linear and CPU-mappable. They are good enough for
/// writeback capture, but should not be scanned out on hardware with tiling support.
#[derive(Debug, Clone)]
pub struct DumbAllocator {
    fd: DrmDeviceFd,
}

impl DumbAllocator {
    /// Create an allocator for the given device
    pub fn new(fd: DrmDeviceFd) -> DumbAllocator {
        DumbAllocator { fd }
    }

    // NV12 packs a full-size luma plane and a half-height chroma plane
    fn dumb_geometry(width: u32, height: u32, fourcc: Fourcc) -> (u32, u32, u32) {
        match fourcc {
            Fourcc::Nv12 | Fourcc::Nv21 => (width, height + (height + 1) / 2, 8),
            _ => (width, height, 32),
        }
    }
}

/// Wrapper around raw DumbBuffer handles.
pub struct DumbBuffer {
    fd: DrmDeviceFd,
    handle: Handle,
    size: Size<i32, BufferCoords>,
    format: Format,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish()
    }
}

impl Allocator for DumbAllocator {
    type Buffer = DumbBuffer;
    type Error = io::Error;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<DumbBuffer, Self::Error> {
        // dumb buffers are always linear
        if modifiers
            .iter()
            .all(|&x| x != Modifier::Invalid && x != Modifier::Linear)
        {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let (alloc_width, alloc_height, bpp) = Self::dumb_geometry(width, height, fourcc);
        let handle = self
            .fd
            .create_dumb_buffer((alloc_width, alloc_height), fourcc, bpp)?;

        Ok(DumbBuffer {
            fd: self.fd.clone(),
            handle,
            size: (width as i32, height as i32).into(),
            format: Format {
                code: fourcc,
                modifier: Modifier::Linear,
            },
        })
    }
}

impl Buffer for DumbBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl DumbBuffer {
    /// Raw handle to the underlying buffer.
    ///
    /// Note: This handle will become invalid, once the `DumbBuffer` wrapper is dropped
    /// or the device used to create is closed. Do not copy this handle and assume it keeps being valid.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stride of the first plane in bytes
    pub fn pitch(&self) -> u32 {
        self.handle.pitch()
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.fd.destroy_dumb_buffer(self.handle) {
            warn!(handle = ?self.handle, "Failed to destroy dumb buffer: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_geometry() {
        assert_eq!(DumbAllocator::dumb_geometry(640, 360, Fourcc::Nv12), (640, 540, 8));
        assert_eq!(DumbAllocator::dumb_geometry(16, 15, Fourcc::Nv12), (16, 23, 8));
        assert_eq!(DumbAllocator::dumb_geometry(640, 360, Fourcc::Argb8888), (640, 360, 32));
    }
}
