//! Buffer allocation and management.
//!
//! Collection of common traits and implementations around
//! buffer creation and handling from various sources.
//!
//! Allocators provided:
//! - Dumb Buffers through [`dumb::DumbAllocator`]
//!
//! Buffer types supported:
//! - [DumbBuffers](dumb::DumbBuffer)
//! - [DmaBufs](dmabuf::Dmabuf)
//!
//! Helpers:
//! - [`BufferQueue`] to supply and recycle writeback capture buffers

pub mod dmabuf;
#[cfg(feature = "backend_drm")]
pub mod dumb;
pub mod queue;

pub use queue::{BufferQueue, QueueError, QueuedBuffer};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use crate::utils::{Buffer as BufferCoords, Size};

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32 {
        self.size().w as u32
    }
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32 {
        self.size().h as u32
    }
    /// Size of the two-dimensional buffer
    fn size(&self) -> Size<i32, BufferCoords>;
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}

/// Interface to create Buffers
pub trait Allocator {
    /// Buffer type produced by this allocator
    type Buffer: Buffer;
    /// Error type thrown if allocations fail
    type Error: std::error::Error + Send + Sync + 'static;

    /// Try to create a buffer with the given dimensions and pixel format
    ///
    /// This may block on the underlying allocator.
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}
