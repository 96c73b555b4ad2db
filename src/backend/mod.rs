//! Hardware-facing building blocks
//!
//! - [`allocator`] describes buffers and how to allocate them, and provides the
//!   queue supplying writeback capture buffers.
//! - [`drm`] contains the device registry, plane assignment and writeback session,
//!   all owned by the [`ResourceManager`](drm::ResourceManager).
//! - [`producer`] contains the per-tunnel buffer cache and release-fence timeline.
//! - [`sync`] describes fences shared between producer and display.
//! - [`blit`] is the seam towards the external 2D fill primitive.

pub mod allocator;
pub mod blit;
pub mod drm;
pub mod producer;
pub mod sync;

#[cfg(any(test, feature = "backend_test"))]
pub mod test;
