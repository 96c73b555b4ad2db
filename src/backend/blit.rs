//! 2D blit primitives
//!
//! The composer never touches pixels itself. Where it needs buffer contents initialized,
//! it goes through a [`Blitter`] provided by the platform, usually a 2D accelerator.

use std::fmt;

use crate::backend::allocator::{Buffer, Fourcc};
use crate::utils::{Buffer as BufferCoords, Rectangle};

/// Errors thrown by a [`Blitter`]
#[derive(Debug, thiserror::Error)]
pub enum BlitError {
    /// The blitter can't handle the buffer's format
    #[error("Unsupported format {0:?}")]
    UnsupportedFormat(Fourcc),
    /// The rectangle is not contained in the buffer
    #[error("Rectangle {0:?} is outside of the buffer")]
    OutOfBounds(Rectangle<i32, BufferCoords>),
    /// The blitter failed for another reason
    #[error("Blit failed")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Fills buffers with constant values
pub trait Blitter: fmt::Debug {
    /// Fill `rect` of `buffer` with `value`
    ///
    /// How `value` maps to the buffer's channels is up to the blitter. `0` clears a buffer.
    fn fill(&self, buffer: &dyn Buffer, rect: Rectangle<i32, BufferCoords>, value: u32) -> Result<(), BlitError>;
}

/// Checks the arguments of a [`Blitter::fill`] call
pub fn check_fill(buffer: &dyn Buffer, rect: Rectangle<i32, BufferCoords>) -> Result<(), BlitError> {
    if !Rectangle::from_size(buffer.size()).contains_rect(rect) {
        return Err(BlitError::OutOfBounds(rect));
    }
    Ok(())
}
