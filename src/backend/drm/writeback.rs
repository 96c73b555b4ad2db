//! Writeback capture session
//!
//! Writeback captures the composed frame of one display into a memory buffer. At most one
//! display holds the session at a time. Capture buffers rotate through three slots:
//!
//! - *next*: freshly dequeued, attached to the upcoming commit
//! - *drawing*: submitted with the commit in flight
//! - *finish*: written by the previously completed commit, ready for read-back
//!
//! [`WritebackState::swap`] moves every buffer one slot along and dequeues a fresh *next*.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::{DisplayDevice, DisplayId, DisplayMode, Error};
use crate::backend::allocator::{Allocator, Buffer, BufferQueue, Fourcc, QueueError, QueuedBuffer};
use crate::backend::blit::Blitter;
use crate::utils::Rectangle;

/// Capture widths are rounded down to a multiple of this
///
/// The writeback hardware silently drops the pixels beyond the last full block.
pub const WRITEBACK_ALIGN: u32 = 16;

/// Pixel format of capture buffers
pub const WRITEBACK_FORMAT: Fourcc = Fourcc::Nv12;

const WRITEBACK_BUFFER_NAME: &str = "WriteBackBuffer";
const RESET_BUFFER_NAME: &str = "WBResetBuffer";

/// Size of the buffer shown while writeback is being reset
pub const RESET_BUFFER_SIZE: (u32, u32) = (640, 360);

/// A capture buffer
pub type WritebackBuffer<B> = Arc<QueuedBuffer<B>>;

pub(crate) fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

/// State of the writeback session
pub struct WritebackState<A: Allocator> {
    allocator: A,
    refcount: u32,
    display: Option<DisplayId>,
    mode: Option<DisplayMode>,
    width: u32,
    height: u32,
    format: Fourcc,
    queue: Option<BufferQueue<A>>,
    next: Option<WritebackBuffer<A::Buffer>>,
    drawing: Option<WritebackBuffer<A::Buffer>>,
    finish: Option<WritebackBuffer<A::Buffer>>,
    reset: Option<WritebackBuffer<A::Buffer>>,
}

impl<A: Allocator> fmt::Debug for WritebackState<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritebackState")
            .field("refcount", &self.refcount)
            .field("display", &self.display)
            .field("mode", &self.mode)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("next", &self.next)
            .field("drawing", &self.drawing)
            .field("finish", &self.finish)
            .field("reset", &self.reset)
            .finish_non_exhaustive()
    }
}

impl<A: Allocator + Clone> WritebackState<A> {
    /// Create a disabled session allocating capture buffers from `allocator`
    pub fn new(allocator: A) -> WritebackState<A> {
        WritebackState {
            allocator,
            refcount: 0,
            display: None,
            mode: None,
            width: 0,
            height: 0,
            format: WRITEBACK_FORMAT,
            queue: None,
            next: None,
            drawing: None,
            finish: None,
            reset: None,
        }
    }

    fn connected_mode(device: &dyn DisplayDevice, output: DisplayId) -> Result<DisplayMode, Error> {
        let Some(connector) = device.connector_for_display(output) else {
            error!(display = %output, "Writeback connector is unavailable");
            return Err(Error::ConnectorUnavailable(output));
        };
        match connector.current_mode {
            Some(mode) if connector.is_connected() => Ok(mode),
            _ => {
                error!(display = %output, connector = %connector.id, state = ?connector.state, "Writeback connector isn't connected");
                Err(Error::ConnectorNotConnected {
                    display: output,
                    connector: connector.id,
                })
            }
        }
    }

    fn dequeue(&mut self, output: DisplayId, width: u32, height: u32) -> Result<WritebackBuffer<A::Buffer>, Error> {
        let allocator = &self.allocator;
        let queue = self.queue.get_or_insert_with(|| BufferQueue::new(allocator.clone()));
        queue
            .dequeue(width, height, WRITEBACK_FORMAT, WRITEBACK_BUFFER_NAME)
            .map_err(|err| {
                error!(
                    display = %output,
                    width,
                    height,
                    format = ?WRITEBACK_FORMAT,
                    "Writeback buffer dequeue failed: {}", err
                );
                Error::BufferAlloc {
                    width,
                    height,
                    source: Box::new(err),
                }
            })
    }

    /// Enable writeback for `output`
    ///
    /// Enabling the display already holding the session only takes another reference.
    /// A failed enable leaves the previous mode and resolution untouched.
    pub fn enable(&mut self, device: &dyn DisplayDevice, output: DisplayId) -> Result<(), Error> {
        if self.refcount > 0 {
            if self.display != Some(output) {
                error!(bound = ?self.display, display = %output, "Writeback is bound to another display");
                return Err(Error::WritebackConflict {
                    bound: self.display,
                    requested: output,
                });
            }
            self.refcount += 1;
            return Ok(());
        }

        let mode = Self::connected_mode(device, output)?;
        let (width, height) = (align_down(mode.width, WRITEBACK_ALIGN), mode.height);
        if self.next.is_none() {
            let next = self.dequeue(output, width, height)?;
            self.next = Some(next);
        }

        self.mode = Some(mode);
        self.width = width;
        self.height = height;
        self.format = WRITEBACK_FORMAT;
        self.refcount = 1;
        self.display = Some(output);
        info!(display = %output, width, height, "Enabled writeback");
        Ok(())
    }

    /// Follow a mode change of the display holding the session
    ///
    /// The new resolution is taken over even if no buffer can be dequeued for it. *next*
    /// is dropped then, so [`swap`](WritebackState::swap) dequeues one at the new size.
    pub fn update_resolution(&mut self, device: &dyn DisplayDevice, output: DisplayId) -> Result<(), Error> {
        if self.refcount == 0 || self.display != Some(output) {
            error!(bound = ?self.display, display = %output, "Writeback is not bound to display");
            return Err(Error::WritebackConflict {
                bound: self.display,
                requested: output,
            });
        }

        let mode = Self::connected_mode(device, output)?;
        self.mode = Some(mode);
        let (width, height) = (align_down(mode.width, WRITEBACK_ALIGN), mode.height);
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        info!(
            display = %output,
            "Update writeback resolution ({}x{}) => ({}x{})",
            self.width,
            self.height,
            mode.width,
            mode.height
        );

        self.width = width;
        self.height = height;
        self.format = WRITEBACK_FORMAT;
        self.next = None;
        let next = self.dequeue(output, width, height)?;
        self.next = Some(next);
        Ok(())
    }

    /// Drop a reference of `output` on the session
    ///
    /// Requests of displays not holding the session are ignored.
    pub fn disable(&mut self, output: DisplayId) {
        if self.display != Some(output) {
            return;
        }

        self.refcount = self.refcount.saturating_sub(1);
        if self.refcount == 0 {
            self.next = None;
            self.drawing = None;
            self.finish = None;
            self.queue = None;
            self.display = None;
            info!(display = %output, "Disabled writeback");
        }
    }

    /// Advance the capture slots
    ///
    /// *finish* takes the *drawing* buffer, *drawing* takes *next*, which is submitted.
    /// A new *next* buffer is dequeued afterwards. If that fails, *next* stays empty
    /// and the following call dequeues it before rotating.
    #[profiling::function]
    pub fn swap(&mut self) -> Result<(), Error> {
        let Some(output) = self.display.filter(|_| self.refcount > 0) else {
            error!("Writeback swap without an active session");
            return Err(Error::NotEnabled);
        };
        let (width, height) = (self.width, self.height);

        if self.next.is_none() {
            let next = self.dequeue(output, width, height)?;
            self.next = Some(next);
        }

        self.finish = self.drawing.take();
        self.drawing = self.next.take();

        let queued = match (self.queue.as_mut(), self.drawing.as_ref()) {
            (Some(queue), Some(drawing)) => queue.queue(drawing),
            _ => Err(QueueError::MissingBuffer),
        };
        if let Err(err) = queued {
            error!(
                display = %output,
                width,
                height,
                format = ?self.format,
                "Writeback buffer queue failed: {}", err
            );
            return Err(Error::QueueSubmit(err));
        }

        let next = self.dequeue(output, width, height)?;
        debug!(display = %output, next = %next.id(), "Swapped writeback buffers");
        self.next = Some(next);
        Ok(())
    }

    /// Cleared buffer to attach while no capture is wanted
    ///
    /// Allocated and cleared on first use, later calls return the same buffer.
    /// A failed clear is only logged, the buffer is still used.
    pub fn reset_buffer(&mut self, blitter: &dyn Blitter) -> Result<WritebackBuffer<A::Buffer>, Error> {
        if let Some(reset) = self.reset.as_ref() {
            return Ok(reset.clone());
        }

        let (width, height) = RESET_BUFFER_SIZE;
        let buffer = BufferQueue::new(self.allocator.clone())
            .dequeue(width, height, WRITEBACK_FORMAT, RESET_BUFFER_NAME)
            .map_err(|err| {
                error!(
                    width,
                    height,
                    format = ?WRITEBACK_FORMAT,
                    name = RESET_BUFFER_NAME,
                    "Reset buffer allocation failed: {}", err
                );
                Error::BufferAlloc {
                    width,
                    height,
                    source: Box::new(err),
                }
            })?;

        let rect = Rectangle::from_size(buffer.size());
        if let Err(err) = blitter.fill(&*buffer, rect, 0) {
            error!(id = %buffer.id(), "Failed to clear reset buffer: {}", err);
        }

        self.reset = Some(buffer.clone());
        Ok(buffer)
    }

    /// Buffer attached to the upcoming commit
    pub fn next(&self) -> Option<WritebackBuffer<A::Buffer>> {
        self.next.clone()
    }

    /// Buffer of the commit in flight
    pub fn drawing(&self) -> Option<WritebackBuffer<A::Buffer>> {
        self.drawing.clone()
    }

    /// Buffer of the last completed commit
    pub fn finish(&self) -> Option<WritebackBuffer<A::Buffer>> {
        self.finish.clone()
    }

    /// Mode of the captured display
    pub fn mode(&self) -> Option<DisplayMode> {
        self.mode
    }

    /// Capture resolution
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Capture format
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Returns true while a session is active
    pub fn is_enabled(&self) -> bool {
        self.refcount > 0
    }

    /// Display holding the session
    pub fn bound_display(&self) -> Option<DisplayId> {
        self.display
    }

    /// Amount of references held on the session
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::ConnectorState;
    use crate::backend::test::{DummyAllocator, DummyBlitter, DummyDevice};

    const DISPLAY: DisplayId = DisplayId::new(0);
    const OTHER: DisplayId = DisplayId::new(1);

    fn device() -> DummyDevice {
        DummyDevice::builder()
            .display_with_mode(DisplayMode::new(1928, 1080, 60))
            .display()
            .build()
    }

    #[test]
    fn width_is_aligned_down() {
        assert_eq!(align_down(1928, WRITEBACK_ALIGN), 1920);
        assert_eq!(align_down(1920, WRITEBACK_ALIGN), 1920);
        assert_eq!(align_down(15, WRITEBACK_ALIGN), 0);

        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());
        state.enable(&device, DISPLAY).unwrap();
        assert_eq!(state.resolution(), (1920, 1080));
        assert_eq!(state.format(), Fourcc::Nv12);
        assert_eq!(state.mode(), Some(DisplayMode::new(1928, 1080, 60)));
        let next = state.next().unwrap();
        assert_eq!((next.width(), next.height()), (1920, 1080));
    }

    #[test]
    fn enable_is_refcounted() {
        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());

        state.enable(&device, DISPLAY).unwrap();
        let next = state.next().unwrap();
        state.enable(&device, DISPLAY).unwrap();
        assert_eq!(state.refcount(), 2);
        assert_eq!(state.next().unwrap().id(), next.id());

        state.disable(DISPLAY);
        assert!(state.is_enabled());
        assert_eq!(state.bound_display(), Some(DISPLAY));
        state.disable(DISPLAY);
        assert!(!state.is_enabled());
        assert_eq!(state.bound_display(), None);
        assert!(state.next().is_none());

        // unbound disables are ignored and never underflow
        state.disable(DISPLAY);
        assert_eq!(state.refcount(), 0);
    }

    #[test]
    fn conflicting_enable_leaves_session() {
        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());
        state.enable(&device, DISPLAY).unwrap();
        state.swap().unwrap();
        let slots = (state.next(), state.drawing(), state.finish());

        let result = state.enable(&device, OTHER);
        assert!(matches!(
            result,
            Err(Error::WritebackConflict {
                bound: Some(DISPLAY),
                requested: OTHER
            })
        ));
        state.disable(OTHER);

        assert_eq!(state.refcount(), 1);
        assert_eq!(state.next().map(|b| b.id()), slots.0.map(|b| b.id()));
        assert_eq!(state.drawing().map(|b| b.id()), slots.1.map(|b| b.id()));
        assert_eq!(state.finish().map(|b| b.id()), slots.2.map(|b| b.id()));
    }

    #[test]
    fn connector_must_be_connected() {
        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());

        let result = state.enable(&device, DisplayId::new(9));
        assert!(matches!(result, Err(Error::ConnectorUnavailable(d)) if d == DisplayId::new(9)));

        device.set_connector_state(DISPLAY, ConnectorState::Disconnected);
        let result = state.enable(&device, DISPLAY);
        assert!(matches!(result, Err(Error::ConnectorNotConnected { display: DISPLAY, .. })));
        assert!(!state.is_enabled());
    }

    #[test]
    fn swap_rotates_slots() {
        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());
        assert!(matches!(state.swap(), Err(Error::NotEnabled)));

        state.enable(&device, DISPLAY).unwrap();
        for _ in 0..5 {
            let next = state.next().unwrap();
            let drawing = state.drawing();
            let before = [Some(next.id()), drawing.as_ref().map(|b| b.id()), state.finish().map(|b| b.id())];

            state.swap().unwrap();
            assert_eq!(state.drawing().unwrap().id(), next.id());
            assert_eq!(state.finish().map(|b| b.id()), drawing.map(|b| b.id()));
            let new_next = state.next().unwrap().id();
            assert!(!before.contains(&Some(new_next)));
        }
    }

    #[test]
    fn failed_dequeue_leaves_next_empty() {
        let device = device();
        let allocator = DummyAllocator::default();
        let mut state = WritebackState::new(allocator.clone());
        state.enable(&device, DISPLAY).unwrap();
        let next = state.next().unwrap();

        allocator.set_failing(true);
        assert!(matches!(
            state.swap(),
            Err(Error::BufferAlloc {
                width: 1920,
                height: 1080,
                ..
            })
        ));
        assert!(state.next().is_none());
        assert_eq!(state.drawing().unwrap().id(), next.id());

        // still failing, nothing rotates
        assert!(matches!(state.swap(), Err(Error::BufferAlloc { .. })));
        assert_eq!(state.drawing().unwrap().id(), next.id());
        assert!(state.finish().is_none());

        allocator.set_failing(false);
        state.swap().unwrap();
        assert_eq!(state.finish().unwrap().id(), next.id());
        assert_ne!(state.drawing().unwrap().id(), next.id());
        assert!(state.next().is_some());
    }

    #[test]
    fn failed_enable_stays_disabled() {
        let device = device();
        let allocator = DummyAllocator::default();
        let mut state = WritebackState::new(allocator.clone());

        allocator.set_failing(true);
        assert!(matches!(state.enable(&device, DISPLAY), Err(Error::BufferAlloc { .. })));
        assert!(!state.is_enabled());
        assert_eq!(state.bound_display(), None);

        allocator.set_failing(false);
        state.enable(&device, DISPLAY).unwrap();
        assert!(state.next().is_some());
    }

    #[test]
    fn reset_buffer_is_cached() {
        let allocator = DummyAllocator::default();
        let mut state = WritebackState::new(allocator.clone());
        let blitter = DummyBlitter::default();

        allocator.set_failing(true);
        assert!(matches!(
            state.reset_buffer(&blitter),
            Err(Error::BufferAlloc {
                width: 640,
                height: 360,
                ..
            })
        ));
        assert_eq!(blitter.fills(), 0);

        allocator.set_failing(false);
        let reset = state.reset_buffer(&blitter).unwrap();
        assert_eq!((reset.width(), reset.height()), RESET_BUFFER_SIZE);
        assert_eq!(reset.format().code, Fourcc::Nv12);
        assert_eq!(reset.name(), "WBResetBuffer");
        assert_eq!(blitter.fills(), 1);

        assert_eq!(state.reset_buffer(&blitter).unwrap().id(), reset.id());
        assert_eq!(blitter.fills(), 1);
    }

    #[test]
    fn failed_clear_is_not_fatal() {
        let mut state = WritebackState::new(DummyAllocator::default());
        let blitter = DummyBlitter::failing();
        let reset = state.reset_buffer(&blitter).unwrap();
        assert_eq!(state.reset_buffer(&blitter).unwrap().id(), reset.id());
    }

    #[test]
    fn resolution_updates() {
        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());
        assert!(matches!(
            state.update_resolution(&device, DISPLAY),
            Err(Error::WritebackConflict { bound: None, .. })
        ));

        state.enable(&device, DISPLAY).unwrap();
        let next = state.next().unwrap();

        // unchanged after alignment
        device.set_mode(DISPLAY, DisplayMode::new(1930, 1080, 60));
        state.update_resolution(&device, DISPLAY).unwrap();
        assert_eq!(state.next().unwrap().id(), next.id());
        assert_eq!(state.mode(), Some(DisplayMode::new(1930, 1080, 60)));

        device.set_mode(DISPLAY, DisplayMode::new(1280, 720, 60));
        state.update_resolution(&device, DISPLAY).unwrap();
        assert_eq!(state.resolution(), (1280, 720));
        let new_next = state.next().unwrap();
        assert_ne!(new_next.id(), next.id());
        assert_eq!((new_next.width(), new_next.height()), (1280, 720));

        assert!(matches!(
            state.update_resolution(&device, OTHER),
            Err(Error::WritebackConflict {
                bound: Some(DISPLAY),
                requested: OTHER
            })
        ));
    }

    #[test]
    fn failed_resolution_update_drops_next() {
        let device = device();
        let allocator = DummyAllocator::default();
        let mut state = WritebackState::new(allocator.clone());
        state.enable(&device, DISPLAY).unwrap();

        device.set_mode(DISPLAY, DisplayMode::new(1280, 720, 60));
        allocator.set_failing(true);
        assert!(matches!(
            state.update_resolution(&device, DISPLAY),
            Err(Error::BufferAlloc {
                width: 1280,
                height: 720,
                ..
            })
        ));
        assert_eq!(state.resolution(), (1280, 720));
        assert!(state.next().is_none());

        // nothing left to re-arm, the size already matches
        allocator.set_failing(false);
        state.update_resolution(&device, DISPLAY).unwrap();
        assert!(state.next().is_none());

        // the stale capture buffer is never submitted
        state.swap().unwrap();
        let drawing = state.drawing().unwrap();
        assert_eq!((drawing.width(), drawing.height()), (1280, 720));
        let next = state.next().unwrap();
        assert_eq!((next.width(), next.height()), (1280, 720));
    }

    #[test]
    fn resolution_update_needs_connector() {
        let device = device();
        let mut state = WritebackState::new(DummyAllocator::default());
        state.enable(&device, DISPLAY).unwrap();
        let next = state.next().unwrap();

        device.set_connector_state(DISPLAY, ConnectorState::Disconnected);
        assert!(matches!(
            state.update_resolution(&device, DISPLAY),
            Err(Error::ConnectorNotConnected { display: DISPLAY, .. })
        ));
        assert_eq!(state.resolution(), (1920, 1080));
        assert_eq!(state.next().unwrap().id(), next.id());

        // the session survives the connector going away
        let empty = DummyDevice::builder().build();
        assert!(matches!(
            state.update_resolution(&empty, DISPLAY),
            Err(Error::ConnectorUnavailable(DISPLAY))
        ));
        assert!(state.is_enabled());
        assert_eq!(state.next().unwrap().id(), next.id());
    }

    #[test]
    fn failed_enable_keeps_previous_mode() {
        let device = device();
        let allocator = DummyAllocator::default();
        let mut state = WritebackState::new(allocator.clone());
        state.enable(&device, DISPLAY).unwrap();
        state.disable(DISPLAY);
        assert_eq!(state.resolution(), (1920, 1080));

        allocator.set_failing(true);
        assert!(matches!(state.enable(&device, OTHER), Err(Error::BufferAlloc { .. })));
        assert_eq!(state.resolution(), (1920, 1080));
        assert_eq!(state.mode(), Some(DisplayMode::new(1928, 1080, 60)));
        assert_eq!(state.bound_display(), None);
    }
}
