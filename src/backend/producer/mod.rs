//! Producer side of a video tunnel
//!
//! A video producer hands buffers straight to the display, bypassing the application.
//! Every tunnel gets a [`ProducerContext`], which
//!
//! - caches the imported form of each buffer the producer submits, keyed by the
//!   producer's own 64-bit identity, so a buffer is imported only once, and
//! - issues [`ReleaseFence`]s on a per-context [`Timeline`], telling the producer when
//!   the display stopped reading a buffer.
//!
//! Each context has its own lock. Contexts of different tunnels never contend, neither
//! with each other nor with the writeback session of the
//! [`ResourceManager`](crate::backend::drm::ResourceManager).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, info_span, trace};

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::drm::{ImportError, ImportedBuffer, Importer};
use crate::utils::{Buffer as BufferCoords, BufferId, Clock, Monotonic, Rectangle, Time, BUFFER_IDS};

mod timeline;

pub use self::timeline::{ReleaseFence, Timeline};

/// Errors thrown by a [`ProducerContext`]
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The buffer could not be imported, it was not cached
    #[error("Failed to import buffer {id:#x}")]
    Import {
        /// External identity of the buffer
        id: u64,
        /// Underlying import error
        #[source]
        source: ImportError,
    },
    /// The buffer was never submitted to this context
    #[error("Buffer {0:#x} is unknown")]
    UnknownBuffer(u64),
    /// The release timeline of the context is no longer usable
    #[error("Release timeline of tunnel {0} is invalid")]
    TimelineInvalid(i32),
}

/// A buffer as submitted by the producer
#[derive(Debug, Clone)]
pub struct TunnelBuffer {
    /// Producer-side identity, stable for the lifetime of the buffer
    pub id: u64,
    /// The buffer itself
    pub handle: Dmabuf,
    /// Region of the buffer to show
    pub crop: Rectangle<i32, BufferCoords>,
}

/// Imported form of a producer buffer
///
/// The device handles are released once the last reference is dropped, which might be
/// the cache of the context, a plane still scanning it out or a commit in flight.
pub struct ProducerBuffer {
    id: BufferId,
    external_id: u64,
    dmabuf: Dmabuf,
    imported: ImportedBuffer,
    crop: Mutex<Rectangle<i32, BufferCoords>>,
    importer: Arc<dyn Importer>,
}

impl fmt::Debug for ProducerBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBuffer")
            .field("id", &self.id)
            .field("external_id", &self.external_id)
            .field("imported", &self.imported)
            .field("crop", &self.crop)
            .finish_non_exhaustive()
    }
}

impl ProducerBuffer {
    /// Internal identity of this buffer
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Identity the producer gave this buffer
    pub fn external_id(&self) -> u64 {
        self.external_id
    }

    /// The underlying dmabuf
    pub fn dmabuf(&self) -> &Dmabuf {
        &self.dmabuf
    }

    /// Device handles of this buffer
    pub fn imported(&self) -> &ImportedBuffer {
        &self.imported
    }

    /// Region of the buffer to show, as of the last submission
    pub fn crop(&self) -> Rectangle<i32, BufferCoords> {
        *self.crop.lock().unwrap()
    }
}

impl Drop for ProducerBuffer {
    fn drop(&mut self) {
        trace!(id = %self.id, external_id = self.external_id, "Releasing producer buffer");
        self.importer.release(&self.imported);
    }
}

#[derive(Debug)]
struct BufferRecord {
    buffer: Arc<ProducerBuffer>,
    descriptor: TunnelBuffer,
    fence: Option<ReleaseFence>,
}

#[derive(Debug, Default)]
struct Timestamps {
    queue: Option<Time<Monotonic>>,
    acquire: Option<Time<Monotonic>>,
    commit: Option<Time<Monotonic>>,
}

#[derive(Debug)]
struct ContextInner {
    records: HashMap<u64, BufferRecord>,
    timeline: Timeline,
    frame_no: u64,
    timestamps: Timestamps,
}

/// Latency of a frame through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLatency {
    /// Time from the producer queueing the frame until the compositor acquired it
    pub queue_to_acquire: Duration,
    /// Time from the producer queueing the frame until it was committed
    pub queue_to_commit: Duration,
}

/// Buffer cache and release timeline of one video tunnel
pub struct ProducerContext {
    tunnel_id: i32,
    importer: Arc<dyn Importer>,
    clock: Clock<Monotonic>,
    inner: Mutex<ContextInner>,
    span: tracing::Span,
}

impl fmt::Debug for ProducerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerContext")
            .field("tunnel_id", &self.tunnel_id)
            .field("importer", &self.importer)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl ProducerContext {
    /// Create the context of `tunnel_id`, importing buffers with `importer`
    ///
    /// Fails if the monotonic clock is not available.
    pub fn new(tunnel_id: i32, importer: Arc<dyn Importer>) -> std::io::Result<ProducerContext> {
        let span = info_span!("drmhwc_producer", tunnel = tunnel_id);
        let clock = Clock::new()?;
        span.in_scope(|| info!("Created producer context"));
        Ok(ProducerContext {
            tunnel_id,
            importer,
            clock,
            inner: Mutex::new(ContextInner {
                records: HashMap::new(),
                timeline: Timeline::new(),
                frame_no: 0,
                timestamps: Timestamps::default(),
            }),
            span,
        })
    }

    /// Tunnel this context belongs to
    pub fn tunnel_id(&self) -> i32 {
        self.tunnel_id
    }

    /// Release timeline of this context
    pub fn timeline(&self) -> Timeline {
        self.inner.lock().unwrap().timeline.clone()
    }

    /// Point of the last issued release fence
    pub fn frame_no(&self) -> u64 {
        self.inner.lock().unwrap().frame_no
    }

    /// Amount of cached buffers
    pub fn cached_buffers(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    /// Resolve a submitted buffer to its imported form
    ///
    /// Known buffers only get their descriptor and crop refreshed. Unknown buffers are
    /// imported and cached, a failed import is not cached.
    #[profiling::function]
    pub fn resolve_buffer(&self, buffer: &TunnelBuffer) -> Result<Arc<ProducerBuffer>, ContextError> {
        let _guard = self.span.enter();
        let mut inner = self.inner.lock().unwrap();

        if let Some(record) = inner.records.get_mut(&buffer.id) {
            record.descriptor = buffer.clone();
            *record.buffer.crop.lock().unwrap() = buffer.crop;
            trace!(
                id = %record.buffer.id,
                external_id = buffer.id,
                crop = ?buffer.crop,
                "Cached buffer hit"
            );
            return Ok(record.buffer.clone());
        }

        let imported = self.importer.import(&buffer.handle).map_err(|source| {
            error!(external_id = buffer.id, "Buffer import failed: {}", source);
            ContextError::Import { id: buffer.id, source }
        })?;
        let resolved = Arc::new(ProducerBuffer {
            id: BUFFER_IDS.next_id(),
            external_id: buffer.id,
            dmabuf: buffer.handle.clone(),
            imported,
            crop: Mutex::new(buffer.crop),
            importer: self.importer.clone(),
        });
        debug!(id = %resolved.id, external_id = buffer.id, "Cached new buffer");

        inner.records.insert(
            buffer.id,
            BufferRecord {
                buffer: resolved.clone(),
                descriptor: buffer.clone(),
                fence: None,
            },
        );
        Ok(resolved)
    }

    /// Most recent submission of the buffer with the external identity `id`
    pub fn descriptor(&self, id: u64) -> Option<TunnelBuffer> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|record| record.descriptor.clone())
    }

    fn checked_record<'a>(&self, inner: &'a mut ContextInner, id: u64) -> Result<&'a mut BufferRecord, ContextError> {
        if !inner.timeline.is_valid() {
            error!(parent: &self.span, external_id = id, "Release timeline is invalid");
            return Err(ContextError::TimelineInvalid(self.tunnel_id));
        }
        inner.records.get_mut(&id).ok_or_else(|| {
            error!(parent: &self.span, external_id = id, "Buffer is not cached");
            ContextError::UnknownBuffer(id)
        })
    }

    /// Issue a new release fence for the buffer `id`
    ///
    /// Replaces any fence previously attached to the buffer. Fences of one context are
    /// issued on strictly increasing points, no matter which buffer they belong to.
    pub fn add_release_fence(&self, id: u64) -> Result<ReleaseFence, ContextError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let timeline = inner.timeline.clone();
        let tunnel_id = self.tunnel_id;

        let record = self.checked_record(inner, id)?;
        let fence = timeline
            .issue(|point| format!("RFVP-ID{}-B{}-FN{}", tunnel_id, id, point))
            .ok_or(ContextError::TimelineInvalid(tunnel_id))?;
        record.fence = Some(fence.clone());
        inner.frame_no = fence.point();

        debug!(parent: &self.span, name = fence.name(), point = fence.point(), "Created release fence");
        Ok(fence)
    }

    /// Release fence currently attached to the buffer `id`
    pub fn get_release_fence(&self, id: u64) -> Result<Option<ReleaseFence>, ContextError> {
        let mut inner = self.inner.lock().unwrap();
        let record = self.checked_record(&mut inner, id)?;
        Ok(record.fence.clone())
    }

    /// Signal the release fence attached to the buffer `id`
    ///
    /// Fences issued before it are signaled as well. Buffers without a fence are left alone.
    pub fn signal_release_fence(&self, id: u64) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().unwrap();
        let record = self.checked_record(&mut inner, id)?;
        match record.fence.as_ref() {
            Some(fence) => {
                trace!(parent: &self.span, name = fence.name(), "Signaling release fence");
                fence.signal();
            }
            None => debug!(parent: &self.span, external_id = id, "No release fence to signal"),
        }
        Ok(())
    }

    /// Close the context
    ///
    /// Invalidates the timeline, which signals every issued fence. Later fence requests fail
    /// with [`ContextError::TimelineInvalid`].
    pub fn close(&self) {
        let inner = self.inner.lock().unwrap();
        inner.timeline.invalidate();
        info!(parent: &self.span, frames = inner.frame_no, "Closed producer context");
    }

    /// Record the time the producer queued the current frame
    ///
    /// The acquire time is taken from the monotonic clock at the time of the call.
    pub fn set_timestamp(&self, queue_time: Time<Monotonic>) {
        let acquire = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.timestamps.queue = Some(queue_time);
        inner.timestamps.acquire = Some(acquire);
    }

    /// Time the producer queued the current frame
    pub fn queue_time(&self) -> Option<Time<Monotonic>> {
        self.inner.lock().unwrap().timestamps.queue
    }

    /// Time the compositor acquired the current frame
    pub fn acquire_time(&self) -> Option<Time<Monotonic>> {
        self.inner.lock().unwrap().timestamps.acquire
    }

    /// Time the current frame was committed
    pub fn commit_time(&self) -> Option<Time<Monotonic>> {
        self.inner.lock().unwrap().timestamps.commit
    }

    /// Record the commit time and log the latency of the current frame
    ///
    /// Returns `None` if no queue time was recorded yet.
    pub fn print_timestamps(&self) -> Option<FrameLatency> {
        let commit = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.timestamps.commit = Some(commit);
        Self::latency(&inner.timestamps).map(|latency| {
            info!(
                parent: &self.span,
                "Queue->Acquire={}ms Queue->Commit={}ms",
                latency.queue_to_acquire.as_millis(),
                latency.queue_to_commit.as_millis()
            );
            latency
        })
    }

    fn latency(timestamps: &Timestamps) -> Option<FrameLatency> {
        let queue = timestamps.queue?;
        let acquire = timestamps.acquire?;
        let commit = timestamps.commit?;
        Some(FrameLatency {
            queue_to_acquire: queue.duration_since(acquire),
            queue_to_commit: queue.duration_since(commit),
        })
    }
}
