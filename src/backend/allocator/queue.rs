//! Queue of writeback capture buffers
//!
//! Tracks which allocated buffers were handed to the hardware.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::allocator::{Allocator, Buffer, Format, Fourcc, Modifier};
use crate::utils::{Buffer as BufferCoords, BufferId, Size, BUFFER_IDS};

/// Amount of submitted buffers a queue keeps track of
pub const QUEUE_CAP: usize = 4;

static QUEUE_IDS: AtomicUsize = AtomicUsize::new(1);

/// Errors returned when submitting a buffer to a [`BufferQueue`]
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// The buffer was not dequeued from this queue
    #[error("Buffer {0} does not belong to this queue")]
    ForeignBuffer(BufferId),
    /// The buffer is already submitted and waiting for the hardware
    #[error("Buffer {0} is already queued")]
    AlreadyQueued(BufferId),
    /// There was no buffer to submit
    #[error("No buffer to queue")]
    MissingBuffer,
}

/// Buffer handed out by a [`BufferQueue`]
///
/// Dereferences to the allocated buffer. The allocation is released once the
/// last reference is dropped, which may be long after the queue forgot about it.
pub struct QueuedBuffer<B: Buffer> {
    id: BufferId,
    queue: usize,
    name: String,
    buffer: B,
}

impl<B: Buffer> fmt::Debug for QueuedBuffer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedBuffer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.buffer.size())
            .field("format", &self.buffer.format())
            .finish()
    }
}

impl<B: Buffer> QueuedBuffer<B> {
    /// Unique identity of this buffer
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Debug name given on dequeue
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<B: Buffer> Deref for QueuedBuffer<B> {
    type Target = B;
    fn deref(&self) -> &B {
        &self.buffer
    }
}

impl<B: Buffer> Buffer for QueuedBuffer<B> {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.buffer.size()
    }

    fn format(&self) -> Format {
        self.buffer.format()
    }
}

/// Queue supplying capture buffers to a writeback connector.
///
/// Every call to [`dequeue`](BufferQueue::dequeue) allocates a fresh buffer, so
/// dequeued buffers are always distinct from anything handed out earlier.
/// Buffers are then [`queue`](BufferQueue::queue)d once they are submitted to the
/// hardware. The queue remembers the last [`QUEUE_CAP`] submissions and refuses to
/// submit any of them a second time.
pub struct BufferQueue<A: Allocator> {
    allocator: A,
    id: usize,
    queued: VecDeque<Arc<QueuedBuffer<A::Buffer>>>,
}

impl<A: Allocator> fmt::Debug for BufferQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("id", &self.id)
            .field("queued", &self.queued)
            .finish_non_exhaustive()
    }
}

impl<A: Allocator> BufferQueue<A> {
    /// Create a new queue allocating linear buffers
    pub fn new(allocator: A) -> BufferQueue<A> {
        BufferQueue {
            allocator,
            id: QUEUE_IDS.fetch_add(1, Ordering::Relaxed),
            queued: VecDeque::with_capacity(QUEUE_CAP),
        }
    }

    /// Allocate a new buffer
    ///
    /// This blocks on the underlying allocator.
    pub fn dequeue(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        name: &str,
    ) -> Result<Arc<QueuedBuffer<A::Buffer>>, A::Error> {
        let buffer = self
            .allocator
            .create_buffer(width, height, fourcc, &[Modifier::Linear])?;
        let buffer = QueuedBuffer {
            id: BUFFER_IDS.next_id(),
            queue: self.id,
            name: name.to_owned(),
            buffer,
        };
        tracing::trace!(id = %buffer.id, name, width, height, ?fourcc, "Dequeued buffer");
        Ok(Arc::new(buffer))
    }

    /// Submit a dequeued buffer
    pub fn queue(&mut self, buffer: &Arc<QueuedBuffer<A::Buffer>>) -> Result<(), QueueError> {
        if buffer.queue != self.id {
            return Err(QueueError::ForeignBuffer(buffer.id));
        }
        if self.queued.iter().any(|queued| queued.id == buffer.id) {
            return Err(QueueError::AlreadyQueued(buffer.id));
        }

        if self.queued.len() == QUEUE_CAP {
            self.queued.pop_front();
        }
        self.queued.push_back(buffer.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test::DummyAllocator;

    #[test]
    fn dequeue_is_distinct() {
        let mut queue = BufferQueue::new(DummyAllocator::default());
        let first = queue.dequeue(64, 32, Fourcc::Nv12, "first").unwrap();
        let second = queue.dequeue(64, 32, Fourcc::Nv12, "second").unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.width(), 64);
        assert_eq!(first.height(), 32);
        assert_eq!(second.name(), "second");
    }

    #[test]
    fn double_queue_is_rejected() {
        let mut queue = BufferQueue::new(DummyAllocator::default());
        let buffer = queue.dequeue(64, 32, Fourcc::Nv12, "buffer").unwrap();

        queue.queue(&buffer).unwrap();
        assert_eq!(queue.queue(&buffer), Err(QueueError::AlreadyQueued(buffer.id())));
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        let mut queue = BufferQueue::new(DummyAllocator::default());
        let mut other = BufferQueue::new(DummyAllocator::default());
        let buffer = other.dequeue(64, 32, Fourcc::Nv12, "buffer").unwrap();

        assert_eq!(queue.queue(&buffer), Err(QueueError::ForeignBuffer(buffer.id())));
    }

    #[test]
    fn queue_is_bounded() {
        let mut queue = BufferQueue::new(DummyAllocator::default());
        let buffers = (0..QUEUE_CAP + 2)
            .map(|i| queue.dequeue(16, 16, Fourcc::Nv12, &format!("b{}", i)).unwrap())
            .collect::<Vec<_>>();
        for buffer in &buffers {
            queue.queue(buffer).unwrap();
        }

        // still tracked
        assert_eq!(queue.queue(&buffers[2]), Err(QueueError::AlreadyQueued(buffers[2].id())));
        // dropped out of the window, may be queued again
        queue.queue(&buffers[0]).unwrap();
        queue.queue(&buffers[1]).unwrap();
        assert_eq!(queue.queue(&buffers[0]), Err(QueueError::AlreadyQueued(buffers[0].id())));
    }
}
