use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide [`BufferIdCounter`] used for every buffer object created by this crate.
///
/// Identities are never reused, so two buffer objects with the same [`BufferId`]
/// are the same object.
pub static BUFFER_IDS: BufferIdCounter = BufferIdCounter {
    next: AtomicU64::new(1),
};

/// Identity of a buffer object tracked by this crate
///
/// This is the *internal* identity. Producers supply their own external 64-bit
/// identity, which is kept alongside.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    /// Raw value of this identity
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A counter handing out unique [`BufferId`]s
#[derive(Debug)]
pub struct BufferIdCounter {
    next: AtomicU64,
}

impl BufferIdCounter {
    /// Retrieve the next identity from the counter
    pub fn next_id(&self) -> BufferId {
        BufferId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
