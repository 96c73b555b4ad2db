use std::fmt;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Condvar, Mutex};

use crate::backend::sync::{Fence, Interrupted};

#[derive(Debug)]
struct Counters {
    issued: u64,
    signaled: u64,
    valid: bool,
}

#[derive(Debug)]
struct TimelineInner {
    counters: Mutex<Counters>,
    cond: Condvar,
}

/// Software timeline backing the release fences of one producer context
///
/// Every issued fence gets the next point on the timeline. Signaling a point signals
/// every fence issued up to it, so fences always complete in issuance order.
#[derive(Debug, Clone)]
pub struct Timeline(Arc<TimelineInner>);

impl Default for Timeline {
    fn default() -> Self {
        Timeline::new()
    }
}

impl Timeline {
    /// Create a new, valid timeline at point zero
    pub fn new() -> Timeline {
        Timeline(Arc::new(TimelineInner {
            counters: Mutex::new(Counters {
                issued: 0,
                signaled: 0,
                valid: true,
            }),
            cond: Condvar::new(),
        }))
    }

    /// Returns false once the timeline was invalidated
    pub fn is_valid(&self) -> bool {
        self.0.counters.lock().unwrap().valid
    }

    /// Invalidate the timeline
    ///
    /// All issued fences are signaled, so no waiter is left blocking.
    pub fn invalidate(&self) {
        let mut counters = self.0.counters.lock().unwrap();
        counters.valid = false;
        counters.signaled = counters.issued;
        self.0.cond.notify_all();
    }

    /// Last signaled point
    pub fn signaled(&self) -> u64 {
        self.0.counters.lock().unwrap().signaled
    }

    /// Issue a fence on the next point of the timeline
    ///
    /// Returns `None` if the timeline is invalid.
    pub fn issue(&self, name: impl FnOnce(u64) -> String) -> Option<ReleaseFence> {
        let mut counters = self.0.counters.lock().unwrap();
        if !counters.valid {
            return None;
        }
        counters.issued += 1;
        let point = counters.issued;
        Some(ReleaseFence {
            timeline: self.clone(),
            point,
            name: name(point).into(),
        })
    }

    /// Advance the signaled point to `point`
    ///
    /// Points that were never issued are not signaled, the timeline never moves backwards.
    pub fn signal(&self, point: u64) {
        let mut counters = self.0.counters.lock().unwrap();
        let target = point.min(counters.issued);
        if target > counters.signaled {
            counters.signaled = target;
            self.0.cond.notify_all();
        }
    }

    fn is_reached(&self, point: u64) -> bool {
        self.0.counters.lock().unwrap().signaled >= point
    }

    fn wait_for(&self, point: u64) {
        let counters = self.0.counters.lock().unwrap();
        let _counters = self
            .0
            .cond
            .wait_while(counters, |counters| counters.signaled < point)
            .unwrap();
    }
}

/// Fence telling a producer when the display is done reading a buffer
#[derive(Clone)]
pub struct ReleaseFence {
    timeline: Timeline,
    point: u64,
    name: Arc<str>,
}

impl fmt::Debug for ReleaseFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseFence")
            .field("name", &self.name)
            .field("point", &self.point)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl ReleaseFence {
    /// Point of this fence on its timeline
    pub fn point(&self) -> u64 {
        self.point
    }

    /// Diagnostic name of this fence
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal this fence and every fence issued before it on the same timeline
    pub fn signal(&self) {
        self.timeline.signal(self.point);
    }
}

impl Fence for ReleaseFence {
    fn is_signaled(&self) -> bool {
        self.timeline.is_reached(self.point)
    }

    fn wait(&self) -> Result<(), Interrupted> {
        self.timeline.wait_for(self.point);
        Ok(())
    }

    fn is_exportable(&self) -> bool {
        false
    }

    fn export(&self) -> Option<OwnedFd> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::SyncPoint;

    fn issue(timeline: &Timeline) -> ReleaseFence {
        timeline.issue(|point| format!("F{}", point)).unwrap()
    }

    #[test]
    fn signal_order_follows_issuance() {
        let timeline = Timeline::new();
        let first = issue(&timeline);
        let second = issue(&timeline);
        let third = issue(&timeline);
        assert_eq!((first.point(), second.point(), third.point()), (1, 2, 3));
        assert_eq!(second.name(), "F2");

        second.signal();
        assert!(first.is_signaled());
        assert!(second.is_signaled());
        assert!(!third.is_signaled());

        // never moves backwards
        first.signal();
        assert_eq!(timeline.signaled(), 2);

        // unissued points stay unsignaled
        timeline.signal(10);
        assert_eq!(timeline.signaled(), 3);
        assert!(third.is_signaled());
    }

    #[test]
    fn invalidation_releases_waiters() {
        let timeline = Timeline::new();
        let fence = issue(&timeline);
        let sync_point = SyncPoint::from(fence.clone());
        assert!(!sync_point.is_reached());

        std::thread::scope(|s| {
            let waiter = s.spawn(|| sync_point.wait());
            timeline.invalidate();
            assert!(waiter.join().unwrap().is_ok());
        });

        assert!(fence.is_signaled());
        assert!(!timeline.is_valid());
        assert!(timeline.issue(|_| String::new()).is_none());
        assert!(sync_point.get::<ReleaseFence>().is_some());
    }
}
