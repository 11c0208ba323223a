//! Clocks derived from ring-buffer position.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::buffering::SegmentedRingBuffer;
use crate::time::{scale, ClockTime, SECOND};

/// Source of pipeline time.
pub trait Clock: Send + Sync {
    fn name(&self) -> &str;

    /// Current time in nanoseconds, or `None` when no time is available.
    fn get_time(&self) -> Option<ClockTime>;
}

/// Clock whose time is the number of samples the attached ring buffer has
/// processed, divided by its rate. Advances only while audio flows.
pub struct SoftwareClock {
    name: String,
    ring: RwLock<Weak<SegmentedRingBuffer>>,
}

impl SoftwareClock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ring: RwLock::new(Weak::new()),
        }
    }

    pub fn attach(&self, ring: &Arc<SegmentedRingBuffer>) {
        *self.ring.write() = Arc::downgrade(ring);
        debug!(clock = self.name.as_str(), "clock attached to ring buffer");
    }

    pub fn detach(&self) {
        *self.ring.write() = Weak::new();
    }
}

impl Clock for SoftwareClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_time(&self) -> Option<ClockTime> {
        let ring = self.ring.read().upgrade()?;
        let rate = ring.rate();
        if rate == 0 {
            return None;
        }
        Some(scale(ring.samples_done(), SECOND, u64::from(rate)))
    }
}
