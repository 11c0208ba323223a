//! Timestamped buffer produced by one pull from the live source.

use crate::buffering::spec::AudioFormat;
use crate::time::{ClockTime, SECOND};

/// A contiguous block of interleaved frames read from the ring buffer.
///
/// Allocated once per pull, on the pulling thread.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    /// Absolute sample index of the first frame.
    pub offset: u64,
    /// Absolute sample index one past the last frame.
    pub offset_end: u64,
    /// Presentation time of the first frame, in nanoseconds.
    pub timestamp: ClockTime,
    pub duration: ClockTime,
    pub format: AudioFormat,
}

impl AudioChunk {
    /// Number of frames in this chunk.
    pub fn samples(&self) -> u64 {
        self.offset_end - self.offset
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration as f64 / SECOND as f64
    }

    /// End of this chunk on the timeline; equals the next chunk's timestamp.
    pub fn end_time(&self) -> ClockTime {
        self.timestamp + self.duration
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
