//! # liveaudio-core
//!
//! Pull-based live audio capture over a segmented ring buffer.
//!
//! ## Architecture
//!
//! ```text
//! DeviceBackend thread ──fill()──► SegmentedRingBuffer ──read()──► LiveAudioSource::create()
//!                                        │                                 │
//!                                 samples_done()                    AudioChunk (timestamped)
//!                                        │                                 │
//!                                  SoftwareClock                   pipeline::run → crossbeam
//! ```
//!
//! The device thread never takes the ring buffer's control lock. All heap
//! work happens on the pulling thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod time;

// Convenience re-exports for downstream crates
pub use audio::simulated::{DriveMode, SimulatedConfig, SimulatedDevice, SimulatedProvider};
pub use audio::{DeviceBackend, DeviceProvider};
pub use buffering::{AudioCaps, AudioChunk, RingBufferSpec, SegmentedRingBuffer};
pub use engine::{
    Clock, ElementState, LiveAudioSource, SoftwareClock, SourceConfig, SourceEvent,
    StateChangeSuccess,
};
pub use error::LiveAudioError;
pub use ipc::events::{ChunkEvent, SourceStatus, SourceStatusEvent};

#[cfg(feature = "audio-cpal")]
pub use audio::capture::{CpalConfig, CpalDevice, CpalProvider};
