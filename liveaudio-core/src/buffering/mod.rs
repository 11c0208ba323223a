//! Segmented ring buffer, negotiated format description, and the timestamped
//! chunks the live source hands downstream.

pub mod chunk;
pub mod ring;
pub mod spec;

pub use chunk::AudioChunk;
pub use ring::{Format, RingState, SegmentIo, SegmentState, SegmentedRingBuffer};
pub use spec::{AudioCaps, AudioFormat, CapsValue, Endianness, MediaType, RingBufferSpec};
