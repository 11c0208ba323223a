//! Device backends that feed (or drain) a [`SegmentedRingBuffer`].
//!
//! A backend owns the physical transport; the ring buffer owns the segment
//! memory and transport state. The two meet at [`SegmentIo`]: the backend's
//! real-time side calls `fill`/`drain` and never touches the ring buffer's
//! control lock.
//!
//! ```text
//! DeviceProvider ──create_backend()──► Box<dyn DeviceBackend>
//!                                           │ bind(SegmentIo)
//!                                           ▼
//!                                  SegmentedRingBuffer
//! ```
//!
//! [`SegmentedRingBuffer`]: crate::buffering::SegmentedRingBuffer

#[cfg(feature = "audio-cpal")]
pub mod capture;
pub mod device;
pub mod simulated;

use crate::buffering::{RingBufferSpec, SegmentIo};
use crate::error::Result;

/// Device-specific hooks driven by the ring buffer.
///
/// Every method except [`bind`](Self::bind), [`delay`](Self::delay) and
/// [`backpressure`](Self::backpressure) is called with the ring buffer's
/// control lock held; implementations must not call back into the ring
/// buffer's control API from them.
pub trait DeviceBackend: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Receive the handle used to move segment data. Called once, when the
    /// ring buffer is constructed.
    fn bind(&mut self, io: SegmentIo);

    fn open_device(&mut self) -> Result<()>;

    fn close_device(&mut self) -> Result<()>;

    /// Prepare the device for `spec`. May adjust `segment_size`,
    /// `segment_count` and `segment_latency` to what the hardware grants.
    fn acquire(&mut self, spec: &mut RingBufferSpec) -> Result<()>;

    fn release(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()> {
        self.start()
    }

    fn stop(&mut self) -> Result<()>;

    /// Segments queued inside the device beyond the ring buffer's own
    /// bookkeeping.
    fn delay(&self) -> u32 {
        0
    }

    /// Enable or disable the thread/callback that calls into [`SegmentIo`].
    fn activate(&mut self, active: bool) -> Result<()>;

    /// Whether readers should block for data that has not been produced yet.
    /// When `false`, unproduced positions read as silence.
    fn backpressure(&self) -> bool {
        true
    }
}

/// Constructs a backend when a source enters the ready state.
pub trait DeviceProvider: Send + Sync {
    fn create_backend(&self) -> Result<Box<dyn DeviceBackend>>;
}

impl<F> DeviceProvider for F
where
    F: Fn() -> Result<Box<dyn DeviceBackend>> + Send + Sync,
{
    fn create_backend(&self) -> Result<Box<dyn DeviceBackend>> {
        self()
    }
}
