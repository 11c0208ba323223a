//! Segmented ring buffer between a real-time device thread and a pull reader.
//!
//! ```text
//!   device thread                 SegmentedRingBuffer                 pull reader
//!  ┌─────────────┐  fill()   ┌──────────────────────────────┐  read()  ┌─────────┐
//!  │ DeviceBackend│ ───────► │ seg0 │ seg1 │ ... │ segN-1     │ ───────► │ create()│
//!  └─────────────┘  drain()  │   segments_done (u64, atomic) │ commit() └─────────┘
//!                   ◄─────── └──────────────────────────────┘ ◄───────
//! ```
//!
//! The device side only touches atomics, the storage read lock and a
//! per-segment mutex. It never takes the control lock that serialises
//! acquire/release/start/stop, so slow backend calls cannot stall it.
//!
//! Blocking operations wait on a condition variable paired with its own
//! short-held mutex. Every state transition and every completed segment (while
//! somebody waits) signals it; there are no timeouts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::audio::DeviceBackend;
use crate::buffering::spec::RingBufferSpec;
use crate::error::{LiveAudioError, Result};
use crate::time::{scale, SECOND};

/// Overall transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RingState {
    Stopped = 0,
    Paused = 1,
    Started = 2,
}

impl RingState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Paused,
            2 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

/// Validity of one segment's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    /// Never written since acquire/clear; holds silence.
    Invalid = 0,
    /// Consumed; holds stale or silent data.
    Empty = 1,
    Filled = 2,
    /// Being written by the producer.
    Partial = 3,
}

impl SegmentState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Empty,
            2 => Self::Filled,
            3 => Self::Partial,
            _ => Self::Invalid,
        }
    }
}

/// Units accepted by [`SegmentedRingBuffer::convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Bytes,
    /// Frames: one sample across all channels.
    Samples,
    /// Nanoseconds.
    Time,
}

// ── shared state ─────────────────────────────────────────────────────────────

struct Storage {
    spec: RingBufferSpec,
    segments: Vec<Mutex<Vec<u8>>>,
    seg_state: Vec<AtomicU8>,
    silence: Vec<u8>,
    samples_per_segment: u64,
}

impl Storage {
    fn segment_count(&self) -> u64 {
        self.segments.len() as u64
    }

    fn segment_state(&self, idx: usize) -> SegmentState {
        SegmentState::from_u8(self.seg_state[idx].load(Ordering::Acquire))
    }

    fn set_segment_state(&self, idx: usize, state: SegmentState) {
        self.seg_state[idx].store(state as u8, Ordering::Release);
    }
}

#[derive(Clone, Copy)]
struct Geometry {
    bps: u64,
    sps: u64,
    segtotal: u64,
}

struct RingShared {
    storage: RwLock<Option<Storage>>,
    state: AtomicU8,
    /// Segments produced (capture) or consumed (playback) since the last reset.
    segments_done: AtomicU64,
    waiting: AtomicU32,
    may_start: AtomicBool,
    flushing: AtomicBool,
    /// Producer cursor inside the current segment, in bytes.
    window_offset: AtomicUsize,
    backpressure: AtomicBool,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
}

impl RingShared {
    fn new() -> Self {
        Self {
            storage: RwLock::new(None),
            state: AtomicU8::new(RingState::Stopped as u8),
            segments_done: AtomicU64::new(0),
            waiting: AtomicU32::new(0),
            may_start: AtomicBool::new(false),
            flushing: AtomicBool::new(true),
            window_offset: AtomicUsize::new(0),
            backpressure: AtomicBool::new(true),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
        }
    }

    fn state(&self) -> RingState {
        RingState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RingState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn cas_state(&self, from: RingState, to: RingState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn geometry(&self) -> Option<Geometry> {
        self.storage.read().as_ref().map(|s| Geometry {
            bps: u64::from(s.spec.bytes_per_sample),
            sps: s.samples_per_segment,
            segtotal: s.segment_count(),
        })
    }

    fn wake_all(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cond.notify_all();
    }

    fn advance(&self, segments: u64) {
        self.segments_done.fetch_add(segments, Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) > 0 {
            trace!("signalling waiter after segment advance");
            self.wake_all();
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.flushing.load(Ordering::SeqCst) {
            return Err(LiveAudioError::Stopped);
        }
        if self.state() != RingState::Started {
            return Err(LiveAudioError::Stopped);
        }
        Ok(())
    }

    /// Block until `segments_done` moves past `observed` or a transition
    /// interrupts the wait. Spurious returns are fine; callers re-check.
    fn wait_progress(&self, observed: u64) -> Result<()> {
        let mut guard = self.wait_lock.lock();
        self.check_running()?;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        if self.segments_done.load(Ordering::SeqCst) == observed {
            trace!(observed, "waiting for segment");
            self.wait_cond.wait(&mut guard);
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.check_running()
    }

    fn clear_all(&self) {
        {
            let guard = self.storage.write();
            if let Some(storage) = guard.as_ref() {
                for (idx, seg) in storage.segments.iter().enumerate() {
                    seg.lock().copy_from_slice(&storage.silence);
                    storage.set_segment_state(idx, SegmentState::Invalid);
                }
            }
            self.segments_done.store(0, Ordering::SeqCst);
            self.window_offset.store(0, Ordering::SeqCst);
        }
        debug!("ring buffer cleared");
        self.wake_all();
    }
}

// ── device-side handle ───────────────────────────────────────────────────────

/// Handle given to a [`DeviceBackend`] for moving bytes in and out of the
/// rotating segment window. Never blocks on control operations.
#[derive(Clone)]
pub struct SegmentIo {
    shared: Arc<RingShared>,
}

impl SegmentIo {
    /// `true` while the transport is started and not flushing.
    pub fn is_started(&self) -> bool {
        !self.shared.flushing.load(Ordering::SeqCst) && self.shared.state() == RingState::Started
    }

    /// Segments completed since the last reset.
    pub fn segments_done(&self) -> u64 {
        self.shared.segments_done.load(Ordering::SeqCst)
    }

    /// Capture side: append `data` at the producer cursor. Segments move
    /// partial → filled; each completed segment advances the position.
    ///
    /// Returns the number of bytes accepted (0 when not started or flushing).
    pub fn fill(&self, data: &[u8]) -> usize {
        if !self.is_started() {
            return 0;
        }
        let guard = self.shared.storage.read();
        let Some(storage) = guard.as_ref() else {
            return 0;
        };
        let segsize = storage.spec.segment_size as usize;
        let segtotal = storage.segment_count();

        let mut consumed = 0;
        while consumed < data.len() {
            let done = self.shared.segments_done.load(Ordering::SeqCst);
            let idx = (done % segtotal) as usize;
            let offset = self.shared.window_offset.load(Ordering::Acquire);
            let n = (segsize - offset).min(data.len() - consumed);

            storage.set_segment_state(idx, SegmentState::Partial);
            storage.segments[idx].lock()[offset..offset + n]
                .copy_from_slice(&data[consumed..consumed + n]);
            consumed += n;

            if offset + n == segsize {
                storage.set_segment_state(idx, SegmentState::Filled);
                self.shared.window_offset.store(0, Ordering::Release);
                self.shared.advance(1);
            } else {
                self.shared.window_offset.store(offset + n, Ordering::Release);
            }
        }
        consumed
    }

    /// Playback side: copy queued bytes at the device cursor into `out`,
    /// leaving silence behind. Each fully drained segment advances the
    /// position.
    ///
    /// Returns the number of bytes written to `out` (0 when not started).
    pub fn drain(&self, out: &mut [u8]) -> usize {
        if !self.is_started() {
            return 0;
        }
        let guard = self.shared.storage.read();
        let Some(storage) = guard.as_ref() else {
            return 0;
        };
        let segsize = storage.spec.segment_size as usize;
        let segtotal = storage.segment_count();

        let mut produced = 0;
        while produced < out.len() {
            let done = self.shared.segments_done.load(Ordering::SeqCst);
            let idx = (done % segtotal) as usize;
            let offset = self.shared.window_offset.load(Ordering::Acquire);
            let n = (segsize - offset).min(out.len() - produced);
            {
                let mut seg = storage.segments[idx].lock();
                out[produced..produced + n].copy_from_slice(&seg[offset..offset + n]);
                seg[offset..offset + n].copy_from_slice(&storage.silence[offset..offset + n]);
            }
            produced += n;

            if offset + n == segsize {
                storage.set_segment_state(idx, SegmentState::Empty);
                self.shared.window_offset.store(0, Ordering::Release);
                self.shared.advance(1);
            } else {
                self.shared.window_offset.store(offset + n, Ordering::Release);
            }
        }
        produced
    }

    /// Copy the whole segment at the device cursor into `out` without
    /// consuming it. Returns its index, or `None` when not started/acquired
    /// or `out` is shorter than a segment.
    pub fn prepare_read(&self, out: &mut [u8]) -> Option<usize> {
        if !self.is_started() {
            return None;
        }
        let guard = self.shared.storage.read();
        let storage = guard.as_ref()?;
        let segsize = storage.spec.segment_size as usize;
        if out.len() < segsize {
            return None;
        }
        let done = self.shared.segments_done.load(Ordering::SeqCst);
        let idx = (done % storage.segment_count()) as usize;
        out[..segsize].copy_from_slice(&storage.segments[idx].lock());
        Some(idx)
    }

    /// Reset one segment to silence and mark it empty.
    pub fn clear(&self, segment: usize) {
        let guard = self.shared.storage.read();
        if let Some(storage) = guard.as_ref() {
            if let Some(seg) = storage.segments.get(segment) {
                seg.lock().copy_from_slice(&storage.silence);
                storage.set_segment_state(segment, SegmentState::Empty);
            }
        }
    }

    /// Mark `segments` whole segments as processed and wake any waiter.
    pub fn advance(&self, segments: u64) {
        self.shared.advance(segments);
    }
}

// ── ring buffer ──────────────────────────────────────────────────────────────

struct Control {
    backend: Box<dyn DeviceBackend>,
    open: bool,
    acquired: bool,
    active: bool,
}

/// Circular buffer of fixed-size segments with a started/paused/stopped
/// transport, driven by a [`DeviceBackend`].
pub struct SegmentedRingBuffer {
    shared: Arc<RingShared>,
    control: Mutex<Control>,
}

impl SegmentedRingBuffer {
    pub fn new(mut backend: Box<dyn DeviceBackend>) -> Self {
        let shared = Arc::new(RingShared::new());
        shared
            .backpressure
            .store(backend.backpressure(), Ordering::SeqCst);
        backend.bind(SegmentIo {
            shared: Arc::clone(&shared),
        });
        debug!(backend = backend.name(), "ring buffer created");
        Self {
            shared,
            control: Mutex::new(Control {
                backend,
                open: false,
                acquired: false,
                active: false,
            }),
        }
    }

    /// Device-side handle for this ring buffer.
    pub fn io(&self) -> SegmentIo {
        SegmentIo {
            shared: Arc::clone(&self.shared),
        }
    }

    // ── device lifecycle ────────────────────────────────────────────────────

    pub fn open_device(&self) -> Result<()> {
        let mut ctl = self.control.lock();
        if ctl.open {
            warn!("device already open");
            return Ok(());
        }
        ctl.backend.open_device()?;
        ctl.open = true;
        debug!(backend = ctl.backend.name(), "device opened");
        Ok(())
    }

    /// Close the device. Fails with `WrongState` while still acquired.
    pub fn close_device(&self) -> Result<()> {
        let mut ctl = self.control.lock();
        if ctl.acquired {
            return Err(LiveAudioError::WrongState("cannot close acquired ring buffer"));
        }
        if !ctl.open {
            return Ok(());
        }
        ctl.backend.close_device()?;
        ctl.open = false;
        debug!(backend = ctl.backend.name(), "device closed");
        Ok(())
    }

    /// Allocate segments for `spec`. The backend may adjust `segment_size`,
    /// `segment_count` and `segment_latency`; the granted values are written
    /// back into `spec`.
    pub fn acquire(&self, spec: &mut RingBufferSpec) -> Result<()> {
        let mut ctl = self.control.lock();
        if !ctl.open {
            return Err(LiveAudioError::WrongState("device not open"));
        }
        if ctl.acquired {
            return Err(LiveAudioError::WrongState("ring buffer already acquired"));
        }

        spec.segment_latency = spec.segment_count;
        ctl.backend.acquire(spec)?;

        let bps = spec.bytes_per_sample;
        let valid = bps > 0
            && spec.segment_count > 0
            && spec.segment_size >= bps
            && spec.segment_size % bps == 0;
        if !valid {
            if let Err(e) = ctl.backend.release() {
                warn!("backend release after rejected geometry failed: {e}");
            }
            return Err(LiveAudioError::NegotiationFailure(format!(
                "backend granted unusable geometry: {} segments of {} bytes at {} bytes/sample",
                spec.segment_count, spec.segment_size, bps
            )));
        }

        let silence = spec.silence_segment();
        let segtotal = spec.segment_count as usize;
        let storage = Storage {
            segments: (0..segtotal).map(|_| Mutex::new(silence.clone())).collect(),
            seg_state: (0..segtotal)
                .map(|_| AtomicU8::new(SegmentState::Invalid as u8))
                .collect(),
            silence,
            samples_per_segment: u64::from(spec.samples_per_segment()),
            spec: spec.clone(),
        };
        {
            let mut guard = self.shared.storage.write();
            *guard = Some(storage);
            self.shared.segments_done.store(0, Ordering::SeqCst);
            self.shared.window_offset.store(0, Ordering::SeqCst);
        }
        ctl.acquired = true;
        spec.log_buffer();
        debug!(backend = ctl.backend.name(), "ring buffer acquired");
        Ok(())
    }

    /// Stop, deactivate and free the segments. A backend failure leaves the
    /// buffer acquired.
    pub fn release(&self) -> Result<()> {
        self.stop()?;
        let mut ctl = self.control.lock();
        if !ctl.acquired {
            return Ok(());
        }
        if ctl.active {
            ctl.backend.activate(false)?;
            ctl.active = false;
        }
        ctl.backend.release()?;
        ctl.acquired = false;
        self.shared.wake_all();
        *self.shared.storage.write() = None;
        debug!(backend = ctl.backend.name(), "ring buffer released");
        Ok(())
    }

    /// Enable or disable the backend's producer mechanism.
    pub fn activate(&self, active: bool) -> Result<()> {
        let mut ctl = self.control.lock();
        if !ctl.acquired {
            return Err(LiveAudioError::WrongState("ring buffer not acquired"));
        }
        if ctl.active == active {
            return Ok(());
        }
        ctl.backend.activate(active)?;
        ctl.active = active;
        debug!(active, "ring buffer activation changed");
        Ok(())
    }

    // ── transport ───────────────────────────────────────────────────────────

    /// Start (or resume) the transport. Returns `Ok(false)` without changing
    /// state while starting is not permitted.
    pub fn start(&self) -> Result<bool> {
        let mut ctl = self.control.lock();
        if self.shared.flushing.load(Ordering::SeqCst) {
            return Err(LiveAudioError::WrongState("ring buffer is flushing"));
        }
        if !ctl.acquired {
            return Err(LiveAudioError::WrongState("ring buffer not acquired"));
        }
        if !self.shared.may_start.load(Ordering::SeqCst) {
            debug!("start requested but not permitted yet");
            return Ok(false);
        }

        let result = if self.shared.cas_state(RingState::Stopped, RingState::Started) {
            ctl.backend.start()
        } else if self.shared.cas_state(RingState::Paused, RingState::Started) {
            ctl.backend.resume()
        } else {
            return Ok(true);
        };

        if let Err(e) = result {
            self.shared.set_state(RingState::Paused);
            self.shared.wake_all();
            return Err(e);
        }
        debug!("ring buffer started");
        self.shared.wake_all();
        Ok(true)
    }

    pub fn pause(&self) -> Result<()> {
        let mut ctl = self.control.lock();
        if self.shared.flushing.load(Ordering::SeqCst) {
            return Err(LiveAudioError::WrongState("ring buffer is flushing"));
        }
        if !ctl.acquired {
            return Err(LiveAudioError::WrongState("ring buffer not acquired"));
        }
        self.pause_locked(&mut ctl)
    }

    fn pause_locked(&self, ctl: &mut Control) -> Result<()> {
        if !self.shared.cas_state(RingState::Started, RingState::Paused) {
            return Ok(());
        }
        self.shared.wake_all();
        if let Err(e) = ctl.backend.pause() {
            self.shared.set_state(RingState::Started);
            return Err(e);
        }
        debug!("ring buffer paused");
        Ok(())
    }

    /// Resume a paused transport. Gated by the start permission like
    /// [`start`](Self::start).
    pub fn resume(&self) -> Result<bool> {
        let mut ctl = self.control.lock();
        if self.shared.flushing.load(Ordering::SeqCst) {
            return Err(LiveAudioError::WrongState("ring buffer is flushing"));
        }
        if !ctl.acquired {
            return Err(LiveAudioError::WrongState("ring buffer not acquired"));
        }
        if !self.shared.may_start.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if !self.shared.cas_state(RingState::Paused, RingState::Started) {
            return Ok(self.shared.state() == RingState::Started);
        }
        if let Err(e) = ctl.backend.resume() {
            self.shared.set_state(RingState::Paused);
            self.shared.wake_all();
            return Err(e);
        }
        debug!("ring buffer resumed");
        self.shared.wake_all();
        Ok(true)
    }

    pub fn stop(&self) -> Result<()> {
        let mut ctl = self.control.lock();
        let previous = if self.shared.cas_state(RingState::Started, RingState::Stopped) {
            RingState::Started
        } else if self.shared.cas_state(RingState::Paused, RingState::Stopped) {
            RingState::Paused
        } else {
            return Ok(());
        };
        self.shared.wake_all();
        if let Err(e) = ctl.backend.stop() {
            self.shared.set_state(previous);
            return Err(e);
        }
        debug!("ring buffer stopped");
        Ok(())
    }

    /// Entering flush mode pauses the transport and clears every segment;
    /// blocked reads and commits return [`LiveAudioError::Stopped`].
    pub fn set_flushing(&self, flushing: bool) {
        let mut ctl = self.control.lock();
        self.shared.flushing.store(flushing, Ordering::SeqCst);
        if flushing {
            if let Err(e) = self.pause_locked(&mut ctl) {
                warn!("pause while entering flush failed: {e}");
            }
        }
        drop(ctl);
        self.shared.clear_all();
    }

    pub fn set_may_start(&self, allowed: bool) {
        debug!(allowed, "start permission changed");
        self.shared.may_start.store(allowed, Ordering::SeqCst);
    }

    /// Reset every segment to silence and the position to zero.
    pub fn clear_all(&self) {
        self.shared.clear_all();
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn is_open(&self) -> bool {
        self.control.lock().open
    }

    pub fn is_acquired(&self) -> bool {
        self.control.lock().acquired
    }

    pub fn is_active(&self) -> bool {
        self.control.lock().active
    }

    pub fn state(&self) -> RingState {
        self.shared.state()
    }

    pub fn may_start(&self) -> bool {
        self.shared.may_start.load(Ordering::SeqCst)
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.flushing.load(Ordering::SeqCst)
    }

    /// Spec of the current acquisition.
    pub fn spec(&self) -> Option<RingBufferSpec> {
        self.shared.storage.read().as_ref().map(|s| s.spec.clone())
    }

    /// Sample rate of the current acquisition; 0 when not acquired.
    pub fn rate(&self) -> u32 {
        self.shared
            .storage
            .read()
            .as_ref()
            .map_or(0, |s| s.spec.format.rate)
    }

    pub(crate) fn store_effective_times(&self, latency_time: u64, buffer_time: u64) {
        if let Some(storage) = self.shared.storage.write().as_mut() {
            storage.spec.latency_time = latency_time;
            storage.spec.buffer_time = buffer_time;
        }
    }

    /// Segments queued but not yet consumed: the backend's own queue plus
    /// segments holding unread data.
    pub fn delay(&self) -> u32 {
        let ctl = self.control.lock();
        if !ctl.acquired {
            return 0;
        }
        let pending = self.shared.storage.read().as_ref().map_or(0, |s| {
            (0..s.segments.len())
                .filter(|&i| {
                    matches!(
                        s.segment_state(i),
                        SegmentState::Filled | SegmentState::Partial
                    )
                })
                .count() as u32
        });
        ctl.backend.delay().saturating_add(pending)
    }

    /// Absolute number of samples processed since the last reset.
    pub fn samples_done(&self) -> u64 {
        let sps = self
            .shared
            .storage
            .read()
            .as_ref()
            .map_or(0, |s| s.samples_per_segment);
        self.shared.segments_done.load(Ordering::SeqCst) * sps
    }

    pub fn segment_state(&self, segment: usize) -> Option<SegmentState> {
        let guard = self.shared.storage.read();
        let storage = guard.as_ref()?;
        (segment < storage.segments.len()).then(|| storage.segment_state(segment))
    }

    /// Convert `value` between bytes, frames and nanoseconds using the
    /// acquired format. `None` when not acquired.
    pub fn convert(&self, src: Format, value: u64, dest: Format) -> Option<u64> {
        if src == dest {
            return Some(value);
        }
        let (bps, rate) = {
            let guard = self.shared.storage.read();
            let s = guard.as_ref()?;
            (u64::from(s.spec.bytes_per_sample), u64::from(s.spec.format.rate))
        };
        if bps == 0 || rate == 0 {
            return None;
        }
        let samples = match src {
            Format::Bytes => value / bps,
            Format::Samples => value,
            Format::Time => scale(value, rate, SECOND),
        };
        Some(match dest {
            Format::Bytes => samples.saturating_mul(bps),
            Format::Samples => samples,
            Format::Time => scale(samples, SECOND, rate),
        })
    }

    // ── segment I/O ─────────────────────────────────────────────────────────

    /// Start the transport on behalf of a blocking call, if permitted.
    fn ensure_started(&self) -> Result<()> {
        if self.shared.state() == RingState::Started {
            return Ok(());
        }
        if !self.shared.may_start.load(Ordering::SeqCst) {
            return Err(LiveAudioError::Stopped);
        }
        debug!("starting ring buffer from blocking call");
        match self.start() {
            Ok(true) => Ok(()),
            Ok(false) => Err(LiveAudioError::Stopped),
            Err(e) if e.is_recoverable() => Err(LiveAudioError::Stopped),
            Err(e) => Err(e),
        }
    }

    /// Read whole frames starting at absolute sample `sample` into `data`.
    /// Positions that were overrun, never written, or are still being
    /// written read as silence.
    ///
    /// Returns the number of samples read.
    ///
    /// # Errors
    /// `WrongState` if not acquired; `Stopped` if flushing or stopped while
    /// waiting for data.
    pub fn read(&self, sample: u64, data: &mut [u8]) -> Result<u64> {
        let geo = self
            .shared
            .geometry()
            .ok_or(LiveAudioError::WrongState("ring buffer not acquired"))?;
        let total = data.len() as u64 / geo.bps;
        let mut copied = 0u64;
        let mut pos = sample;

        while copied < total {
            let read_seg = pos / geo.sps;
            let sample_off = pos % geo.sps;
            let n = (geo.sps - sample_off).min(total - copied);
            let dst = &mut data[(copied * geo.bps) as usize..((copied + n) * geo.bps) as usize];

            let available = self.await_segment(read_seg, geo)?;
            self.copy_segment_out(read_seg, sample_off, dst, available, geo)?;

            copied += n;
            pos += n;
        }
        Ok(total)
    }

    /// Returns `true` if `read_seg` holds produced data, `false` if it must be
    /// read as silence.
    fn await_segment(&self, read_seg: u64, geo: Geometry) -> Result<bool> {
        loop {
            let done = self.shared.segments_done.load(Ordering::SeqCst);
            if done > read_seg {
                if done - read_seg >= geo.segtotal {
                    trace!(read_seg, done, "segment overrun, reading silence");
                    return Ok(false);
                }
                return Ok(true);
            }
            self.ensure_started()?;
            if !self.shared.backpressure.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.shared.wait_progress(done)?;
        }
    }

    fn copy_segment_out(
        &self,
        read_seg: u64,
        sample_off: u64,
        dst: &mut [u8],
        available: bool,
        geo: Geometry,
    ) -> Result<()> {
        let guard = self.shared.storage.read();
        let storage = guard.as_ref().ok_or(LiveAudioError::Stopped)?;
        let start = (sample_off * geo.bps) as usize;
        let range = start..start + dst.len();

        if !available {
            dst.copy_from_slice(&storage.silence[range]);
            return Ok(());
        }

        let idx = (read_seg % geo.segtotal) as usize;
        dst.copy_from_slice(&storage.segments[idx].lock()[range.clone()]);

        // A reset between the wait and the copy leaves `done <= read_seg`.
        let done = self.shared.segments_done.load(Ordering::SeqCst);
        let stale = done
            .checked_sub(read_seg)
            .map_or(true, |ahead| ahead == 0 || ahead >= geo.segtotal);
        if stale {
            trace!(read_seg, done, "segment lapped or reset during read, substituting silence");
            dst.copy_from_slice(&storage.silence[range]);
        } else if range.end == storage.spec.segment_size as usize {
            let _ = storage.seg_state[idx].compare_exchange(
                SegmentState::Filled as u8,
                SegmentState::Empty as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        Ok(())
    }

    /// Write `data` for playback at absolute sample `*sample`, converting
    /// from `data.len() / bps` input frames to `out_samples` output frames
    /// with nearest-sample stepping. `accum` carries the stepping error
    /// between calls. Segments already consumed by the device are skipped.
    ///
    /// Advances `*sample` by the output frames placed and returns the number
    /// of input frames consumed.
    ///
    /// # Errors
    /// `WrongState` if not acquired; `Stopped` if flushing or stopped while
    /// waiting for space.
    pub fn commit(
        &self,
        sample: &mut u64,
        data: &[u8],
        out_samples: u64,
        accum: &mut i64,
    ) -> Result<u64> {
        let geo = self
            .shared
            .geometry()
            .ok_or(LiveAudioError::WrongState("ring buffer not acquired"))?;
        let bps = geo.bps as usize;
        let in_total = data.len() / bps;
        if in_total == 0 || out_samples == 0 {
            return Ok(0);
        }
        let stepper = Stepper {
            in_frames: in_total as i64,
            out_frames: out_samples as i64,
            bps,
        };

        let mut in_pos = 0usize;
        let mut out_left = out_samples;
        let mut pos = *sample;

        while in_pos < in_total && out_left > 0 {
            let write_seg = pos / geo.sps;
            let sample_off = pos % geo.sps;
            let room = (geo.sps - sample_off).min(out_left) as usize;

            let step = self.commit_segment(write_seg, sample_off, geo, |dst| {
                stepper.run(data, in_pos, in_total, dst, room, accum)
            });
            let (used, produced) = match step {
                Ok(step) => step,
                Err(e) => {
                    // Keep the progress made by earlier segments of this call.
                    *sample = pos;
                    return Err(e);
                }
            };

            in_pos += used;
            out_left -= produced as u64;
            pos += produced as u64;
        }

        *sample = pos;
        Ok(in_pos as u64)
    }

    /// Wait for room at `write_seg` and let `write` place frames from
    /// `sample_off` onward, or discard them when the device already consumed
    /// the segment. Returns `(frames consumed, frames produced)`.
    fn commit_segment(
        &self,
        write_seg: u64,
        sample_off: u64,
        geo: Geometry,
        write: impl FnOnce(Option<&mut [u8]>) -> (usize, usize),
    ) -> Result<(usize, usize)> {
        if self.await_space(write_seg, geo)? {
            trace!(write_seg, "segment already consumed, dropping");
            return Ok(write(None));
        }

        let guard = self.shared.storage.read();
        let storage = guard.as_ref().ok_or(LiveAudioError::Stopped)?;
        let idx = (write_seg % geo.segtotal) as usize;
        let start = sample_off as usize * geo.bps as usize;
        let (used, produced) = {
            let mut seg = storage.segments[idx].lock();
            write(Some(&mut seg[start..]))
        };
        let state = if sample_off + produced as u64 == geo.sps {
            SegmentState::Filled
        } else {
            SegmentState::Partial
        };
        storage.set_segment_state(idx, state);
        Ok((used, produced))
    }

    /// Returns `true` if `write_seg` was already consumed by the device.
    fn await_space(&self, write_seg: u64, geo: Geometry) -> Result<bool> {
        loop {
            let done = self.shared.segments_done.load(Ordering::SeqCst);
            if write_seg < done {
                return Ok(true);
            }
            if write_seg - done < geo.segtotal {
                return Ok(false);
            }
            self.ensure_started()?;
            self.shared.wait_progress(done)?;
        }
    }
}

impl Drop for SegmentedRingBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("release on drop failed: {e}");
        }
        if let Err(e) = self.close_device() {
            warn!("close on drop failed: {e}");
        }
    }
}

/// Forward nearest-sample rate stepping with an error accumulator.
struct Stepper {
    in_frames: i64,
    out_frames: i64,
    bps: usize,
}

impl Stepper {
    /// Copy frames from `src[in_pos..in_end]` into up to `max_out` frames of
    /// `dst` (or discard them). Returns `(frames consumed, frames produced)`.
    fn run(
        &self,
        src: &[u8],
        in_pos: usize,
        in_end: usize,
        mut dst: Option<&mut [u8]>,
        max_out: usize,
        accum: &mut i64,
    ) -> (usize, usize) {
        let bps = self.bps;
        let mut s = in_pos;
        let mut d = 0usize;

        if self.in_frames == self.out_frames {
            let n = (in_end - in_pos).min(max_out);
            if let Some(dst) = dst.as_deref_mut() {
                dst[..n * bps].copy_from_slice(&src[s * bps..(s + n) * bps]);
            }
            return (n, n);
        }

        while s < in_end && d < max_out {
            if self.in_frames > self.out_frames {
                // Downsampling: every input frame is consumed, some are kept.
                *accum += self.out_frames;
                if *accum >= self.in_frames {
                    *accum -= self.in_frames;
                    if let Some(dst) = dst.as_deref_mut() {
                        dst[d * bps..(d + 1) * bps].copy_from_slice(&src[s * bps..(s + 1) * bps]);
                    }
                    d += 1;
                }
                s += 1;
            } else {
                // Upsampling: every output frame is written, some repeat.
                if let Some(dst) = dst.as_deref_mut() {
                    dst[d * bps..(d + 1) * bps].copy_from_slice(&src[s * bps..(s + 1) * bps]);
                }
                d += 1;
                *accum += self.in_frames;
                if *accum >= self.out_frames {
                    *accum -= self.out_frames;
                    s += 1;
                }
            }
        }
        (s - in_pos, d)
    }
}
