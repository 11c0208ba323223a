//! `LiveAudioSource`: pull-based capture source over a segmented ring buffer.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveAudioSource::new()
//!     └─► set_state(Ready)     → backend created, device open
//!         └─► set_state(Paused)  → flushing cleared; set_caps() acquires + activates
//!             └─► set_state(Playing) → ring buffer may start; create() pulls data
//! ```
//!
//! Reverse transitions undo these steps; see [`lifecycle`].
//!
//! ## Timestamps
//!
//! Every buffer is stamped from its absolute sample index and the negotiated
//! rate, the same quantity the [`SoftwareClock`] reports, so consecutive
//! buffers form a gapless timeline regardless of scheduling jitter.

pub mod clock;
pub mod lifecycle;
pub mod pipeline;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::audio::DeviceProvider;
use crate::buffering::{AudioCaps, AudioChunk, RingBufferSpec, SegmentedRingBuffer};
use crate::error::{LiveAudioError, Result};
use crate::ipc::events::{SourceStatus, SourceStatusEvent};
use crate::time::{samples_to_time, ClockTime};

pub use clock::{Clock, SoftwareClock};
pub use lifecycle::{ElementState, StateChange, StateChangeSuccess};

/// Broadcast channel capacity: 64 status events buffered for slow consumers.
const BROADCAST_CAP: usize = 64;

/// Configured ring-buffer times, applied at the next format negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceConfig {
    /// Total ring-buffer duration in µs. Default: 200000.
    pub buffer_time_us: u64,
    /// Duration of one segment in µs. Default: 10000.
    pub latency_time_us: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            buffer_time_us: 200_000,
            latency_time_us: 10_000,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_time_us == 0 {
            return Err(LiveAudioError::InvalidConfig(
                "buffer_time_us must be positive".into(),
            ));
        }
        if self.latency_time_us == 0 {
            return Err(LiveAudioError::InvalidConfig(
                "latency_time_us must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Out-of-band events delivered to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    FlushStart,
    FlushStop,
}

pub struct LiveAudioSource {
    config: RwLock<SourceConfig>,
    provider: Arc<dyn DeviceProvider>,
    ring: RwLock<Option<Arc<SegmentedRingBuffer>>>,
    clock: Arc<SoftwareClock>,
    /// Next sample expected by `create`; `None` resyncs at sample 0.
    next_sample: Mutex<Option<u64>>,
    /// Bumped on every flush-stop so a read racing a flush is discarded.
    flush_epoch: AtomicU64,
    state: Mutex<ElementState>,
    transition_lock: Mutex<()>,
    status_tx: broadcast::Sender<SourceStatusEvent>,
}

impl LiveAudioSource {
    pub fn new(config: SourceConfig, provider: Arc<dyn DeviceProvider>) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Ok(Self {
            config: RwLock::new(config),
            provider,
            ring: RwLock::new(None),
            clock: Arc::new(SoftwareClock::new("liveaudio-clock")),
            next_sample: Mutex::new(None),
            flush_epoch: AtomicU64::new(0),
            state: Mutex::new(ElementState::Null),
            transition_lock: Mutex::new(()),
            status_tx,
        })
    }

    // ── configuration ───────────────────────────────────────────────────────

    pub fn config(&self) -> SourceConfig {
        self.config.read().clone()
    }

    /// Takes effect at the next [`set_caps`](Self::set_caps).
    pub fn set_buffer_time(&self, buffer_time_us: u64) -> Result<()> {
        let mut config = self.config.write();
        let updated = SourceConfig {
            buffer_time_us,
            ..config.clone()
        };
        updated.validate()?;
        *config = updated;
        Ok(())
    }

    /// Takes effect at the next [`set_caps`](Self::set_caps).
    pub fn set_latency_time(&self, latency_time_us: u64) -> Result<()> {
        let mut config = self.config.write();
        let updated = SourceConfig {
            latency_time_us,
            ..config.clone()
        };
        updated.validate()?;
        *config = updated;
        Ok(())
    }

    // ── introspection ───────────────────────────────────────────────────────

    pub fn ring(&self) -> Option<Arc<SegmentedRingBuffer>> {
        self.ring.read().clone()
    }

    pub fn current_state(&self) -> ElementState {
        *self.state.lock()
    }

    /// Live sources produce data in real time and cannot preroll.
    pub fn is_live(&self) -> bool {
        true
    }

    /// Limited pull mode is supported: only strictly sequential ranges.
    pub fn check_get_range(&self) -> bool {
        true
    }

    /// Buffers are not synchronised against a clock by the consumer; the
    /// source schedules them by its own clock.
    pub fn get_times(&self, _chunk: &AudioChunk) -> (Option<ClockTime>, Option<ClockTime>) {
        (None, None)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SourceStatusEvent> {
        self.status_tx.subscribe()
    }

    // ── clock ───────────────────────────────────────────────────────────────

    /// The source's clock, available only while the ring buffer is acquired.
    pub fn provide_clock(&self) -> Option<Arc<dyn Clock>> {
        let ring = self.ring.read().clone()?;
        if !ring.is_acquired() {
            debug!("ring buffer not acquired, no clock to provide");
            return None;
        }
        Some(Arc::clone(&self.clock) as Arc<dyn Clock>)
    }

    /// Accept `None` or this source's own clock. Slaving to another clock is
    /// not supported.
    pub fn set_clock(&self, clock: Option<Arc<dyn Clock>>) -> Result<()> {
        match clock {
            None => Ok(()),
            Some(c) if Arc::as_ptr(&c) as *const () == Arc::as_ptr(&self.clock) as *const () => {
                Ok(())
            }
            Some(c) => {
                let err = LiveAudioError::ClockConflict;
                error!(clock = c.name(), "{err}");
                self.post_error(&err);
                Err(err)
            }
        }
    }

    // ── negotiation ─────────────────────────────────────────────────────────

    /// Resolve unconstrained caps fields to the default capture format.
    pub fn fixate(&self, caps: &mut AudioCaps) {
        caps.fixate();
    }

    /// Negotiate `caps`: (re)acquire the ring buffer with segment geometry
    /// from the configured times and activate the device's producer.
    ///
    /// Returns the effective spec, with times recomputed from the geometry
    /// the device granted.
    pub fn set_caps(&self, caps: &AudioCaps) -> Result<RingBufferSpec> {
        let ring = self.ring_handle()?;
        let config = self.config();

        let mut spec = RingBufferSpec::with_times(config.buffer_time_us, config.latency_time_us);
        spec.parse_caps(caps)?;
        spec.log_caps();
        spec.compute_segment_geometry();

        debug!("release old ring buffer");
        ring.release()?;
        spec.log_buffer();

        debug!("acquire new ring buffer");
        ring.acquire(&mut spec).map_err(|e| match e {
            LiveAudioError::NegotiationFailure(_) => e,
            other => LiveAudioError::NegotiationFailure(format!(
                "could not acquire ring buffer: {other}"
            )),
        })?;

        spec.update_times_from_geometry();
        ring.store_effective_times(spec.latency_time, spec.buffer_time);
        spec.log_buffer();

        ring.activate(true)?;
        info!(
            rate = spec.format.rate,
            channels = spec.format.channels,
            segment_size = spec.segment_size,
            segment_count = spec.segment_count,
            latency_us = spec.latency_time,
            "caps negotiated"
        );
        Ok(spec)
    }

    // ── events ──────────────────────────────────────────────────────────────

    /// Flush-start pauses and clears the ring buffer; flush-stop clears it
    /// again and makes the next pull resync at sample 0.
    pub fn handle_event(&self, event: SourceEvent) -> bool {
        let Some(ring) = self.ring() else {
            return true;
        };
        match event {
            SourceEvent::FlushStart => {
                if let Err(e) = ring.pause() {
                    debug!("pause on flush-start: {e}");
                }
                ring.clear_all();
            }
            SourceEvent::FlushStop => {
                {
                    let mut next = self.next_sample.lock();
                    *next = None;
                    self.flush_epoch.fetch_add(1, Ordering::SeqCst);
                }
                ring.clear_all();
            }
        }
        debug!(?event, "event handled");
        true
    }

    // ── pull ────────────────────────────────────────────────────────────────

    /// Produce the next buffer.
    ///
    /// `offset` is an absolute byte offset; when given it must be exactly
    /// the next sequential position. `length` of `None` or 0 reads one
    /// segment; other lengths are rounded down to whole frames.
    ///
    /// # Errors
    /// - `WrongState` if the ring buffer is not acquired, or stopped or
    ///   flushed during the read. Soft: retry or end the pull cycle.
    /// - `SequentialAccessViolation` for any non-sequential `offset`.
    pub fn create(&self, offset: Option<u64>, length: Option<u32>) -> Result<AudioChunk> {
        let ring = self.ring_handle()?;
        let spec = ring
            .spec()
            .ok_or(LiveAudioError::WrongState("ring buffer not acquired"))?;
        let bps = u64::from(spec.bytes_per_sample);

        let length = match length {
            None | Some(0) => u64::from(spec.segment_size),
            Some(len) => u64::from(len) - u64::from(len) % bps,
        };

        let epoch = self.flush_epoch.load(Ordering::SeqCst);
        let sample = self.next_sample.lock().unwrap_or(0);

        if let Some(offset) = offset {
            if offset / bps != sample {
                let err = LiveAudioError::SequentialAccessViolation {
                    offset,
                    expected: sample * bps,
                };
                error!("{err}");
                self.post_error(&err);
                return Err(err);
            }
        }

        let samples = length / bps;
        let mut data = vec![0u8; length as usize];
        match ring.read(sample, &mut data) {
            Ok(_) => {}
            Err(LiveAudioError::Stopped) => {
                debug!("ring buffer stopped");
                return Err(LiveAudioError::WrongState("ring buffer stopped"));
            }
            Err(e) => return Err(e),
        }

        let next = sample + samples;
        {
            let mut next_sample = self.next_sample.lock();
            if self.flush_epoch.load(Ordering::SeqCst) != epoch {
                debug!(sample, "flushed during read, dropping buffer");
                return Err(LiveAudioError::WrongState("flushed during read"));
            }
            *next_sample = Some(next);
        }

        let rate = spec.format.rate;
        let timestamp = samples_to_time(sample, rate);
        let duration = samples_to_time(next, rate) - timestamp;

        Ok(AudioChunk {
            data,
            offset: sample,
            offset_end: next,
            timestamp,
            duration,
            format: spec.format,
        })
    }

    /// Report a non-recoverable error to status subscribers.
    pub fn post_error(&self, err: &LiveAudioError) {
        let _ = self.status_tx.send(SourceStatusEvent {
            status: SourceStatus::Error,
            detail: Some(err.to_string()),
        });
    }

    // ── internal helpers ────────────────────────────────────────────────────

    fn ring_handle(&self) -> Result<Arc<SegmentedRingBuffer>> {
        self.ring
            .read()
            .clone()
            .ok_or(LiveAudioError::WrongState("no ring buffer"))
    }

    fn set_status(&self, state: ElementState) {
        *self.state.lock() = state;
        let _ = self.status_tx.send(SourceStatusEvent {
            status: state.status(),
            detail: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{DriveMode, SimulatedConfig, SimulatedProvider};
    use crate::buffering::RingState;
    use crate::time::MSECOND;

    fn manual_source(backpressure: bool) -> (LiveAudioSource, SimulatedProvider) {
        let provider = SimulatedProvider::new(SimulatedConfig {
            drive: DriveMode::Manual,
            backpressure,
            ..SimulatedConfig::default()
        });
        let source = LiveAudioSource::new(SourceConfig::default(), Arc::new(provider.clone()))
            .expect("source");
        (source, provider)
    }

    fn playing_source(backpressure: bool) -> LiveAudioSource {
        let (source, _) = manual_source(backpressure);
        source.set_state(ElementState::Paused).expect("paused");
        source
            .set_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("caps");
        source.set_state(ElementState::Playing).expect("playing");
        source
    }

    #[test]
    fn config_rejects_zero_times() {
        let zero_latency = SourceConfig {
            latency_time_us: 0,
            ..SourceConfig::default()
        };
        assert!(matches!(
            zero_latency.validate(),
            Err(LiveAudioError::InvalidConfig(_))
        ));
        let (source, _) = manual_source(true);
        assert!(source.set_buffer_time(0).is_err());
        assert_eq!(source.config().buffer_time_us, 200_000);
    }

    #[test]
    fn config_deserializes_camel_case_with_defaults() {
        let config: SourceConfig =
            serde_json::from_str(r#"{"latencyTimeUs":20000}"#).expect("deserialize");
        assert_eq!(config.latency_time_us, 20_000);
        assert_eq!(config.buffer_time_us, 200_000);
    }

    #[test]
    fn create_before_negotiation_is_wrong_state() {
        let (source, _) = manual_source(true);
        assert!(matches!(
            source.create(None, None).unwrap_err(),
            LiveAudioError::WrongState(_)
        ));
        source.set_state(ElementState::Ready).expect("ready");
        let err = source.create(None, None).unwrap_err();
        assert!(matches!(err, LiveAudioError::WrongState(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn set_caps_reports_effective_geometry() {
        let (source, _) = manual_source(true);
        source.set_state(ElementState::Paused).expect("paused");
        let spec = source
            .set_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("caps");
        assert_eq!(spec.segment_size, 1764);
        assert_eq!(spec.segment_count, 20);
        assert_eq!(spec.latency_time, 10_000);
        assert_eq!(spec.buffer_time, 200_000);
        let ring = source.ring().expect("ring");
        assert!(ring.is_acquired());
        assert!(ring.is_active());
        assert_eq!(ring.spec().expect("spec").latency_time, 10_000);
    }

    #[test]
    fn set_caps_rejects_unfixed_caps() {
        let (source, _) = manual_source(true);
        source.set_state(ElementState::Paused).expect("paused");
        assert!(matches!(
            source.set_caps(&AudioCaps::raw_int()).unwrap_err(),
            LiveAudioError::NegotiationFailure(_)
        ));
    }

    #[test]
    fn fixated_caps_negotiate_default_format() {
        let (source, _) = manual_source(true);
        source.set_state(ElementState::Paused).expect("paused");
        let mut caps = AudioCaps::raw_int();
        source.fixate(&mut caps);
        let spec = source.set_caps(&caps).expect("caps");
        assert_eq!(spec.format.rate, 44_100);
        assert_eq!(spec.format.channels, 2);
        assert_eq!(spec.bytes_per_sample, 4);
    }

    #[test]
    fn create_returns_contiguous_segments() {
        let source = playing_source(false);
        let first = source.create(None, None).expect("first");
        let second = source.create(None, Some(0)).expect("second");

        assert_eq!(first.data.len(), 1764);
        assert_eq!(first.timestamp, 0);
        assert_eq!(first.duration, 10 * MSECOND);
        assert_eq!(second.timestamp, first.end_time());
        assert_eq!(second.offset, first.offset_end);
        assert_eq!(second.samples(), 441);
    }

    #[test]
    fn create_rounds_length_to_whole_frames() {
        let source = playing_source(false);
        let chunk = source.create(None, Some(1001)).expect("chunk");
        assert_eq!(chunk.data.len(), 1000);
        assert_eq!(chunk.samples(), 250);
    }

    #[test]
    fn create_enforces_sequential_offsets() {
        let source = playing_source(false);
        let mut status = source.subscribe_status();
        source.create(Some(0), None).expect("first");
        source.create(Some(1764), None).expect("sequential");

        let err = source.create(Some(0), None).unwrap_err();
        match err {
            LiveAudioError::SequentialAccessViolation { offset, expected } => {
                assert_eq!(offset, 0);
                assert_eq!(expected, 3528);
            }
            other => panic!("unexpected error: {other}"),
        }
        let event = status.try_recv().expect("error status");
        assert_eq!(event.status, SourceStatus::Error);
    }

    #[test]
    fn flush_stop_resyncs_at_zero() {
        let source = playing_source(false);
        source.create(None, None).expect("first");
        source.create(None, None).expect("second");

        assert!(source.handle_event(SourceEvent::FlushStart));
        assert!(source.handle_event(SourceEvent::FlushStop));

        let chunk = source.create(None, None).expect("after flush");
        assert_eq!(chunk.offset, 0);
        assert_eq!(chunk.timestamp, 0);
    }

    #[test]
    fn flush_start_pauses_ring() {
        let source = playing_source(false);
        source.create(None, None).expect("start via read");
        let ring = source.ring().expect("ring");
        assert_eq!(ring.state(), RingState::Started);
        source.handle_event(SourceEvent::FlushStart);
        assert_eq!(ring.state(), RingState::Paused);
    }

    #[test]
    fn clock_is_provided_only_while_acquired() {
        let (source, _) = manual_source(true);
        assert!(source.provide_clock().is_none());
        source.set_state(ElementState::Paused).expect("paused");
        assert!(source.provide_clock().is_none());
        source
            .set_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("caps");
        let clock = source.provide_clock().expect("clock");
        assert_eq!(clock.get_time(), Some(0));
        source.set_clock(Some(clock)).expect("own clock accepted");
        source.set_clock(None).expect("no clock accepted");
    }

    #[test]
    fn foreign_clock_is_rejected() {
        let (source, _) = manual_source(true);
        let foreign: Arc<dyn Clock> = Arc::new(SoftwareClock::new("foreign"));
        assert!(matches!(
            source.set_clock(Some(foreign)).unwrap_err(),
            LiveAudioError::ClockConflict
        ));
    }

    #[test]
    fn source_is_live_with_limited_pull() {
        let source = playing_source(false);
        assert!(source.is_live());
        assert!(source.check_get_range());
        let chunk = source.create(None, None).expect("chunk");
        assert_eq!(source.get_times(&chunk), (None, None));
    }
}
