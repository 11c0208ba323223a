//! In-process capture backend generating a test tone.
//!
//! In [`DriveMode::Timer`] a driver thread fills one segment per latency
//! period while the ring buffer is active. In [`DriveMode::Manual`] nothing
//! runs on its own and callers push data through
//! [`SegmentedRingBuffer::io`](crate::buffering::SegmentedRingBuffer::io).
//!
//! Every hook appends to a shared [`CallLog`] so lifecycle ordering can be
//! asserted.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DeviceBackend, DeviceProvider};
use crate::buffering::{AudioFormat, Endianness, MediaType, RingBufferSpec, SegmentIo};
use crate::error::{LiveAudioError, Result};
use crate::time::samples_to_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Timer,
    Manual,
}

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub name: String,
    pub drive: DriveMode,
    pub tone_hz: f32,
    /// Peak level in [0.0, 1.0]; 0 produces digital silence.
    pub amplitude: f32,
    pub backpressure: bool,
    pub fail_open: bool,
    pub fail_start: bool,
    pub fail_release: bool,
    pub reject_acquire: bool,
    pub granted_segment_count: Option<u32>,
    pub granted_segment_size: Option<u32>,
    /// Reported by `delay()`.
    pub queued_segments: u32,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            name: "simulated".into(),
            drive: DriveMode::Timer,
            tone_hz: 440.0,
            amplitude: 0.25,
            backpressure: true,
            fail_open: false,
            fail_start: false,
            fail_release: false,
            reject_acquire: false,
            granted_segment_count: None,
            granted_segment_size: None,
            queued_segments: 0,
        }
    }
}

/// Ordered record of backend hook invocations.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn push(&self, call: &'static str) {
        self.0.lock().push(call);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

struct Driver {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SimulatedDevice {
    config: SimulatedConfig,
    io: Option<SegmentIo>,
    spec: Option<RingBufferSpec>,
    log: CallLog,
    driver: Option<Driver>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedConfig) -> Self {
        Self::with_log(config, CallLog::default())
    }

    pub fn with_log(config: SimulatedConfig, log: CallLog) -> Self {
        Self {
            config,
            io: None,
            spec: None,
            log,
            driver: None,
        }
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn spawn_driver(&mut self) -> Result<()> {
        let io = self
            .io
            .clone()
            .ok_or(LiveAudioError::WrongState("backend not bound to a ring buffer"))?;
        let spec = self
            .spec
            .clone()
            .ok_or(LiveAudioError::WrongState("backend not acquired"))?;
        let period = Duration::from_nanos(samples_to_time(
            u64::from(spec.samples_per_segment()),
            spec.format.rate,
        ));
        let mut tone = ToneGenerator::new(spec.format, self.config.tone_hz, self.config.amplitude);
        let segment_frames = spec.samples_per_segment() as usize;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name(format!("{}-driver", self.config.name))
            .spawn(move || {
                debug!(period_us = period.as_micros() as u64, "simulated driver running");
                let mut segment = Vec::with_capacity(segment_frames * spec.bytes_per_sample as usize);
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !io.is_started() {
                                continue;
                            }
                            segment.clear();
                            tone.render(segment_frames, &mut segment);
                            io.fill(&segment);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("simulated driver exiting");
            })?;

        self.driver = Some(Driver { stop_tx, handle });
        Ok(())
    }

    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.stop_tx.send(());
            if driver.handle.join().is_err() {
                warn!("simulated driver thread panicked");
            }
        }
    }
}

impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn bind(&mut self, io: SegmentIo) {
        self.io = Some(io);
    }

    fn open_device(&mut self) -> Result<()> {
        self.log.push("open");
        if self.config.fail_open {
            return Err(LiveAudioError::DeviceOpenFailure(format!(
                "{} refused to open",
                self.config.name
            )));
        }
        info!(device = self.config.name.as_str(), "simulated device opened");
        Ok(())
    }

    fn close_device(&mut self) -> Result<()> {
        self.log.push("close");
        Ok(())
    }

    fn acquire(&mut self, spec: &mut RingBufferSpec) -> Result<()> {
        self.log.push("acquire");
        if self.config.reject_acquire {
            return Err(LiveAudioError::NegotiationFailure(format!(
                "{} rejected {} Hz x {}",
                self.config.name, spec.format.rate, spec.format.channels
            )));
        }
        if let Some(count) = self.config.granted_segment_count {
            spec.segment_count = count;
            spec.segment_latency = count;
        }
        if let Some(size) = self.config.granted_segment_size {
            spec.segment_size = size;
        }
        self.spec = Some(spec.clone());
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.log.push("release");
        if self.config.fail_release {
            return Err(LiveAudioError::Device(format!(
                "{} failed to release",
                self.config.name
            )));
        }
        self.stop_driver();
        self.spec = None;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.log.push("start");
        if self.config.fail_start {
            return Err(LiveAudioError::Device(format!(
                "{} failed to start",
                self.config.name
            )));
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.log.push("pause");
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.log.push("resume");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.log.push("stop");
        Ok(())
    }

    fn delay(&self) -> u32 {
        self.config.queued_segments
    }

    fn activate(&mut self, active: bool) -> Result<()> {
        self.log.push(if active { "activate" } else { "deactivate" });
        match (active, self.config.drive) {
            (true, DriveMode::Timer) => self.spawn_driver(),
            (false, _) => {
                self.stop_driver();
                Ok(())
            }
            (true, DriveMode::Manual) => Ok(()),
        }
    }

    fn backpressure(&self) -> bool {
        self.config.backpressure
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

/// Creates a [`SimulatedDevice`] per ready-entry, all sharing one call log.
#[derive(Debug, Clone, Default)]
pub struct SimulatedProvider {
    pub config: SimulatedConfig,
    log: CallLog,
}

impl SimulatedProvider {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            log: CallLog::default(),
        }
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }
}

impl DeviceProvider for SimulatedProvider {
    fn create_backend(&self) -> Result<Box<dyn DeviceBackend>> {
        Ok(Box::new(SimulatedDevice::with_log(
            self.config.clone(),
            self.log.clone(),
        )))
    }
}

/// Sine generator encoding into the negotiated sample format.
struct ToneGenerator {
    format: AudioFormat,
    step: f32,
    phase: f32,
    amplitude: f32,
    silence: Vec<u8>,
}

impl ToneGenerator {
    fn new(format: AudioFormat, tone_hz: f32, amplitude: f32) -> Self {
        let step = if format.rate == 0 {
            0.0
        } else {
            TAU * tone_hz / format.rate as f32
        };
        Self {
            format,
            step,
            phase: 0.0,
            amplitude: amplitude.clamp(0.0, 1.0),
            silence: format.silence_frame(),
        }
    }

    fn render(&mut self, frames: usize, out: &mut Vec<u8>) {
        for _ in 0..frames {
            let value = self.phase.sin() * self.amplitude;
            self.phase = (self.phase + self.step) % TAU;
            let before = out.len();
            for _ in 0..self.format.channels {
                encode_sample(&self.format, value, out);
            }
            if out.len() == before {
                out.extend_from_slice(&self.silence);
            }
        }
    }
}

/// Append one channel sample. Companded formats are not synthesised and
/// append nothing; the caller substitutes silence.
fn encode_sample(format: &AudioFormat, value: f32, out: &mut Vec<u8>) {
    let width = usize::from(format.width / 8);
    let mut bytes = match format.media {
        MediaType::RawInt => {
            let depth = u32::from(format.depth.clamp(1, 64));
            let max = ((1i128 << (depth - 1)) - 1) as f64;
            let mut v = (f64::from(value) * max).round() as i128;
            if !format.signed {
                v += 1i128 << (depth - 1);
            }
            let mut le = (v as u128).to_le_bytes()[..width.min(16)].to_vec();
            le.resize(width, 0);
            le
        }
        MediaType::RawFloat if width == 8 => f64::from(value).to_le_bytes().to_vec(),
        MediaType::RawFloat => value.to_le_bytes().to_vec(),
        MediaType::MuLaw | MediaType::ALaw => return,
    };
    if format.endianness == Endianness::Big {
        bytes.reverse();
    }
    out.extend_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{AudioCaps, SegmentedRingBuffer};
    use approx::assert_abs_diff_eq;

    fn s16_stereo() -> AudioFormat {
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_raw_int(48_000, 2, 16, 16, true))
            .expect("parse");
        spec.format
    }

    #[test]
    fn tone_encodes_signed_16_bit_frames() {
        let format = s16_stereo();
        let mut tone = ToneGenerator::new(format, 1_000.0, 0.5);
        let mut out = Vec::new();
        tone.render(48, &mut out);
        assert_eq!(out.len(), 48 * 4);

        let first_peak = out
            .chunks(4)
            .map(|f| i16::from_ne_bytes([f[0], f[1]]))
            .max()
            .unwrap_or_default();
        assert_abs_diff_eq!(f64::from(first_peak) / 32767.0, 0.5, epsilon = 0.01);
        // Channels carry the same sample.
        assert!(out.chunks(4).all(|f| f[0..2] == f[2..4]));
    }

    #[test]
    fn zero_amplitude_is_silence_for_unsigned_formats() {
        let format = AudioFormat {
            signed: false,
            width: 8,
            depth: 8,
            channels: 1,
            ..s16_stereo()
        };
        let mut tone = ToneGenerator::new(format, 440.0, 0.0);
        let mut out = Vec::new();
        tone.render(10, &mut out);
        assert!(out.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn companded_formats_render_silence() {
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_g711(MediaType::MuLaw, 8_000, 1))
            .expect("parse");
        let mut tone = ToneGenerator::new(spec.format, 440.0, 1.0);
        let mut out = Vec::new();
        tone.render(4, &mut out);
        assert_eq!(out, vec![0xff; 4]);
    }

    #[test]
    fn hooks_are_logged_in_call_order() {
        let provider = SimulatedProvider::new(SimulatedConfig {
            drive: DriveMode::Manual,
            ..SimulatedConfig::default()
        });
        let ring = SegmentedRingBuffer::new(provider.create_backend().expect("backend"));
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("parse");
        spec.compute_segment_geometry();

        ring.open_device().expect("open");
        ring.acquire(&mut spec).expect("acquire");
        ring.activate(true).expect("activate");
        ring.set_flushing(false);
        ring.set_may_start(true);
        ring.start().expect("start");
        ring.release().expect("release");
        ring.close_device().expect("close");

        assert_eq!(
            provider.call_log().entries(),
            vec!["open", "acquire", "activate", "start", "stop", "deactivate", "release", "close"]
        );
    }

    #[test]
    fn granted_geometry_is_reported_back() {
        let device = SimulatedDevice::new(SimulatedConfig {
            drive: DriveMode::Manual,
            granted_segment_count: Some(8),
            granted_segment_size: Some(3528),
            ..SimulatedConfig::default()
        });
        let ring = SegmentedRingBuffer::new(Box::new(device));
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("parse");
        spec.compute_segment_geometry();
        ring.open_device().expect("open");
        ring.acquire(&mut spec).expect("acquire");
        assert_eq!(spec.segment_count, 8);
        assert_eq!(spec.segment_size, 3528);
        assert_eq!(spec.segment_latency, 8);
    }

    #[test]
    fn rejected_acquire_leaves_ring_unacquired() {
        let device = SimulatedDevice::new(SimulatedConfig {
            reject_acquire: true,
            ..SimulatedConfig::default()
        });
        let ring = SegmentedRingBuffer::new(Box::new(device));
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("parse");
        spec.compute_segment_geometry();
        ring.open_device().expect("open");
        assert!(matches!(
            ring.acquire(&mut spec).unwrap_err(),
            LiveAudioError::NegotiationFailure(_)
        ));
        assert!(!ring.is_acquired());
    }

    #[test]
    fn failed_start_leaves_ring_paused() {
        let device = SimulatedDevice::new(SimulatedConfig {
            drive: DriveMode::Manual,
            fail_start: true,
            ..SimulatedConfig::default()
        });
        let ring = SegmentedRingBuffer::new(Box::new(device));
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("parse");
        spec.compute_segment_geometry();
        ring.open_device().expect("open");
        ring.acquire(&mut spec).expect("acquire");
        ring.set_flushing(false);
        ring.set_may_start(true);
        assert!(matches!(ring.start().unwrap_err(), LiveAudioError::Device(_)));
        assert_eq!(ring.state(), crate::buffering::RingState::Paused);
    }
}
