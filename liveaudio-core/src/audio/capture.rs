//! Hardware capture backend via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a mutex or condvar, or perform I/O.
//! It therefore only copies sample bytes into an SPSC `ringbuf` producer,
//! whose `push_slice` is lock-free and allocation-free.
//!
//! A transfer thread drains that queue and hands whole segments to
//! [`SegmentIo::fill`].
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). The stream is therefore built, owned and dropped by the transfer
//! thread; `activate(true)` blocks until that thread reports the stream open.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use super::{DeviceBackend, DeviceProvider};
use crate::buffering::{
    AudioCaps, CapsValue, Endianness, MediaType, RingBufferSpec, SegmentIo,
};
use crate::error::{LiveAudioError, Result};

/// Bytes of slack in the callback queue, in segments.
const QUEUE_SEGMENTS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct CpalConfig {
    /// Preferred input device; `None` uses the host default.
    pub device_name: Option<String>,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct CpalDevice {
    config: CpalConfig,
    io: Option<SegmentIo>,
    /// Name of the device resolved at open.
    resolved: Option<String>,
    spec: Option<RingBufferSpec>,
    /// Callback gate: data is queued only while `true`.
    running: Arc<AtomicBool>,
    /// Bytes captured but not yet handed to the ring buffer.
    queued: Arc<AtomicUsize>,
    worker: Option<Worker>,
}

impl CpalDevice {
    pub fn new(config: CpalConfig) -> Self {
        Self {
            config,
            io: None,
            resolved: None,
            spec: None,
            running: Arc::new(AtomicBool::new(false)),
            queued: Arc::new(AtomicUsize::new(0)),
            worker: None,
        }
    }

    /// Capabilities of the opened device as generic caps: supported rate
    /// range and channel counts for its default sample format.
    pub fn device_caps(&self) -> Result<AudioCaps> {
        let device = find_device(self.resolved.as_deref())?;
        let default = device
            .default_input_config()
            .map_err(|e| LiveAudioError::Device(e.to_string()))?;
        let format = default.sample_format();

        let mut min_rate = u32::MAX;
        let mut max_rate = 0;
        let mut channels = Vec::new();
        let ranges = device
            .supported_input_configs()
            .map_err(|e| LiveAudioError::Device(e.to_string()))?;
        for range in ranges.filter(|r| r.sample_format() == format) {
            min_rate = min_rate.min(range.min_sample_rate().0);
            max_rate = max_rate.max(range.max_sample_rate().0);
            let ch = i32::from(range.channels());
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
        if channels.is_empty() {
            return Err(LiveAudioError::Device(format!(
                "no input configurations for {format:?}"
            )));
        }

        let mut caps = match format {
            SampleFormat::I16 => AudioCaps::fixed_raw_int(0, 1, 16, 16, true),
            SampleFormat::U8 => AudioCaps::fixed_raw_int(0, 1, 8, 8, false),
            SampleFormat::F32 => AudioCaps::fixed_raw_float(0, 1),
            other => {
                return Err(LiveAudioError::Device(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        };
        caps.rate = Some(CapsValue::Range {
            min: min_rate as i32,
            max: max_rate as i32,
        });
        caps.channels = Some(CapsValue::List(channels));
        Ok(caps)
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let io = self
            .io
            .clone()
            .ok_or(LiveAudioError::WrongState("backend not bound to a ring buffer"))?;
        let spec = self
            .spec
            .clone()
            .ok_or(LiveAudioError::WrongState("backend not acquired"))?;
        let device_name = self.resolved.clone();
        let running = Arc::clone(&self.running);
        let queued = Arc::clone(&self.queued);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        // Sync oneshot: the worker signals stream-open success/failure.
        let (open_tx, open_rx) = bounded::<Result<()>>(1);

        let handle = std::thread::Builder::new()
            .name("liveaudio-cpal".into())
            .spawn(move || {
                let segsize = spec.segment_size as usize;
                let (producer, mut consumer) = HeapRb::<u8>::new(segsize * QUEUE_SEGMENTS).split();

                // ── Open stream (must happen on THIS thread, Stream is !Send) ──
                let stream = match build_stream(device_name.as_deref(), &spec, producer, running) {
                    Ok(s) => {
                        let _ = open_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                let poll = Duration::from_micros((spec.latency_time / 4).max(1_000));
                let mut segment = vec![0u8; segsize];
                let mut filled = 0usize;
                loop {
                    match stop_rx.recv_timeout(poll) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    loop {
                        filled += consumer.pop_slice(&mut segment[filled..]);
                        if filled < segsize {
                            break;
                        }
                        io.fill(&segment);
                        filled = 0;
                    }
                    queued.store(consumer.occupied_len() + filled, Ordering::Relaxed);
                }

                // Stream drops here, releasing the device on this thread.
                drop(stream);
                debug!("cpal transfer thread exiting");
            })?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(Worker { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(LiveAudioError::Device(
                    "capture thread died before opening the stream".into(),
                ))
            }
        }
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.handle.join().is_err() {
                warn!("cpal transfer thread panicked");
            }
        }
        self.queued.store(0, Ordering::Relaxed);
    }
}

impl DeviceBackend for CpalDevice {
    fn name(&self) -> &str {
        self.resolved.as_deref().unwrap_or("cpal")
    }

    fn bind(&mut self, io: SegmentIo) {
        self.io = Some(io);
    }

    fn open_device(&mut self) -> Result<()> {
        let device = find_device(self.config.device_name.as_deref())
            .map_err(|e| LiveAudioError::DeviceOpenFailure(e.to_string()))?;
        let name = device.name().unwrap_or_default();
        info!(device = name.as_str(), "opening input device");
        self.resolved = Some(name);
        Ok(())
    }

    fn close_device(&mut self) -> Result<()> {
        self.resolved = None;
        Ok(())
    }

    fn acquire(&mut self, spec: &mut RingBufferSpec) -> Result<()> {
        let format = sample_format_for(spec)?;
        let device = find_device(self.resolved.as_deref())?;
        let supported = device
            .supported_input_configs()
            .map_err(|e| LiveAudioError::Device(e.to_string()))?
            .any(|r| {
                r.sample_format() == format
                    && r.channels() == spec.format.channels
                    && (r.min_sample_rate().0..=r.max_sample_rate().0).contains(&spec.format.rate)
            });
        if !supported {
            return Err(LiveAudioError::NegotiationFailure(format!(
                "device does not capture {format:?} at {} Hz x {}",
                spec.format.rate, spec.format.channels
            )));
        }
        info!(
            sample_rate = spec.format.rate,
            channels = spec.format.channels,
            "audio config selected"
        );
        self.spec = Some(spec.clone());
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.stop_worker();
        self.spec = None;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn delay(&self) -> u32 {
        let segsize = self.spec.as_ref().map_or(0, |s| s.segment_size as usize);
        if segsize == 0 {
            return 0;
        }
        (self.queued.load(Ordering::Relaxed) / segsize) as u32
    }

    fn activate(&mut self, active: bool) -> Result<()> {
        if active {
            self.spawn_worker()
        } else {
            self.stop_worker();
            Ok(())
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.stop_worker();
    }
}

/// Creates a [`CpalDevice`] per ready-entry.
#[derive(Debug, Clone, Default)]
pub struct CpalProvider {
    pub config: CpalConfig,
}

impl DeviceProvider for CpalProvider {
    fn create_backend(&self) -> Result<Box<dyn DeviceBackend>> {
        Ok(Box::new(CpalDevice::new(self.config.clone())))
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Preferred device by name, otherwise the host default, otherwise the first
/// available input.
fn find_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|device| {
                    device
                        .name()
                        .map(|name| name == preferred_name)
                        .unwrap_or(false)
                }) {
                    return Ok(device);
                }
                warn!("preferred input device '{}' not found, falling back", preferred_name);
            }
            Err(e) => {
                warn!("failed to list input devices while resolving preference: {e}");
            }
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| LiveAudioError::Device(e.to_string()))?;
    let fallback = devices
        .next()
        .ok_or_else(|| LiveAudioError::Device("no input device available".into()))?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

fn sample_format_for(spec: &RingBufferSpec) -> Result<SampleFormat> {
    let f = &spec.format;
    if f.endianness != Endianness::native() {
        return Err(LiveAudioError::NegotiationFailure(
            "cpal captures in native byte order only".into(),
        ));
    }
    match (f.media, f.width, f.depth, f.signed) {
        (MediaType::RawInt, 16, 16, true) => Ok(SampleFormat::I16),
        (MediaType::RawInt, 8, 8, false) => Ok(SampleFormat::U8),
        (MediaType::RawFloat, 32, _, _) => Ok(SampleFormat::F32),
        _ => Err(LiveAudioError::NegotiationFailure(format!(
            "no cpal sample format for {} width {} depth {}",
            f.media.as_str(),
            f.width,
            f.depth
        ))),
    }
}

/// Sample types whose native-endian bytes are queued verbatim.
trait NativeBytes: SizedSample + Send + 'static {
    fn push_bytes(self, producer: &mut HeapProd<u8>) -> usize;
}

impl NativeBytes for i16 {
    fn push_bytes(self, producer: &mut HeapProd<u8>) -> usize {
        producer.push_slice(&self.to_ne_bytes())
    }
}

impl NativeBytes for u8 {
    fn push_bytes(self, producer: &mut HeapProd<u8>) -> usize {
        producer.push_slice(&[self])
    }
}

impl NativeBytes for f32 {
    fn push_bytes(self, producer: &mut HeapProd<u8>) -> usize {
        producer.push_slice(&self.to_ne_bytes())
    }
}

fn build_stream(
    device_name: Option<&str>,
    spec: &RingBufferSpec,
    producer: HeapProd<u8>,
    running: Arc<AtomicBool>,
) -> Result<Stream> {
    let device = find_device(device_name)?;
    let config = StreamConfig {
        channels: spec.format.channels,
        sample_rate: SampleRate(spec.format.rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = match sample_format_for(spec)? {
        SampleFormat::I16 => input_stream::<i16>(&device, &config, producer, running),
        SampleFormat::U8 => input_stream::<u8>(&device, &config, producer, running),
        _ => input_stream::<f32>(&device, &config, producer, running),
    }?;
    stream
        .play()
        .map_err(|e| LiveAudioError::Device(e.to_string()))?;
    Ok(stream)
}

fn input_stream<T: NativeBytes>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<u8>,
    running: Arc<AtomicBool>,
) -> Result<Stream> {
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let mut dropped = 0usize;
                for &sample in data {
                    let want = std::mem::size_of::<T>();
                    let written = sample.push_bytes(&mut producer);
                    if written < want {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    warn!("capture queue full: dropped {dropped} samples");
                }
            },
            |err| error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| LiveAudioError::Device(e.to_string()))
}
