//! liveaudio host binary.
//!
//! Drives one [`LiveAudioSource`] through its lifecycle, pulls buffers on a
//! dedicated thread and prints one JSON [`ChunkEvent`] line per buffer.
//!
//! ```text
//! settings.json ─► AppSettings ─► DeviceProvider ─► LiveAudioSource
//!                                                        │ Null → Paused → set_caps → Playing
//!                                                        ▼
//!                     pull thread (pipeline::run) ─► chunk channel ─► level meter (this thread)
//!                                    │
//!                                    └─► ChunkEvent broadcast ─► stdout printer thread
//! ```

mod settings;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use liveaudio_core::audio::device::list_input_devices;
use liveaudio_core::buffering::{AudioChunk, CapsValue, MediaType};
use liveaudio_core::engine::pipeline::{self, PullContext, PullDiagnostics};
use liveaudio_core::{
    AudioCaps, DeviceProvider, ElementState, LiveAudioSource, SimulatedConfig, SimulatedProvider,
};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the chunk-event broadcast channel.
const EVENT_CAP: usize = 256;

/// Pull live audio and print one JSON line per buffer.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the user data directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Capture device by name; "simulated" selects the tone generator
    #[arg(long)]
    device: Option<String>,

    /// Number of buffers to pull; 0 runs until killed
    #[arg(long)]
    pulls: Option<u64>,

    /// Bytes per pull; defaults to one segment
    #[arg(long)]
    length: Option<u32>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,

    /// List capture devices as JSON and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("liveaudio=info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        for device in list_input_devices() {
            println!("{}", serde_json::to_string(&device)?);
        }
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    if let Some(device) = cli.device.clone() {
        app_settings.preferred_input_device = Some(device);
    }
    if let Some(pulls) = cli.pulls {
        app_settings.pulls = pulls;
    }
    app_settings.normalize();
    info!(
        settings_path = ?settings_path,
        device = ?app_settings.preferred_input_device,
        sample_rate = app_settings.sample_rate,
        channels = app_settings.channels,
        buffer_time_us = app_settings.source.buffer_time_us,
        latency_time_us = app_settings.source.latency_time_us,
        "settings loaded"
    );
    if cli.save {
        save_settings(&settings_path, &app_settings)
            .with_context(|| format!("failed to save settings to {}", settings_path.display()))?;
    }

    // ── Source setup ──────────────────────────────────────────────────────
    let provider = build_provider(&app_settings)?;
    let source = Arc::new(
        LiveAudioSource::new(app_settings.source.clone(), provider)
            .context("invalid source configuration")?,
    );
    let mut status_rx = source.subscribe_status();
    std::thread::Builder::new()
        .name("liveaudio-status".into())
        .spawn(move || {
            while let Ok(event) = status_rx.blocking_recv() {
                info!(status = ?event.status, detail = ?event.detail, "source status");
            }
        })
        .context("failed to spawn status thread")?;

    source
        .set_state(ElementState::Paused)
        .context("failed to open capture device")?;

    let mut caps = AudioCaps::raw_int();
    caps.rate = Some(CapsValue::Fixed(app_settings.sample_rate as i32));
    caps.channels = Some(CapsValue::Fixed(i32::from(app_settings.channels)));
    source.fixate(&mut caps);
    let spec = source.set_caps(&caps).context("format negotiation failed")?;
    info!(
        segment_size = spec.segment_size,
        segment_count = spec.segment_count,
        latency_us = spec.latency_time,
        buffer_us = spec.buffer_time,
        "ring buffer acquired"
    );

    source
        .set_state(ElementState::Playing)
        .context("failed to start source")?;

    // ── Pull loop ─────────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(PullDiagnostics::default());
    let (chunk_tx, chunk_rx) = crossbeam_channel::bounded::<AudioChunk>(spec.segment_count as usize);
    let (event_tx, mut event_rx) = broadcast::channel(EVENT_CAP);

    let printer = std::thread::Builder::new()
        .name("liveaudio-print".into())
        .spawn(move || loop {
            match event_rx.blocking_recv() {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("failed to encode chunk event: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("printer lagged by {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        })
        .context("failed to spawn printer thread")?;

    let ctx = PullContext {
        source: Arc::clone(&source),
        running: Arc::clone(&running),
        chunk_tx,
        event_tx,
        seq: Arc::new(AtomicU64::new(0)),
        diagnostics: Arc::clone(&diagnostics),
        length: cli.length,
        max_pulls: (app_settings.pulls > 0).then_some(app_settings.pulls),
    };
    let puller = std::thread::Builder::new()
        .name("liveaudio-pull".into())
        .spawn(move || pipeline::run(ctx))
        .context("failed to spawn pull thread")?;

    // Downstream consumer: the channel closes when the pull loop ends.
    for chunk in chunk_rx.iter() {
        if let Some(peak) = peak_level(&chunk) {
            debug!(offset = chunk.offset, peak = format!("{peak:.3}"), "level");
        }
    }

    running.store(false, Ordering::SeqCst);
    if puller.join().is_err() {
        warn!("pull thread panicked");
    }
    if printer.join().is_err() {
        warn!("printer thread panicked");
    }

    // ── Shutdown ──────────────────────────────────────────────────────────
    if let Some(ring) = source.ring() {
        if let Err(e) = ring.stop() {
            warn!("failed to stop ring buffer: {e}");
        }
    }
    source
        .set_state(ElementState::Null)
        .context("failed to close capture device")?;

    let snap = diagnostics.snapshot();
    info!(
        pulls = snap.pulls,
        bytes = snap.bytes,
        wrong_state_retries = snap.wrong_state_retries,
        errors = snap.errors,
        "liveaudio finished"
    );
    Ok(())
}

fn build_provider(settings: &AppSettings) -> Result<Arc<dyn DeviceProvider>> {
    if settings.wants_simulated() {
        info!("using simulated tone device");
        return Ok(Arc::new(SimulatedProvider::new(SimulatedConfig {
            tone_hz: settings.tone_hz,
            amplitude: settings.amplitude,
            ..SimulatedConfig::default()
        })));
    }

    #[cfg(feature = "audio-cpal")]
    {
        use liveaudio_core::{CpalConfig, CpalProvider};
        Ok(Arc::new(CpalProvider {
            config: CpalConfig {
                device_name: settings.preferred_input_device.clone(),
            },
        }))
    }

    #[cfg(not(feature = "audio-cpal"))]
    {
        anyhow::bail!(
            "device {:?} needs the `audio-cpal` feature",
            settings.preferred_input_device
        )
    }
}

/// Peak magnitude in [0, 1] for signed 16-bit native-endian chunks.
fn peak_level(chunk: &AudioChunk) -> Option<f32> {
    let f = &chunk.format;
    if f.media != MediaType::RawInt || f.width != 16 || !f.signed {
        return None;
    }
    let peak = chunk
        .data
        .chunks_exact(2)
        .map(|b| i16::from_ne_bytes([b[0], b[1]]).unsigned_abs())
        .max()
        .unwrap_or(0);
    Some(f32::from(peak) / f32::from(i16::MAX))
}
