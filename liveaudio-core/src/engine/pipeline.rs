//! Blocking pull loop: the streaming task that drives a live source.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Check running flag
//! 2. LiveAudioSource::create(None, length)   (blocks on the ring buffer)
//! 3. Ok  → ChunkEvent on the broadcast channel, AudioChunk downstream
//!    WrongState/Stopped → retry after a short sleep, or exit if stopping
//!    other error → post error status, exit
//! ```
//!
//! Runs on a dedicated OS thread; every wait inside `create` is woken by a
//! ring-buffer transition, so clearing `running` and then moving the source
//! out of the playing state always ends the loop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::buffering::AudioChunk;
use crate::engine::LiveAudioSource;
use crate::ipc::events::ChunkEvent;

/// Sleep between retries after a soft failure.
const DEFAULT_RETRY_SLEEP_MS: u64 = 5;

#[derive(Default)]
pub struct PullDiagnostics {
    pub pulls: AtomicUsize,
    pub bytes: AtomicUsize,
    pub wrong_state_retries: AtomicUsize,
    pub errors: AtomicUsize,
}

impl PullDiagnostics {
    pub fn reset(&self) {
        self.pulls.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.wrong_state_retries.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            pulls: self.pulls.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            wrong_state_retries: self.wrong_state_retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub pulls: usize,
    pub bytes: usize,
    pub wrong_state_retries: usize,
    pub errors: usize,
}

/// All context the pull loop needs, passed as one struct so the thread
/// closure stays tidy.
pub struct PullContext {
    pub source: Arc<LiveAudioSource>,
    pub running: Arc<AtomicBool>,
    /// Downstream consumer of produced buffers.
    pub chunk_tx: Sender<AudioChunk>,
    pub event_tx: broadcast::Sender<ChunkEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PullDiagnostics>,
    /// Bytes per pull; `None` reads one segment.
    pub length: Option<u32>,
    /// Stop after this many buffers.
    pub max_pulls: Option<u64>,
}

/// Run the pull loop until `ctx.running` becomes false, the downstream
/// channel closes, `max_pulls` is reached, or a fatal error occurs.
pub fn run(ctx: PullContext) {
    info!("pull loop started");
    let mut pulled = 0u64;

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }
        if ctx.max_pulls.is_some_and(|max| pulled >= max) {
            debug!(pulled, "pull limit reached");
            break;
        }

        // ── 1. Pull ───────────────────────────────────────────────────────
        match ctx.source.create(None, ctx.length) {
            Ok(chunk) => {
                pulled += 1;
                ctx.diagnostics.pulls.fetch_add(1, Ordering::Relaxed);
                ctx.diagnostics
                    .bytes
                    .fetch_add(chunk.data.len(), Ordering::Relaxed);

                // ── 2. Notify + hand downstream ───────────────────────────
                let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
                trace!(seq, offset = chunk.offset, timestamp_ns = chunk.timestamp, "buffer pulled");
                let _ = ctx.event_tx.send(ChunkEvent {
                    seq,
                    offset: chunk.offset,
                    offset_end: chunk.offset_end,
                    timestamp_ns: chunk.timestamp,
                    duration_ns: chunk.duration,
                    bytes: chunk.data.len(),
                });
                if ctx.chunk_tx.send(chunk).is_err() {
                    debug!("downstream closed, ending pull loop");
                    break;
                }
            }
            Err(e) if e.is_recoverable() => {
                if !ctx.running.load(Ordering::SeqCst) {
                    debug!("pull interrupted during shutdown: {e}");
                    break;
                }
                ctx.diagnostics
                    .wrong_state_retries
                    .fetch_add(1, Ordering::Relaxed);
                trace!("pull not possible yet: {e}");
                std::thread::sleep(Duration::from_millis(retry_sleep_ms()));
            }
            Err(e) => {
                ctx.diagnostics.errors.fetch_add(1, Ordering::Relaxed);
                error!("pull failed: {e}");
                ctx.source.post_error(&e);
                break;
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        pulls = snap.pulls,
        bytes = snap.bytes,
        wrong_state_retries = snap.wrong_state_retries,
        errors = snap.errors,
        "pull loop stopped, diagnostics"
    );
}

fn retry_sleep_ms() -> u64 {
    static RETRY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *RETRY_SLEEP_MS.get_or_init(|| {
        std::env::var("LIVEAUDIO_PULL_RETRY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 100))
            .unwrap_or(DEFAULT_RETRY_SLEEP_MS)
    })
}
