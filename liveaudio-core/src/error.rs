use thiserror::Error;

/// All errors produced by liveaudio-core.
#[derive(Debug, Error)]
pub enum LiveAudioError {
    /// The ring buffer is not acquired (or not running) for this operation.
    /// Soft: the caller retries or abandons the current pull cycle.
    #[error("ring buffer in wrong state: {0}")]
    WrongState(&'static str),

    /// A blocking read/commit was interrupted by stop or flush.
    #[error("ring buffer stopped")]
    Stopped,

    #[error(
        "resource can only be operated on sequentially but offset {offset} was given \
         (expected byte offset {expected})"
    )]
    SequentialAccessViolation { offset: u64, expected: u64 },

    #[error("cannot operate with this clock")]
    ClockConflict,

    #[error("format negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("failed to open audio device: {0}")]
    DeviceOpenFailure(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LiveAudioError {
    /// `true` for conditions that a pull loop may race into during a
    /// concurrent stop/flush and should retry or end gracefully on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::WrongState(_) | Self::Stopped)
    }
}

pub type Result<T> = std::result::Result<T, LiveAudioError>;
