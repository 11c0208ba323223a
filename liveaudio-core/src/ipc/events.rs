//! Event types emitted over broadcast channels.
//!
//! | Event | Sender |
//! |-------|--------|
//! | `ChunkEvent` | pull loop, one per buffer handed downstream |
//! | `SourceStatusEvent` | `LiveAudioSource`, on every state change or error |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chunk events
// ---------------------------------------------------------------------------

/// Summary of one pulled buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Absolute sample index of the first frame.
    pub offset: u64,
    /// Absolute sample index one past the last frame.
    pub offset_end: u64,
    pub timestamp_ns: u64,
    pub duration_ns: u64,
    /// Payload size in bytes.
    pub bytes: usize,
}

// ---------------------------------------------------------------------------
// Source status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatusEvent {
    pub status: SourceStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle state of a live source as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// No device handle.
    Null,
    /// Device open, no format negotiated.
    Ready,
    /// Format may be negotiated; data does not flow.
    Paused,
    /// The ring buffer may start and data flows.
    Playing,
    /// A non-recoverable error was posted.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_event_serializes_with_camel_case_fields() {
        let event = ChunkEvent {
            seq: 4,
            offset: 441,
            offset_end: 882,
            timestamp_ns: 10_000_000,
            duration_ns: 10_000_000,
            bytes: 1764,
        };

        let json = serde_json::to_value(&event).expect("serialize chunk event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["offsetEnd"], 882);
        assert_eq!(json["timestampNs"], 10_000_000);
        assert_eq!(json["durationNs"], 10_000_000);
        assert_eq!(json["bytes"], 1764);

        let round_trip: ChunkEvent =
            serde_json::from_value(json).expect("deserialize chunk event");
        assert_eq!(round_trip.offset, 441);
    }

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SourceStatusEvent {
            status: SourceStatus::Playing,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "playing");
        assert!(json["detail"].is_null());

        let round_trip: SourceStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, SourceStatus::Playing);
    }

    #[test]
    fn source_status_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<SourceStatus>(r#""Ready""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }
}
