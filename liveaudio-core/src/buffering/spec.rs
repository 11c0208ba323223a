//! Ring-buffer format specification and caps negotiation.
//!
//! ## Negotiation flow
//!
//! ```text
//! AudioCaps (ranges/lists) ──fixate()──► AudioCaps (fixed)
//!                                             │
//!                              RingBufferSpec::parse_caps
//!                                             │
//!                          compute_segment_geometry (segsize/segtotal)
//!                                             │
//!                     backend acquire may adjust segment geometry
//!                                             │
//!                         update_times_from_geometry (effective µs)
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LiveAudioError, Result};
use crate::time::{scale, USEC_PER_SEC};

/// Default rate picked by [`AudioCaps::fixate`].
pub const DEFAULT_RATE: i32 = 44_100;
/// Default channel count picked by [`AudioCaps::fixate`].
pub const DEFAULT_CHANNELS: i32 = 2;
/// Default width and depth picked by [`AudioCaps::fixate`].
pub const DEFAULT_WIDTH: i32 = 16;

/// Ring buffers need at least two segments: one being produced, one being read.
const MIN_SEGMENT_COUNT: u32 = 2;

/// Byte-order codes as used in capability descriptions.
pub const LITTLE_ENDIAN: i32 = 1234;
pub const BIG_ENDIAN: i32 = 4321;

/// Sample encoding carried by a caps description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Linear PCM integers (`audio/x-raw-int`).
    RawInt,
    /// IEEE float (`audio/x-raw-float`).
    RawFloat,
    /// G.711 µ-law (`audio/x-mulaw`).
    MuLaw,
    /// G.711 A-law (`audio/x-alaw`).
    ALaw,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawInt => "audio/x-raw-int",
            Self::RawFloat => "audio/x-raw-float",
            Self::MuLaw => "audio/x-mulaw",
            Self::ALaw => "audio/x-alaw",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "audio/x-raw-int" => Some(Self::RawInt),
            "audio/x-raw-float" => Some(Self::RawFloat),
            "audio/x-mulaw" => Some(Self::MuLaw),
            "audio/x-alaw" => Some(Self::ALaw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    pub const fn code(self) -> i32 {
        match self {
            Self::Little => LITTLE_ENDIAN,
            Self::Big => BIG_ENDIAN,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            LITTLE_ENDIAN => Some(Self::Little),
            BIG_ENDIAN => Some(Self::Big),
            _ => None,
        }
    }
}

/// Constraint on a single integer caps field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapsValue {
    Fixed(i32),
    /// Inclusive range.
    Range { min: i32, max: i32 },
    /// Ordered list of preferences.
    List(Vec<i32>),
}

impl CapsValue {
    pub fn fixed(&self) -> Option<i32> {
        match self {
            Self::Fixed(v) => Some(*v),
            Self::Range { min, max } if min == max => Some(*min),
            Self::List(values) if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }

    /// Collapse to the allowed value nearest `target`. Earlier list entries
    /// win ties.
    pub fn fixate_nearest(&mut self, target: i32) {
        let chosen = match self {
            Self::Fixed(v) => *v,
            Self::Range { min, max } => target.clamp(*min, (*max).max(*min)),
            Self::List(values) => {
                let mut best: Option<i32> = None;
                for &v in values.iter() {
                    let better = match best {
                        None => true,
                        Some(b) => {
                            (i64::from(v) - i64::from(target)).abs()
                                < (i64::from(b) - i64::from(target)).abs()
                        }
                    };
                    if better {
                        best = Some(v);
                    }
                }
                match best {
                    Some(v) => v,
                    None => return,
                }
            }
        };
        *self = Self::Fixed(chosen);
    }
}

/// Generic capability description offered by a device or requested
/// downstream. Fields left `None` are absent from the description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioCaps {
    pub media: MediaType,
    pub rate: Option<CapsValue>,
    pub channels: Option<CapsValue>,
    pub width: Option<CapsValue>,
    pub depth: Option<CapsValue>,
    pub signed: Option<bool>,
    pub endianness: Option<CapsValue>,
}

impl AudioCaps {
    /// Unconstrained linear integer PCM.
    pub fn raw_int() -> Self {
        Self {
            media: MediaType::RawInt,
            rate: Some(CapsValue::Range {
                min: 1,
                max: i32::MAX,
            }),
            channels: Some(CapsValue::Range {
                min: 1,
                max: i32::MAX,
            }),
            width: Some(CapsValue::List(vec![8, 16, 24, 32])),
            depth: Some(CapsValue::Range { min: 1, max: 32 }),
            signed: None,
            endianness: Some(CapsValue::List(vec![LITTLE_ENDIAN, BIG_ENDIAN])),
        }
    }

    /// Fully fixed linear integer PCM in native byte order.
    pub fn fixed_raw_int(rate: u32, channels: u16, width: u16, depth: u16, signed: bool) -> Self {
        Self {
            media: MediaType::RawInt,
            rate: Some(CapsValue::Fixed(rate as i32)),
            channels: Some(CapsValue::Fixed(i32::from(channels))),
            width: Some(CapsValue::Fixed(i32::from(width))),
            depth: Some(CapsValue::Fixed(i32::from(depth))),
            signed: Some(signed),
            endianness: Some(CapsValue::Fixed(Endianness::native().code())),
        }
    }

    /// Fixed 32-bit float PCM in native byte order.
    pub fn fixed_raw_float(rate: u32, channels: u16) -> Self {
        Self {
            media: MediaType::RawFloat,
            rate: Some(CapsValue::Fixed(rate as i32)),
            channels: Some(CapsValue::Fixed(i32::from(channels))),
            width: Some(CapsValue::Fixed(32)),
            depth: None,
            signed: None,
            endianness: Some(CapsValue::Fixed(Endianness::native().code())),
        }
    }

    /// Fixed G.711 caps (`MuLaw` or `ALaw`).
    pub fn fixed_g711(media: MediaType, rate: u32, channels: u16) -> Self {
        Self {
            media,
            rate: Some(CapsValue::Fixed(rate as i32)),
            channels: Some(CapsValue::Fixed(i32::from(channels))),
            width: None,
            depth: None,
            signed: None,
            endianness: None,
        }
    }

    /// Resolve every remaining choice to the default live-source format:
    /// 44100 Hz, 2 channels, 16-bit signed, native byte order.
    pub fn fixate(&mut self) {
        if let Some(rate) = self.rate.as_mut() {
            rate.fixate_nearest(DEFAULT_RATE);
        }
        if let Some(channels) = self.channels.as_mut() {
            channels.fixate_nearest(DEFAULT_CHANNELS);
        }
        if let Some(depth) = self.depth.as_mut() {
            depth.fixate_nearest(DEFAULT_WIDTH);
        }
        if let Some(width) = self.width.as_mut() {
            width.fixate_nearest(DEFAULT_WIDTH);
        }
        if self.media == MediaType::RawInt {
            self.signed = Some(true);
        }
        if let Some(endianness) = self.endianness.as_mut() {
            endianness.fixate_nearest(Endianness::native().code());
        }
    }

    pub fn is_fixed(&self) -> bool {
        [
            &self.rate,
            &self.channels,
            &self.width,
            &self.depth,
            &self.endianness,
        ]
        .iter()
        .all(|field| field.as_ref().map_or(true, |v| v.fixed().is_some()))
    }
}

/// Negotiated sample format attached to every output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub media: MediaType,
    pub rate: u32,
    pub channels: u16,
    /// Container bits per sample.
    pub width: u16,
    /// Significant bits per sample.
    pub depth: u16,
    pub signed: bool,
    pub endianness: Endianness,
}

impl AudioFormat {
    /// Bytes for one sample of one channel.
    pub fn sample_width_bytes(&self) -> u32 {
        u32::from(self.width / 8)
    }

    /// Bytes for one frame (a sample across all channels).
    pub fn bytes_per_frame(&self) -> u32 {
        self.sample_width_bytes() * u32::from(self.channels)
    }

    /// Byte pattern of one silent frame.
    pub fn silence_frame(&self) -> Vec<u8> {
        let width = self.sample_width_bytes() as usize;
        let sample: Vec<u8> = match self.media {
            MediaType::MuLaw => vec![0xff; width],
            MediaType::ALaw => vec![0xd5; width],
            MediaType::RawFloat => vec![0; width],
            MediaType::RawInt if self.signed => vec![0; width],
            MediaType::RawInt => {
                // Unsigned zero level is the midpoint of the significant bits.
                let mid: u64 = 1u64 << (self.depth.clamp(1, 64) - 1);
                let mut bytes = mid.to_le_bytes()[..width.min(8)].to_vec();
                bytes.resize(width, 0);
                if self.endianness == Endianness::Big {
                    bytes.reverse();
                }
                bytes
            }
        };
        sample.repeat(usize::from(self.channels))
    }
}

/// Sample format plus segment geometry for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferSpec {
    pub format: AudioFormat,
    /// Bytes per frame, i.e. per sample across all channels.
    pub bytes_per_sample: u32,
    /// Requested/actual latency in µs: the duration of one segment.
    pub latency_time: u64,
    /// Requested/actual total buffer duration in µs.
    pub buffer_time: u64,
    pub segment_size: u32,
    pub segment_count: u32,
    /// Segments queued in the lower level device; defaults to `segment_count`.
    pub segment_latency: u32,
}

impl RingBufferSpec {
    /// Spec with the configured times and an unparsed (default) format.
    pub fn with_times(buffer_time: u64, latency_time: u64) -> Self {
        let format = AudioFormat {
            media: MediaType::RawInt,
            rate: 0,
            channels: 0,
            width: 0,
            depth: 0,
            signed: true,
            endianness: Endianness::native(),
        };
        Self {
            format,
            bytes_per_sample: 0,
            latency_time,
            buffer_time,
            segment_size: 0,
            segment_count: 0,
            segment_latency: 0,
        }
    }

    /// Populate the format fields from fixed caps.
    ///
    /// # Errors
    /// `NegotiationFailure` if a field is unfixed, missing or out of range.
    pub fn parse_caps(&mut self, caps: &AudioCaps) -> Result<()> {
        fn field(value: &Option<CapsValue>, name: &str) -> Result<i32> {
            value
                .as_ref()
                .and_then(CapsValue::fixed)
                .ok_or_else(|| LiveAudioError::NegotiationFailure(format!("{name} is not fixed")))
        }
        fn positive<T: TryFrom<i32>>(v: i32, name: &str) -> Result<T> {
            if v <= 0 {
                return Err(LiveAudioError::NegotiationFailure(format!(
                    "{name} must be positive, got {v}"
                )));
            }
            T::try_from(v)
                .map_err(|_| LiveAudioError::NegotiationFailure(format!("{name} out of range")))
        }

        let rate: u32 = positive(field(&caps.rate, "rate")?, "rate")?;
        let channels: u16 = positive(field(&caps.channels, "channels")?, "channels")?;

        let endianness = match &caps.endianness {
            Some(value) => {
                let code = value.fixed().ok_or_else(|| {
                    LiveAudioError::NegotiationFailure("endianness is not fixed".into())
                })?;
                Endianness::from_code(code).ok_or_else(|| {
                    LiveAudioError::NegotiationFailure(format!("unknown endianness {code}"))
                })?
            }
            None => Endianness::native(),
        };

        let (width, depth, signed) = match caps.media {
            MediaType::RawInt => {
                let width: u16 = positive(field(&caps.width, "width")?, "width")?;
                let depth: u16 = match &caps.depth {
                    Some(_) => positive(field(&caps.depth, "depth")?, "depth")?,
                    None => width,
                };
                if depth > width {
                    return Err(LiveAudioError::NegotiationFailure(format!(
                        "depth {depth} exceeds width {width}"
                    )));
                }
                let signed = caps.signed.ok_or_else(|| {
                    LiveAudioError::NegotiationFailure("signedness is not fixed".into())
                })?;
                (width, depth, signed)
            }
            MediaType::RawFloat => {
                let width: u16 = positive(field(&caps.width, "width")?, "width")?;
                if width != 32 && width != 64 {
                    return Err(LiveAudioError::NegotiationFailure(format!(
                        "unsupported float width {width}"
                    )));
                }
                (width, width, true)
            }
            MediaType::MuLaw | MediaType::ALaw => (8, 8, false),
        };

        if width % 8 != 0 {
            return Err(LiveAudioError::NegotiationFailure(format!(
                "width {width} is not a whole number of bytes"
            )));
        }

        self.format = AudioFormat {
            media: caps.media,
            rate,
            channels,
            width,
            depth,
            signed,
            endianness,
        };
        self.bytes_per_sample = self.format.bytes_per_frame();
        Ok(())
    }

    /// Suggested segment geometry from the configured times:
    /// `segment_size = rate * bps * latency_time`, `segment_count =
    /// buffer_time / latency_time`.
    pub fn compute_segment_geometry(&mut self) {
        let bps = u64::from(self.bytes_per_sample.max(1));
        let raw = scale(
            u64::from(self.format.rate) * bps,
            self.latency_time,
            USEC_PER_SEC,
        );
        let size = (raw - raw % bps).max(bps);
        self.segment_size = u32::try_from(size).unwrap_or(u32::MAX - (u32::MAX % bps as u32));
        let count = self.buffer_time / self.latency_time.max(1);
        self.segment_count = u32::try_from(count)
            .unwrap_or(u32::MAX)
            .max(MIN_SEGMENT_COUNT);
        self.segment_latency = self.segment_count;
    }

    /// Recompute the effective µs times from the (possibly device-adjusted)
    /// segment geometry.
    pub fn update_times_from_geometry(&mut self) {
        let bytes_per_sec = u64::from(self.format.rate) * u64::from(self.bytes_per_sample);
        if bytes_per_sec == 0 {
            return;
        }
        self.latency_time = scale(u64::from(self.segment_size), USEC_PER_SEC, bytes_per_sec);
        self.buffer_time = scale(
            u64::from(self.segment_count) * u64::from(self.segment_size),
            USEC_PER_SEC,
            bytes_per_sec,
        );
    }

    pub fn samples_per_segment(&self) -> u32 {
        if self.bytes_per_sample == 0 {
            0
        } else {
            self.segment_size / self.bytes_per_sample
        }
    }

    /// One full segment of silence.
    pub fn silence_segment(&self) -> Vec<u8> {
        let frame = self.format.silence_frame();
        if frame.is_empty() {
            return vec![0; self.segment_size as usize];
        }
        let mut seg = frame.repeat(self.samples_per_segment() as usize);
        seg.resize(self.segment_size as usize, frame[0]);
        seg
    }

    pub fn log_caps(&self) {
        debug!(
            media = self.format.media.as_str(),
            rate = self.format.rate,
            channels = self.format.channels,
            width = self.format.width,
            depth = self.format.depth,
            signed = self.format.signed,
            endianness = ?self.format.endianness,
            bytes_per_sample = self.bytes_per_sample,
            "spec caps"
        );
    }

    pub fn log_buffer(&self) {
        debug!(
            buffer_time_us = self.buffer_time,
            latency_time_us = self.latency_time,
            segment_size = self.segment_size,
            segment_count = self.segment_count,
            segment_latency = self.segment_latency,
            samples_per_segment = self.samples_per_segment(),
            "spec buffer geometry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_s16_spec(buffer_time: u64, latency_time: u64) -> RingBufferSpec {
        let mut spec = RingBufferSpec::with_times(buffer_time, latency_time);
        spec.parse_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("parse fixed caps");
        spec
    }

    #[test]
    fn fixate_picks_cd_quality_native_defaults() {
        let mut caps = AudioCaps::raw_int();
        assert!(!caps.is_fixed());
        caps.fixate();
        assert!(caps.is_fixed());
        assert_eq!(caps.rate, Some(CapsValue::Fixed(44_100)));
        assert_eq!(caps.channels, Some(CapsValue::Fixed(2)));
        assert_eq!(caps.width, Some(CapsValue::Fixed(16)));
        assert_eq!(caps.depth, Some(CapsValue::Fixed(16)));
        assert_eq!(caps.signed, Some(true));
        assert_eq!(
            caps.endianness,
            Some(CapsValue::Fixed(Endianness::native().code()))
        );
    }

    #[test]
    fn fixate_respects_device_ranges() {
        let mut caps = AudioCaps::raw_int();
        caps.rate = Some(CapsValue::Range {
            min: 8_000,
            max: 16_000,
        });
        caps.channels = Some(CapsValue::List(vec![1, 4]));
        caps.fixate();
        assert_eq!(caps.rate, Some(CapsValue::Fixed(16_000)));
        // 1 and 4 are not equidistant from 2; 1 is nearer.
        assert_eq!(caps.channels, Some(CapsValue::Fixed(1)));
    }

    #[test]
    fn parse_rejects_unfixed_caps() {
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        let err = spec.parse_caps(&AudioCaps::raw_int()).unwrap_err();
        assert!(matches!(err, LiveAudioError::NegotiationFailure(_)));
    }

    #[test]
    fn parse_rejects_depth_wider_than_width() {
        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        let err = spec
            .parse_caps(&AudioCaps::fixed_raw_int(48_000, 1, 16, 24, true))
            .unwrap_err();
        assert!(matches!(err, LiveAudioError::NegotiationFailure(_)));
    }

    #[test]
    fn geometry_matches_rate_and_latency() {
        let mut spec = stereo_s16_spec(200_000, 10_000);
        assert_eq!(spec.bytes_per_sample, 4);
        spec.compute_segment_geometry();
        assert_eq!(spec.segment_size, 1764);
        assert_eq!(spec.segment_count, 20);
        assert_eq!(spec.segment_latency, 20);
        assert_eq!(spec.samples_per_segment(), 441);
    }

    #[test]
    fn geometry_rounds_segment_to_whole_frames() {
        let mut spec = RingBufferSpec::with_times(100_000, 1_000);
        spec.parse_caps(&AudioCaps::fixed_raw_int(22_050, 2, 16, 16, true))
            .expect("parse");
        spec.compute_segment_geometry();
        // 22050 * 4 * 0.001 = 88.2 bytes -> 88
        assert_eq!(spec.segment_size, 88);
        assert_eq!(spec.segment_size % spec.bytes_per_sample, 0);
    }

    #[test]
    fn geometry_keeps_at_least_two_segments() {
        let mut spec = stereo_s16_spec(5_000, 10_000);
        spec.compute_segment_geometry();
        assert_eq!(spec.segment_count, 2);
    }

    #[test]
    fn effective_times_follow_granted_geometry() {
        let mut spec = stereo_s16_spec(200_000, 10_000);
        spec.compute_segment_geometry();
        spec.segment_count = 10;
        spec.segment_size = 3528;
        spec.update_times_from_geometry();
        assert_eq!(spec.latency_time, 20_000);
        assert_eq!(spec.buffer_time, 200_000);
    }

    #[test]
    fn silence_patterns_per_encoding() {
        let unsigned_le = AudioFormat {
            media: MediaType::RawInt,
            rate: 8_000,
            channels: 1,
            width: 16,
            depth: 16,
            signed: false,
            endianness: Endianness::Little,
        };
        assert_eq!(unsigned_le.silence_frame(), vec![0x00, 0x80]);

        let unsigned_be = AudioFormat {
            endianness: Endianness::Big,
            ..unsigned_le
        };
        assert_eq!(unsigned_be.silence_frame(), vec![0x80, 0x00]);

        let u8_stereo = AudioFormat {
            width: 8,
            depth: 8,
            channels: 2,
            ..unsigned_le
        };
        assert_eq!(u8_stereo.silence_frame(), vec![0x80, 0x80]);

        let mut spec = RingBufferSpec::with_times(200_000, 10_000);
        spec.parse_caps(&AudioCaps::fixed_g711(MediaType::MuLaw, 8_000, 1))
            .expect("parse mulaw");
        assert_eq!(spec.format.silence_frame(), vec![0xff]);
        spec.parse_caps(&AudioCaps::fixed_g711(MediaType::ALaw, 8_000, 1))
            .expect("parse alaw");
        assert_eq!(spec.format.silence_frame(), vec![0xd5]);
    }

    #[test]
    fn silence_segment_spans_whole_segment() {
        let mut spec = stereo_s16_spec(200_000, 10_000);
        spec.compute_segment_geometry();
        let seg = spec.silence_segment();
        assert_eq!(seg.len(), 1764);
        assert!(seg.iter().all(|&b| b == 0));
    }
}
