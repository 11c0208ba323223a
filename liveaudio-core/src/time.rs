//! Clock time units and overflow-safe scaling.
//!
//! All timestamps in this crate are `u64` nanoseconds. Configuration times
//! (`latency_time`, `buffer_time`) are microseconds, matching the units
//! device APIs usually advertise.

/// A point in time or a duration, in nanoseconds.
pub type ClockTime = u64;

pub const SECOND: ClockTime = 1_000_000_000;
pub const MSECOND: ClockTime = 1_000_000;

/// Microseconds per second, for converting configured µs times.
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Compute `val * num / denom` rounding down, without intermediate overflow.
///
/// Saturates at `u64::MAX` when the result does not fit, and when `denom` is
/// zero.
pub fn scale(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let wide = u128::from(val) * u128::from(num) / u128::from(denom);
    u64::try_from(wide).unwrap_or(u64::MAX)
}

/// Convert an absolute sample index to clock time at `rate` Hz.
pub fn samples_to_time(samples: u64, rate: u32) -> ClockTime {
    scale(samples, SECOND, u64::from(rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_survives_products_beyond_u64() {
        // 2^40 samples * 1e9 overflows u64 but the quotient does not.
        let samples = 1u64 << 40;
        let t = scale(samples, SECOND, 48_000);
        assert_eq!(t, ((samples as u128) * 1_000_000_000 / 48_000) as u64);
    }

    #[test]
    fn scale_saturates_on_zero_denominator() {
        assert_eq!(scale(1, 1, 0), u64::MAX);
    }

    #[test]
    fn samples_to_time_rounds_down() {
        assert_eq!(samples_to_time(441, 44_100), 10 * MSECOND);
        assert_eq!(samples_to_time(1, 3), 333_333_333);
    }
}
