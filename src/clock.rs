// Process-wide monotonic clock backed by QueryPerformanceCounter.
//
// Frame timestamps use the 100 ns tick base of WGC's SystemRelativeTime, so
// host-side "now" readings and frame stamps live on one axis (both count
// from boot). QPC readings are rebased onto that axis here.

use std::sync::OnceLock;

use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};

use crate::error::{CaptureError, ErrorKind, Result};

/// Ticks per second of the shared timestamp base (100 ns units).
pub(crate) const TICKS_PER_SECOND: i64 = 10_000_000;

static QPC_FREQUENCY: OnceLock<i64> = OnceLock::new();

/// Counter frequency, queried once and cached for the process lifetime.
fn qpc_frequency() -> Result<i64> {
    if let Some(frequency) = QPC_FREQUENCY.get() {
        return Ok(*frequency);
    }

    let mut frequency = 0i64;
    // SAFETY: QueryPerformanceFrequency writes the frequency to the out-param.
    unsafe { QueryPerformanceFrequency(&mut frequency) }.map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::ClockUnavailable,
            "QueryPerformanceFrequency refused",
            e,
        )
    })?;
    if frequency <= 0 {
        return Err(CaptureError::new(
            ErrorKind::ClockUnavailable,
            "QueryPerformanceFrequency returned a non-positive frequency",
        ));
    }

    Ok(*QPC_FREQUENCY.get_or_init(|| frequency))
}

/// Current time in shared ticks.
pub(crate) fn now_ticks() -> Result<i64> {
    let frequency = qpc_frequency()?;

    let mut counter = 0i64;
    // SAFETY: QueryPerformanceCounter writes the counter to the out-param.
    unsafe { QueryPerformanceCounter(&mut counter) }.map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::ClockUnavailable,
            "QueryPerformanceCounter refused",
            e,
        )
    })?;

    Ok(rebase_ticks(counter, frequency, TICKS_PER_SECOND))
}

/// Convert a tick count between frequencies.
///
/// Whole seconds and the sub-second remainder are rebased separately: the
/// naive `value * to / from` overflows 64 bits for uptimes measured in days.
pub(crate) fn rebase_ticks(value: i64, from_frequency: i64, to_frequency: i64) -> i64 {
    if from_frequency == to_frequency {
        return value;
    }
    let whole_seconds = value / from_frequency;
    let remainder = value % from_frequency;
    whole_seconds * to_frequency + remainder * to_frequency / from_frequency
}

pub(crate) fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_identity_when_frequencies_match() {
        assert_eq!(rebase_ticks(12_345, 1000, 1000), 12_345);
    }

    #[test]
    fn rebase_scales_between_bases() {
        // 1.5 s at 1 kHz is 1.5 s at 10 MHz.
        assert_eq!(rebase_ticks(1500, 1000, TICKS_PER_SECOND), 15_000_000);
        // 2.5 s at 10 MHz down to 1 kHz.
        assert_eq!(rebase_ticks(25_000_000, TICKS_PER_SECOND, 1000), 2500);
    }

    #[test]
    fn rebase_survives_large_uptimes() {
        // ~30 days of uptime at a 10 MHz QPC: the naive product would
        // overflow i64, the split form must not.
        let thirty_days = 30 * 24 * 3600;
        let value = thirty_days * 10_000_000 + 7;
        let rebased = rebase_ticks(value, 10_000_000, TICKS_PER_SECOND);
        assert_eq!(rebased, value);

        let odd_frequency = 2_441_407; // not a divisor of the target base
        let value = thirty_days * odd_frequency + 1234;
        let rebased = rebase_ticks(value, odd_frequency, TICKS_PER_SECOND);
        let seconds = rebased as f64 / TICKS_PER_SECOND as f64;
        let expected = value as f64 / odd_frequency as f64;
        assert!((seconds - expected).abs() < 1e-6);
    }

    #[test]
    fn ticks_to_seconds_uses_shared_base() {
        assert!((ticks_to_seconds(TICKS_PER_SECOND) - 1.0).abs() < f64::EPSILON);
        assert!((ticks_to_seconds(TICKS_PER_SECOND / 2) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn now_is_monotonic() {
        let a = now_ticks().expect("clock available");
        let b = now_ticks().expect("clock available");
        assert!(b >= a);
    }
}
