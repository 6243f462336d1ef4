// Immutable snapshot sessions and the index-by-time search.

use std::sync::Arc;

use crate::capture::ring::FrameRecord;
use crate::clock::{ticks_to_seconds, TICKS_PER_SECOND};
use crate::d3d11::readback::{self, FramePixels};
use crate::d3d11::GpuContext;
use crate::error::{CaptureError, ErrorKind, Result};

struct SessionFrame {
    record: Arc<FrameRecord>,
    timestamp: i64,
}

/// Immutable view of the ring at a single instant.
///
/// The session holds its own strong references to the frame records, so
/// later ring eviction never invalidates it. Frames are ordered newest
/// first; with an fps remap the user-visible sequence runs oldest to
/// newest at the requested apparent rate.
pub struct Session {
    gpu: Arc<GpuContext>,
    frames: Vec<SessionFrame>,
    user_to_raw: Vec<usize>,
    latest: i64,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        gpu: Arc<GpuContext>,
        frames: Vec<(Arc<FrameRecord>, i64)>,
        latest: i64,
        fps: Option<f64>,
        duration_seconds: Option<f64>,
    ) -> Self {
        let frames: Vec<SessionFrame> = frames
            .into_iter()
            .map(|(record, timestamp)| SessionFrame { record, timestamp })
            .collect();

        let timestamps: Vec<i64> = frames.iter().map(|frame| frame.timestamp).collect();
        let user_to_raw = match fps {
            Some(fps) if fps > 0.0 && !frames.is_empty() => {
                remap_user_to_raw(&timestamps, latest, fps, duration_seconds)
            }
            _ => (0..frames.len()).collect(),
        };

        Self {
            gpu,
            frames,
            user_to_raw,
            latest,
            closed: false,
        }
    }

    /// Number of user-visible frames.
    pub fn len(&self) -> usize {
        self.user_to_raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_to_raw.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Index of the frame whose age relative to the snapshot's latest
    /// timestamp is closest to `seconds_ago`, or `None` for an empty
    /// session. Ties resolve to the smaller index.
    pub fn get_index_by_time(&self, seconds_ago: f64) -> Option<usize> {
        let target = seconds_ago.max(0.0);
        let ages: Vec<f64> = self
            .user_to_raw
            .iter()
            .map(|&raw| self.age_seconds(raw))
            .collect();
        nearest_position(&ages, target)
    }

    /// Materialize the frame at `index` into CPU pixels.
    pub fn get_frame(&self, index: usize) -> Result<FramePixels> {
        if self.closed {
            return Err(CaptureError::new(ErrorKind::SessionClosed, "session is closed"));
        }
        if self.frames.is_empty() {
            return Err(CaptureError::new(
                ErrorKind::EmptyBuffer,
                "no frame was captured before the snapshot",
            ));
        }
        let raw = *self.user_to_raw.get(index).ok_or_else(|| {
            CaptureError::new(ErrorKind::OutOfRange, "frame index out of range")
                .with_context("index", format!("{index} (size {})", self.user_to_raw.len()))
        })?;

        readback::read_texture(&self.gpu, &self.frames[raw].record.texture)
    }

    /// Drop all frame references. Idempotent; subsequent `get_frame` calls
    /// fail with `SessionClosed`.
    pub fn close(&mut self) {
        self.frames.clear();
        self.user_to_raw.clear();
        self.closed = true;
    }

    fn age_seconds(&self, raw: usize) -> f64 {
        ticks_to_seconds(self.latest - self.frames[raw].timestamp)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the user→raw index map for an fps remap.
///
/// `timestamps` are the raw frames' publication ticks, newest first. The
/// user sequence has `round(user_duration · fps)` entries; entry `i`
/// targets the relative time `user_duration · (n − i − 1) / n`, so user
/// index 0 is the oldest remapped frame and `n − 1` the newest.
fn remap_user_to_raw(
    timestamps: &[i64],
    latest: i64,
    fps: f64,
    duration_seconds: Option<f64>,
) -> Vec<usize> {
    let ages: Vec<f64> = timestamps
        .iter()
        .map(|&timestamp| ticks_to_seconds(latest - timestamp))
        .collect();

    let oldest = ages.iter().copied().fold(f64::MIN, f64::max);
    let newest = ages.iter().copied().fold(f64::MAX, f64::min);
    let raw_duration = (oldest - newest).max(0.0);
    let user_duration = duration_seconds.unwrap_or(raw_duration);

    let count = (user_duration * fps).round() as usize;
    let mut map = Vec::with_capacity(count);
    for i in 0..count {
        let target = user_duration * (count - i - 1) as f64 / count as f64;
        map.push(nearest_raw_index(&ages, timestamps, target));
    }
    map
}

/// Raw index whose age is closest to `target`; ties go to the smaller
/// timestamp, the older frame.
fn nearest_raw_index(ages: &[f64], timestamps: &[i64], target: f64) -> usize {
    let mut best = 0;
    let mut best_error = f64::INFINITY;
    for (index, &age) in ages.iter().enumerate() {
        let error = (age - target).abs();
        let better =
            error < best_error || (error == best_error && timestamps[index] < timestamps[best]);
        if better {
            best = index;
            best_error = error;
        }
    }
    best
}

/// Position whose age is closest to `target`; the smallest index wins ties.
fn nearest_position(ages: &[f64], target: f64) -> Option<usize> {
    let mut best = None;
    let mut best_error = f64::INFINITY;
    for (index, &age) in ages.iter().enumerate() {
        let error = (age - target).abs();
        if error < best_error {
            best = Some(index);
            best_error = error;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = TICKS_PER_SECOND;

    /// Newest-first timestamps for frames at the given ages.
    fn timestamps_for_ages(latest: i64, ages: &[f64]) -> Vec<i64> {
        ages.iter()
            .map(|age| latest - (age * SEC as f64).round() as i64)
            .collect()
    }

    #[test]
    fn nearest_position_breaks_ties_toward_the_smaller_index() {
        // Ten frames at ages 0.0, 0.1, ..., 0.9. Target 0.25 sits exactly
        // between ages 0.2 and 0.3; the smaller index (age 0.2) wins.
        let ages: Vec<f64> = (0..10).map(|i| i as f64 * 0.1).collect();
        assert_eq!(nearest_position(&ages, 0.25), Some(2));
        assert_eq!(nearest_position(&ages, 0.31), Some(3));
        assert_eq!(nearest_position(&ages, 5.0), Some(9));
        assert_eq!(nearest_position(&[], 0.1), None);
    }

    #[test]
    fn remap_selects_uniform_targets_from_newest() {
        // Twelve raw frames uniformly spaced over 1.2 s, newest first.
        let latest = 100 * SEC;
        let ages: Vec<f64> = (0..12).map(|i| i as f64 * 0.1).collect();
        let timestamps = timestamps_for_ages(latest, &ages);

        // fps 5 over 1.0 s: five entries at relative times
        // 0.8, 0.6, 0.4, 0.2, 0.0 measured from the newest frame.
        let map = remap_user_to_raw(&timestamps, latest, 5.0, Some(1.0));
        assert_eq!(map, [8, 6, 4, 2, 0]);
    }

    #[test]
    fn remap_count_is_duration_times_fps() {
        let latest = 50 * SEC;
        let ages: Vec<f64> = (0..40).map(|i| i as f64 * 0.05).collect();
        let timestamps = timestamps_for_ages(latest, &ages);

        assert_eq!(remap_user_to_raw(&timestamps, latest, 5.0, Some(2.0)).len(), 10);
        assert_eq!(remap_user_to_raw(&timestamps, latest, 7.5, Some(2.0)).len(), 15);

        // Without an explicit duration the raw span (1.95 s) is used.
        assert_eq!(remap_user_to_raw(&timestamps, latest, 10.0, None).len(), 20);
    }

    #[test]
    fn remap_targets_decrease_strictly() {
        // The target times t_i = D(n-i-1)/n must strictly decrease in i;
        // with distinct raw ages that makes mapped ages non-increasing.
        let latest = 10 * SEC;
        let ages: Vec<f64> = (0..30).map(|i| i as f64 * 0.1).collect();
        let timestamps = timestamps_for_ages(latest, &ages);

        let map = remap_user_to_raw(&timestamps, latest, 10.0, Some(2.9));
        for pair in map.windows(2) {
            assert!(pair[0] >= pair[1], "raw indices must not move backward");
        }
        assert!(map.first() > map.last());
    }

    #[test]
    fn remap_ties_prefer_the_older_frame() {
        // Two frames at ages 0.0 and 0.2; target 0.1 is equidistant.
        let latest = 10 * SEC;
        let timestamps = timestamps_for_ages(latest, &[0.0, 0.2]);
        let ages = [0.0, 0.2];
        assert_eq!(nearest_raw_index(&ages, &timestamps, 0.1), 1);
    }

    #[test]
    fn remap_repeats_frames_when_fps_exceeds_capture_rate() {
        // Two raw frames over 1 s replayed at 4 fps: each raw frame is
        // reused for consecutive user slots.
        let latest = 10 * SEC;
        let timestamps = timestamps_for_ages(latest, &[0.0, 1.0]);
        let map = remap_user_to_raw(&timestamps, latest, 4.0, None);
        assert_eq!(map.len(), 4);
        assert_eq!(map, [1, 1, 0, 0]);
    }
}
