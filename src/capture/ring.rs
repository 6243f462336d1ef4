// Time- and memory-bounded rotating store of captured frames.
//
// One writer (the capture engine) shares the ring with snapshot readers
// under a read/write lock. Snapshot construction copies record references
// out under the read lock and never touches the ring again; readback runs
// entirely outside the lock.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;

use crate::clock::{ticks_to_seconds, TICKS_PER_SECOND};
use crate::error::{CaptureError, ErrorKind, Result};

/// One captured frame: the engine-owned GPU texture, its publication
/// timestamp and the content size at capture time.
///
/// Immutable after publication. Shared ownership: the texture lives as long
/// as any ring slot, session or in-flight readback still references the
/// record.
pub(crate) struct FrameRecord {
    pub texture: ID3D11Texture2D,
    pub timestamp: i64,
    pub width: u32,
    pub height: u32,
}

pub(crate) type FrameRing = Ring<Arc<FrameRecord>>;

/// Frames selected by [`Ring::snapshot_range`], newest first, plus the
/// pinned latest timestamp.
pub(crate) struct RingSnapshot<T> {
    pub frames: Vec<(T, i64)>,
    pub latest: i64,
}

struct RingState<T> {
    slots: Vec<Option<(T, i64)>>,
    head: usize,
    count: usize,
    latest: i64,
}

/// Fixed-capacity rotating buffer of timestamped records.
///
/// Generic over the record handle so rotation and selection are testable
/// without a GPU; the engine instantiates it with `Arc<FrameRecord>`.
pub(crate) struct Ring<T> {
    state: RwLock<RingState<T>>,
}

impl<T: Clone> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: RwLock::new(RingState {
                slots: vec![None; capacity],
                head: capacity - 1,
                count: 0,
                latest: 0,
            }),
        }
    }

    /// Publish a record: advance the head, overwrite the oldest slot.
    pub fn push(&self, record: T, timestamp: i64) -> Result<()> {
        let mut state = self.write()?;
        let capacity = state.slots.len();
        state.head = (state.head + 1) % capacity;
        let head = state.head;
        state.slots[head] = Some((record, timestamp));
        state.count = (state.count + 1).min(capacity);
        state.latest = timestamp;
        Ok(())
    }

    /// Copy out every occupied slot whose age relative to the latest frame
    /// is at most `max_age_seconds` (plus a one-tick tolerance), newest
    /// first. A non-empty ring always yields at least its most recent
    /// frame.
    pub fn snapshot_range(&self, max_age_seconds: f64) -> Result<RingSnapshot<T>> {
        let state = self.read()?;
        let capacity = state.slots.len();
        let tolerance = 1.0 / TICKS_PER_SECOND as f64;

        let mut frames = Vec::with_capacity(state.count);
        for offset in 0..state.count {
            let index = (state.head + capacity - offset) % capacity;
            let Some((record, timestamp)) = &state.slots[index] else {
                continue;
            };
            let age = ticks_to_seconds(state.latest - timestamp);
            if age > max_age_seconds + tolerance {
                continue;
            }
            frames.push((record.clone(), *timestamp));
        }

        if frames.is_empty() {
            if let Some((record, timestamp)) = &state.slots[state.head] {
                frames.push((record.clone(), *timestamp));
            }
        }

        Ok(RingSnapshot {
            frames,
            latest: state.latest,
        })
    }

    /// Record whose age relative to `now_ticks` is closest to
    /// `seconds_ago`. Age ties preserve ring order: the newer slot wins.
    pub fn nearest(&self, seconds_ago: f64, now_ticks: i64) -> Result<Option<(T, i64)>> {
        let state = self.read()?;
        let capacity = state.slots.len();
        let target = seconds_ago.max(0.0);

        let mut best: Option<(T, i64)> = None;
        let mut best_error = f64::INFINITY;
        for offset in 0..state.count {
            let index = (state.head + capacity - offset) % capacity;
            let Some((record, timestamp)) = &state.slots[index] else {
                continue;
            };
            let age = ticks_to_seconds(now_ticks - timestamp);
            let error = (age - target).abs();
            if error < best_error {
                best_error = error;
                best = Some((record.clone(), *timestamp));
            }
        }

        Ok(best)
    }

    /// Reallocate to `new_capacity`, dropping all held records.
    ///
    /// Called when the content size changes: retained frames would be
    /// geometrically inconsistent with new arrivals, and the per-frame byte
    /// budget has moved.
    pub fn resize(&self, new_capacity: usize) -> Result<()> {
        let mut state = self.write()?;
        let new_capacity = new_capacity.max(1);
        state.slots = vec![None; new_capacity];
        state.head = new_capacity - 1;
        state.count = 0;
        state.latest = 0;
        Ok(())
    }

    /// Drop every record without changing capacity.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        for slot in &mut state.slots {
            *slot = None;
        }
        state.head = state.slots.len() - 1;
        state.count = 0;
        state.latest = 0;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.count)
    }

    pub fn capacity(&self) -> Result<usize> {
        Ok(self.read()?.slots.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RingState<T>>> {
        self.state.read().map_err(|_| {
            CaptureError::new(ErrorKind::InternalInvariantViolated, "frame ring lock poisoned")
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RingState<T>>> {
        self.state.write().map_err(|_| {
            CaptureError::new(ErrorKind::InternalInvariantViolated, "frame ring lock poisoned")
        })
    }
}
