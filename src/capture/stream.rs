// Stream facade: the host-facing handle binding one engine to its ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::engine::{self, RawTarget, StopEvent, StreamShared};
use super::options::CaptureOptions;
use super::ring::FrameRing;
use super::session::Session;
use crate::clock;
use crate::d3d11::readback::{self, FramePixels};
use crate::d3d11::{self, GpuContext};
use crate::error::{CaptureError, ErrorChannel, ErrorKind, Result};

/// Live capture stream over one window or monitor.
///
/// A dedicated engine worker publishes frames into a bounded ring;
/// [`Stream::create_session`] freezes the ring's current contents into an
/// immutable [`Session`]. Methods may be called from any thread. `close`
/// is idempotent and also runs on drop.
pub struct Stream {
    gpu: Arc<GpuContext>,
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
    closed: AtomicBool,
    buffer_seconds: f64,
}

/// Open a capture stream over a window handle.
pub fn open_window(hwnd: isize, options: CaptureOptions) -> Result<Stream> {
    Stream::open(RawTarget::Window(hwnd), options)
}

/// Open a capture stream over a monitor handle.
pub fn open_monitor(hmonitor: isize, options: CaptureOptions) -> Result<Stream> {
    Stream::open(RawTarget::Monitor(hmonitor), options)
}

impl Stream {
    fn open(target: RawTarget, options: CaptureOptions) -> Result<Self> {
        if target.handle_value() == 0 {
            return Err(CaptureError::new(
                ErrorKind::TargetInvalid,
                "target handle must not be null",
            ));
        }

        let gpu = d3d11::acquire()?;
        let shared = Arc::new(StreamShared {
            // Sized properly by the engine once the content size is known.
            ring: FrameRing::new(1),
            errors: ErrorChannel::new(),
            stop: StopEvent::new()?,
        });

        let buffer_seconds = options.buffer_seconds.max(0.1);
        let worker = engine::spawn(Arc::clone(&gpu), Arc::clone(&shared), target, options)?;

        Ok(Self {
            gpu,
            shared,
            worker: Some(worker),
            closed: AtomicBool::new(false),
            buffer_seconds,
        })
    }

    /// Freeze the ring into an immutable [`Session`].
    ///
    /// `fps` resamples the user-visible sequence to that apparent rate;
    /// `duration_seconds` caps how far back the session reaches (defaulting
    /// to the stream's full retention window).
    pub fn create_session(
        &self,
        fps: Option<f64>,
        duration_seconds: Option<f64>,
    ) -> Result<Session> {
        self.ensure_open()?;

        let max_age = duration_seconds
            .unwrap_or(f64::MAX)
            .max(0.0)
            .min(self.buffer_seconds);
        let snapshot = self.shared.ring.snapshot_range(max_age)?;

        Ok(Session::new(
            Arc::clone(&self.gpu),
            snapshot.frames,
            snapshot.latest,
            fps,
            duration_seconds,
        ))
    }

    /// Read back the single frame closest to `seconds_ago` without building
    /// a session. Returns `None` while the ring is still empty.
    pub fn get_frame_by_time(&self, seconds_ago: f64) -> Result<Option<FramePixels>> {
        self.ensure_open()?;

        let now = clock::now_ticks()?;
        let Some((record, _)) = self.shared.ring.nearest(seconds_ago, now)? else {
            return Ok(None);
        };

        // The ring lock is already released; the record reference keeps the
        // texture alive across the readback.
        readback::read_texture(&self.gpu, &record.texture).map(Some)
    }

    /// Stop the engine, join the worker and drop the ring contents.
    /// Idempotent; never raises.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.shared.stop.signal();
        if worker.join().is_err() {
            log::warn!("engine worker panicked during shutdown");
        }
        if let Err(e) = self.shared.ring.clear() {
            log::warn!("failed to clear the ring at close: {e}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Entry contract for every host-facing call: closed check first, then
    /// drain the engine error channel. A drained engine error latches the
    /// stream closed before it propagates.
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CaptureError::new(ErrorKind::StreamClosed, "stream is closed"));
        }
        if let Err(error) = self.shared.errors.throw_out() {
            self.closed.store(true, Ordering::Relaxed);
            return Err(error);
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
