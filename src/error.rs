// Structured errors and the cross-thread error channel.
//
// Engine failures happen on the capture worker, where unwinding into COM
// dispatch is not an option. They are packaged as `CaptureError` values and
// parked in an `ErrorChannel`; host threads drain the channel at operation
// entry.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Failure categories surfaced by the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("graphics capture is unavailable on this platform")]
    PlatformUnsupported,
    #[error("capture target was refused")]
    TargetInvalid,
    #[error("Direct3D initialization failed")]
    GpuInitFailed,
    #[error("staging texture allocation failed")]
    StagingAllocFailed,
    #[error("mapping the staging texture failed")]
    MapFailed,
    #[error("stream is closed")]
    StreamClosed,
    #[error("session is closed")]
    SessionClosed,
    #[error("frame index out of range")]
    OutOfRange,
    #[error("no frame has been captured yet")]
    EmptyBuffer,
    #[error("monotonic clock is unavailable")]
    ClockUnavailable,
    #[error("internal invariant violated")]
    InternalInvariantViolated,
}

/// Structured capture error.
///
/// Carries a description, the source location that detected the failure, an
/// optional typed key/value context (e.g. `HRESULT` with the formatted
/// code) and a stack trace captured at construction. Trace capture honours
/// `RUST_BACKTRACE`.
#[derive(Debug)]
pub struct CaptureError {
    kind: ErrorKind,
    description: String,
    file: &'static str,
    line: u32,
    context: Option<(String, String)>,
    backtrace: Backtrace,
}

impl CaptureError {
    #[track_caller]
    pub(crate) fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            kind,
            description: description.into(),
            file: location.file(),
            line: location.line(),
            context: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context = Some((key.into(), value.into()));
        self
    }

    /// Wrap a `windows` API error, attaching its HRESULT as context.
    #[track_caller]
    pub(crate) fn from_win32(
        kind: ErrorKind,
        description: impl Into<String>,
        source: windows::core::Error,
    ) -> Self {
        let formatted = format!(
            "{:#010X}: {}",
            source.code().0 as u32,
            source.message().trim_end()
        );
        Self::new(kind, description).with_context("HRESULT", formatted)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Source file and line that detected the failure.
    pub fn location(&self) -> (&'static str, u32) {
        (self.file, self.line)
    }

    pub fn context(&self) -> Option<(&str, &str)> {
        self.context
            .as_ref()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.kind)?;
        if let Some((key, value)) = &self.context {
            write!(f, " [{key}={value}]")?;
        }
        write!(f, " at {}:{}", self.file, self.line)
    }
}

impl std::error::Error for CaptureError {}

/// Single-slot channel carrying the first engine error across the worker
/// thread boundary.
pub(crate) struct ErrorChannel {
    slot: Mutex<Option<CaptureError>>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Park an error. The earliest error is assumed to be the root cause;
    /// later arrivals are logged and discarded.
    pub fn throw_in(&self, error: CaptureError) {
        // Keep delivering across a poisoned lock: the channel is the one
        // path that must stay usable while something else is unwinding.
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(first) => {
                log::warn!("error channel already holds `{first}`; discarding `{error}`");
            }
            None => *slot = Some(error),
        }
    }

    /// Drain the channel, re-raising the pending error on the caller's
    /// stack, or return cleanly if the channel is empty.
    pub fn throw_out(&self) -> Result<()> {
        let pending = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for ErrorChannel {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(error) = slot.take() {
            log::warn!("dropping error channel with pending error: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_keeps_only_the_first_error() {
        let channel = ErrorChannel::new();
        channel.throw_in(CaptureError::new(ErrorKind::MapFailed, "first"));
        channel.throw_in(CaptureError::new(ErrorKind::OutOfRange, "second"));

        let surfaced = channel.throw_out().unwrap_err();
        assert_eq!(surfaced.kind(), ErrorKind::MapFailed);
        assert_eq!(surfaced.description(), "first");

        // Exactly one throw_out surfaces anything.
        assert!(channel.throw_out().is_ok());
        assert!(!channel.has_pending());
    }

    #[test]
    fn empty_channel_drains_cleanly() {
        let channel = ErrorChannel::new();
        assert!(channel.throw_out().is_ok());
    }

    #[test]
    fn display_carries_description_kind_and_context() {
        let error = CaptureError::new(ErrorKind::StagingAllocFailed, "no staging memory")
            .with_context("HRESULT", "0x8007000E: out of memory");
        let text = error.to_string();
        assert!(text.contains("no staging memory"));
        assert!(text.contains("staging texture allocation failed"));
        assert!(text.contains("HRESULT=0x8007000E"));
        assert!(text.contains("error.rs:"));
    }

    #[test]
    fn location_points_at_the_construction_site() {
        let error = CaptureError::new(ErrorKind::EmptyBuffer, "empty");
        let (file, line) = error.location();
        assert!(file.ends_with("error.rs"));
        assert!(line > 0);
    }
}
