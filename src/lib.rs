// Rolling Windows Graphics Capture with instant-replay snapshots.
//
// A stream continuously records a window or monitor into a bounded,
// time-windowed ring of GPU textures. A session freezes that ring at one
// instant; frames are materialized into CPU pixel buffers on demand, by
// index or by relative time.

#![cfg(windows)]

pub mod capture;
pub mod d3d11;
pub mod error;

mod clock;

pub use capture::options::CaptureOptions;
pub use capture::session::Session;
pub use capture::stream::{open_monitor, open_window, Stream};
pub use d3d11::readback::FramePixels;
pub use error::{CaptureError, ErrorKind, Result};
