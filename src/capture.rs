// Capture core: engine worker, frame ring, snapshot sessions and the
// stream facade.

pub mod options;
pub mod session;
pub mod stream;

pub(crate) mod engine;
pub(crate) mod ring;

pub use options::CaptureOptions;
pub use session::Session;
pub use stream::{open_monitor, open_window, Stream};
