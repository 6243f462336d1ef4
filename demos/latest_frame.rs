// Grab the most recent frame from the primary monitor and report its size.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use windows::Win32::Foundation::POINT;
use windows::Win32::Graphics::Gdi::{MonitorFromPoint, MONITOR_DEFAULTTOPRIMARY};

use replaycap::CaptureOptions;

fn main() -> Result<()> {
    env_logger::init();

    // SAFETY: with MONITOR_DEFAULTTOPRIMARY this always yields a monitor.
    let monitor =
        unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) };

    let mut stream = replaycap::open_monitor(monitor.0 as isize, CaptureOptions::default())?;

    // Give the engine a moment to publish its first frames.
    thread::sleep(Duration::from_millis(500));

    match stream.get_frame_by_time(0.0)? {
        Some(frame) => println!(
            "latest frame: {}x{}, {} bytes (BGR)",
            frame.width,
            frame.height,
            frame.data.len()
        ),
        None => println!("no frame arrived yet"),
    }

    stream.close();
    Ok(())
}
