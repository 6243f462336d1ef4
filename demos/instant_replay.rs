// Record the primary monitor for a few seconds, then play the retained
// window back as a fixed-rate frame sequence.

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

    let options = CaptureOptions {
        buffer_seconds: 3.0,
        max_width: Some(1280),
        max_height: Some(720),
        ..Default::default()
    };
    let mut stream = replaycap::open_monitor(monitor.0 as isize, options)?;

    println!("recording for 3 s...");
    thread::sleep(Duration::from_secs(3));

    // Replay the last two seconds at an apparent 10 fps.
    let mut session = stream.create_session(Some(10.0), Some(2.0))?;
    println!("replay has {} frames", session.len());

    for index in 0..session.len() {
        let frame = session.get_frame(index)?;
        println!(
            "  frame {index}: {}x{}, {} bytes",
            frame.width,
            frame.height,
            frame.data.len()
        );
    }

    if let Some(index) = session.get_index_by_time(1.0) {
        println!("frame closest to one second ago: index {index}");
    }

    session.close();
    stream.close();
    Ok(())
}
