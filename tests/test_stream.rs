// Integration tests for the stream/session surface.
//
// Tests touching a live desktop are marked #[ignore]: they need an
// interactive session with a hardware GPU and on-screen activity. Run them
// locally with `cargo test -- --ignored`.

#![cfg(windows)]

use std::thread;
use std::time::Duration;

use windows::Win32::Foundation::POINT;
use windows::Win32::Graphics::Gdi::{MonitorFromPoint, MONITOR_DEFAULTTOPRIMARY};

use replaycap::{CaptureOptions, ErrorKind};

fn primary_monitor() -> isize {
    // SAFETY: with MONITOR_DEFAULTTOPRIMARY this always yields a monitor.
    let monitor = unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) };
    monitor.0 as isize
}

#[test]
fn null_window_handle_is_rejected() {
    let error = replaycap::open_window(0, CaptureOptions::default()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::TargetInvalid);
}

#[test]
fn null_monitor_handle_is_rejected() {
    let error = replaycap::open_monitor(0, CaptureOptions::default()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::TargetInvalid);
}

#[test]
#[ignore = "requires an interactive desktop with a hardware GPU"]
fn rolling_snapshot_envelope() {
    let options = CaptureOptions {
        buffer_seconds: 2.0,
        target_fps: 30,
        memory_budget_bytes: 512 * 1024 * 1024,
        ..Default::default()
    };
    let mut stream = replaycap::open_monitor(primary_monitor(), options).expect("open stream");

    thread::sleep(Duration::from_millis(1200));

    let session = stream.create_session(None, Some(2.0)).expect("session");
    assert!(!session.is_empty(), "no frames after 1.2 s of capture");
    // Capacity for 2 s at 30 fps is 60 slots; the session cannot exceed it.
    assert!(session.len() <= 60, "session larger than the ring capacity");

    // Newest-first ordering: the frame closest to "now" is index 0.
    assert_eq!(session.get_index_by_time(0.0), Some(0));

    let frame = session.get_frame(0).expect("readback");
    assert!(frame.width > 0 && frame.height > 0);
    assert_eq!(frame.data.len(), (frame.width * frame.height * 3) as usize);

    stream.close();
}

#[test]
#[ignore = "requires an interactive desktop with a hardware GPU"]
fn snapshots_survive_ring_rotation() {
    let options = CaptureOptions {
        buffer_seconds: 1.0,
        target_fps: 30,
        ..Default::default()
    };
    let mut stream = replaycap::open_monitor(primary_monitor(), options).expect("open stream");

    thread::sleep(Duration::from_millis(600));
    let session = stream.create_session(None, None).expect("session");
    assert!(!session.is_empty());
    let before = session.get_frame(0).expect("readback before rotation");

    // Keep capturing well past the retention window so the ring rotates
    // through every slot; the session must stay readable.
    thread::sleep(Duration::from_millis(1500));
    let after = session.get_frame(0).expect("readback after rotation");

    assert_eq!(before.width, after.width);
    assert_eq!(before.height, after.height);
    assert_eq!(before.data, after.data);

    stream.close();
}

#[test]
#[ignore = "requires an interactive desktop with a hardware GPU"]
fn fps_remap_sizes_the_replay() {
    let mut stream =
        replaycap::open_monitor(primary_monitor(), CaptureOptions::default()).expect("open stream");

    thread::sleep(Duration::from_millis(1200));

    let session = stream.create_session(Some(5.0), Some(1.0)).expect("session");
    if !session.is_empty() {
        // round(1.0 s × 5 fps) user-visible frames.
        assert_eq!(session.len(), 5);
        let frame = session.get_frame(0).expect("readback");
        assert_eq!(frame.data.len(), (frame.width * frame.height * 3) as usize);
    }

    stream.close();
}

#[test]
#[ignore = "requires an interactive desktop with a hardware GPU"]
fn size_caps_shrink_stored_frames() {
    let options = CaptureOptions {
        max_width: Some(320),
        max_height: Some(200),
        ..Default::default()
    };
    let mut stream = replaycap::open_monitor(primary_monitor(), options).expect("open stream");

    thread::sleep(Duration::from_millis(800));

    if let Some(frame) = stream.get_frame_by_time(0.0).expect("readback") {
        assert!(frame.width <= 320);
        assert!(frame.height <= 200);
    }

    stream.close();
}

#[test]
#[ignore = "requires an interactive desktop with a hardware GPU"]
fn close_is_idempotent_and_final() {
    let mut stream =
        replaycap::open_monitor(primary_monitor(), CaptureOptions::default()).expect("open stream");

    thread::sleep(Duration::from_millis(300));

    stream.close();
    assert!(stream.is_closed());
    stream.close(); // second close is a no-op

    let error = stream.get_frame_by_time(0.0).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::StreamClosed);
    let error = stream.create_session(None, None).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::StreamClosed);
}

#[test]
#[ignore = "requires an interactive desktop with a hardware GPU"]
fn session_close_is_idempotent_and_final() {
    let mut stream =
        replaycap::open_monitor(primary_monitor(), CaptureOptions::default()).expect("open stream");

    thread::sleep(Duration::from_millis(600));

    let mut session = stream.create_session(None, None).expect("session");
    session.close();
    assert!(session.is_closed());
    session.close(); // second close is a no-op

    let error = session.get_frame(0).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::SessionClosed);

    stream.close();
}
