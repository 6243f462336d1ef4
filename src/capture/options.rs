// Stream configuration and the sizing maths derived from it.

/// Options controlling how much history a stream retains and how frames
/// enter the ring.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Upper bound on the retained time window, in seconds.
    pub buffer_seconds: f64,
    /// Upper bound on the ring's GPU memory footprint, in bytes.
    pub memory_budget_bytes: u64,
    /// Expected capture rate; sizes the ring together with `buffer_seconds`.
    pub target_fps: u32,
    /// Draw the OS cursor into captured frames.
    pub include_cursor: bool,
    /// Show the capture-border UI around the target.
    pub border_required: bool,
    /// Optional width cap. Larger frames are downscaled before entering the
    /// ring; frames are never upscaled and aspect ratio is preserved.
    pub max_width: Option<u32>,
    /// Optional height cap; see `max_width`.
    pub max_height: Option<u32>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            buffer_seconds: 2.0,
            memory_budget_bytes: 512 * 1024 * 1024,
            target_fps: 30,
            include_cursor: false,
            border_required: false,
            max_width: None,
            max_height: None,
        }
    }
}

/// Ring slots for the given per-frame geometry: the time window sized by
/// `buffer_seconds × target_fps`, clamped by the memory budget, never zero.
pub(crate) fn ring_capacity(options: &CaptureOptions, width: u32, height: u32) -> usize {
    let fps = options.target_fps.max(1) as f64;
    let seconds = options.buffer_seconds.max(0.1);
    let by_time = (seconds * fps).ceil() as usize;

    let frame_bytes = u64::from(width) * u64::from(height) * 4;
    let by_memory = if frame_bytes > 0 && options.memory_budget_bytes > 0 {
        (options.memory_budget_bytes / frame_bytes).max(1) as usize
    } else {
        by_time
    };

    by_time.min(by_memory).max(1)
}

/// Largest frame size fitting the caps without upscaling or changing the
/// aspect ratio.
pub(crate) fn optimal_frame_size(
    width: u32,
    height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> (u32, u32) {
    let mut scale = 1.0f64;
    if let Some(max_width) = max_width {
        scale = scale.min(f64::from(max_width) / f64::from(width.max(1)));
    }
    if let Some(max_height) = max_height {
        scale = scale.min(f64::from(max_height) / f64::from(height.max(1)));
    }

    if scale >= 1.0 {
        return (width, height);
    }

    (
        (f64::from(width) * scale).round().max(1.0) as u32,
        (f64::from(height) * scale).round().max(1.0) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_time_bounded_for_small_frames() {
        // 2 s at 30 fps: 60 frames. 512 MiB over 100x100 BGRA frames would
        // allow far more, so the time window wins.
        let options = CaptureOptions::default();
        assert_eq!(ring_capacity(&options, 100, 100), 60);
    }

    #[test]
    fn capacity_is_memory_bounded_for_large_frames() {
        let options = CaptureOptions {
            memory_budget_bytes: 64 * 1024 * 1024,
            ..Default::default()
        };
        // 3840x2160 BGRA = ~31.6 MiB per frame; only 2 fit in 64 MiB.
        assert_eq!(ring_capacity(&options, 3840, 2160), 2);
    }

    #[test]
    fn capacity_never_drops_below_one() {
        let options = CaptureOptions {
            memory_budget_bytes: 1,
            ..Default::default()
        };
        assert_eq!(ring_capacity(&options, 3840, 2160), 1);
    }

    #[test]
    fn capacity_rounds_the_time_window_up() {
        let options = CaptureOptions {
            buffer_seconds: 1.05,
            target_fps: 10,
            ..Default::default()
        };
        assert_eq!(ring_capacity(&options, 16, 16), 11);
    }

    #[test]
    fn optimal_size_passes_uncapped_frames_through() {
        assert_eq!(optimal_frame_size(800, 600, None, None), (800, 600));
    }

    #[test]
    fn optimal_size_downscales_preserving_aspect() {
        // Width is the binding cap: 1920x1080 into max_width 960.
        assert_eq!(
            optimal_frame_size(1920, 1080, Some(960), None),
            (960, 540)
        );
        // Height binds harder than width here.
        assert_eq!(
            optimal_frame_size(1920, 1080, Some(1800), Some(540)),
            (960, 540)
        );
    }

    #[test]
    fn optimal_size_never_upscales() {
        assert_eq!(
            optimal_frame_size(640, 480, Some(1920), Some(1080)),
            (640, 480)
        );
    }

    #[test]
    fn optimal_size_rounds_and_stays_positive() {
        assert_eq!(optimal_frame_size(3, 1000, None, Some(1)), (1, 1));
    }
}
