use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Frame clock with a rolling average for periodic frame-time logging.
pub struct Time {
    start: Instant,
    last: Instant,
    pub delta: Duration,
    frames: u64,
    window_start: Instant,
    window_frames: u32,
}

impl Time {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { start: now, last: now, delta: Duration::ZERO, frames: 0, window_start: now, window_frames: 0 }
    }

    pub fn tick(&mut self) {
        let now = Instant::now();
        self.delta = now - self.last;
        self.last = now;
        self.frames += 1;
        self.window_frames += 1;
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    pub fn elapsed_seconds(&self) -> f32 {
        self.last.duration_since(self.start).as_secs_f32()
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Average frame time in milliseconds once per report interval, resetting the window.
    pub fn take_report(&mut self) -> Option<f32> {
        let span = self.last.duration_since(self.window_start);
        if span < REPORT_INTERVAL || self.window_frames == 0 {
            return None;
        }
        let average_ms = span.as_secs_f32() * 1000.0 / self.window_frames as f32;
        self.window_start = self.last;
        self.window_frames = 0;
        Some(average_ms)
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_counts_frames_and_withholds_early_reports() {
        let mut time = Time::new();
        time.tick();
        time.tick();
        assert_eq!(time.frame_count(), 2);
        assert!(time.take_report().is_none());
    }
}
