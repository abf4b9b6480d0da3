//! Presentation timestamps for the frame producer
//!
//! Timestamps count ticks of the 90 kHz RTP video clock. The first frame is
//! stamped 0 and every following frame exactly `ticks_per_frame` later, so
//! the sequence is independent of capture latency and camera switches; only
//! the wall-clock wait before each frame absorbs jitter.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// RTP clock rate for video
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

/// Monotonic frame clock keyed to a fixed output rate
#[derive(Debug)]
pub struct FrameClock {
    start: Option<Instant>,
    next_pts: u64,
    ticks_per_frame: u64,
}

impl FrameClock {
    /// Create a clock for `fps` frames per second
    pub fn new(fps: u32) -> Self {
        let fps = u64::from(fps.max(1));
        let ticks_per_frame = ((VIDEO_CLOCK_RATE + fps / 2) / fps).max(1);
        Self {
            start: None,
            next_pts: 0,
            ticks_per_frame,
        }
    }

    pub fn ticks_per_frame(&self) -> u64 {
        self.ticks_per_frame
    }

    /// Wall-clock spacing between frames
    pub fn frame_interval(&self) -> Duration {
        ticks_to_duration(self.ticks_per_frame)
    }

    /// Wait until the next frame is due and return its timestamp.
    ///
    /// Cancel safe: the clock only advances once the wait completes, so a
    /// dropped call leaves the next timestamp unchanged.
    pub async fn tick(&mut self) -> u64 {
        let start = *self.start.get_or_insert_with(Instant::now);
        let pts = self.next_pts;
        sleep_until(start + ticks_to_duration(pts)).await;
        self.next_pts = pts + self.ticks_per_frame;
        pts
    }
}

/// Convert clock ticks to a duration without overflowing on long streams
pub fn ticks_to_duration(ticks: u64) -> Duration {
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(VIDEO_CLOCK_RATE);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_per_frame() {
        assert_eq!(FrameClock::new(30).ticks_per_frame(), 3000);
        assert_eq!(FrameClock::new(25).ticks_per_frame(), 3600);
        assert_eq!(FrameClock::new(60).ticks_per_frame(), 1500);
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(FrameClock::new(30).frame_interval(), Duration::from_nanos(33_333_333));
        assert_eq!(ticks_to_duration(VIDEO_CLOCK_RATE), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tick_sequence_is_rate_consistent() {
        let mut clock = FrameClock::new(200);
        let mut last = None;
        for _ in 0..5 {
            let pts = clock.tick().await;
            if let Some(prev) = last {
                assert_eq!(pts - prev, clock.ticks_per_frame());
            } else {
                assert_eq!(pts, 0);
            }
            last = Some(pts);
        }
    }

    #[tokio::test]
    async fn test_tick_waits_for_schedule() {
        let mut clock = FrameClock::new(50);
        let started = std::time::Instant::now();
        for _ in 0..3 {
            clock.tick().await;
        }
        // frames 0, 1, 2 are due at 0, 20 and 40 ms
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
