//! Frame producer
//!
//! Pulls one frame per clock tick from the failover controller and stamps
//! it with the next presentation timestamp. Camera switches change the
//! pixels but never the timestamp sequence.

use std::sync::Arc;

use crate::assert_invariant;
use crate::failover::FailoverController;
use crate::timing::FrameClock;
use crate::types::VideoFrame;

pub struct FrameProducer {
    controller: Arc<FailoverController>,
    clock: FrameClock,
    last_pts: Option<u64>,
    frames_produced: u64,
}

impl FrameProducer {
    /// Producer clocked at the controller's configured frame rate
    pub fn new(controller: Arc<FailoverController>) -> Self {
        let fps = controller.settings().fps;
        Self::with_fps(controller, fps)
    }

    /// Producer with an output rate that differs from the capture rate
    pub fn with_fps(controller: Arc<FailoverController>, fps: u32) -> Self {
        Self {
            controller,
            clock: FrameClock::new(fps),
            last_pts: None,
            frames_produced: 0,
        }
    }

    pub fn controller(&self) -> &Arc<FailoverController> {
        &self.controller
    }

    pub fn ticks_per_frame(&self) -> u64 {
        self.clock.ticks_per_frame()
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    /// Wait for the next scheduled presentation time and produce its frame.
    ///
    /// Never fails; capture problems arrive as filler frames.
    pub async fn next(&mut self) -> VideoFrame {
        let pts = self.clock.tick().await;
        self.capture(pts).await
    }

    /// Wait for the next presentation time without reading a frame.
    ///
    /// Cancel safe. Used by the broadcast pump, which only watches its stop
    /// signal while waiting here.
    pub async fn wait_next(&mut self) -> u64 {
        self.clock.tick().await
    }

    /// Read one frame and stamp it with `pts`
    pub async fn capture(&mut self, pts: u64) -> VideoFrame {
        if let Some(last) = self.last_pts {
            assert_invariant!(pts > last, "Frame timestamps strictly increase", "producer");
        }
        self.last_pts = Some(pts);

        let frame = self.controller.read_frame().await;
        self.frames_produced += 1;
        VideoFrame { pts, frame }
    }
}
