//! Synthetic camera frames
//!
//! Frames carry a gradient that shifts with the frame number and a
//! per-candidate tint, so tests can tell both which read produced a frame
//! and which camera it came from.

use crate::types::CameraFrame;

/// Create a synthetic RGB24 frame for `device_id`
pub fn synthetic_video_frame(
    frame_number: u64,
    width: u32,
    height: u32,
    device_id: &str,
) -> CameraFrame {
    let mut data = vec![0u8; width as usize * height as usize * 3];
    let base = (frame_number % 256) as u8;
    let tint = device_tint(device_id);

    for (i, pixel) in data.chunks_exact_mut(3).enumerate() {
        let x = (i % width.max(1) as usize) as u8;
        let y = (i / width.max(1) as usize) as u8;
        pixel[0] = base.wrapping_add(x);
        pixel[1] = base.wrapping_add(y);
        pixel[2] = tint;
    }

    CameraFrame::new(data, width, height, device_id.to_string())
}

/// Blue channel value that identifies a candidate; never 0 so it differs from filler
pub fn device_tint(device_id: &str) -> u8 {
    let sum = device_id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b.into()));
    (sum % 255) as u8 + 1
}
