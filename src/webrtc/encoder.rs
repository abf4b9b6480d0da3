//! H.264 encoder wrapper using openh264

use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use crate::errors::RelayError;

/// H.264 encoder for one peer's outbound track
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    frame_count: u64,
    last_frame_was_keyframe: bool,
}

impl H264Encoder {
    /// Create an encoder for `width` x `height` RGB24 frames.
    ///
    /// YUV 4:2:0 needs even dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self, RelayError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(RelayError::EncodingError(format!(
                "Frame size {}x{} must be non-zero and even",
                width, height
            )));
        }

        let encoder = Encoder::new()
            .map_err(|e| RelayError::EncodingError(format!("Failed to create encoder: {}", e)))?;

        Ok(Self {
            encoder,
            width,
            height,
            frame_count: 0,
            last_frame_was_keyframe: false,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Encode an RGB frame to Annex B H.264
    pub fn encode_rgb(&mut self, rgb_data: &[u8]) -> Result<EncodedFrame, RelayError> {
        let expected_size = self.width as usize * self.height as usize * 3;
        if rgb_data.len() != expected_size {
            return Err(RelayError::EncodingError(format!(
                "Invalid frame size: expected {} bytes, got {}",
                expected_size,
                rgb_data.len()
            )));
        }

        let yuv = rgb_to_yuv420(rgb_data, self.width, self.height);
        let yuv_buffer = YUVBuffer::from_vec(yuv, self.width as usize, self.height as usize);

        let bitstream = self
            .encoder
            .encode(&yuv_buffer)
            .map_err(|e| RelayError::EncodingError(format!("Encoding failed: {}", e)))?;

        self.frame_count += 1;
        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        self.last_frame_was_keyframe = is_keyframe;

        Ok(EncodedFrame {
            data: bitstream.to_vec(),
            is_keyframe,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_was_keyframe(&self) -> bool {
        self.last_frame_was_keyframe
    }

    /// Force the next frame to be a keyframe
    pub fn force_keyframe(&mut self) {
        self.encoder.force_intra_frame();
    }
}

/// One encoded access unit
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Annex B NAL units (with start codes)
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// Convert RGB24 to planar YUV 4:2:0 (BT.601)
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for (i, pixel) in rgb.chunks_exact(3).enumerate().take(y_size) {
        let (x, y) = (i % w, i / w);
        let r = i32::from(pixel[0]);
        let g = i32::from(pixel[1]);
        let b = i32::from(pixel[2]);

        let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
        y_plane[i] = y_val.clamp(0, 255) as u8;

        if y % 2 == 0 && x % 2 == 0 {
            let uv_idx = (y / 2) * (w / 2) + (x / 2);
            let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
            let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
            u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
            v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
        }
    }

    yuv
}
