//! Core data types shared across the relay
//!
//! Device identifiers, capture settings, raw and timestamped frames, and the
//! session-description/connection-state types exchanged with peers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::RelayError;

/// Identifier of one capture candidate.
///
/// A decimal string names a device index (`"0"`, `"1"`); anything else is a
/// URI or filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceId {
    Index(u32),
    Uri(String),
}

impl DeviceId {
    /// Filesystem path for still-image candidates (`file:` prefix stripped)
    pub fn as_path(&self) -> Option<&str> {
        match self {
            DeviceId::Index(_) => None,
            DeviceId::Uri(uri) => Some(uri.strip_prefix("file:").unwrap_or(uri)),
        }
    }
}

impl FromStr for DeviceId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RelayError::ConfigError(
                "Device identifier must not be empty".to_string(),
            ));
        }
        match trimmed.parse::<u32>() {
            Ok(index) => Ok(DeviceId::Index(index)),
            Err(_) => Ok(DeviceId::Uri(trimmed.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        DeviceId::Index(index)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(index) => write!(f, "{}", index),
            DeviceId::Uri(uri) => write!(f, "{}", uri),
        }
    }
}

/// Pixel format requested from the capture device.
///
/// Frames handed to the producer are always RGB24; this only selects what
/// the device itself delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Mjpeg,
    Yuyv,
    Rgb24,
}

impl PixelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
        }
    }
}

/// Settings applied to a capture source when it is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_depth: u32,
    pub pixel_format: PixelFormat,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            buffer_depth: 1,
            pixel_format: PixelFormat::Mjpeg,
        }
    }
}

impl CaptureSettings {
    /// Size in bytes of one RGB24 frame at these settings
    pub fn rgb_frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Raw RGB24 frame read from a capture source
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Pixel data, reference counted so fan-out never copies it
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Candidate that produced the frame; empty for the filler frame
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    /// True for the blank frame substituted when no real frame is available
    pub is_filler: bool,
}

impl CameraFrame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, device_id: String) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            device_id,
            captured_at: Utc::now(),
            is_filler: false,
        }
    }

    /// Black RGB24 frame of the given size
    pub fn filler(width: u32, height: u32) -> Self {
        let image = image::RgbImage::new(width, height);
        Self {
            data: Bytes::from(image.into_raw()),
            width,
            height,
            device_id: String::new(),
            captured_at: Utc::now(),
            is_filler: true,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// A frame stamped by the producer's presentation clock
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation timestamp in units of `1 / VIDEO_CLOCK_RATE` seconds
    pub pts: u64,
    pub frame: CameraFrame,
}

impl VideoFrame {
    pub fn pts_seconds(&self) -> f64 {
        self.pts as f64 / crate::timing::VIDEO_CLOCK_RATE as f64
    }
}

/// Peer connection state as reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Closed and failed sessions are removed from the registry
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// SDP (Session Description Protocol) type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's JSON shape: `{"sdp": ..., "type": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parsing() {
        assert_eq!("0".parse::<DeviceId>().unwrap(), DeviceId::Index(0));
        assert_eq!(" 2 ".parse::<DeviceId>().unwrap(), DeviceId::Index(2));
        assert_eq!(
            "rtsp://cam.local/stream".parse::<DeviceId>().unwrap(),
            DeviceId::Uri("rtsp://cam.local/stream".to_string())
        );
        assert!("".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_device_id_path() {
        let id: DeviceId = "file:image.png".parse().unwrap();
        assert_eq!(id.as_path(), Some("image.png"));
        assert_eq!(DeviceId::Index(1).as_path(), None);
    }

    #[test]
    fn test_filler_frame_is_black() {
        let frame = CameraFrame::filler(8, 4);
        assert!(frame.is_filler);
        assert_eq!(frame.size_bytes(), 8 * 4 * 3);
        assert!(frame.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_session_description_json_shape() {
        let desc = SessionDescription::answer("v=0");
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"type\":\"answer\""));

        let parsed: SessionDescription =
            serde_json::from_str(r#"{"sdp":"v=0\r\n","type":"offer"}"#).unwrap();
        assert_eq!(parsed.sdp_type, SdpType::Offer);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }
}
