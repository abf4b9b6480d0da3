//! WebRTC transport for relayed video
//!
//! [`WebRtcConnector`] answers browser offers with a send-only H.264 track
//! fed from a broadcast subscription.

pub mod encoder;
pub mod peer;

pub use encoder::{EncodedFrame, H264Encoder};
pub use peer::{WebRtcConnector, WebRtcPeer};
