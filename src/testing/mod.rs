//! Test doubles for running the relay without cameras or a network
//!
//! [`ScriptedBackend`] stands in for capture hardware with scriptable
//! failures, [`LoopbackConnector`] for the peer-connection library, and
//! [`synthetic_video_frame`] produces recognisable frames for both.

pub mod loopback;
pub mod scripted;
pub mod synthetic_data;

pub use loopback::{LoopbackConnector, LoopbackPeer};
pub use scripted::ScriptedBackend;
pub use synthetic_data::{device_tint, synthetic_video_frame};
