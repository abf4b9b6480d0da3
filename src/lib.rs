//! CrabRelay: one camera, many WebRTC viewers
//!
//! This crate multiplexes a single capture device to any number of remote
//! viewers. The device is opened when the first viewer connects and
//! released when the last one leaves; read failures rotate through an
//! ordered list of candidate cameras instead of reaching the viewers.
//!
//! # Features
//! - Failover across candidate cameras, with optional periodic rotation
//! - Fixed-rate frame production on a 90 kHz presentation clock
//! - Lossless fan-out of one frame stream to independent subscribers
//! - Session registry that starts and stops the camera with demand
//! - WebRTC peer connections with H.264 video (feature `webrtc`)
//! - Physical cameras through nokhwa (feature `native-camera`)
//!
//! # Usage
//! ```toml
//! [dependencies]
//! crabrelay = { version = "0.1", features = ["webrtc", "native-camera"] }
//! ```
//!
//! ```rust,ignore
//! use crabrelay::{capture::SystemBackend, RelayConfig, SessionRegistry};
//! use crabrelay::webrtc::WebRtcConnector;
//! use std::sync::Arc;
//!
//! let config = RelayConfig::load_or_default();
//! let connector = WebRtcConnector::new(&config);
//! let registry = SessionRegistry::new(config, Arc::new(SystemBackend::new()), connector);
//!
//! let answer = registry.request_session(offer).await?;
//! // ...
//! registry.shutdown().await;
//! ```
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod errors;
pub mod failover;
pub mod invariants;
pub mod producer;
pub mod session;
pub mod source;
pub mod timing;
pub mod types;
pub mod worker;

#[cfg(feature = "webrtc")]
pub mod webrtc;

// Testing utilities - scripted backends and loopback peers
pub mod testing;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, Subscription};
pub use config::RelayConfig;
pub use errors::RelayError;
pub use failover::{FailoverController, FailoverOptions, FailoverStats};
pub use producer::FrameProducer;
pub use session::{RegistryStats, SessionId, SessionRegistry};
pub use source::SharedVideoSource;
pub use types::{
    CameraFrame, CaptureSettings, ConnectionState, DeviceId, PixelFormat, SessionDescription,
    VideoFrame,
};

/// Install the env_logger backend, defaulting to `crabrelay=info`.
///
/// Safe to call more than once.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("crabrelay=info");
    if env_logger::Builder::from_env(env).try_init().is_ok() {
        log::debug!("Logging initialized");
    }
}

/// Current version of CrabRelay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Crate description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
