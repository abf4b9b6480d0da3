use thiserror::Error;

/// Errors raised by the relay.
///
/// Only `NoCandidateAvailable`, `NegotiationError`, `StreamClosed` and
/// `ShuttingDown` ever reach a caller of the session layer. The capture-path
/// variants are logged and counted by the failover controller, which turns
/// them into degraded output instead.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Device open failure on {device}: {reason}")]
    DeviceOpenFailure { device: String, reason: String },

    #[error("No capture candidate available ({tried} tried)")]
    NoCandidateAvailable { tried: usize },

    #[error("Frame read failure on {device}: {reason}")]
    FrameReadFailure { device: String, reason: String },

    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Teardown error: {0}")]
    TeardownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Broadcast stream is closed")]
    StreamClosed,

    #[error("Relay is shutting down")]
    ShuttingDown,
}

impl RelayError {
    pub fn open_failure(device: impl ToString, reason: impl ToString) -> Self {
        RelayError::DeviceOpenFailure {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn read_failure(device: impl ToString, reason: impl ToString) -> Self {
        RelayError::FrameReadFailure {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is surfaced to whoever asked for a session.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            RelayError::NoCandidateAvailable { .. }
                | RelayError::NegotiationError(_)
                | RelayError::StreamClosed
                | RelayError::ShuttingDown
        )
    }
}
