//! Peer sessions
//!
//! A [`Session`] is one remote viewer from offer to terminal connection
//! state. The [`SessionRegistry`] owns every session and, through its
//! emptiness, the lifetime of the shared video source.

pub mod events;
pub mod peer;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::broadcast::SubscriptionId;
use crate::types::ConnectionState;

pub use events::{ConnectionEvents, StateChange};
pub use peer::{PeerConnector, PeerHandle};
pub use registry::{RegistryStats, SessionRegistry};

/// Unique identifier of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One viewer's connection as tracked by the registry
pub struct Session<P> {
    pub id: SessionId,
    /// `None` while the offer is still being negotiated
    pub peer: Option<P>,
    pub subscription_id: SubscriptionId,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
}

impl<P> Session<P> {
    pub fn new(id: SessionId, subscription_id: SubscriptionId) -> Self {
        Self {
            id,
            peer: None,
            subscription_id,
            state: ConnectionState::New,
            created_at: Utc::now(),
        }
    }
}

/// Snapshot of a session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: ConnectionState,
    pub negotiated: bool,
    pub created_at: DateTime<Utc>,
}

impl<P> From<&Session<P>> for SessionInfo {
    fn from(session: &Session<P>) -> Self {
        Self {
            id: session.id,
            state: session.state,
            negotiated: session.peer.is_some(),
            created_at: session.created_at,
        }
    }
}
