//! Connection-state notifications
//!
//! Peer adapters never call into the registry directly. They hold a
//! [`ConnectionEvents`] and report state changes as [`StateChange`]
//! messages, which a registry-owned task consumes in order.

use tokio::sync::mpsc;

use super::SessionId;
use crate::types::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub session_id: SessionId,
    pub state: ConnectionState,
}

/// Sender side of one session's state notifications
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<StateChange>,
}

impl ConnectionEvents {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<StateChange>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Report a state change; callable from synchronous transport callbacks.
    ///
    /// Returns false once the registry is gone.
    pub fn notify(&self, state: ConnectionState) -> bool {
        log::debug!("Session {} reported {}", self.session_id, state);
        self.tx
            .send(StateChange {
                session_id: self.session_id,
                state,
            })
            .is_ok()
    }
}
