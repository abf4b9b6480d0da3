use std::future::Future;

use super::events::ConnectionEvents;
use crate::broadcast::Subscription;
use crate::errors::RelayError;
use crate::types::SessionDescription;

/// A negotiated peer connection
pub trait PeerHandle: Send + Sync + 'static {
    /// Close the connection and stop sending media
    fn close(&self) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// Turns a remote offer into a peer connection fed by a subscription.
///
/// Implementations answer the offer, attach `subscription` as the outbound
/// video track and report connection-state changes through `events`. A
/// rejected offer is a `NegotiationError`.
pub trait PeerConnector: Send + Sync + 'static {
    type Peer: PeerHandle;

    fn accept(
        &self,
        offer: SessionDescription,
        subscription: Subscription,
        events: ConnectionEvents,
    ) -> impl Future<Output = Result<(Self::Peer, SessionDescription), RelayError>> + Send;
}
