//! In-process peer connector
//!
//! Accepts any offer whose SDP does not contain `reject`, answers
//! immediately and drains the subscription in a background task, counting
//! frames and checking their order. Tests drive remote-side behaviour
//! through [`LoopbackConnector::disconnect`] and [`LoopbackConnector::fail`],
//! which report state changes exactly like a transport would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broadcast::Subscription;
use crate::errors::RelayError;
use crate::session::{ConnectionEvents, PeerConnector, PeerHandle, SessionId};
use crate::types::{ConnectionState, SdpType, SessionDescription};

#[derive(Debug)]
struct PeerState {
    events: ConnectionEvents,
    frames: AtomicU64,
    out_of_order: AtomicU64,
    ended: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct ConnectorState {
    peers: Mutex<HashMap<SessionId, Arc<PeerState>>>,
    accept_delay: Mutex<Duration>,
    accepted: AtomicU64,
    closed: AtomicU64,
}

impl ConnectorState {
    fn peers(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<PeerState>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer(&self, id: SessionId) -> Option<Arc<PeerState>> {
        self.peers().get(&id).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    inner: Arc<ConnectorState>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every negotiation, to widen race windows in tests
    pub fn set_accept_delay(&self, delay: Duration) {
        *self
            .inner
            .accept_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Sessions accepted so far, in no particular order
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.peers().keys().copied().collect()
    }

    /// Remote side hangs up
    pub fn disconnect(&self, id: SessionId) -> bool {
        self.report(id, ConnectionState::Closed)
    }

    /// Transport reports a failed connection
    pub fn fail(&self, id: SessionId) -> bool {
        self.report(id, ConnectionState::Failed)
    }

    pub fn report(&self, id: SessionId, state: ConnectionState) -> bool {
        self.inner
            .peer(id)
            .map_or(false, |peer| peer.events.notify(state))
    }

    pub fn frames_received(&self, id: SessionId) -> u64 {
        self.inner
            .peer(id)
            .map_or(0, |peer| peer.frames.load(Ordering::SeqCst))
    }

    /// Frames whose timestamp did not increase over the previous one
    pub fn out_of_order_frames(&self) -> u64 {
        self.inner
            .peers()
            .values()
            .map(|peer| peer.out_of_order.load(Ordering::SeqCst))
            .sum()
    }

    /// Whether the session's subscription has reached end of stream
    pub fn stream_ended(&self, id: SessionId) -> bool {
        self.inner
            .peer(id)
            .map_or(false, |peer| peer.ended.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self, id: SessionId) -> bool {
        self.inner
            .peer(id)
            .map_or(false, |peer| peer.closed.load(Ordering::SeqCst))
    }

    pub fn accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    pub fn peers_closed(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl PeerConnector for LoopbackConnector {
    type Peer = LoopbackPeer;

    async fn accept(
        &self,
        offer: SessionDescription,
        mut subscription: Subscription,
        events: ConnectionEvents,
    ) -> Result<(LoopbackPeer, SessionDescription), RelayError> {
        let delay = *self
            .inner
            .accept_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if offer.sdp_type != SdpType::Offer {
            return Err(RelayError::NegotiationError(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        if offer.sdp.contains("reject") {
            return Err(RelayError::NegotiationError(
                "remote description rejected".to_string(),
            ));
        }

        let session_id = events.session_id();
        let state = Arc::new(PeerState {
            events,
            frames: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let drain_state = Arc::clone(&state);
        let drain = tokio::spawn(async move {
            let mut last_pts = None;
            while let Some(frame) = subscription.next().await {
                if last_pts.map_or(false, |last| frame.pts <= last) {
                    drain_state.out_of_order.fetch_add(1, Ordering::SeqCst);
                }
                last_pts = Some(frame.pts);
                drain_state.frames.fetch_add(1, Ordering::SeqCst);
            }
            drain_state.ended.store(true, Ordering::SeqCst);
        });

        self.inner.peers().insert(session_id, Arc::clone(&state));
        self.inner.accepted.fetch_add(1, Ordering::SeqCst);
        state.events.notify(ConnectionState::Connected);

        let peer = LoopbackPeer {
            state,
            connector: Arc::clone(&self.inner),
            drain: Mutex::new(Some(drain)),
        };
        let answer = SessionDescription::answer(format!("v=0\r\ns=loopback {}\r\n", session_id));
        Ok((peer, answer))
    }
}

#[derive(Debug)]
pub struct LoopbackPeer {
    state: Arc<PeerState>,
    connector: Arc<ConnectorState>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl PeerHandle for LoopbackPeer {
    async fn close(&self) -> Result<(), RelayError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(drain) = drain {
            drain.abort();
        }
        self.connector.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
