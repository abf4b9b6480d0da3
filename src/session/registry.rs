//! Session registry
//!
//! Tracks every peer session and keeps the shared video source alive
//! exactly while at least one session exists. Session insert and removal,
//! together with starting or stopping the source they imply, happen under
//! one async mutex, so concurrent connects and disconnects always see a
//! consistent "non-empty iff streaming" state.
//!
//! Offer negotiation itself runs outside that mutex. The session is
//! registered (without a peer) before negotiating, which keeps the source
//! alive while the connector works.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use super::events::{ConnectionEvents, StateChange};
use super::peer::{PeerConnector, PeerHandle};
use super::{Session, SessionId, SessionInfo};
use crate::assert_invariant;
use crate::capture::CaptureBackend;
use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::failover::FailoverStats;
use crate::source::SharedVideoSource;
use crate::types::{ConnectionState, SessionDescription};
use crate::worker::StoppableTask;

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_rejected: u64,
    pub subscriptions_issued: u64,
    pub streams_started: u64,
    pub streams_stopped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_created: AtomicU64,
    sessions_rejected: AtomicU64,
    subscriptions_issued: AtomicU64,
    streams_started: AtomicU64,
    streams_stopped: AtomicU64,
}

struct RegistryState<P> {
    sessions: HashMap<SessionId, Session<P>>,
    stream: Option<Arc<SharedVideoSource>>,
}

impl<P> RegistryState<P> {
    fn check_stream_invariant(&self) {
        assert_invariant!(
            self.stream.is_some() == !self.sessions.is_empty(),
            "Shared stream exists iff sessions non-empty",
            "registry"
        );
    }
}

struct Inner<C: PeerConnector> {
    connector: C,
    config: RelayConfig,
    backend: Arc<dyn CaptureBackend>,
    state: Mutex<RegistryState<C::Peer>>,
    events: mpsc::UnboundedSender<StateChange>,
    event_task: std::sync::Mutex<Option<StoppableTask>>,
    shutting_down: AtomicBool,
    counters: Counters,
}

/// Registry of peer sessions; clones share the same registry
pub struct SessionRegistry<C: PeerConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: PeerConnector> Clone for SessionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: PeerConnector> SessionRegistry<C> {
    /// Create a registry and start consuming connection-state events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RelayConfig, backend: Arc<dyn CaptureBackend>, connector: C) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connector,
            config,
            backend,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                stream: None,
            }),
            events,
            event_task: std::sync::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let task = Self::spawn_event_task(Arc::downgrade(&inner), rx);
        *inner
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Self { inner }
    }

    fn spawn_event_task(
        registry: Weak<Inner<C>>,
        mut rx: mpsc::UnboundedReceiver<StateChange>,
    ) -> StoppableTask {
        StoppableTask::spawn("connection-events", move |mut stop| async move {
            loop {
                let change = tokio::select! {
                    _ = &mut stop => break,
                    change = rx.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                SessionRegistry { inner }
                    .on_connection_state_change(change.session_id, change.state)
                    .await;
            }
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Answer a remote offer with a new session fed from the shared source.
    ///
    /// Starts the source if this is the first session. Fails with
    /// `NoCandidateAvailable` when no camera opens, `NegotiationError` when
    /// the connector rejects the offer, and `ShuttingDown` during shutdown.
    /// A failure leaves other sessions and the source untouched.
    pub async fn request_session(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, RelayError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }

        let session_id = SessionId::new();
        let subscription = {
            let mut state = inner.state.lock().await;
            if inner.shutting_down.load(Ordering::SeqCst) {
                return Err(RelayError::ShuttingDown);
            }

            let stream = match state.stream.clone() {
                Some(stream) => stream,
                None => {
                    let stream = match SharedVideoSource::start(
                        &inner.config,
                        Arc::clone(&inner.backend),
                    )
                    .await
                    {
                        Ok(stream) => Arc::new(stream),
                        Err(e) => {
                            Counters::bump(&inner.counters.sessions_rejected);
                            log::error!("Cannot start shared video source: {}", e);
                            return Err(e);
                        }
                    };
                    Counters::bump(&inner.counters.streams_started);
                    state.stream = Some(Arc::clone(&stream));
                    stream
                }
            };

            let subscription = match stream.subscribe() {
                Ok(subscription) => subscription,
                Err(e) => {
                    Counters::bump(&inner.counters.sessions_rejected);
                    if state.sessions.is_empty() {
                        self.stop_stream_locked(&mut state).await;
                    }
                    return Err(e);
                }
            };
            Counters::bump(&inner.counters.subscriptions_issued);
            state
                .sessions
                .insert(session_id, Session::new(session_id, subscription.id()));
            state.check_stream_invariant();
            subscription
        };

        log::info!("Session {} created, negotiating", session_id);
        let events = ConnectionEvents::new(session_id, inner.events.clone());
        let outcome = inner.connector.accept(offer, subscription, events).await;

        let mut state = inner.state.lock().await;
        match outcome {
            Ok((peer, answer)) => {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.peer = Some(peer);
                    Counters::bump(&inner.counters.sessions_created);
                    log::info!(
                        "Session {} negotiated ({} active)",
                        session_id,
                        state.sessions.len()
                    );
                    return Ok(answer);
                }

                // removed by shutdown or a terminal state while negotiating
                drop(state);
                Counters::bump(&inner.counters.sessions_rejected);
                if let Err(e) = peer.close().await {
                    log::warn!("Closing orphaned peer {} failed: {}", session_id, e);
                }
                if inner.shutting_down.load(Ordering::SeqCst) {
                    Err(RelayError::ShuttingDown)
                } else {
                    Err(RelayError::NegotiationError(format!(
                        "session {} closed during negotiation",
                        session_id
                    )))
                }
            }
            Err(e) => {
                Counters::bump(&inner.counters.sessions_rejected);
                log::warn!("Session {} negotiation failed: {}", session_id, e);
                self.remove_locked(&mut state, session_id).await;
                Err(e)
            }
        }
    }

    /// Apply a connection-state change reported by the transport.
    ///
    /// Terminal states remove the session; removing the last one stops the
    /// shared source before this returns. Unknown sessions are ignored.
    pub async fn on_connection_state_change(&self, session_id: SessionId, new_state: ConnectionState) {
        let peer = {
            let mut state = self.inner.state.lock().await;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                log::debug!("State {} for unknown session {}", new_state, session_id);
                return;
            };
            log::debug!("Session {}: {} -> {}", session_id, session.state, new_state);
            session.state = new_state;

            if !new_state.is_terminal() {
                return;
            }
            self.remove_locked(&mut state, session_id).await
        };

        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                log::warn!("Closing peer for session {} failed: {}", session_id, e);
            }
        }
    }

    /// Remove a session, detach its subscription, and stop the source if it
    /// was the last one. Returns the session's peer for the caller to close.
    async fn remove_locked(
        &self,
        state: &mut RegistryState<C::Peer>,
        session_id: SessionId,
    ) -> Option<C::Peer> {
        let session = state.sessions.remove(&session_id)?;
        if let Some(stream) = &state.stream {
            stream.unsubscribe(session.subscription_id);
        }
        log::info!(
            "Session {} removed in state {} ({} remaining)",
            session_id,
            session.state,
            state.sessions.len()
        );

        if state.sessions.is_empty() {
            self.stop_stream_locked(state).await;
        }
        state.check_stream_invariant();
        session.peer
    }

    async fn stop_stream_locked(&self, state: &mut RegistryState<C::Peer>) {
        if let Some(stream) = state.stream.take() {
            stream.stop().await;
            Counters::bump(&self.inner.counters.streams_stopped);
        }
    }

    /// Close every session, wait for them, then release the shared source.
    ///
    /// New requests fail with `ShuttingDown` from the moment this is called.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Session registry shutting down");

        let (sessions, stream) = {
            let mut state = inner.state.lock().await;
            let sessions: Vec<_> = state.sessions.drain().map(|(_, s)| s).collect();
            let stream = state.stream.take();
            state.check_stream_invariant();
            (sessions, stream)
        };

        let mut closing = JoinSet::new();
        for session in sessions {
            if let Some(peer) = session.peer {
                let id = session.id;
                closing.spawn(async move {
                    if let Err(e) = peer.close().await {
                        log::warn!("Closing session {} failed: {}", id, e);
                    }
                });
            }
        }
        let mut closed = 0;
        while let Some(result) = closing.join_next().await {
            match result {
                Ok(()) => closed += 1,
                Err(e) => log::error!("Session close task failed: {}", e),
            }
        }
        log::info!("Closed {} sessions", closed);

        if let Some(stream) = stream {
            stream.stop().await;
            Counters::bump(&inner.counters.streams_stopped);
        }

        let task = inner
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
        log::info!("Session registry shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn is_streaming(&self) -> bool {
        self.inner.state.lock().await.stream.is_some()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    pub async fn session_state(&self, session_id: SessionId) -> Option<ConnectionState> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(&session_id)
            .map(|s| s.state)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .values()
            .map(SessionInfo::from)
            .collect()
    }

    /// Failover counters of the running source, if any
    pub async fn failover_stats(&self) -> Option<FailoverStats> {
        self.inner
            .state
            .lock()
            .await
            .stream
            .as_ref()
            .map(|s| s.failover_stats())
    }

    /// Active candidate index of the running source, if any
    pub async fn active_candidate(&self) -> Option<usize> {
        self.inner
            .state
            .lock()
            .await
            .stream
            .as_ref()
            .map(|s| s.controller().active_index())
    }

    /// Subscriber count and frames broadcast by the running source
    pub async fn hub_stats(&self) -> Option<(usize, u64)> {
        self.inner
            .state
            .lock()
            .await
            .stream
            .as_ref()
            .map(|s| (s.hub().subscriber_count(), s.hub().frames_broadcast()))
    }

    pub async fn stats(&self) -> RegistryStats {
        let active_sessions = self.inner.state.lock().await.sessions.len();
        let counters = &self.inner.counters;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RegistryStats {
            active_sessions,
            sessions_created: load(&counters.sessions_created),
            sessions_rejected: load(&counters.sessions_rejected),
            subscriptions_issued: load(&counters.subscriptions_issued),
            streams_started: load(&counters.streams_started),
            streams_stopped: load(&counters.streams_stopped),
        }
    }
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
