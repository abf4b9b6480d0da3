//! Broadcast hub
//!
//! One pump task pulls frames from the [`FrameProducer`] and publishes each
//! one exactly once on a `tokio::sync::broadcast` channel. Every
//! [`Subscription`] is an independent receiver on that channel, so slow
//! subscribers only ever lag themselves. Frame payloads are `Bytes`, so the
//! fan-out shares one allocation per frame.
//!
//! Each subscription also holds a `watch` receiver whose sender lives in the
//! hub. Dropping that sender (on `unsubscribe` or `close`) ends the
//! subscription immediately, even while it is waiting for a frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use crate::errors::RelayError;
use crate::producer::FrameProducer;
use crate::types::VideoFrame;
use crate::worker::StoppableTask;

/// Identifier of one subscription within its hub
pub type SubscriptionId = u64;

pub struct BroadcastHub {
    tx: Mutex<Option<broadcast::Sender<VideoFrame>>>,
    subscribers: Mutex<HashMap<SubscriptionId, watch::Sender<()>>>,
    next_id: AtomicU64,
    frames_broadcast: Arc<AtomicU64>,
    pump: Mutex<Option<StoppableTask>>,
    closed: AtomicBool,
}

impl BroadcastHub {
    /// Start pumping `producer` into a channel holding up to `capacity`
    /// frames per subscriber.
    pub fn start(mut producer: FrameProducer, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let frames_broadcast = Arc::new(AtomicU64::new(0));

        let pump_tx = tx.clone();
        let counter = Arc::clone(&frames_broadcast);
        let pump = StoppableTask::spawn("broadcast-pump", move |mut stop| async move {
            loop {
                // the stop signal is only honoured while waiting for the
                // next tick, never during a capture
                let pts = tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    pts = producer.wait_next() => pts,
                };
                let frame = producer.capture(pts).await;
                counter.fetch_add(1, Ordering::Relaxed);
                // no receivers is fine; the frame is simply not wanted
                let _ = pump_tx.send(frame);
            }
            log::debug!(
                "Broadcast pump exiting after {} frames",
                producer.frames_produced()
            );
        });

        log::info!("Broadcast hub started (capacity {})", capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            frames_broadcast,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, watch::Sender<()>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New subscription seeing every frame produced from now on
    pub fn subscribe(&self) -> Result<Subscription, RelayError> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = tx.as_ref().ok_or(RelayError::StreamClosed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (detach, detached) = watch::channel(());
        let rx = tx.subscribe();
        self.subscribers().insert(id, detach);

        log::debug!("Subscription {} attached", id);
        Ok(Subscription {
            id,
            rx,
            detached,
            skipped: 0,
        })
    }

    /// Detach a subscription; returns false if it was not attached
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscribers().remove(&id).is_some();
        if removed {
            log::debug!("Subscription {} detached", id);
        }
        removed
    }

    /// Attached subscriptions whose handle is still alive
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|_, detach| !detach.is_closed());
        subscribers.len()
    }

    pub fn frames_broadcast(&self) -> u64 {
        self.frames_broadcast.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the pump and end every subscription.
    ///
    /// Waits for a capture in flight to finish. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.stop().await;
        }

        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let detached = {
            let mut subscribers = self.subscribers();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        log::info!(
            "Broadcast hub closed after {} frames ({} subscriptions ended)",
            self.frames_broadcast(),
            detached
        );
    }
}

/// One subscriber's view of the broadcast
pub struct Subscription {
    id: SubscriptionId,
    rx: broadcast::Receiver<VideoFrame>,
    detached: watch::Receiver<()>,
    skipped: u64,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Frames this subscriber missed by falling behind
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next frame, or `None` once detached or the hub has closed.
    ///
    /// A subscriber that falls more than the hub capacity behind skips
    /// ahead to the oldest retained frame.
    pub async fn next(&mut self) -> Option<VideoFrame> {
        loop {
            tokio::select! {
                biased;
                changed = self.detached.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                received = self.rx.recv() => match received {
                    Ok(frame) => return Some(frame),
                    Err(RecvError::Lagged(missed)) => {
                        self.skipped += missed;
                        log::warn!("Subscription {} lagged, skipped {} frames", self.id, missed);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("skipped", &self.skipped)
            .finish()
    }
}
