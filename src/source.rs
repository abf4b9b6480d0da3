//! Shared video source
//!
//! The failover controller, the frame producer and the broadcast hub are
//! created together and torn down together; this type is that unit. The
//! session registry holds one while it has sessions and none otherwise.
//!
//! `stop()` is the orderly path. Dropping a source without it ends the
//! pump, and the capture device is closed when the controller drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broadcast::{BroadcastHub, Subscription, SubscriptionId};
use crate::capture::CaptureBackend;
use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::failover::{FailoverController, FailoverOptions, FailoverStats};
use crate::producer::FrameProducer;

pub struct SharedVideoSource {
    controller: Arc<FailoverController>,
    hub: BroadcastHub,
    stopped: AtomicBool,
}

impl SharedVideoSource {
    /// Open the first working candidate and start broadcasting
    pub async fn start(
        config: &RelayConfig,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self, RelayError> {
        let options = FailoverOptions {
            rotation_period: config.failover.rotation_period(),
            open_retry_backoff: config.failover.open_retry_backoff(),
        };
        let controller = FailoverController::open(
            config.camera.candidates.clone(),
            config.camera.capture_settings(),
            backend,
            options,
        )
        .await?;

        let producer = FrameProducer::new(Arc::clone(&controller));
        let hub = BroadcastHub::start(producer, config.broadcast.capacity);

        log::info!(
            "Shared video source started on candidate {}",
            controller.active_index()
        );
        Ok(Self {
            controller,
            hub,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> Result<Subscription, RelayError> {
        self.hub.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn controller(&self) -> &Arc<FailoverController> {
        &self.controller
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn failover_stats(&self) -> FailoverStats {
        self.controller.stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// End all subscriptions, then release the capture device.
    ///
    /// Returns after the device is closed and the rotation timer is gone.
    /// Only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hub.close().await;
        self.controller.shutdown().await;
        log::info!("Shared video source stopped");
    }
}
