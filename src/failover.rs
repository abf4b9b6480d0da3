//! Camera failover and rotation
//!
//! The [`FailoverController`] owns an ordered list of capture candidates and
//! at most one open capture source. Reads that fail rotate to the next
//! candidate and hand back a black filler frame, so callers never see a
//! capture error. With more than one candidate an optional timer also
//! rotates round-robin on a fixed period.
//!
//! All device access happens inside one exclusive section (the slot mutex):
//! reads, failure-driven rotation and periodic rotation never touch a handle
//! concurrently. A separate rotation-in-progress flag keeps a periodic tick
//! that is queued behind a failure-driven rotation from rotating twice.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

use crate::assert_invariant;
use crate::capture::{open_configured, CaptureBackend, CaptureDevice};
use crate::errors::RelayError;
use crate::types::{CameraFrame, CaptureSettings, DeviceId};
use crate::worker::StoppableTask;

/// Timing options for a controller
#[derive(Debug, Clone)]
pub struct FailoverOptions {
    /// Round-robin rotation period; `None` disables the timer
    pub rotation_period: Option<Duration>,
    /// Wait before retrying once every candidate failed to open
    pub open_retry_backoff: Duration,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            rotation_period: Some(Duration::from_secs(5)),
            open_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters that keep silent degradation observable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailoverStats {
    pub frames_read: u64,
    pub failed_reads: u64,
    pub filler_frames: u64,
    pub open_failures: u64,
    pub rotations: u64,
    pub periodic_rotations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_read: AtomicU64,
    failed_reads: AtomicU64,
    filler_frames: AtomicU64,
    open_failures: AtomicU64,
    rotations: AtomicU64,
    periodic_rotations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RotationCause {
    ReadFailure,
    Retry,
    Periodic,
    Requested,
}

struct Slot {
    index: usize,
    device: Option<Box<dyn CaptureDevice>>,
    /// Set when every candidate failed; no open is attempted before it
    retry_at: Option<Instant>,
    closed: bool,
}

impl Slot {
    fn retry_due(&self) -> bool {
        self.retry_at.map_or(true, |at| Instant::now() >= at)
    }
}

/// Clears the rotation-in-progress flag when dropped
struct RotationGuard<'a>(&'a AtomicBool);

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FailoverController {
    candidates: Vec<DeviceId>,
    settings: CaptureSettings,
    backend: Arc<dyn CaptureBackend>,
    slot: Mutex<Slot>,
    rotating: AtomicBool,
    shut_down: AtomicBool,
    active: watch::Sender<usize>,
    filler: CameraFrame,
    retry_backoff: Duration,
    counters: Counters,
    rotation_timer: std::sync::Mutex<Option<StoppableTask>>,
}

impl FailoverController {
    /// Open the first candidate, in list order, that initializes.
    ///
    /// Every candidate is tried at most once. Fails with
    /// `NoCandidateAvailable` when none opens. On success the periodic
    /// rotation timer is started if configured and there are at least two
    /// candidates.
    pub async fn open(
        candidates: Vec<DeviceId>,
        settings: CaptureSettings,
        backend: Arc<dyn CaptureBackend>,
        options: FailoverOptions,
    ) -> Result<Arc<Self>, RelayError> {
        if candidates.is_empty() {
            return Err(RelayError::NoCandidateAvailable { tried: 0 });
        }

        let (active, _) = watch::channel(0);
        let controller = Arc::new(Self {
            filler: CameraFrame::filler(settings.width, settings.height),
            candidates,
            settings,
            backend,
            slot: Mutex::new(Slot {
                index: 0,
                device: None,
                retry_at: None,
                closed: false,
            }),
            rotating: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            active,
            retry_backoff: options.open_retry_backoff,
            counters: Counters::default(),
            rotation_timer: std::sync::Mutex::new(None),
        });

        let Some((index, device)) = controller.open_first(0).await else {
            log::error!(
                "None of the {} capture candidates could be opened",
                controller.candidates.len()
            );
            return Err(RelayError::NoCandidateAvailable {
                tried: controller.candidates.len(),
            });
        };

        {
            let mut slot = controller.slot.lock().await;
            slot.index = index;
            slot.device = Some(device);
        }
        controller.active.send_replace(index);

        if let Some(period) = options.rotation_period.filter(|p| !p.is_zero()) {
            if controller.candidates.len() > 1 {
                controller.start_rotation_timer(period);
            }
        }

        Ok(controller)
    }

    pub fn candidates(&self) -> &[DeviceId] {
        &self.candidates
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Index of the current candidate
    pub fn active_index(&self) -> usize {
        *self.active.borrow()
    }

    /// Follow the current candidate index as it rotates
    pub fn watch_active(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }

    /// Whether a capture source is open right now
    pub async fn is_source_open(&self) -> bool {
        self.slot.lock().await.device.is_some()
    }

    pub fn filler_frame(&self) -> &CameraFrame {
        &self.filler
    }

    pub fn stats(&self) -> FailoverStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FailoverStats {
            frames_read: load(&self.counters.frames_read),
            failed_reads: load(&self.counters.failed_reads),
            filler_frames: load(&self.counters.filler_frames),
            open_failures: load(&self.counters.open_failures),
            rotations: load(&self.counters.rotations),
            periodic_rotations: load(&self.counters.periodic_rotations),
        }
    }

    /// Read one frame from the active source.
    ///
    /// Never fails: a failed read rotates to the next candidate and returns
    /// the filler frame, as does a read while no source is open.
    pub async fn read_frame(&self) -> CameraFrame {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return self.filler();
        }

        let Some(mut device) = slot.device.take() else {
            if slot.retry_due() {
                if let Some(_rotation) = self.begin_rotation() {
                    self.rotate_locked(&mut slot, RotationCause::Retry).await;
                }
            }
            return self.filler();
        };

        let outcome = tokio::task::spawn_blocking(move || {
            let result = device.read_frame();
            (device, result)
        })
        .await;

        let failure = match outcome {
            Ok((device, Ok(frame))) => {
                slot.device = Some(device);
                Counters::bump(&self.counters.frames_read);
                return frame;
            }
            Ok((device, Err(e))) => {
                slot.device = Some(device);
                e.to_string()
            }
            // the handle went down with the task; nothing left to close
            Err(e) => format!("capture read task failed: {}", e),
        };

        Counters::bump(&self.counters.failed_reads);
        log::warn!("{}; rotating to next candidate", failure);
        if let Some(_rotation) = self.begin_rotation() {
            self.rotate_locked(&mut slot, RotationCause::ReadFailure).await;
        }
        self.filler()
    }

    /// Close the current source and open the next candidate.
    ///
    /// Returns false without rotating when another rotation is already in
    /// progress or the controller has been shut down.
    pub async fn rotate(&self) -> bool {
        self.rotate_with(RotationCause::Requested).await
    }

    /// Close the open source and stop the rotation timer.
    ///
    /// Runs once; later calls return immediately. Reads afterwards return
    /// the filler frame.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let timer = self
            .rotation_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.stop().await;
        }

        let mut slot = self.slot.lock().await;
        slot.closed = true;
        if let Some(device) = slot.device.take() {
            self.close_device(device).await;
        }
        log::info!("Failover controller shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn rotate_with(&self, cause: RotationCause) -> bool {
        let Some(_rotation) = self.begin_rotation() else {
            log::debug!("Rotation already in progress, skipping {:?} rotation", cause);
            return false;
        };

        let mut slot = self.slot.lock().await;
        if slot.closed {
            return false;
        }
        self.rotate_locked(&mut slot, cause).await;
        true
    }

    fn begin_rotation(&self) -> Option<RotationGuard<'_>> {
        self.rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RotationGuard(&self.rotating))
    }

    async fn rotate_locked(&self, slot: &mut Slot, cause: RotationCause) {
        let previous = slot.index;
        // after a failed pass the index already points at the next candidate
        let next = match slot.device.take() {
            Some(device) => {
                self.close_device(device).await;
                (previous + 1) % self.candidates.len()
            }
            None => previous,
        };
        assert_invariant!(
            slot.device.is_none(),
            "At most one capture source is open",
            "failover"
        );

        match self.open_first(next).await {
            Some((index, device)) => {
                slot.index = index;
                slot.device = Some(device);
                slot.retry_at = None;
            }
            None => {
                slot.index = next;
                slot.retry_at = Some(Instant::now() + self.retry_backoff);
                log::error!(
                    "All {} capture candidates failed to open; retrying in {:?}",
                    self.candidates.len(),
                    self.retry_backoff
                );
            }
        }

        Counters::bump(&self.counters.rotations);
        if cause == RotationCause::Periodic {
            Counters::bump(&self.counters.periodic_rotations);
        }
        self.active.send_replace(slot.index);
        log::info!(
            "Rotated capture source {} -> {} ({:?})",
            previous,
            slot.index,
            cause
        );
    }

    /// Try each candidate once, starting at `start` and wrapping around
    async fn open_first(&self, start: usize) -> Option<(usize, Box<dyn CaptureDevice>)> {
        let count = self.candidates.len();
        for offset in 0..count {
            let index = (start + offset) % count;
            let id = self.candidates[index].clone();
            match self.open_candidate(id.clone()).await {
                Ok(device) => {
                    log::info!("Opened capture candidate {} ({})", index, id);
                    return Some((index, device));
                }
                Err(e) => {
                    Counters::bump(&self.counters.open_failures);
                    log::warn!("Capture candidate {} failed: {}", index, e);
                }
            }
        }
        None
    }

    async fn open_candidate(&self, id: DeviceId) -> Result<Box<dyn CaptureDevice>, RelayError> {
        let backend = Arc::clone(&self.backend);
        let settings = self.settings.clone();
        let task_id = id.clone();
        tokio::task::spawn_blocking(move || open_configured(backend.as_ref(), &task_id, &settings))
            .await
            .map_err(|e| RelayError::open_failure(&id, format!("open task failed: {}", e)))?
    }

    async fn close_device(&self, device: Box<dyn CaptureDevice>) {
        let id = device.device_id().clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut device = device;
            device.close()
        })
        .await;

        match result {
            Ok(Ok(())) => log::debug!("Closed capture source {}", id),
            Ok(Err(e)) => log::error!("Failed to close capture source {}: {}", id, e),
            Err(e) => log::error!("Close task for capture source {} failed: {}", id, e),
        }
    }

    fn filler(&self) -> CameraFrame {
        Counters::bump(&self.counters.filler_frames);
        self.filler.clone()
    }

    fn start_rotation_timer(self: &Arc<Self>, period: Duration) {
        let controller = Arc::downgrade(self);
        let task = StoppableTask::spawn("rotation-timer", move |mut stop| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {}
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.rotate_with(RotationCause::Periodic).await;
            }
        });

        log::info!(
            "Rotating between {} candidates every {:?}",
            self.candidates.len(),
            period
        );
        *self
            .rotation_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

// Dropped without `shutdown`: release the device on this thread
impl Drop for FailoverController {
    fn drop(&mut self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if let Some(mut device) = self.slot.get_mut().device.take() {
            let id = device.device_id().clone();
            match device.close() {
                Ok(()) => log::debug!("Closed capture source {} on drop", id),
                Err(e) => log::error!("Failed to close capture source {}: {}", id, e),
            }
        }
    }
}
