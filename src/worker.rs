//! Background tasks that stop only between units of work
//!
//! The rotation timer and the broadcast pump both drive capture calls that
//! hold a device handle inside `spawn_blocking`. Aborting them mid-call would
//! strand the handle, so instead they watch a stop signal while idle and
//! `stop()` waits for the current unit of work to finish.

use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Stop signal handed to the task body
pub type StopSignal = oneshot::Receiver<()>;

pub struct StoppableTask {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl StoppableTask {
    /// Spawn `body` with a stop signal it must poll between units of work
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, signal) = oneshot::channel();
        let handle = tokio::spawn(body(signal));
        log::debug!("Spawned background task {}", name);
        Self {
            name,
            stop: Some(stop),
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it to exit
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            // the task may already have exited on its own
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            log::error!("Background task {} ended abnormally: {}", self.name, e);
        }
        log::debug!("Stopped background task {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_waits_for_unit_of_work() {
        let completed = Arc::new(AtomicU32::new(0));
        let counter = completed.clone();

        let task = StoppableTask::spawn("test", move |mut stop| async move {
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
                // unit of work that must not be interrupted
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(8)).await;
        task.stop().await;
        let after_stop = completed.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(completed.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_stop_after_task_exited() {
        let task = StoppableTask::spawn("short", |_stop| async {});
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(task.is_finished());
        task.stop().await;
    }
}
