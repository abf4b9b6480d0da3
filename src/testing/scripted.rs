//! Scripted capture backend
//!
//! Candidates are `DeviceId::Index(0..n)`. Each candidate can be told to fail
//! opening, fail configuring, or fail some or all reads, and every open,
//! close and read is counted so tests can check exactly what the failover
//! controller did to the hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::synthetic_data::synthetic_video_frame;
use crate::capture::{CaptureBackend, CaptureDevice};
use crate::errors::RelayError;
use crate::types::{CameraFrame, CaptureSettings, DeviceId};

#[derive(Debug, Default, Clone)]
struct CandidateScript {
    fail_open: bool,
    fail_configure: bool,
    fail_all_reads: bool,
    pending_read_failures: u32,
    read_delay: Duration,
    opens: u32,
    closes: u32,
    reads: u64,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: Mutex<HashMap<u32, CandidateScript>>,
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
}

/// Capture backend whose behaviour is driven by the test
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
    count: u32,
}

impl ScriptedBackend {
    /// Backend with `count` healthy candidates
    pub fn new(count: u32) -> Self {
        let scripts = (0..count).map(|i| (i, CandidateScript::default())).collect();
        Self {
            inner: Arc::new(Inner {
                scripts: Mutex::new(scripts),
                ..Inner::default()
            }),
            count,
        }
    }

    pub fn candidates(&self) -> Vec<DeviceId> {
        (0..self.count).map(DeviceId::Index).collect()
    }

    fn scripts(&self) -> MutexGuard<'_, HashMap<u32, CandidateScript>> {
        self.inner.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, index: u32, f: impl FnOnce(&mut CandidateScript)) {
        if let Some(script) = self.scripts().get_mut(&index) {
            f(script);
        }
    }

    fn read_script<T>(&self, index: u32, f: impl FnOnce(&CandidateScript) -> T) -> T
    where
        T: Default,
    {
        self.scripts().get(&index).map(f).unwrap_or_default()
    }

    pub fn fail_open(&self, index: u32) {
        self.update(index, |s| s.fail_open = true);
    }

    pub fn allow_open(&self, index: u32) {
        self.update(index, |s| s.fail_open = false);
    }

    pub fn fail_configure(&self, index: u32) {
        self.update(index, |s| s.fail_configure = true);
    }

    /// Make the next `count` reads on this candidate fail
    pub fn fail_next_reads(&self, index: u32, count: u32) {
        self.update(index, |s| s.pending_read_failures += count);
    }

    pub fn fail_all_reads(&self, index: u32, fail: bool) {
        self.update(index, |s| s.fail_all_reads = fail);
    }

    /// Simulated device latency for every read on this candidate
    pub fn set_read_delay(&self, index: u32, delay: Duration) {
        self.update(index, |s| s.read_delay = delay);
    }

    pub fn opens(&self, index: u32) -> u32 {
        self.read_script(index, |s| s.opens)
    }

    pub fn closes(&self, index: u32) -> u32 {
        self.read_script(index, |s| s.closes)
    }

    pub fn reads(&self, index: u32) -> u64 {
        self.read_script(index, |s| s.reads)
    }

    pub fn total_opens(&self) -> u32 {
        self.scripts().values().map(|s| s.opens).sum()
    }

    pub fn total_closes(&self) -> u32 {
        self.scripts().values().map(|s| s.closes).sum()
    }

    /// Handles opened and not yet closed
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open handles seen
    pub fn max_open_handles(&self) -> usize {
        self.inner.max_open_handles.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for ScriptedBackend {
    fn open(&self, device: &DeviceId) -> Result<Box<dyn CaptureDevice>, RelayError> {
        let DeviceId::Index(index) = device else {
            return Err(RelayError::open_failure(device, "scripted backend opens indices only"));
        };

        {
            let mut scripts = self.scripts();
            let script = scripts
                .get_mut(index)
                .ok_or_else(|| RelayError::open_failure(device, "no such candidate"))?;
            script.opens += 1;
            if script.fail_open {
                return Err(RelayError::open_failure(device, "scripted open failure"));
            }
        }

        let open = self.inner.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_open_handles.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(ScriptedDevice {
            backend: self.clone(),
            device: device.clone(),
            index: *index,
            settings: None,
            frame_number: 0,
            closed: false,
        }))
    }
}

struct ScriptedDevice {
    backend: ScriptedBackend,
    device: DeviceId,
    index: u32,
    settings: Option<CaptureSettings>,
    frame_number: u64,
    closed: bool,
}

impl CaptureDevice for ScriptedDevice {
    fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), RelayError> {
        if self.backend.read_script(self.index, |s| s.fail_configure) {
            return Err(RelayError::open_failure(&self.device, "scripted configure failure"));
        }
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CameraFrame, RelayError> {
        let (fail, delay) = {
            let mut scripts = self.backend.scripts();
            match scripts.get_mut(&self.index) {
                Some(script) => {
                    script.reads += 1;
                    let fail = script.fail_all_reads || script.pending_read_failures > 0;
                    script.pending_read_failures = script.pending_read_failures.saturating_sub(1);
                    (fail, script.read_delay)
                }
                None => (true, Duration::ZERO),
            }
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail || self.closed {
            return Err(RelayError::read_failure(&self.device, "scripted read failure"));
        }

        let settings = self.settings.clone().unwrap_or_default();
        self.frame_number += 1;
        Ok(synthetic_video_frame(
            self.frame_number,
            settings.width,
            settings.height,
            &self.device.to_string(),
        ))
    }

    fn close(&mut self) -> Result<(), RelayError> {
        if !self.closed {
            self.closed = true;
            self.backend.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
            self.backend.update(self.index, |s| s.closes += 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_open_and_close_counts() {
        let backend = ScriptedBackend::new(2);
        backend.fail_open(0);

        assert!(backend.open(&DeviceId::Index(0)).is_err());
        let mut device = backend.open(&DeviceId::Index(1)).unwrap();
        assert_eq!(backend.open_handles(), 1);

        device.close().unwrap();
        device.close().unwrap();
        assert_eq!(backend.closes(1), 1);
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(backend.total_opens(), 2);
    }

    #[test]
    fn test_scripted_read_failures_are_consumed() {
        let backend = ScriptedBackend::new(1);
        let mut device = backend.open(&DeviceId::Index(0)).unwrap();
        device.configure(&CaptureSettings::default()).unwrap();
        backend.fail_next_reads(0, 1);

        assert!(device.read_frame().is_err());
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.device_id, "0");
        assert_eq!(backend.reads(0), 2);
    }
}
