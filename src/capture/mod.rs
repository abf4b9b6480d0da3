//! Capture sources
//!
//! The relay talks to capture hardware through two small traits: a
//! [`CaptureBackend`] opens a device handle for a candidate identifier, and
//! the returned [`CaptureDevice`] is configured, read and closed. All calls
//! are blocking; the failover controller runs them on the blocking pool.

pub mod still;

#[cfg(feature = "native-camera")]
pub mod native;

use crate::errors::RelayError;
use crate::types::{CameraFrame, CaptureSettings, DeviceId};

pub use still::StillImageBackend;

/// An open capture device handle
pub trait CaptureDevice: Send + 'static {
    fn device_id(&self) -> &DeviceId;

    /// Apply resolution, frame rate, buffer depth and pixel format
    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), RelayError>;

    /// Read one RGB24 frame
    fn read_frame(&mut self) -> Result<CameraFrame, RelayError>;

    fn close(&mut self) -> Result<(), RelayError>;
}

/// Opens capture devices by identifier
pub trait CaptureBackend: Send + Sync + 'static {
    fn open(&self, device: &DeviceId) -> Result<Box<dyn CaptureDevice>, RelayError>;
}

/// Open and configure a device; a configure failure closes the handle again
pub fn open_configured(
    backend: &dyn CaptureBackend,
    device: &DeviceId,
    settings: &CaptureSettings,
) -> Result<Box<dyn CaptureDevice>, RelayError> {
    let mut handle = backend.open(device)?;
    if let Err(e) = handle.configure(settings) {
        if let Err(close_err) = handle.close() {
            log::debug!("Closing {} after failed configure: {}", device, close_err);
        }
        return Err(e);
    }
    Ok(handle)
}

/// Backend used by the service: device indices go to the physical camera
/// backend, paths and `file:` URIs to the still-image backend.
#[derive(Debug, Default)]
pub struct SystemBackend {
    still: StillImageBackend,
}

impl SystemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for SystemBackend {
    fn open(&self, device: &DeviceId) -> Result<Box<dyn CaptureDevice>, RelayError> {
        match device {
            DeviceId::Uri(_) => self.still.open(device),
            #[cfg(feature = "native-camera")]
            DeviceId::Index(_) => native::NativeBackend.open(device),
            #[cfg(not(feature = "native-camera"))]
            DeviceId::Index(_) => Err(RelayError::open_failure(
                device,
                "camera support not compiled in (enable the native-camera feature)",
            )),
        }
    }
}
