//! Still-image capture source
//!
//! Serves one decoded image file as an endless camera feed. Useful as a
//! last-resort failover candidate and for running the relay on machines
//! without camera hardware.

use bytes::Bytes;
use image::imageops::FilterType;
use image::RgbImage;

use super::{CaptureBackend, CaptureDevice};
use crate::errors::RelayError;
use crate::types::{CameraFrame, CaptureSettings, DeviceId};

#[derive(Debug, Default)]
pub struct StillImageBackend;

impl CaptureBackend for StillImageBackend {
    fn open(&self, device: &DeviceId) -> Result<Box<dyn CaptureDevice>, RelayError> {
        let path = device
            .as_path()
            .ok_or_else(|| RelayError::open_failure(device, "not an image path"))?;

        let image = image::open(path)
            .map_err(|e| RelayError::open_failure(device, format!("failed to decode image: {}", e)))?
            .to_rgb8();

        log::debug!(
            "Opened still image {} ({}x{})",
            path,
            image.width(),
            image.height()
        );

        Ok(Box::new(StillImageSource {
            device: device.clone(),
            source: image,
            frame: None,
        }))
    }
}

struct StillImageSource {
    device: DeviceId,
    source: RgbImage,
    /// Source resized to the configured resolution, set by `configure`
    frame: Option<(Bytes, u32, u32)>,
}

impl CaptureDevice for StillImageSource {
    fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), RelayError> {
        if settings.width == 0 || settings.height == 0 {
            return Err(RelayError::open_failure(&self.device, "zero resolution"));
        }

        let resized = if self.source.dimensions() == (settings.width, settings.height) {
            self.source.clone()
        } else {
            image::imageops::resize(
                &self.source,
                settings.width,
                settings.height,
                FilterType::Triangle,
            )
        };

        self.frame = Some((Bytes::from(resized.into_raw()), settings.width, settings.height));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CameraFrame, RelayError> {
        let (data, width, height) = self
            .frame
            .as_ref()
            .ok_or_else(|| RelayError::read_failure(&self.device, "source not configured"))?;

        Ok(CameraFrame::new(data.clone(), *width, *height, self.device.to_string()))
    }

    fn close(&mut self) -> Result<(), RelayError> {
        self.frame = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_image(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("still.png");
        let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn test_still_image_resized_to_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path());
        let id = DeviceId::Uri(format!("file:{}", path.display()));

        let mut source = StillImageBackend.open(&id).unwrap();
        let settings = CaptureSettings {
            width: 32,
            height: 16,
            ..CaptureSettings::default()
        };
        source.configure(&settings).unwrap();

        let frame = source.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
        assert_eq!(frame.size_bytes(), settings.rgb_frame_len());
        assert!(!frame.is_filler);
        assert_eq!(frame.data[0], 200);
    }

    #[test]
    fn test_read_before_configure_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path());
        let id = DeviceId::Uri(path.display().to_string());

        let mut source = StillImageBackend.open(&id).unwrap();
        assert!(matches!(
            source.read_frame(),
            Err(RelayError::FrameReadFailure { .. })
        ));
    }

    #[test]
    fn test_missing_image_fails_to_open() {
        let id = DeviceId::Uri("file:/definitely/not/here.png".to_string());
        assert!(matches!(
            StillImageBackend.open(&id),
            Err(RelayError::DeviceOpenFailure { .. })
        ));
    }
}
