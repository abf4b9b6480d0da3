use super::{CaptureBackend, CaptureDevice};
use crate::errors::RelayError;
use crate::types::{CameraFrame, CaptureSettings, DeviceId, PixelFormat};
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{
        CameraFormat as NokhwaFormat, CameraIndex, FrameFormat, RequestedFormat,
        RequestedFormatType, Resolution,
    },
    CallbackCamera,
};

/// Physical cameras through nokhwa's native backend (V4L2, AVFoundation, Media Foundation)
#[derive(Debug, Default)]
pub struct NativeBackend;

impl CaptureBackend for NativeBackend {
    fn open(&self, device: &DeviceId) -> Result<Box<dyn CaptureDevice>, RelayError> {
        match device {
            DeviceId::Index(index) => Ok(Box::new(NativeCamera {
                device: device.clone(),
                index: *index,
                camera: None,
            })),
            DeviceId::Uri(_) => Err(RelayError::open_failure(
                device,
                "native backend only opens device indices",
            )),
        }
    }
}

/// Camera handle; the nokhwa stream is created by `configure`
pub struct NativeCamera {
    device: DeviceId,
    index: u32,
    camera: Option<CallbackCamera>,
}

fn frame_format(format: PixelFormat) -> FrameFormat {
    match format {
        PixelFormat::Mjpeg => FrameFormat::MJPEG,
        PixelFormat::Yuyv => FrameFormat::YUYV,
        PixelFormat::Rgb24 => FrameFormat::RAWRGB,
    }
}

impl CaptureDevice for NativeCamera {
    fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), RelayError> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            NokhwaFormat::new(
                Resolution::new(settings.width, settings.height),
                frame_format(settings.pixel_format),
                settings.fps,
            ),
        ));

        let mut camera = CallbackCamera::new(CameraIndex::Index(self.index), requested, |_| {})
            .map_err(|e| {
                RelayError::open_failure(&self.device, format!("Failed to initialize camera: {}", e))
            })?;

        camera.open_stream().map_err(|e| {
            RelayError::open_failure(&self.device, format!("Failed to start stream: {}", e))
        })?;

        // nokhwa keeps its own driver queue; buffer depth is advisory here
        log::debug!(
            "Camera {} streaming at {}x{}@{} {} (buffer depth {})",
            self.device,
            settings.width,
            settings.height,
            settings.fps,
            settings.pixel_format.as_str(),
            settings.buffer_depth
        );

        self.camera = Some(camera);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CameraFrame, RelayError> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| RelayError::read_failure(&self.device, "stream not open"))?;

        let buffer = camera
            .poll_frame()
            .map_err(|e| RelayError::read_failure(&self.device, format!("Failed to capture frame: {}", e)))?;

        let rgb = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| RelayError::read_failure(&self.device, format!("Failed to decode frame: {}", e)))?;

        let (width, height) = (rgb.width(), rgb.height());
        Ok(CameraFrame::new(rgb.into_raw(), width, height, self.device.to_string()))
    }

    fn close(&mut self) -> Result<(), RelayError> {
        match self.camera.take() {
            Some(mut camera) => camera
                .stop_stream()
                .map_err(|e| RelayError::TeardownError(format!("Failed to stop stream on {}: {}", self.device, e))),
            None => Ok(()),
        }
    }
}
