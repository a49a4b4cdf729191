//! Still-image frame source, used for bench testing pipelines without a camera.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use image::RgbImage;
use tracing::debug;

use crate::{
    properties::{CameraCalibration, FrameStaticProperties},
    provider::{FrameProcessor, FrameProvider},
    threshold::HsvThreshold,
    types::{CaptureError, Frame, FrameThresholdType, ImageRotationMode},
};

/// Serves the same decoded image on every [`FrameProvider::get`] call.
pub struct FileFrameProvider {
    name: String,
    image: RgbImage,
    properties: Arc<FrameStaticProperties>,
    processor: FrameProcessor,
}

impl FileFrameProvider {
    pub fn open(
        path: impl AsRef<Path>,
        fov: f64,
        calibration: Option<CameraCalibration>,
    ) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|source| CaptureError::Decode {
                path: path.display().to_string(),
                source,
            })?
            .to_rgb8();
        debug!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "loaded still frame"
        );
        Ok(Self::from_image(display_name(path), image, fov, calibration))
    }

    pub fn from_image(
        name: impl Into<String>,
        image: RgbImage,
        fov: f64,
        calibration: Option<CameraCalibration>,
    ) -> Self {
        let properties = Arc::new(FrameStaticProperties::new(
            image.width(),
            image.height(),
            fov,
            calibration,
        ));
        Self {
            name: name.into(),
            image,
            properties,
            processor: FrameProcessor::new(),
        }
    }

    pub fn static_properties(&self) -> &Arc<FrameStaticProperties> {
        &self.properties
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

impl FrameProvider for FileFrameProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self) -> Result<Frame, CaptureError> {
        let timestamp_us = Utc::now().timestamp_micros();
        Ok(self
            .processor
            .process(self.image.clone(), timestamp_us, &self.properties))
    }

    fn request_frame_threshold_type(&mut self, threshold_type: FrameThresholdType) {
        self.processor.set_threshold_type(threshold_type);
    }

    fn request_hsv_settings(&mut self, threshold: HsvThreshold) {
        self.processor.set_hsv(threshold);
    }

    fn request_frame_rotation(&mut self, rotation: ImageRotationMode) {
        self.processor.set_rotation(rotation);
    }
}
