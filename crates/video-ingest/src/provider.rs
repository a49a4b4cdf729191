//! The frame source seam and the shared per-frame preparation step.

use std::sync::Arc;

use image::RgbImage;

use crate::{
    properties::FrameStaticProperties,
    threshold::{HsvThreshold, rgb_to_gray},
    types::{CaptureError, Frame, FrameImage, FrameThresholdType, ImageRotationMode},
};

/// A source of frames. Implementations are driven by a single processing thread: the pipeline
/// manager requests a threshold type, HSV window and rotation, then pulls a frame with
/// [`FrameProvider::get`].
pub trait FrameProvider: Send {
    fn name(&self) -> &str;

    /// Block until the next frame is available.
    fn get(&mut self) -> Result<Frame, CaptureError>;

    fn request_frame_threshold_type(&mut self, threshold_type: FrameThresholdType);

    fn request_hsv_settings(&mut self, threshold: HsvThreshold);

    fn request_frame_rotation(&mut self, rotation: ImageRotationMode);

    fn is_connected(&self) -> bool {
        true
    }

    fn release(&mut self) {}
}

impl<P: FrameProvider + ?Sized> FrameProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get(&mut self) -> Result<Frame, CaptureError> {
        (**self).get()
    }

    fn request_frame_threshold_type(&mut self, threshold_type: FrameThresholdType) {
        (**self).request_frame_threshold_type(threshold_type)
    }

    fn request_hsv_settings(&mut self, threshold: HsvThreshold) {
        (**self).request_hsv_settings(threshold)
    }

    fn request_frame_rotation(&mut self, rotation: ImageRotationMode) {
        (**self).request_frame_rotation(rotation)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Turns a raw colour capture into a [`Frame`]: applies the requested rotation, derives the
/// requested processed plane and stamps a monotonically increasing sequence id.
#[derive(Debug, Default)]
pub struct FrameProcessor {
    next_sequence_id: u64,
    threshold_type: FrameThresholdType,
    hsv: HsvThreshold,
    rotation: ImageRotationMode,
    rotated_properties: Option<(ImageRotationMode, Arc<FrameStaticProperties>)>,
}

impl FrameProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold_type(&self) -> FrameThresholdType {
        self.threshold_type
    }

    pub fn set_threshold_type(&mut self, threshold_type: FrameThresholdType) {
        self.threshold_type = threshold_type;
    }

    pub fn set_hsv(&mut self, hsv: HsvThreshold) {
        self.hsv = hsv;
    }

    pub fn set_rotation(&mut self, rotation: ImageRotationMode) {
        self.rotation = rotation;
    }

    pub fn process(
        &mut self,
        color: RgbImage,
        timestamp_us: i64,
        properties: &Arc<FrameStaticProperties>,
    ) -> Frame {
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;

        let color = FrameImage::Rgb(color).rotate(self.rotation);
        let static_properties = self.properties_for_rotation(properties);

        let processed = match (&color, self.threshold_type) {
            (FrameImage::Rgb(rgb), FrameThresholdType::Hsv) => FrameImage::Gray(self.hsv.apply(rgb)),
            (FrameImage::Rgb(rgb), FrameThresholdType::Greyscale) => {
                FrameImage::Gray(rgb_to_gray(rgb))
            }
            (image, _) => image.clone(),
        };

        Frame {
            sequence_id,
            timestamp_us,
            color,
            processed,
            threshold_type: self.threshold_type,
            static_properties,
        }
    }

    fn properties_for_rotation(
        &mut self,
        properties: &Arc<FrameStaticProperties>,
    ) -> Arc<FrameStaticProperties> {
        if self.rotation == ImageRotationMode::Deg0 {
            return Arc::clone(properties);
        }
        if let Some((mode, cached)) = &self.rotated_properties {
            let source_dims = if mode.swaps_dimensions() {
                (cached.image_height, cached.image_width)
            } else {
                (cached.image_width, cached.image_height)
            };
            if *mode == self.rotation
                && source_dims == (properties.image_width, properties.image_height)
            {
                return Arc::clone(cached);
            }
        }
        let rotated = Arc::new(properties.rotated(self.rotation));
        self.rotated_properties = Some((self.rotation, Arc::clone(&rotated)));
        rotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn sequence_ids_increase_per_frame() {
        let props = Arc::new(FrameStaticProperties::new(4, 4, 70.0, None));
        let mut processor = FrameProcessor::new();
        let first = processor.process(solid(4, 4, [0, 0, 0]), 0, &props);
        let second = processor.process(solid(4, 4, [0, 0, 0]), 1, &props);
        assert_eq!(first.sequence_id + 1, second.sequence_id);
    }

    #[test]
    fn hsv_request_produces_binary_plane() {
        let props = Arc::new(FrameStaticProperties::new(2, 2, 70.0, None));
        let mut processor = FrameProcessor::new();
        processor.set_threshold_type(FrameThresholdType::Hsv);
        processor.set_hsv(HsvThreshold {
            hue: (50, 70),
            saturation: (100, 255),
            value: (100, 255),
            hue_inverted: false,
        });
        let frame = processor.process(solid(2, 2, [0, 255, 0]), 0, &props);
        let mask = frame.processed.as_gray().expect("mask");
        assert!(mask.pixels().all(|p| p.0 == [255]));
        assert_eq!(frame.threshold_type, FrameThresholdType::Hsv);
    }

    #[test]
    fn unthresholded_frames_carry_colour_copy() {
        let props = Arc::new(FrameStaticProperties::new(2, 2, 70.0, None));
        let mut processor = FrameProcessor::new();
        let frame = processor.process(solid(2, 2, [1, 2, 3]), 0, &props);
        assert_eq!(frame.processed, frame.color);
    }

    #[test]
    fn rotation_rotates_properties_with_image() {
        let props = Arc::new(FrameStaticProperties::new(8, 4, 70.0, None));
        let mut processor = FrameProcessor::new();
        processor.set_rotation(ImageRotationMode::Deg270);
        let frame = processor.process(solid(8, 4, [0, 0, 0]), 0, &props);
        assert_eq!(frame.color.dimensions(), (4, 8));
        assert_eq!(frame.static_properties.image_width, 4);
        let again = processor.process(solid(8, 4, [0, 0, 0]), 1, &props);
        assert!(Arc::ptr_eq(&frame.static_properties, &again.static_properties));
    }
}
