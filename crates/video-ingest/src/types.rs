use std::sync::Arc;

use image::{GrayImage, RgbImage, imageops};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::properties::FrameStaticProperties;

/// A single captured frame: the colour image, the thresholded image the active pipeline asked
/// for, and the static description of the camera that produced it.
///
/// Frames are handed through the pipeline by value. Whoever holds the frame last is responsible
/// for dropping or [`Frame::release`]-ing it.
#[derive(Clone, Debug)]
pub struct Frame {
    pub sequence_id: u64,
    pub timestamp_us: i64,
    pub color: FrameImage,
    pub processed: FrameImage,
    pub threshold_type: FrameThresholdType,
    pub static_properties: Arc<FrameStaticProperties>,
}

impl Frame {
    /// Frame with no pixel data, used when a provider has nothing to deliver yet.
    pub fn empty(sequence_id: u64, static_properties: Arc<FrameStaticProperties>) -> Self {
        Self {
            sequence_id,
            timestamp_us: 0,
            color: FrameImage::Empty,
            processed: FrameImage::Empty,
            threshold_type: FrameThresholdType::None,
            static_properties,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_empty() && self.processed.is_empty()
    }

    /// Drop both image buffers eagerly.
    pub fn release(&mut self) {
        self.color = FrameImage::Empty;
        self.processed = FrameImage::Empty;
    }
}

/// Pixel storage for a frame plane.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FrameImage {
    #[default]
    Empty,
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl FrameImage {
    pub fn is_empty(&self) -> bool {
        match self {
            FrameImage::Empty => true,
            FrameImage::Gray(image) => image.width() == 0 || image.height() == 0,
            FrameImage::Rgb(image) => image.width() == 0 || image.height() == 0,
        }
    }

    pub fn channels(&self) -> u8 {
        match self {
            FrameImage::Empty => 0,
            FrameImage::Gray(_) => 1,
            FrameImage::Rgb(_) => 3,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            FrameImage::Empty => (0, 0),
            FrameImage::Gray(image) => image.dimensions(),
            FrameImage::Rgb(image) => image.dimensions(),
        }
    }

    pub fn as_gray(&self) -> Option<&GrayImage> {
        match self {
            FrameImage::Gray(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_rgb(&self) -> Option<&RgbImage> {
        match self {
            FrameImage::Rgb(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_rgb_mut(&mut self) -> Option<&mut RgbImage> {
        match self {
            FrameImage::Rgb(image) => Some(image),
            _ => None,
        }
    }

    /// Expand a single-channel plane to three identical channels. Colour planes pass through.
    pub fn into_rgb(self) -> FrameImage {
        match self {
            FrameImage::Gray(gray) => {
                let (width, height) = gray.dimensions();
                let mut rgb = RgbImage::new(width, height);
                for (dst, src) in rgb.pixels_mut().zip(gray.pixels()) {
                    dst.0 = [src.0[0]; 3];
                }
                FrameImage::Rgb(rgb)
            }
            other => other,
        }
    }

    pub fn rotate(self, mode: ImageRotationMode) -> FrameImage {
        match (self, mode) {
            (image, ImageRotationMode::Deg0) => image,
            (FrameImage::Empty, _) => FrameImage::Empty,
            (FrameImage::Gray(image), mode) => FrameImage::Gray(rotate_buffer(&image, mode)),
            (FrameImage::Rgb(image), mode) => FrameImage::Rgb(rotate_buffer(&image, mode)),
        }
    }
}

fn rotate_buffer<P>(
    image: &image::ImageBuffer<P, Vec<u8>>,
    mode: ImageRotationMode,
) -> image::ImageBuffer<P, Vec<u8>>
where
    P: image::Pixel<Subpixel = u8> + 'static,
{
    match mode {
        ImageRotationMode::Deg0 => image.clone(),
        ImageRotationMode::Deg90 => imageops::rotate90(image),
        ImageRotationMode::Deg180 => imageops::rotate180(image),
        ImageRotationMode::Deg270 => imageops::rotate270(image),
    }
}

/// Which derived image the provider should attach to each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameThresholdType {
    #[default]
    None,
    Greyscale,
    Hsv,
}

/// Clockwise rotation applied to captured frames before processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRotationMode {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl ImageRotationMode {
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, ImageRotationMode::Deg90 | ImageRotationMode::Deg270)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to decode image {path:?}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("video source disconnected")]
    Disconnected,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
