//! Frame acquisition for the sightline vision stack: frame types, static camera geometry,
//! colour thresholding and the [`FrameProvider`] seam.

#[cfg(feature = "with-opencv")]
pub mod camera;
pub mod file;
pub mod properties;
pub mod provider;
pub mod threshold;
pub mod types;

#[cfg(feature = "with-opencv")]
pub use camera::CameraFrameProvider;
pub use file::FileFrameProvider;
pub use properties::{CameraCalibration, FrameStaticProperties};
pub use provider::{FrameProcessor, FrameProvider};
pub use threshold::HsvThreshold;
pub use types::{CaptureError, Frame, FrameImage, FrameThresholdType, ImageRotationMode};
