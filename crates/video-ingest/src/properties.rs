//! Static camera description shared by every frame from one source.

use serde::{Deserialize, Serialize};

use crate::types::ImageRotationMode;

/// Intrinsic calibration for one capture resolution.
///
/// `camera_intrinsics` is the row-major 3x3 camera matrix `[fx 0 cx; 0 fy cy; 0 0 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub resolution: (u32, u32),
    pub camera_intrinsics: [f64; 9],
    pub dist_coeffs: Vec<f64>,
    #[serde(default)]
    pub reprojection_error: Option<f64>,
}

impl CameraCalibration {
    pub fn fx(&self) -> f64 {
        self.camera_intrinsics[0]
    }

    pub fn fy(&self) -> f64 {
        self.camera_intrinsics[4]
    }

    pub fn cx(&self) -> f64 {
        self.camera_intrinsics[2]
    }

    pub fn cy(&self) -> f64 {
        self.camera_intrinsics[5]
    }

    pub fn matches_resolution(&self, width: u32, height: u32) -> bool {
        self.resolution == (width, height)
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Intrinsics for the same lens after the image has been rotated clockwise.
    pub fn rotated(&self, mode: ImageRotationMode) -> Self {
        let (width, height) = (self.resolution.0 as f64, self.resolution.1 as f64);
        let (fx, fy, cx, cy) = (self.fx(), self.fy(), self.cx(), self.cy());
        let (resolution, fx, fy, cx, cy) = match mode {
            ImageRotationMode::Deg0 => return self.clone(),
            ImageRotationMode::Deg90 => (
                (self.resolution.1, self.resolution.0),
                fy,
                fx,
                height - 1.0 - cy,
                cx,
            ),
            ImageRotationMode::Deg180 => {
                (self.resolution, fx, fy, width - 1.0 - cx, height - 1.0 - cy)
            }
            ImageRotationMode::Deg270 => (
                (self.resolution.1, self.resolution.0),
                fy,
                fx,
                cy,
                width - 1.0 - cx,
            ),
        };
        Self {
            resolution,
            camera_intrinsics: [fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0],
            dist_coeffs: self.dist_coeffs.clone(),
            reprojection_error: self.reprojection_error,
        }
    }
}

/// Geometry derived once per camera mode and reused by every pipe that needs angles or areas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameStaticProperties {
    pub image_width: u32,
    pub image_height: u32,
    /// Diagonal field of view in degrees.
    pub fov: f64,
    pub image_area: f64,
    pub center_x: f64,
    pub center_y: f64,
    /// Horizontal and vertical field of view, in degrees.
    pub horizontal_fov: f64,
    pub vertical_fov: f64,
    pub horizontal_focal_length: f64,
    pub vertical_focal_length: f64,
    pub calibration: Option<CameraCalibration>,
}

impl FrameStaticProperties {
    /// Derive the static properties of a camera mode. A calibration whose resolution does not
    /// match the mode is ignored and the diagonal FOV is used instead.
    pub fn new(
        image_width: u32,
        image_height: u32,
        fov: f64,
        calibration: Option<CameraCalibration>,
    ) -> Self {
        let calibration =
            calibration.filter(|cal| cal.matches_resolution(image_width, image_height));
        let width = image_width as f64;
        let height = image_height as f64;

        let (center_x, center_y, horizontal_focal_length, vertical_focal_length) =
            match &calibration {
                Some(cal) => (cal.cx(), cal.cy(), cal.fx(), cal.fy()),
                None => {
                    let diagonal_view = fov.to_radians();
                    let diagonal_aspect = width.hypot(height);
                    let half_tan = (diagonal_view / 2.0).tan();
                    let horizontal_view = (half_tan * (width / diagonal_aspect)).atan() * 2.0;
                    let vertical_view = (half_tan * (height / diagonal_aspect)).atan() * 2.0;
                    (
                        width / 2.0 - 0.5,
                        height / 2.0 - 0.5,
                        width / (2.0 * (horizontal_view / 2.0).tan()),
                        height / (2.0 * (vertical_view / 2.0).tan()),
                    )
                }
            };

        let horizontal_fov = (2.0 * (width / (2.0 * horizontal_focal_length)).atan()).to_degrees();
        let vertical_fov = (2.0 * (height / (2.0 * vertical_focal_length)).atan()).to_degrees();

        Self {
            image_width,
            image_height,
            fov,
            image_area: width * height,
            center_x,
            center_y,
            horizontal_fov,
            vertical_fov,
            horizontal_focal_length,
            vertical_focal_length,
            calibration,
        }
    }

    /// Properties of the image after a clockwise rotation.
    pub fn rotated(&self, mode: ImageRotationMode) -> Self {
        if !mode.swaps_dimensions() && mode != ImageRotationMode::Deg180 {
            return self.clone();
        }
        let (width, height) = if mode.swaps_dimensions() {
            (self.image_height, self.image_width)
        } else {
            (self.image_width, self.image_height)
        };
        let calibration = self.calibration.as_ref().map(|cal| cal.rotated(mode));
        Self::new(width, height, self.fov, calibration)
    }
}
