//! Image-processing backend seam.
//!
//! Pipes never call a vision library directly; they go through [`VisionBackend`]. The
//! production implementation is the OpenCV backend (feature `with-opencv`). Builds without it
//! have no backend, and callers supply their own.

#[cfg(feature = "with-opencv")]
pub mod opencv;
#[cfg(test)]
pub(crate) mod software;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use video_ingest::CameraCalibration;

use crate::{
    error::BackendError,
    geometry::{Contour, Point, Transform3d, Translation3},
};

#[cfg(feature = "with-opencv")]
pub use self::opencv::OpenCvBackend;
#[cfg(test)]
pub(crate) use software::SoftwareBackend;

/// Object/image correspondences for a perspective-n-point solve.
#[derive(Clone, Copy, Debug)]
pub struct PnpRequest<'a> {
    /// Model points in metres, in the target's own frame.
    pub object_points: &'a [Translation3],
    /// Matching image points in pixels, same order as `object_points`.
    pub image_points: &'a [Point],
    /// Intrinsics and distortion of the camera that saw `image_points`.
    pub calibration: &'a CameraCalibration,
}

/// Pose of a target in the camera optical frame, with the alternate solution planar targets
/// admit and the ratio of their reprojection errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PnpResult {
    /// Camera-to-target transform with the lower reprojection error.
    pub best: Transform3d,
    /// RMS reprojection error of `best`, in pixels.
    pub best_reprojection_error: f64,
    /// Second solution, when the solver reports one.
    pub alt: Option<Transform3d>,
    pub alt_reprojection_error: Option<f64>,
    /// `best` error over `alt` error; 0 when there is no alternate.
    pub ambiguity: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AprilTagFamily {
    /// 36-bit tags, minimum hamming distance 11.
    #[default]
    Tag36h11,
    /// 25-bit tags, minimum hamming distance 9.
    Tag25h9,
    /// 16-bit tags, minimum hamming distance 5.
    Tag16h5,
}

/// Tuning passed straight to the AprilTag detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AprilTagDetectorParams {
    /// Tag family to decode.
    pub family: AprilTagFamily,
    /// Quad detection runs on an image downscaled by this factor (>= 1).
    pub decimate: f64,
    /// Gaussian blur sigma applied before quad detection; 0 disables it.
    pub blur: f64,
    /// Detector worker threads.
    pub threads: u32,
    /// Snap quad edges to strong gradients after decimation.
    pub refine_edges: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArucoDictionary {
    /// 4x4 bits, 50 markers.
    Dict4x4_50,
    /// 5x5 bits, 100 markers.
    Dict5x5_100,
    /// 6x6 bits, 250 markers.
    Dict6x6_250,
    /// AprilTag 36h11 decoded by the ArUco detector.
    #[default]
    AprilTag36h11,
    AprilTag16h5,
}

/// Tuning passed straight to the ArUco detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArucoDetectorParams {
    /// Marker dictionary to decode.
    pub dictionary: ArucoDictionary,
    /// Smallest and largest adaptive threshold window, in pixels.
    pub threshold_window: (u32, u32),
    /// Window size increment between adaptive threshold passes.
    pub threshold_step: u32,
    /// Constant subtracted from the local mean in adaptive thresholding.
    pub threshold_constant: f64,
    /// Refine marker corners to sub-pixel accuracy.
    pub corner_refinement: bool,
}

/// A decoded fiducial. Corners run counter-clockwise from the bottom-left in image space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagDetection {
    /// Decoded marker id.
    pub id: i32,
    /// Bits corrected during decoding.
    pub hamming: u32,
    /// Detector confidence; higher is better. Backends without one report a large constant.
    pub decision_margin: f64,
    /// Tag centre in pixels.
    pub center: Point,
    pub corners: [Point; 4],
}

/// Inputs that determine a tag pose estimator. Equal configs produce equivalent estimators,
/// so a change to any field, distortion included, forces a rebuild.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagPoseConfig {
    /// Edge length of the tag's black border, in metres.
    pub tag_size_m: f64,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Lens distortion in OpenCV order (k1, k2, p1, p2, k3, ...). Detected corners are
    /// undistorted with these before the pose is estimated.
    pub dist_coeffs: Vec<f64>,
}

impl TagPoseConfig {
    pub fn from_calibration(tag_size_m: f64, calibration: &CameraCalibration) -> Self {
        Self {
            tag_size_m,
            fx: calibration.fx(),
            fy: calibration.fy(),
            cx: calibration.cx(),
            cy: calibration.cy(),
            dist_coeffs: calibration.dist_coeffs.clone(),
        }
    }

    /// The camera model this estimator solves against.
    pub fn calibration(&self, resolution: (u32, u32)) -> CameraCalibration {
        CameraCalibration {
            resolution,
            camera_intrinsics: [self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0],
            dist_coeffs: self.dist_coeffs.clone(),
            reprojection_error: None,
        }
    }

    /// Tag corners in the tag frame, matching [`TagDetection::corners`] order.
    pub fn object_points(&self) -> [Translation3; 4] {
        let half = self.tag_size_m / 2.0;
        [
            Translation3::new(-half, -half, 0.0),
            Translation3::new(half, -half, 0.0),
            Translation3::new(half, half, 0.0),
            Translation3::new(-half, half, 0.0),
        ]
    }
}

/// A configured pose estimator. Holding one may pin backend resources; drop it to release.
pub trait TagPoseEstimator: Send {
    fn estimate(&mut self, detection: &TagDetection, iterations: u32)
    -> Result<PnpResult, BackendError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardKind {
    #[default]
    Chessboard,
}

/// Calibration target. `columns` and `rows` count inner corners.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardParams {
    pub kind: BoardKind,
    pub columns: u32,
    pub rows: u32,
    pub square_size_m: f64,
}

impl BoardParams {
    pub fn corner_count(&self) -> usize {
        (self.columns * self.rows) as usize
    }

    pub fn object_points(&self) -> Vec<Translation3> {
        let mut points = Vec::with_capacity(self.corner_count());
        for row in 0..self.rows {
            for col in 0..self.columns {
                points.push(Translation3::new(
                    col as f64 * self.square_size_m,
                    row as f64 * self.square_size_m,
                    0.0,
                ));
            }
        }
        points
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub image_size: (u32, u32),
    pub corners: Vec<Point>,
}

/// Vision primitives the pipes are built from.
pub trait VisionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Outer contours of the non-zero regions of a binary mask.
    fn find_contours(&self, mask: &GrayImage) -> Result<Vec<Contour>, BackendError>;

    /// Closed-polygon simplification with maximum deviation `epsilon` pixels.
    fn approx_polygon(&self, contour: &Contour, epsilon: f64) -> Result<Contour, BackendError>;

    fn solve_pnp(&self, request: &PnpRequest<'_>) -> Result<PnpResult, BackendError>;

    fn detect_apriltags(
        &self,
        image: &GrayImage,
        params: &AprilTagDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError>;

    fn tag_pose_estimator(
        &self,
        config: &TagPoseConfig,
    ) -> Result<Box<dyn TagPoseEstimator>, BackendError>;

    fn detect_aruco(
        &self,
        image: &GrayImage,
        params: &ArucoDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError>;

    /// Inner chessboard corners in row-major order, or `None` when the board is not visible.
    fn find_board_corners(
        &self,
        image: &GrayImage,
        board: &BoardParams,
    ) -> Result<Option<Vec<Point>>, BackendError>;

    fn calibrate_camera(
        &self,
        snapshots: &[BoardSnapshot],
        board: &BoardParams,
    ) -> Result<CameraCalibration, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(dist_coeffs: Vec<f64>) -> CameraCalibration {
        CameraCalibration {
            resolution: (640, 480),
            camera_intrinsics: [500.0, 0.0, 320.0, 0.0, 510.0, 240.0, 0.0, 0.0, 1.0],
            dist_coeffs,
            reprojection_error: None,
        }
    }

    #[test]
    fn tag_pose_config_keeps_lens_distortion() {
        let plain = TagPoseConfig::from_calibration(0.165, &camera(Vec::new()));
        let distorted = TagPoseConfig::from_calibration(0.165, &camera(vec![-0.3, 0.1, 0.0, 0.0]));
        assert_ne!(plain, distorted);

        let rebuilt = distorted.calibration((640, 480));
        assert_eq!(rebuilt.dist_coeffs, vec![-0.3, 0.1, 0.0, 0.0]);
        assert_eq!(rebuilt.camera_intrinsics, camera(Vec::new()).camera_intrinsics);
    }
}
