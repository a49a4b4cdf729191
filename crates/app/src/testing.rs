//! Backend for tests that exercise the session plumbing rather than detection.

use image::GrayImage;
use video_ingest::CameraCalibration;
use vision::{
    BackendError, VisionBackend,
    backend::{
        AprilTagDetectorParams, ArucoDetectorParams, BoardParams, BoardSnapshot, PnpRequest,
        PnpResult, TagDetection, TagPoseConfig, TagPoseEstimator,
    },
    geometry::{Contour, Point},
};

/// Sees nothing in any image and refuses every pose or calibration request.
pub struct FlatBackend;

fn unsupported(operation: &'static str) -> BackendError {
    BackendError::Unsupported {
        backend: "flat",
        operation,
    }
}

impl VisionBackend for FlatBackend {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn find_contours(&self, _mask: &GrayImage) -> Result<Vec<Contour>, BackendError> {
        Ok(Vec::new())
    }

    fn approx_polygon(&self, contour: &Contour, _epsilon: f64) -> Result<Contour, BackendError> {
        Ok(contour.clone())
    }

    fn solve_pnp(&self, _request: &PnpRequest<'_>) -> Result<PnpResult, BackendError> {
        Err(unsupported("solve_pnp"))
    }

    fn detect_apriltags(
        &self,
        _image: &GrayImage,
        _params: &AprilTagDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        Ok(Vec::new())
    }

    fn tag_pose_estimator(
        &self,
        _config: &TagPoseConfig,
    ) -> Result<Box<dyn TagPoseEstimator>, BackendError> {
        Err(unsupported("tag_pose_estimator"))
    }

    fn detect_aruco(
        &self,
        _image: &GrayImage,
        _params: &ArucoDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        Ok(Vec::new())
    }

    fn find_board_corners(
        &self,
        _image: &GrayImage,
        _board: &BoardParams,
    ) -> Result<Option<Vec<Point>>, BackendError> {
        Ok(None)
    }

    fn calibrate_camera(
        &self,
        _snapshots: &[BoardSnapshot],
        _board: &BoardParams,
    ) -> Result<CameraCalibration, BackendError> {
        Err(unsupported("calibrate_camera"))
    }
}
