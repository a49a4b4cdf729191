//! AprilTag and ArUco detection plus per-tag pose estimation.

use std::sync::Arc;

use image::GrayImage;
use tracing::debug;

use super::{Pipe, Releasable, configured};
use crate::{
    backend::{
        AprilTagDetectorParams, ArucoDetectorParams, PnpResult, TagDetection, TagPoseConfig,
        TagPoseEstimator, VisionBackend,
    },
    error::{ParamError, VisionError},
};

#[derive(Clone, Debug, PartialEq)]
pub struct AprilTagDetectionParams {
    pub detector: AprilTagDetectorParams,
    pub max_hamming: u32,
    pub min_decision_margin: f64,
}

const APRILTAG: &str = "apriltag detection";

pub struct AprilTagDetectionPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<AprilTagDetectionParams>,
}

impl AprilTagDetectionPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
        }
    }
}

impl<'a> Pipe<&'a GrayImage> for AprilTagDetectionPipe {
    type Output = Vec<TagDetection>;
    type Params = AprilTagDetectionParams;

    fn set_params(&mut self, params: AprilTagDetectionParams) -> Result<(), VisionError> {
        let detector = &params.detector;
        if detector.decimate < 1.0 {
            return Err(
                ParamError::out_of_range(APRILTAG, "decimate", "x >= 1", detector.decimate).into(),
            );
        }
        if detector.blur < 0.0 {
            return Err(ParamError::out_of_range(APRILTAG, "blur", "x >= 0", detector.blur).into());
        }
        if detector.threads == 0 {
            return Err(ParamError::out_of_range(APRILTAG, "threads", "x >= 1", 0.0).into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, image: &'a GrayImage) -> Result<Vec<TagDetection>, VisionError> {
        let params = configured(&self.params, APRILTAG)?;
        let detections = self.backend.detect_apriltags(image, &params.detector)?;
        Ok(detections
            .into_iter()
            .filter(|d| {
                d.hamming <= params.max_hamming && d.decision_margin >= params.min_decision_margin
            })
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AprilTagPoseEstimatorParams {
    pub config: TagPoseConfig,
    pub iterations: u32,
}

/// Estimates one tag's pose. The wrapped estimator is rebuilt only when its configuration
/// changes, since per-frame parameter application would otherwise rebuild it every frame.
pub struct AprilTagPoseEstimatorPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<AprilTagPoseEstimatorParams>,
    estimator: Option<Box<dyn TagPoseEstimator>>,
}

const POSE: &str = "apriltag pose";

impl AprilTagPoseEstimatorPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
            estimator: None,
        }
    }
}

impl<'a> Pipe<&'a TagDetection> for AprilTagPoseEstimatorPipe {
    type Output = PnpResult;
    type Params = AprilTagPoseEstimatorParams;

    fn set_params(&mut self, params: AprilTagPoseEstimatorParams) -> Result<(), VisionError> {
        if params.config.tag_size_m <= 0.0 {
            return Err(
                ParamError::out_of_range(POSE, "tag_size_m", "x > 0", params.config.tag_size_m)
                    .into(),
            );
        }
        let unchanged = self
            .params
            .as_ref()
            .is_some_and(|current| current.config == params.config);
        if !unchanged && self.estimator.take().is_some() {
            debug!(config = ?params.config, "tag pose estimator configuration changed");
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, detection: &'a TagDetection) -> Result<PnpResult, VisionError> {
        let params = configured(&self.params, POSE)?;
        let mut estimator = match self.estimator.take() {
            Some(estimator) => estimator,
            None => self.backend.tag_pose_estimator(&params.config)?,
        };
        let result = estimator.estimate(detection, params.iterations);
        self.estimator = Some(estimator);
        Ok(result?)
    }
}

impl Releasable for AprilTagPoseEstimatorPipe {
    fn release(&mut self) {
        self.estimator = None;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArucoDetectionParams {
    pub detector: ArucoDetectorParams,
}

const ARUCO: &str = "aruco detection";

pub struct ArucoDetectionPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<ArucoDetectionParams>,
}

impl ArucoDetectionPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
        }
    }
}

impl<'a> Pipe<&'a GrayImage> for ArucoDetectionPipe {
    type Output = Vec<TagDetection>;
    type Params = ArucoDetectionParams;

    fn set_params(&mut self, params: ArucoDetectionParams) -> Result<(), VisionError> {
        let (min, max) = params.detector.threshold_window;
        if min < 3 {
            return Err(ParamError::out_of_range(ARUCO, "threshold_window.min", "x >= 3", min).into());
        }
        if min > max {
            return Err(ParamError::InvertedRange {
                stage: ARUCO,
                field: "threshold_window",
                min: min.into(),
                max: max.into(),
            }
            .into());
        }
        if params.detector.threshold_step == 0 {
            return Err(ParamError::out_of_range(ARUCO, "threshold_step", "x >= 1", 0.0).into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, image: &'a GrayImage) -> Result<Vec<TagDetection>, VisionError> {
        let params = configured(&self.params, ARUCO)?;
        Ok(self.backend.detect_aruco(image, &params.detector)?)
    }
}
