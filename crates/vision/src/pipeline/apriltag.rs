//! AprilTag detection with optional per-tag pose.

use std::sync::Arc;

use image::GrayImage;
use tracing::warn;
use video_ingest::{Frame, FrameStaticProperties};

use super::{CvPipeline, PipelineResult, kind_settings, replace_settings};
use crate::{
    backend::{AprilTagDetectorParams, TagPoseConfig, VisionBackend},
    error::{ParamError, VisionError},
    pipe::{
        Pipe, Releasable,
        fiducial::{
            AprilTagDetectionParams, AprilTagDetectionPipe, AprilTagPoseEstimatorParams,
            AprilTagPoseEstimatorPipe,
        },
        fps::CalculateFpsPipe,
    },
    profile::{PipeProfile, profile_stages},
    settings::PipelineSettings,
    target::TrackedTarget,
};

profile_stages! {
    pub enum AprilTagStage {
        Detect => "apriltag_detect",
        PoseEstimate => "pose_estimate",
    }
}

const LABEL: &str = "apriltag";

pub struct AprilTagPipeline {
    settings: PipelineSettings,
    detection: AprilTagDetectionPipe,
    pose_estimator: AprilTagPoseEstimatorPipe,
    /// Pose runs only when the pipe received parameters for this frame.
    pose_configured: bool,
    warned_uncalibrated: bool,
    props: Option<FrameStaticProperties>,
    fps: CalculateFpsPipe,
    profile: PipeProfile<AprilTagStage>,
}

impl AprilTagPipeline {
    pub fn new(settings: PipelineSettings, backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            settings,
            detection: AprilTagDetectionPipe::new(Arc::clone(&backend)),
            pose_estimator: AprilTagPoseEstimatorPipe::new(backend),
            pose_configured: false,
            warned_uncalibrated: false,
            props: None,
            fps: CalculateFpsPipe::default(),
            profile: PipeProfile::new(),
        }
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<TrackedTarget>, VisionError> {
        let detections = self.detection.run(image)?;
        self.profile.record(AprilTagStage::Detect, detections.nanos);

        let Some(props) = self.props.as_ref() else {
            return Ok(Vec::new());
        };

        let mut targets = Vec::with_capacity(detections.output.len());
        for detection in &detections.output {
            let pose = if self.pose_configured {
                let estimate = self.pose_estimator.run(detection)?;
                self.profile.add(AprilTagStage::PoseEstimate, estimate.nanos);
                Some(estimate.output)
            } else {
                None
            };
            targets.push(TrackedTarget::from_fiducial(detection, pose, props));
        }
        Ok(targets)
    }
}

impl CvPipeline for AprilTagPipeline {
    fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn set_settings(&mut self, settings: PipelineSettings) -> Result<(), VisionError> {
        replace_settings(&mut self.settings, settings)
    }

    fn set_pipe_params(&mut self, props: &FrameStaticProperties) -> Result<(), VisionError> {
        let kind = kind_settings!(self.settings, AprilTag)?;
        let base = &self.settings.base;

        self.detection.set_params(AprilTagDetectionParams {
            detector: AprilTagDetectorParams {
                family: kind.tag_family,
                decimate: kind.decimate,
                blur: kind.blur,
                threads: kind.threads,
                refine_edges: kind.refine_edges,
            },
            max_hamming: kind.hamming_dist,
            min_decision_margin: kind.decision_margin,
        })?;

        self.pose_configured = false;
        if base.solve_pnp_enabled {
            let tag_size = base.target_model.square_side_m().ok_or(ParamError::OutOfRange {
                stage: "apriltag pose",
                field: "target_model",
                constraint: "square tag model",
                value: 0.0,
            })?;
            match props.calibration.as_ref() {
                Some(calibration) => {
                    self.pose_estimator.set_params(AprilTagPoseEstimatorParams {
                        config: TagPoseConfig::from_calibration(tag_size, calibration),
                        iterations: kind.num_iterations,
                    })?;
                    self.pose_configured = true;
                    self.warned_uncalibrated = false;
                }
                None if !self.warned_uncalibrated => {
                    warn!("3D mode enabled but the camera has no calibration for this resolution");
                    self.warned_uncalibrated = true;
                }
                None => {}
            }
        }
        self.props = Some(props.clone());
        Ok(())
    }

    fn process(&mut self, frame: Frame) -> Result<PipelineResult, VisionError> {
        self.profile.reset();
        let targets = match frame.processed.as_gray() {
            Some(image) => self.detect(image)?,
            None => Vec::new(),
        };
        self.profile.emit_metrics(LABEL);

        Ok(PipelineResult {
            sequence_id: frame.sequence_id,
            pipeline_type: self.pipeline_type(),
            processing_nanos: self.profile.total_nanos(),
            fps: self.fps.process(())?,
            targets,
            profile: self.profile.snapshot(LABEL),
            frame,
        })
    }

    fn release(&mut self) {
        self.pose_estimator.release();
    }
}
