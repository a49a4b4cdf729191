//! ArUco marker detection. Pose uses the generic PnP solve against the configured square model.

use std::sync::Arc;

use image::GrayImage;
use video_ingest::{Frame, FrameStaticProperties};

use super::{CvPipeline, PipelineResult, kind_settings, replace_settings, solve_pnp_params};
use crate::{
    backend::{ArucoDetectorParams, VisionBackend},
    error::{ParamError, VisionError},
    pipe::{
        Pipe,
        fiducial::{ArucoDetectionParams, ArucoDetectionPipe},
        fps::CalculateFpsPipe,
        targets::SolvePnpPipe,
    },
    profile::{PipeProfile, profile_stages},
    settings::PipelineSettings,
    target::TrackedTarget,
};

profile_stages! {
    pub enum ArucoStage {
        Detect => "aruco_detect",
        SolvePnp => "solve_pnp",
    }
}

const LABEL: &str = "aruco";

pub struct ArucoPipeline {
    settings: PipelineSettings,
    detection: ArucoDetectionPipe,
    solve_pnp: SolvePnpPipe,
    props: Option<FrameStaticProperties>,
    fps: CalculateFpsPipe,
    profile: PipeProfile<ArucoStage>,
}

impl ArucoPipeline {
    pub fn new(settings: PipelineSettings, backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            settings,
            detection: ArucoDetectionPipe::new(Arc::clone(&backend)),
            solve_pnp: SolvePnpPipe::new(backend),
            props: None,
            fps: CalculateFpsPipe::default(),
            profile: PipeProfile::new(),
        }
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<TrackedTarget>, VisionError> {
        let detections = self.detection.run(image)?;
        self.profile.record(ArucoStage::Detect, detections.nanos);

        let Some(props) = self.props.as_ref() else {
            return Ok(Vec::new());
        };
        let targets: Vec<TrackedTarget> = detections
            .output
            .iter()
            .map(|detection| TrackedTarget::from_fiducial(detection, None, props))
            .collect();

        if !self.settings.base.solve_pnp_enabled {
            self.profile.skip(ArucoStage::SolvePnp);
            return Ok(targets);
        }
        let targets = self.solve_pnp.run(targets)?;
        self.profile.record(ArucoStage::SolvePnp, targets.nanos);
        Ok(targets.output)
    }
}

impl CvPipeline for ArucoPipeline {
    fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn set_settings(&mut self, settings: PipelineSettings) -> Result<(), VisionError> {
        replace_settings(&mut self.settings, settings)
    }

    fn set_pipe_params(&mut self, props: &FrameStaticProperties) -> Result<(), VisionError> {
        let kind = kind_settings!(self.settings, Aruco)?;

        self.detection.set_params(ArucoDetectionParams {
            detector: ArucoDetectorParams {
                dictionary: kind.dictionary,
                threshold_window: kind.threshold_window,
                threshold_step: kind.threshold_step,
                threshold_constant: kind.threshold_constant,
                corner_refinement: kind.corner_refinement,
            },
        })?;

        if self.settings.base.solve_pnp_enabled
            && self.settings.base.target_model.square_side_m().is_none()
        {
            return Err(ParamError::OutOfRange {
                stage: "solve pnp",
                field: "target_model",
                constraint: "square marker model",
                value: 0.0,
            }
            .into());
        }
        self.solve_pnp.set_params(solve_pnp_params(&self.settings, props))?;
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
}
