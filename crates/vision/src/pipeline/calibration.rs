//! Camera calibration from chessboard snapshots.
//!
//! The pipeline shows the detected board every frame. A requested snapshot is taken from the
//! next frame in which the full board is visible. Finishing a session hands every snapshot of
//! the latest resolution to the backend solver.

use std::sync::Arc;

use image::GrayImage;
use tracing::{debug, info};
use video_ingest::{CameraCalibration, Frame, FrameStaticProperties};

use super::{CvPipeline, PipelineResult, kind_settings, replace_settings};
use crate::{
    backend::{BoardSnapshot, VisionBackend},
    error::{ParamError, VisionError},
    geometry::{Contour, Point},
    pipe::{
        Pipe,
        calibration::{FindBoardCornersParams, FindBoardCornersPipe},
        fps::CalculateFpsPipe,
    },
    profile::{PipeProfile, profile_stages},
    settings::PipelineSettings,
    target::TrackedTarget,
};

profile_stages! {
    pub enum CalibrationStage {
        FindBoardCorners => "find_board_corners",
    }
}

const LABEL: &str = "calib3d";

pub struct CalibrationPipeline {
    settings: PipelineSettings,
    backend: Arc<dyn VisionBackend>,
    find_corners: FindBoardCornersPipe,
    snapshots: Vec<BoardSnapshot>,
    snapshot_requested: bool,
    fps: CalculateFpsPipe,
    profile: PipeProfile<CalibrationStage>,
}

impl CalibrationPipeline {
    pub fn new(settings: PipelineSettings, backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            settings,
            find_corners: FindBoardCornersPipe::new(Arc::clone(&backend)),
            backend,
            snapshots: Vec::new(),
            snapshot_requested: false,
            fps: CalculateFpsPipe::default(),
            profile: PipeProfile::new(),
        }
    }

    /// Capture the board from the next frame that shows all of it.
    pub fn request_snapshot(&mut self) {
        self.snapshot_requested = true;
    }

    pub fn snapshots(&self) -> &[BoardSnapshot] {
        &self.snapshots
    }

    /// Start a new capture session, discarding anything left from an earlier one.
    pub fn begin_session(&mut self) {
        if !self.snapshots.is_empty() {
            debug!(discarded = self.snapshots.len(), "discarding stale calibration snapshots");
        }
        self.snapshots.clear();
        self.snapshot_requested = false;
    }

    /// End the session. Returns the solved calibration when enough snapshots were taken.
    pub fn finish_calibration(&mut self) -> Result<Option<CameraCalibration>, VisionError> {
        let kind = kind_settings!(self.settings, Calib3d)?.clone();
        let mut snapshots = std::mem::take(&mut self.snapshots);
        self.snapshot_requested = false;
        if snapshots.is_empty() {
            return Ok(None);
        }

        if let Some(latest) = snapshots.last().map(|s| s.image_size) {
            snapshots.retain(|s| s.image_size == latest);
        }
        if snapshots.len() < kind.min_snapshots {
            info!(
                snapshots = snapshots.len(),
                required = kind.min_snapshots,
                "calibration finished without enough snapshots"
            );
            return Ok(None);
        }

        let calibration = self.backend.calibrate_camera(&snapshots, &kind.board)?;
        info!(
            resolution = ?calibration.resolution,
            snapshots = snapshots.len(),
            reprojection_error = ?calibration.reprojection_error,
            "camera calibration complete"
        );
        Ok(Some(calibration))
    }

    fn detect(
        &mut self,
        image: &GrayImage,
        draw_all: bool,
    ) -> Result<Vec<TrackedTarget>, VisionError> {
        let corners = self.find_corners.run(image)?;
        self.profile.record(CalibrationStage::FindBoardCorners, corners.nanos);

        let mut targets = Vec::new();
        if let Some(corners) = corners.output {
            if self.snapshot_requested {
                self.snapshots.push(BoardSnapshot {
                    image_size: image.dimensions(),
                    corners: corners.clone(),
                });
                self.snapshot_requested = false;
                info!(count = self.snapshots.len(), "calibration snapshot taken");
            }
            targets.push(board_target(corners));
        }
        if draw_all {
            targets.extend(self.snapshots.iter().map(|s| board_target(s.corners.clone())));
        }
        Ok(targets)
    }
}

fn board_target(corners: Vec<Point>) -> TrackedTarget {
    TrackedTarget {
        contour: Contour::new(corners.clone()),
        corners,
        ..TrackedTarget::default()
    }
}

impl CvPipeline for CalibrationPipeline {
    fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn set_settings(&mut self, settings: PipelineSettings) -> Result<(), VisionError> {
        replace_settings(&mut self.settings, settings)
    }

    fn set_pipe_params(&mut self, _props: &FrameStaticProperties) -> Result<(), VisionError> {
        let kind = kind_settings!(self.settings, Calib3d)?;
        if kind.min_snapshots == 0 {
            return Err(
                ParamError::out_of_range("calibration", "min_snapshots", "x >= 1", 0.0).into(),
            );
        }
        self.find_corners
            .set_params(FindBoardCornersParams { board: kind.board })
    }

    fn process(&mut self, frame: Frame) -> Result<PipelineResult, VisionError> {
        self.profile.reset();
        let draw_all = kind_settings!(self.settings, Calib3d)?.draw_all_snapshots;
        let targets = match frame.processed.as_gray() {
            Some(image) => self.detect(image, draw_all)?,
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
