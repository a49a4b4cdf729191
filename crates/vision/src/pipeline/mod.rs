//! Pipelines: ordered pipe chains that turn one [`Frame`] into one [`PipelineResult`].
//!
//! Every pipeline owns its pipes and its [`PipelineSettings`]. Before each frame
//! [`CvPipeline::set_pipe_params`] rebuilds every pipe's parameters from the settings and the
//! frame's static properties, so a settings replacement between frames is always picked up in
//! full.

pub mod apriltag;
pub mod aruco;
pub mod calibration;
pub mod colored_shape;
pub mod driver_mode;
pub mod output_stream;
pub mod reflective;

use std::sync::Arc;

use tracing::trace;
use video_ingest::{Frame, FrameStaticProperties, FrameThresholdType};

use crate::{
    backend::VisionBackend,
    error::VisionError,
    pipe::{
        contours::SortContoursParams,
        targets::{CornerDetectionParams, SolvePnpParams},
    },
    profile::ProfileSnapshot,
    settings::{PipelineSettings, PipelineType},
    target::{MAX_MULTI_TARGET_RESULTS, TargetCalculationParams, TrackedTarget},
};

pub use self::{
    apriltag::AprilTagPipeline, aruco::ArucoPipeline, calibration::CalibrationPipeline,
    colored_shape::ColoredShapePipeline, driver_mode::DriverModePipeline,
    output_stream::{OutputStreamPipeline, OutputStreamResult},
    reflective::ReflectivePipeline,
};

/// Output of one pipeline invocation. Owns the source frame so the output stream can draw on it
/// and the caller can release it.
#[derive(Debug)]
pub struct PipelineResult {
    pub sequence_id: u64,
    pub pipeline_type: PipelineType,
    /// Sum of the stage timings.
    pub processing_nanos: u64,
    pub fps: f64,
    pub targets: Vec<TrackedTarget>,
    pub profile: ProfileSnapshot,
    pub frame: Frame,
}

impl PipelineResult {
    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn latency_millis(&self) -> f64 {
        self.processing_nanos as f64 / 1e6
    }
}

pub trait CvPipeline: Send {
    fn settings(&self) -> &PipelineSettings;

    /// Replace the settings wholesale. The new settings must be of this pipeline's kind.
    fn set_settings(&mut self, settings: PipelineSettings) -> Result<(), VisionError>;

    fn pipeline_type(&self) -> PipelineType {
        self.settings().pipeline_type()
    }

    fn threshold_type(&self) -> FrameThresholdType {
        self.pipeline_type().threshold_type()
    }

    /// Rebuild every pipe's parameters from the current settings.
    fn set_pipe_params(&mut self, props: &FrameStaticProperties) -> Result<(), VisionError>;

    fn process(&mut self, frame: Frame) -> Result<PipelineResult, VisionError>;

    /// Apply parameters, process the frame and publish timing metrics.
    fn run(&mut self, frame: Frame) -> Result<PipelineResult, VisionError> {
        let label = self.pipeline_type().label();
        let _span = tracing::info_span!(
            "pipeline.process",
            sequence_id = frame.sequence_id,
            pipeline = label
        )
        .entered();

        let props = Arc::clone(&frame.static_properties);
        self.set_pipe_params(&props)?;
        let result = self.process(frame)?;

        metrics::histogram!("vision_pipeline_latency_seconds", "pipeline" => label)
            .record(result.processing_nanos as f64 / 1e9);
        metrics::gauge!("vision_pipeline_fps", "pipeline" => label).set(result.fps);
        trace!(
            targets = result.targets.len(),
            profile = %result.profile.summary(),
            "pipeline frame complete"
        );
        Ok(result)
    }

    /// Drop backend resources held by the pipes.
    fn release(&mut self) {}
}

/// Instantiate the pipeline for `settings`' kind.
pub fn build(settings: PipelineSettings, backend: Arc<dyn VisionBackend>) -> Box<dyn CvPipeline> {
    match settings.pipeline_type() {
        PipelineType::Reflective => Box::new(ReflectivePipeline::new(settings, backend)),
        PipelineType::ColoredShape => Box::new(ColoredShapePipeline::new(settings, backend)),
        PipelineType::AprilTag => Box::new(AprilTagPipeline::new(settings, backend)),
        PipelineType::Aruco => Box::new(ArucoPipeline::new(settings, backend)),
        PipelineType::DriverMode => Box::new(DriverModePipeline::new(settings)),
        PipelineType::Calib3d => Box::new(CalibrationPipeline::new(settings, backend)),
    }
}

/// Check that `settings` configures every stage of its pipeline kind, without touching any
/// running pipeline.
pub fn validate_settings(
    settings: &PipelineSettings,
    backend: Arc<dyn VisionBackend>,
    props: &FrameStaticProperties,
) -> Result<(), VisionError> {
    build(settings.clone(), backend).set_pipe_params(props)
}

pub(crate) fn replace_settings(
    current: &mut PipelineSettings,
    settings: PipelineSettings,
) -> Result<(), VisionError> {
    if settings.pipeline_type() != current.pipeline_type() {
        return Err(kind_mismatch(current.pipeline_type(), &settings));
    }
    *current = settings;
    Ok(())
}

pub(crate) fn kind_mismatch(expected: PipelineType, settings: &PipelineSettings) -> VisionError {
    VisionError::InvalidRequest(format!(
        "{} pipeline cannot take {} settings",
        expected.label(),
        settings.pipeline_type().label()
    ))
}

pub(crate) fn target_calculation_params(
    settings: &PipelineSettings,
    props: &FrameStaticProperties,
) -> TargetCalculationParams {
    let base = &settings.base;
    TargetCalculationParams {
        offset_mode: base.offset_robot_offset_mode,
        single_offset: base.offset_single_point,
        dual_offset: base.offset_dual,
        offset_point_edge: base.contour_target_offset_point_edge,
        orientation: base.contour_target_orientation,
        props: props.clone(),
    }
}

pub(crate) fn sort_params(
    settings: &PipelineSettings,
    props: &FrameStaticProperties,
) -> SortContoursParams {
    SortContoursParams {
        mode: settings.base.contour_sort_mode,
        max_targets: if settings.base.output_show_multiple_targets {
            MAX_MULTI_TARGET_RESULTS
        } else {
            1
        },
        props: props.clone(),
    }
}

pub(crate) fn corner_params(settings: &PipelineSettings) -> CornerDetectionParams {
    let base = &settings.base;
    CornerDetectionParams {
        strategy: base.corner_detection_strategy,
        use_convex_hulls: base.corner_detection_use_convex_hulls,
        exact_side_count: base.corner_detection_exact_side_count,
        side_count: base.corner_detection_side_count,
        accuracy_percentage: base.corner_detection_accuracy_percentage,
    }
}

pub(crate) fn solve_pnp_params(
    settings: &PipelineSettings,
    props: &FrameStaticProperties,
) -> SolvePnpParams {
    SolvePnpParams {
        calibration: props.calibration.clone(),
        target_model: settings.base.target_model,
    }
}

/// Kind-specific settings of a pipeline, or a mismatch error.
macro_rules! kind_settings {
    ($settings:expr, $variant:ident) => {
        match &$settings.kind {
            $crate::settings::KindSettings::$variant(kind) => Ok(kind),
            _ => Err($crate::pipeline::kind_mismatch(
                $crate::settings::PipelineType::$variant,
                &$settings,
            )),
        }
    };
}

pub(crate) use kind_settings;
