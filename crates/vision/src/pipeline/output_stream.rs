//! Prepares a processed frame for streaming: downscales both planes and draws the overlays that
//! match the active pipeline kind.

use std::sync::Arc;

use video_ingest::{Frame, FrameStaticProperties};

use crate::{
    error::VisionError,
    pipe::{
        Pipe,
        draw::{
            Draw2dCrosshairParams, Draw2dCrosshairPipe, Draw2dFiducialsParams, Draw2dFiducialsPipe,
            Draw2dTargetsParams, Draw2dTargetsPipe, Draw3dTargetsParams, Draw3dTargetsPipe,
            DrawCalibrationParams, DrawCalibrationPipe,
        },
        fps::CalculateFpsPipe,
        output::{OutputMatPipe, ResizeImagePipe},
    },
    profile::{PipeProfile, ProfileSnapshot, profile_stages},
    settings::{PipelineSettings, PipelineType},
    target::TrackedTarget,
};

profile_stages! {
    pub enum OutputStage {
        ResizeInput => "resize_input",
        ResizeOutput => "resize_output",
        OutputMat => "output_mat",
        CrosshairInput => "crosshair_input",
        CrosshairOutput => "crosshair_output",
        Targets2d => "targets_2d",
        Targets3d => "targets_3d",
        AprilTags2d => "apriltags_2d",
        AprilTags3d => "apriltags_3d",
        Aruco2d => "aruco_2d",
        Aruco3d => "aruco_3d",
        Calibration => "calibration",
    }
}

const LABEL: &str = "output_stream";

#[derive(Clone, Debug, PartialEq)]
pub struct OutputStreamResult {
    pub sequence_id: u64,
    pub processing_nanos: u64,
    pub fps: f64,
    pub profile: ProfileSnapshot,
}

#[derive(Default)]
pub struct OutputStreamPipeline {
    resize: ResizeImagePipe,
    output_mat: OutputMatPipe,
    crosshair: Draw2dCrosshairPipe,
    targets_2d: Draw2dTargetsPipe,
    targets_3d: Draw3dTargetsPipe,
    apriltags_2d: Draw2dFiducialsPipe,
    apriltags_3d: Draw3dTargetsPipe,
    aruco_2d: Draw2dFiducialsPipe,
    aruco_3d: Draw3dTargetsPipe,
    calibration: DrawCalibrationPipe,
    fps: CalculateFpsPipe,
    profile: PipeProfile<OutputStage>,
}

impl OutputStreamPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_pipe_params(
        &mut self,
        settings: &PipelineSettings,
        props: &FrameStaticProperties,
    ) -> Result<(), VisionError> {
        let base = &settings.base;
        let divisor = base.streaming_frame_divisor.value();
        let draw = base.output_should_draw;
        let multiple = base.output_show_multiple_targets;
        let draw_3d = |label_ids| Draw3dTargetsParams {
            should_draw: draw,
            show_multiple: multiple,
            calibration: props.calibration.clone(),
            outline: base.target_model.vertices(),
            depth_m: base.target_model.overlay_depth_m(),
            label_ids,
            divisor,
        };
        let draw_fiducials = Draw2dFiducialsParams {
            should_draw: draw,
            show_multiple: multiple,
            divisor,
        };

        self.resize.set_params(base.streaming_frame_divisor.into())?;
        self.output_mat.set_params(())?;
        self.crosshair.set_params(Draw2dCrosshairParams {
            should_draw: draw,
            offset_mode: base.offset_robot_offset_mode,
            single_offset: base.offset_single_point,
            dual_offset: base.offset_dual,
            props: props.clone(),
            divisor,
        })?;
        self.targets_2d.set_params(Draw2dTargetsParams {
            should_draw: draw,
            show_multiple: multiple,
            divisor,
        })?;
        self.targets_3d.set_params(draw_3d(false))?;
        self.apriltags_2d.set_params(draw_fiducials.clone())?;
        self.apriltags_3d.set_params(draw_3d(true))?;
        self.aruco_2d.set_params(draw_fiducials)?;
        self.aruco_3d.set_params(draw_3d(true))?;
        self.calibration.set_params(DrawCalibrationParams { divisor })?;
        Ok(())
    }

    /// Draw `targets` onto `frame` in place. The colour plane gets the crosshair; the processed
    /// plane is expanded to colour and gets the kind-specific overlay.
    pub fn process(
        &mut self,
        frame: &mut Frame,
        settings: &PipelineSettings,
        targets: &[TrackedTarget],
    ) -> Result<OutputStreamResult, VisionError> {
        let _span = tracing::debug_span!("output_stream.process", sequence_id = frame.sequence_id)
            .entered();
        self.profile.reset();
        let props = Arc::clone(&frame.static_properties);
        self.set_pipe_params(settings, &props)?;

        let profile = &mut self.profile;
        if !frame.color.is_empty() {
            let resized = self.resize.run(&mut frame.color)?;
            profile.record(OutputStage::ResizeInput, resized.nanos);
        }

        if !frame.processed.is_empty() {
            let resized = self.resize.run(&mut frame.processed)?;
            profile.record(OutputStage::ResizeOutput, resized.nanos);

            if frame.processed.channels() == 1 {
                let expanded = self.output_mat.run(&mut frame.processed)?;
                profile.record(OutputStage::OutputMat, expanded.nanos);
            }

            if let Some(input) = frame.color.as_rgb_mut() {
                let drawn = self.crosshair.run((input, targets))?;
                profile.record(OutputStage::CrosshairInput, drawn.nanos);
            }

            if let Some(output) = frame.processed.as_rgb_mut() {
                let solve_pnp = settings.base.solve_pnp_enabled;
                match settings.pipeline_type() {
                    PipelineType::Reflective
                    | PipelineType::ColoredShape
                    | PipelineType::DriverMode => {
                        let drawn = self.crosshair.run((&mut *output, targets))?;
                        profile.record(OutputStage::CrosshairOutput, drawn.nanos);
                        if solve_pnp {
                            let drawn = self.targets_3d.run((output, targets))?;
                            profile.record(OutputStage::Targets3d, drawn.nanos);
                        } else {
                            let drawn = self.targets_2d.run((output, targets))?;
                            profile.record(OutputStage::Targets2d, drawn.nanos);
                        }
                    }
                    PipelineType::Calib3d => {
                        let drawn = self.calibration.run((output, targets))?;
                        profile.record(OutputStage::Calibration, drawn.nanos);
                    }
                    PipelineType::AprilTag if solve_pnp => {
                        let drawn = self.apriltags_3d.run((output, targets))?;
                        profile.record(OutputStage::AprilTags3d, drawn.nanos);
                    }
                    PipelineType::AprilTag => {
                        let drawn = self.apriltags_2d.run((output, targets))?;
                        profile.record(OutputStage::AprilTags2d, drawn.nanos);
                    }
                    PipelineType::Aruco if solve_pnp => {
                        let drawn = self.aruco_3d.run((output, targets))?;
                        profile.record(OutputStage::Aruco3d, drawn.nanos);
                    }
                    PipelineType::Aruco => {
                        let drawn = self.aruco_2d.run((output, targets))?;
                        profile.record(OutputStage::Aruco2d, drawn.nanos);
                    }
                }
            }
        }

        let fps = self.fps.process(())?;
        self.profile.emit_metrics(LABEL);
        Ok(OutputStreamResult {
            sequence_id: frame.sequence_id,
            processing_nanos: self.profile.total_nanos(),
            fps,
            profile: self.profile.snapshot(LABEL),
        })
    }
}
