use video_ingest::{Frame, FrameStaticProperties};

use super::{CvPipeline, PipelineResult, replace_settings};
use crate::{
    error::VisionError,
    pipe::{Pipe, fps::CalculateFpsPipe},
    profile::ProfileSnapshot,
    settings::PipelineSettings,
};

const LABEL: &str = "driver_mode";

/// Passes the colour image through untouched; the output stream adds the crosshair.
pub struct DriverModePipeline {
    settings: PipelineSettings,
    fps: CalculateFpsPipe,
}

impl DriverModePipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            fps: CalculateFpsPipe::default(),
        }
    }
}

impl CvPipeline for DriverModePipeline {
    fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn set_settings(&mut self, settings: PipelineSettings) -> Result<(), VisionError> {
        replace_settings(&mut self.settings, settings)
    }

    fn set_pipe_params(&mut self, _props: &FrameStaticProperties) -> Result<(), VisionError> {
        Ok(())
    }

    fn process(&mut self, frame: Frame) -> Result<PipelineResult, VisionError> {
        Ok(PipelineResult {
            sequence_id: frame.sequence_id,
            pipeline_type: self.pipeline_type(),
            processing_nanos: 0,
            fps: self.fps.process(())?,
            targets: Vec::new(),
            profile: ProfileSnapshot {
                pipeline: LABEL,
                stages: Vec::new(),
            },
            frame,
        })
    }
}
