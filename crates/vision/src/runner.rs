//! The processing loop: one thread pulls frames from a provider, runs the active pipeline and
//! the output stream, and hands the result to a consumer.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use tracing::{info, warn};
use video_ingest::{Frame, FrameImage, FrameProvider};

use crate::{
    error::VisionError,
    manager::PipelineManager,
    pipeline::OutputStreamPipeline,
    profile::ProfileSnapshot,
    settings::PipelineType,
    target::TrackedTarget,
};

/// Everything a consumer needs about one processed frame.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineOutput {
    pub sequence_id: u64,
    pub timestamp_us: i64,
    pub pipeline_index: i32,
    pub pipeline_type: PipelineType,
    pub targets: Vec<TrackedTarget>,
    pub fps: f64,
    /// Pipeline stages only; the output stream is timed separately.
    pub processing_nanos: u64,
    pub output_nanos: u64,
    #[serde(skip)]
    pub input: FrameImage,
    #[serde(skip)]
    pub output: FrameImage,
    pub profile: ProfileSnapshot,
    pub output_profile: ProfileSnapshot,
}

/// What became of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Published,
    /// The consumer was behind and the output was discarded.
    Dropped,
    /// The consumer hung up.
    ConsumerGone,
}

pub struct VisionRunner<P: FrameProvider> {
    provider: P,
    manager: PipelineManager,
    output_stream: OutputStreamPipeline,
    results: Sender<PipelineOutput>,
    shutdown: Arc<AtomicBool>,
    dropped_outputs: u64,
}

impl<P: FrameProvider> VisionRunner<P> {
    pub fn new(
        provider: P,
        manager: PipelineManager,
        results: Sender<PipelineOutput>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            provider,
            manager,
            output_stream: OutputStreamPipeline::new(),
            results,
            shutdown,
            dropped_outputs: 0,
        }
    }

    pub fn manager(&self) -> &PipelineManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut PipelineManager {
        &mut self.manager
    }

    pub fn dropped_outputs(&self) -> u64 {
        self.dropped_outputs
    }

    /// Process one frame end to end.
    pub fn run_once(&mut self) -> Result<Step, VisionError> {
        let pipeline = self.manager.current_pipeline();
        let settings = pipeline.settings().clone();
        self.provider
            .request_frame_threshold_type(pipeline.threshold_type());
        self.provider.request_hsv_settings(settings.base.hsv);
        self.provider
            .request_frame_rotation(settings.base.input_image_rotation_mode);

        let frame = tracing::debug_span!("provider.get").in_scope(|| self.provider.get())?;
        let timestamp_us = frame.timestamp_us;
        let mut result = pipeline.run(frame)?;
        let pipeline_index = self.manager.current_index();

        let streamed = self
            .output_stream
            .process(&mut result.frame, &settings, &result.targets)?;

        let Frame {
            color, processed, ..
        } = result.frame;
        let output = PipelineOutput {
            sequence_id: result.sequence_id,
            timestamp_us,
            pipeline_index,
            pipeline_type: result.pipeline_type,
            targets: result.targets,
            fps: result.fps,
            processing_nanos: result.processing_nanos,
            output_nanos: streamed.processing_nanos,
            input: color,
            output: processed,
            profile: result.profile,
            output_profile: streamed.profile,
        };

        match self.results.try_send(output) {
            Ok(()) => Ok(Step::Published),
            Err(TrySendError::Full(_)) => {
                self.dropped_outputs = self.dropped_outputs.wrapping_add(1);
                metrics::counter!("vision_output_dropped_frames_total").increment(1);
                metrics::gauge!("vision_queue_depth", "queue" => "output")
                    .set(self.results.len() as f64);
                Ok(Step::Dropped)
            }
            Err(TrySendError::Disconnected(_)) => Ok(Step::ConsumerGone),
        }
    }

    /// Loop until shutdown, the consumer hangs up, or `max_frames` frames were processed.
    /// Returns the number of frames processed. The first processing error ends the loop.
    pub fn run(&mut self, max_frames: Option<u64>) -> Result<u64, VisionError> {
        let _span = tracing::info_span!("vision.runner", provider = self.provider.name()).entered();
        let mut frames: u64 = 0;
        while !self.shutdown.load(Ordering::Relaxed) {
            if max_frames.is_some_and(|limit| frames >= limit) {
                break;
            }
            if self.run_once()? == Step::ConsumerGone {
                warn!("output consumer disconnected; stopping");
                break;
            }
            frames += 1;
        }
        info!(
            frames,
            dropped = self.dropped_outputs,
            "vision runner stopped"
        );
        Ok(frames)
    }

    pub fn release(&mut self) {
        self.manager.release();
        self.provider.release();
    }
}

impl<P: FrameProvider> Drop for VisionRunner<P> {
    fn drop(&mut self) {
        self.release();
    }
}
