//! Vision pipelines for sightline.
//!
//! Frames from a [`video_ingest::FrameProvider`] run through the pipeline the
//! [`PipelineManager`] currently has active; the [`OutputStreamPipeline`] then draws overlays for
//! display. [`VisionRunner`] drives that loop on one thread while [`PipelineControl`] handles
//! change the active pipeline from others.

pub mod backend;
pub mod error;
pub mod events;
pub mod geometry;
pub mod manager;
pub mod pipe;
pub mod pipeline;
pub mod profile;
pub mod runner;
pub mod settings;
pub mod target;

#[cfg(feature = "with-opencv")]
pub use backend::OpenCvBackend;
pub use backend::VisionBackend;
pub use error::{BackendError, ParamError, VisionError};
pub use events::{ConfigEvent, ConfigSnapshot, EventBus};
pub use manager::{PipelineControl, PipelineManager};
pub use pipeline::{CvPipeline, OutputStreamPipeline, OutputStreamResult, PipelineResult};
pub use profile::ProfileSnapshot;
pub use runner::{PipelineOutput, Step, VisionRunner};
pub use settings::{
    CALIBRATION_INDEX, DRIVER_MODE_INDEX, PipelineSettings, PipelineType,
};
pub use target::{TargetModel, TrackedTarget};
