use thiserror::Error;
use video_ingest::CaptureError;

/// Rejected stage parameters. Raised when parameters are applied, never mid-frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("{stage}: parameters applied before first configuration")]
    Unset { stage: &'static str },
    #[error("{stage}: {field} must satisfy {constraint}, got {value}")]
    OutOfRange {
        stage: &'static str,
        field: &'static str,
        constraint: &'static str,
        value: f64,
    },
    #[error("{stage}: {field} range is inverted ({min} > {max})")]
    InvertedRange {
        stage: &'static str,
        field: &'static str,
        min: f64,
        max: f64,
    },
}

impl ParamError {
    pub(crate) fn out_of_range(
        stage: &'static str,
        field: &'static str,
        constraint: &'static str,
        value: impl Into<f64>,
    ) -> Self {
        ParamError::OutOfRange {
            stage,
            field,
            constraint,
            value: value.into(),
        }
    }
}

/// Check that a `(min, max)` window is ordered.
pub(crate) fn check_range(
    stage: &'static str,
    field: &'static str,
    range: (f64, f64),
) -> Result<(), ParamError> {
    if range.0 > range.1 {
        return Err(ParamError::InvertedRange {
            stage,
            field,
            min: range.0,
            max: range.1,
        });
    }
    Ok(())
}

/// Faults raised by a [`crate::backend::VisionBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend} backend does not implement {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("invalid pipeline request: {0}")]
    InvalidRequest(String),
    #[error("pipeline manager is no longer running")]
    ManagerGone,
}
