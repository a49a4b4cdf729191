//! Single-step image-processing units.
//!
//! A pipe is configured with [`Pipe::set_params`] before each invocation and then run on one
//! input. Parameter validation happens in `set_params`; [`Pipe::run`] adds wall-clock timing
//! around [`Pipe::process`].

pub mod calibration;
pub mod contours;
pub mod draw;
pub mod fiducial;
pub mod fps;
pub mod output;
pub mod shapes;
pub mod targets;

use std::time::Instant;

use crate::error::{ParamError, VisionError};

/// Output of a pipe together with the time it took.
#[derive(Clone, Debug, PartialEq)]
pub struct PipeResult<T> {
    pub output: T,
    pub nanos: u64,
}

pub trait Pipe<In> {
    type Output;
    type Params: Clone + PartialEq;

    fn set_params(&mut self, params: Self::Params) -> Result<(), VisionError>;

    fn process(&mut self, input: In) -> Result<Self::Output, VisionError>;

    fn run(&mut self, input: In) -> Result<PipeResult<Self::Output>, VisionError> {
        let start = Instant::now();
        let output = self.process(input)?;
        Ok(PipeResult {
            output,
            nanos: start.elapsed().as_nanos() as u64,
        })
    }
}

/// Pipes holding backend resources beyond their parameters.
pub trait Releasable {
    fn release(&mut self);
}

pub(crate) fn configured<'a, P>(params: &'a Option<P>, stage: &'static str) -> Result<&'a P, ParamError> {
    params.as_ref().ok_or(ParamError::Unset { stage })
}
