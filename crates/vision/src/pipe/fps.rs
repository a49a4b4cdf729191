use std::{collections::VecDeque, time::Instant};

use super::Pipe;
use crate::error::VisionError;

const WINDOW: usize = 20;

/// Frames per second over a sliding window of recent invocations.
#[derive(Debug, Default)]
pub struct CalculateFpsPipe {
    last: Option<Instant>,
    intervals: VecDeque<f64>,
}

impl CalculateFpsPipe {
    fn push_interval(&mut self, seconds: f64) -> f64 {
        if self.intervals.len() == WINDOW {
            self.intervals.pop_front();
        }
        self.intervals.push_back(seconds);
        let mean = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        if mean > 0.0 { 1.0 / mean } else { 0.0 }
    }
}

impl Pipe<()> for CalculateFpsPipe {
    type Output = f64;
    type Params = ();

    fn set_params(&mut self, _params: ()) -> Result<(), VisionError> {
        Ok(())
    }

    fn process(&mut self, _input: ()) -> Result<f64, VisionError> {
        let now = Instant::now();
        let fps = match self.last.replace(now) {
            Some(previous) => self.push_interval(now.duration_since(previous).as_secs_f64()),
            None => 0.0,
        };
        Ok(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_interval_inverts_to_rate() {
        let mut pipe = CalculateFpsPipe::default();
        assert!((pipe.push_interval(0.1) - 10.0).abs() < 1e-9);
        let fps = pipe.push_interval(0.3);
        assert!((fps - 5.0).abs() < 1e-9);
    }

    #[test]
    fn first_frame_reports_zero() {
        let mut pipe = CalculateFpsPipe::default();
        assert_eq!(pipe.process(()).unwrap(), 0.0);
    }
}
