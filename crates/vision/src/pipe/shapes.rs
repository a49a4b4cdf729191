//! Shape classification for coloured-shape tracking.

use std::sync::Arc;

use video_ingest::FrameStaticProperties;

use super::{Pipe, configured};
use crate::{
    backend::VisionBackend,
    error::{ParamError, VisionError, check_range},
    geometry::Contour,
    target::{ContourShape, PotentialTarget},
};

const STAGE: &str = "filter shapes";

#[derive(Clone, Debug, PartialEq)]
pub struct FilterShapesParams {
    pub shape: ContourShape,
    /// Polygon approximation tolerance; higher accepts rougher outlines.
    pub accuracy_percentage: f64,
    /// Minimum circularity, in percent, for circles.
    pub circle_accuracy: f64,
    /// Perimeter window in pixels.
    pub perimeter: (f64, f64),
    pub props: FrameStaticProperties,
}

/// Keeps contours matching the requested shape and tags them with it.
pub struct FilterShapesPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<FilterShapesParams>,
}

impl FilterShapesPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
        }
    }
}

impl Pipe<Vec<Contour>> for FilterShapesPipe {
    type Output = Vec<PotentialTarget>;
    type Params = FilterShapesParams;

    fn set_params(&mut self, params: FilterShapesParams) -> Result<(), VisionError> {
        check_range(STAGE, "perimeter", params.perimeter)?;
        if !(0.0..=100.0).contains(&params.accuracy_percentage) {
            return Err(ParamError::out_of_range(
                STAGE,
                "accuracy_percentage",
                "0 <= x <= 100",
                params.accuracy_percentage,
            )
            .into());
        }
        if !(0.0..=100.0).contains(&params.circle_accuracy) {
            return Err(ParamError::out_of_range(
                STAGE,
                "circle_accuracy",
                "0 <= x <= 100",
                params.circle_accuracy,
            )
            .into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, contours: Vec<Contour>) -> Result<Vec<PotentialTarget>, VisionError> {
        let params = configured(&self.params, STAGE)?;
        let mut matches = Vec::new();
        for contour in contours {
            let perimeter = contour.perimeter();
            if perimeter < params.perimeter.0 || perimeter > params.perimeter.1 {
                continue;
            }
            let accepted = match params.shape {
                ContourShape::Circle => contour.circularity() * 100.0 >= params.circle_accuracy,
                shape => {
                    let epsilon = (100.0 - params.accuracy_percentage) / 600.0 * perimeter;
                    let polygon = self.backend.approx_polygon(&contour, epsilon)?;
                    match shape.side_count() {
                        Some(sides) => polygon.len() == sides,
                        None => polygon.len() >= 3,
                    }
                }
            };
            if accepted {
                matches.push(PotentialTarget::single(contour).with_shape(params.shape));
            }
        }
        Ok(matches)
    }
}
