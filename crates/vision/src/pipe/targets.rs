//! Target collection, corner extraction and pose solving.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use video_ingest::CameraCalibration;

use super::{Pipe, configured};
use crate::{
    backend::{PnpRequest, VisionBackend},
    error::{ParamError, VisionError},
    geometry::Point,
    target::{PotentialTarget, TargetCalculationParams, TargetModel, TrackedTarget},
};

#[derive(Default)]
pub struct Collect2dTargetsPipe {
    params: Option<TargetCalculationParams>,
}

impl Pipe<Vec<PotentialTarget>> for Collect2dTargetsPipe {
    type Output = Vec<TrackedTarget>;
    type Params = TargetCalculationParams;

    fn set_params(&mut self, params: TargetCalculationParams) -> Result<(), VisionError> {
        if params.props.horizontal_focal_length <= 0.0 || params.props.vertical_focal_length <= 0.0
        {
            return Err(ParamError::out_of_range(
                "collect targets",
                "focal_length",
                "x > 0",
                params.props.horizontal_focal_length.min(params.props.vertical_focal_length),
            )
            .into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, targets: Vec<PotentialTarget>) -> Result<Vec<TrackedTarget>, VisionError> {
        let params = configured(&self.params, "collect targets")?;
        Ok(targets
            .into_iter()
            .map(|target| TrackedTarget::from_potential(target, params))
            .collect())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CornerDetectionStrategy {
    None,
    #[default]
    ExtremeCorners,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CornerDetectionParams {
    pub strategy: CornerDetectionStrategy,
    pub use_convex_hulls: bool,
    pub exact_side_count: bool,
    pub side_count: usize,
    pub accuracy_percentage: f64,
}

/// Finds the four outer corners of each target, ordered bottom-left, bottom-right, top-right,
/// top-left.
pub struct CornerDetectionPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<CornerDetectionParams>,
}

impl CornerDetectionPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
        }
    }
}

const CORNERS: &str = "corner detection";

impl Pipe<Vec<TrackedTarget>> for CornerDetectionPipe {
    type Output = Vec<TrackedTarget>;
    type Params = CornerDetectionParams;

    fn set_params(&mut self, params: CornerDetectionParams) -> Result<(), VisionError> {
        if params.exact_side_count && params.side_count < 3 {
            return Err(ParamError::out_of_range(
                CORNERS,
                "side_count",
                "x >= 3",
                params.side_count as f64,
            )
            .into());
        }
        if !(0.0..=100.0).contains(&params.accuracy_percentage) {
            return Err(ParamError::out_of_range(
                CORNERS,
                "accuracy_percentage",
                "0 <= x <= 100",
                params.accuracy_percentage,
            )
            .into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, mut targets: Vec<TrackedTarget>) -> Result<Vec<TrackedTarget>, VisionError> {
        let params = configured(&self.params, CORNERS)?;
        if params.strategy == CornerDetectionStrategy::None {
            return Ok(targets);
        }
        for target in &mut targets {
            let outline = if params.use_convex_hulls {
                target.contour.convex_hull()
            } else {
                target.contour.clone()
            };
            if params.exact_side_count {
                let epsilon = params.accuracy_percentage / 600.0 * outline.perimeter();
                let polygon = self.backend.approx_polygon(&outline, epsilon)?;
                if polygon.len() != params.side_count {
                    debug!(
                        sides = polygon.len(),
                        wanted = params.side_count,
                        "target outline has wrong side count"
                    );
                    target.corners.clear();
                    continue;
                }
            }
            target.corners = extreme_corners(&outline.points).map(Vec::from).unwrap_or_default();
        }
        Ok(targets)
    }
}

/// Extremes along the two diagonals of image space.
fn extreme_corners(points: &[Point]) -> Option<[Point; 4]> {
    let by = |key: fn(&Point) -> f64, max: bool| {
        points.iter().copied().reduce(|best, p| {
            let better = if max { key(&p) > key(&best) } else { key(&p) < key(&best) };
            if better { p } else { best }
        })
    };
    let top_left = by(|p| p.x + p.y, false)?;
    let bottom_right = by(|p| p.x + p.y, true)?;
    let top_right = by(|p| p.x - p.y, true)?;
    let bottom_left = by(|p| p.x - p.y, false)?;
    Some([bottom_left, bottom_right, top_right, top_left])
}

#[derive(Clone, Debug, PartialEq)]
pub struct SolvePnpParams {
    pub calibration: Option<CameraCalibration>,
    pub target_model: TargetModel,
}

pub struct SolvePnpPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<SolvePnpParams>,
    warned_uncalibrated: bool,
}

impl SolvePnpPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
            warned_uncalibrated: false,
        }
    }
}

impl Pipe<Vec<TrackedTarget>> for SolvePnpPipe {
    type Output = Vec<TrackedTarget>;
    type Params = SolvePnpParams;

    fn set_params(&mut self, params: SolvePnpParams) -> Result<(), VisionError> {
        if params.calibration.is_some() {
            self.warned_uncalibrated = false;
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, mut targets: Vec<TrackedTarget>) -> Result<Vec<TrackedTarget>, VisionError> {
        let params = configured(&self.params, "solve pnp")?;
        let Some(calibration) = params.calibration.as_ref() else {
            if !self.warned_uncalibrated {
                warn!("3D mode enabled but the camera has no calibration for this resolution");
                self.warned_uncalibrated = true;
            }
            return Ok(targets);
        };

        let model = params.target_model.vertices();
        for target in &mut targets {
            if target.corners.len() != model.len() {
                continue;
            }
            let request = PnpRequest {
                object_points: &model,
                image_points: &target.corners,
                calibration,
            };
            target.pose = Some(self.backend.solve_pnp(&request)?);
        }
        Ok(targets)
    }
}
