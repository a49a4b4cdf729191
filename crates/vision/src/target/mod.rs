//! Targets as they move through a pipeline: grouped contours become [`PotentialTarget`]s, and
//! collection turns them into [`TrackedTarget`]s with angles, area and optional pose.

pub mod calc;
pub mod model;

use serde::{Deserialize, Serialize};
use video_ingest::FrameStaticProperties;

use crate::{
    backend::{PnpResult, TagDetection},
    geometry::{Contour, Point, RotatedRect},
};

pub use calc::{DualOffsetValues, RobotOffsetPointMode, TargetOffsetPointEdge, TargetOrientation};
pub use model::TargetModel;

/// Most targets reported per frame.
pub const MAX_MULTI_TARGET_RESULTS: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourShape {
    #[default]
    Custom,
    Circle,
    Triangle,
    Quadrilateral,
}

impl ContourShape {
    /// Required vertex count for polygonal shapes. `Custom` accepts any polygon.
    pub fn side_count(self) -> Option<usize> {
        match self {
            ContourShape::Triangle => Some(3),
            ContourShape::Quadrilateral => Some(4),
            ContourShape::Custom | ContourShape::Circle => None,
        }
    }
}

/// One or more contours believed to be a single target.
#[derive(Clone, Debug, PartialEq)]
pub struct PotentialTarget {
    pub merged: Contour,
    pub sub_contours: Vec<Contour>,
    pub shape: Option<ContourShape>,
}

impl PotentialTarget {
    pub fn single(contour: Contour) -> Self {
        Self {
            merged: contour.clone(),
            sub_contours: vec![contour],
            shape: None,
        }
    }

    pub fn group(contours: Vec<Contour>) -> Self {
        Self {
            merged: Contour::merged(&contours),
            sub_contours: contours,
            shape: None,
        }
    }

    pub fn with_shape(mut self, shape: ContourShape) -> Self {
        self.shape = Some(shape);
        self
    }
}

/// Inputs for turning contours into reported targets.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetCalculationParams {
    pub offset_mode: RobotOffsetPointMode,
    pub single_offset: Point,
    pub dual_offset: DualOffsetValues,
    pub offset_point_edge: TargetOffsetPointEdge,
    pub orientation: TargetOrientation,
    pub props: FrameStaticProperties,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TrackedTarget {
    /// Degrees, positive right of the crosshair.
    pub yaw: f64,
    /// Degrees, positive above the crosshair.
    pub pitch: f64,
    /// Percent of the image covered by the target outline.
    pub area: f64,
    pub skew: f64,
    pub target_point: Point,
    pub crosshair: Point,
    pub min_area_rect: RotatedRect,
    pub contour: Contour,
    #[serde(skip)]
    pub sub_contours: Vec<Contour>,
    /// Ordered bottom-left, bottom-right, top-right, top-left when present.
    pub corners: Vec<Point>,
    pub shape: Option<ContourShape>,
    pub fiducial_id: Option<i32>,
    pub pose: Option<PnpResult>,
}

impl TrackedTarget {
    pub fn from_potential(potential: PotentialTarget, params: &TargetCalculationParams) -> Self {
        let props = &params.props;
        let min_area_rect = potential.merged.min_area_rect();
        let area = calc::area_percent(potential.merged.area(), props.image_area);
        let crosshair = calc::robot_offset_point(
            params.offset_mode,
            params.single_offset,
            &params.dual_offset,
            props,
            Some(area),
        );
        let target_point =
            calc::target_offset_point(&min_area_rect, params.offset_point_edge, params.orientation);

        Self {
            yaw: calc::yaw(crosshair.x, target_point.x, props.horizontal_focal_length),
            pitch: calc::pitch(crosshair.y, target_point.y, props.vertical_focal_length),
            area,
            skew: calc::skew(&min_area_rect, params.orientation),
            target_point,
            crosshair,
            min_area_rect,
            contour: potential.merged,
            sub_contours: potential.sub_contours,
            corners: Vec::new(),
            shape: potential.shape,
            fiducial_id: None,
            pose: None,
        }
    }

    /// Fiducials aim relative to the image centre.
    pub fn from_fiducial(
        detection: &TagDetection,
        pose: Option<PnpResult>,
        props: &FrameStaticProperties,
    ) -> Self {
        let contour = Contour::new(detection.corners.to_vec());
        let min_area_rect = contour.min_area_rect();
        let crosshair = Point::new(props.center_x, props.center_y);
        Self {
            yaw: calc::yaw(crosshair.x, detection.center.x, props.horizontal_focal_length),
            pitch: calc::pitch(crosshair.y, detection.center.y, props.vertical_focal_length),
            area: calc::area_percent(contour.area(), props.image_area),
            skew: min_area_rect.angle,
            target_point: detection.center,
            crosshair,
            min_area_rect,
            sub_contours: vec![contour.clone()],
            contour,
            corners: detection.corners.to_vec(),
            shape: Some(ContourShape::Quadrilateral),
            fiducial_id: Some(detection.id),
            pose,
        }
    }
}
