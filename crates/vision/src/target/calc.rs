//! Angle, area and offset-point math shared by target collection and drawing.

use serde::{Deserialize, Serialize};
use video_ingest::FrameStaticProperties;

use crate::geometry::{Point, RotatedRect};

/// Where the robot's aiming reference sits in the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotOffsetPointMode {
    #[default]
    None,
    Single,
    Dual,
}

/// Which point of the target's bounding rectangle is reported as its location.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOffsetPointEdge {
    #[default]
    Center,
    Top,
    Bottom,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOrientation {
    Portrait,
    #[default]
    Landscape,
}

/// Two calibrated offset points; the crosshair is interpolated between them by target area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DualOffsetValues {
    pub first_point: Point,
    pub first_area: f64,
    pub second_point: Point,
    pub second_area: f64,
}

impl DualOffsetValues {
    pub fn interpolate(&self, area: f64) -> Point {
        let span = self.second_area - self.first_area;
        if span.abs() < f64::EPSILON {
            return self.first_point;
        }
        let t = (area - self.first_area) / span;
        Point::new(
            self.first_point.x + (self.second_point.x - self.first_point.x) * t,
            self.first_point.y + (self.second_point.y - self.first_point.y) * t,
        )
    }
}

pub fn yaw(offset_center_x: f64, target_center_x: f64, horizontal_focal_length: f64) -> f64 {
    ((target_center_x - offset_center_x) / horizontal_focal_length)
        .atan()
        .to_degrees()
}

/// Positive pitch is up; image rows grow downward.
pub fn pitch(offset_center_y: f64, target_center_y: f64, vertical_focal_length: f64) -> f64 {
    -((target_center_y - offset_center_y) / vertical_focal_length)
        .atan()
        .to_degrees()
}

pub fn area_percent(contour_area: f64, image_area: f64) -> f64 {
    if image_area <= 0.0 {
        return 0.0;
    }
    contour_area / image_area * 100.0
}

/// Crosshair location for the configured offset mode.
pub fn robot_offset_point(
    mode: RobotOffsetPointMode,
    single: Point,
    dual: &DualOffsetValues,
    props: &FrameStaticProperties,
    target_area: Option<f64>,
) -> Point {
    let image_center = Point::new(props.center_x, props.center_y);
    match mode {
        RobotOffsetPointMode::None => image_center,
        RobotOffsetPointMode::Single => {
            if single == Point::default() {
                image_center
            } else {
                single
            }
        }
        RobotOffsetPointMode::Dual => match target_area {
            Some(area) => dual.interpolate(area),
            None => image_center,
        },
    }
}

/// Rectangle with its long side as `width` when landscape and as `height` when portrait.
fn oriented(rect: &RotatedRect, orientation: TargetOrientation) -> RotatedRect {
    let landscape = orientation == TargetOrientation::Landscape;
    if (rect.width >= rect.height) == landscape {
        *rect
    } else {
        RotatedRect {
            center: rect.center,
            width: rect.height,
            height: rect.width,
            angle: if rect.angle > 0.0 {
                rect.angle - 90.0
            } else {
                rect.angle + 90.0
            },
        }
    }
}

pub fn skew(rect: &RotatedRect, orientation: TargetOrientation) -> f64 {
    oriented(rect, orientation).angle
}

pub fn target_offset_point(
    rect: &RotatedRect,
    edge: TargetOffsetPointEdge,
    orientation: TargetOrientation,
) -> Point {
    if edge == TargetOffsetPointEdge::Center {
        return rect.center;
    }
    let corners = oriented(rect, orientation).corners();
    let edges = [0, 1, 2, 3].map(|i| corners[i].midpoint(corners[(i + 1) % 4]));
    let pick = |key: fn(&Point) -> f64, smallest: bool| {
        edges
            .iter()
            .copied()
            .min_by(|a, b| {
                let (ka, kb) = (key(a), key(b));
                if smallest {
                    ka.total_cmp(&kb)
                } else {
                    kb.total_cmp(&ka)
                }
            })
            .unwrap_or(rect.center)
    };
    match edge {
        TargetOffsetPointEdge::Center => rect.center,
        TargetOffsetPointEdge::Top => pick(|p| p.y, true),
        TargetOffsetPointEdge::Bottom => pick(|p| p.y, false),
        TargetOffsetPointEdge::Left => pick(|p| p.x, true),
        TargetOffsetPointEdge::Right => pick(|p| p.x, false),
    }
}
