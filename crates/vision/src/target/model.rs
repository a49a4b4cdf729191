//! Physical target geometry used for pose estimation and 3D overlays.

use serde::{Deserialize, Serialize};

use crate::geometry::Translation3;

const INCH: f64 = 0.0254;

/// Known target shapes. Vertices are planar, in metres, in the target frame (x right, y up,
/// z out of the target toward the camera), ordered bottom-left, bottom-right, top-right,
/// top-left to match corner detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetModel {
    #[default]
    DualTarget2019,
    HighGoal2020,
    PowerCell7in,
    AprilTag6p5in36h11,
    AprilTag6in16h5,
    Aruco150mm,
}

impl TargetModel {
    pub fn vertices(self) -> Vec<Translation3> {
        let inches = |x: f64, y: f64| Translation3::new(x * INCH, y * INCH, 0.0);
        match self {
            TargetModel::DualTarget2019 => vec![
                inches(-7.313, -2.662),
                inches(7.313, -2.662),
                inches(5.936, 2.662),
                inches(-5.936, 2.662),
            ],
            TargetModel::HighGoal2020 => vec![
                inches(-9.819, -8.5),
                inches(9.819, -8.5),
                inches(19.625, 8.5),
                inches(-19.625, 8.5),
            ],
            TargetModel::PowerCell7in
            | TargetModel::AprilTag6p5in36h11
            | TargetModel::AprilTag6in16h5
            | TargetModel::Aruco150mm => {
                let half = self.square_side_m().unwrap_or_default() / 2.0;
                vec![
                    Translation3::new(-half, -half, 0.0),
                    Translation3::new(half, -half, 0.0),
                    Translation3::new(half, half, 0.0),
                    Translation3::new(-half, half, 0.0),
                ]
            }
        }
    }

    /// Side length for square models.
    pub fn square_side_m(self) -> Option<f64> {
        match self {
            TargetModel::PowerCell7in => Some(7.0 * INCH),
            TargetModel::AprilTag6p5in36h11 => Some(6.5 * INCH),
            TargetModel::AprilTag6in16h5 => Some(6.0 * INCH),
            TargetModel::Aruco150mm => Some(0.15),
            TargetModel::DualTarget2019 | TargetModel::HighGoal2020 => None,
        }
    }

    /// How far the 3D overlay box extrudes toward the camera.
    pub fn overlay_depth_m(self) -> f64 {
        match self {
            TargetModel::DualTarget2019 => 2.0 * INCH,
            TargetModel::HighGoal2020 => 10.0 * INCH,
            other => other.square_side_m().unwrap_or(0.1) / 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_model_is_planar_with_four_vertices() {
        for model in [
            TargetModel::DualTarget2019,
            TargetModel::HighGoal2020,
            TargetModel::PowerCell7in,
            TargetModel::AprilTag6p5in36h11,
            TargetModel::AprilTag6in16h5,
            TargetModel::Aruco150mm,
        ] {
            let vertices = model.vertices();
            assert_eq!(vertices.len(), 4, "{model:?}");
            assert!(vertices.iter().all(|v| v.z == 0.0));
        }
    }

    #[test]
    fn tag_model_matches_printed_size() {
        let v = TargetModel::AprilTag6p5in36h11.vertices();
        assert!(((v[1].x - v[0].x) - 6.5 * INCH).abs() < 1e-12);
    }
}
