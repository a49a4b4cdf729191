//! Pipeline settings.
//!
//! A [`PipelineSettings`] is a plain value: a [`BaseSettings`] block every pipeline kind shares,
//! plus a [`KindSettings`] variant holding what only one kind understands. Pipelines rebuild all
//! of their stage parameters from it before every frame, so replacing the value is the only way
//! settings change.

use serde::{Deserialize, Serialize};
use video_ingest::{FrameThresholdType, HsvThreshold, ImageRotationMode};

use crate::{
    backend::{AprilTagFamily, ArucoDictionary, BoardKind, BoardParams},
    geometry::Point,
    pipe::{
        contours::{ContourGroupingMode, ContourIntersectionDirection, ContourSortMode},
        output::FrameDivisor,
        targets::CornerDetectionStrategy,
    },
    target::{
        ContourShape, DualOffsetValues, RobotOffsetPointMode, TargetModel, TargetOffsetPointEdge,
        TargetOrientation,
    },
};

/// Index of the built-in driver-mode pipeline.
pub const DRIVER_MODE_INDEX: i32 = -1;
/// Index of the built-in camera-calibration pipeline.
pub const CALIBRATION_INDEX: i32 = -2;

pub const DEFAULT_NICKNAME: &str = "New Pipeline";

/// Closed set of pipeline kinds. Negative base indices are the built-in pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Calib3d,
    DriverMode,
    Reflective,
    ColoredShape,
    AprilTag,
    Aruco,
}

impl PipelineType {
    pub const ALL: [PipelineType; 6] = [
        PipelineType::Calib3d,
        PipelineType::DriverMode,
        PipelineType::Reflective,
        PipelineType::ColoredShape,
        PipelineType::AprilTag,
        PipelineType::Aruco,
    ];

    pub fn base_index(self) -> i32 {
        match self {
            PipelineType::Calib3d => CALIBRATION_INDEX,
            PipelineType::DriverMode => DRIVER_MODE_INDEX,
            PipelineType::Reflective => 0,
            PipelineType::ColoredShape => 1,
            PipelineType::AprilTag => 2,
            PipelineType::Aruco => 3,
        }
    }

    pub fn from_base_index(index: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.base_index() == index)
    }

    /// Kinds that may live in the user pipeline list.
    pub fn is_user_type(self) -> bool {
        self.base_index() >= 0
    }

    pub fn label(self) -> &'static str {
        match self {
            PipelineType::Calib3d => "calib3d",
            PipelineType::DriverMode => "driver_mode",
            PipelineType::Reflective => "reflective",
            PipelineType::ColoredShape => "colored_shape",
            PipelineType::AprilTag => "apriltag",
            PipelineType::Aruco => "aruco",
        }
    }

    /// Processed plane the frame provider should attach for this kind.
    pub fn threshold_type(self) -> FrameThresholdType {
        match self {
            PipelineType::Reflective | PipelineType::ColoredShape => FrameThresholdType::Hsv,
            PipelineType::AprilTag | PipelineType::Aruco | PipelineType::Calib3d => {
                FrameThresholdType::Greyscale
            }
            PipelineType::DriverMode => FrameThresholdType::None,
        }
    }

    /// Parse a label or a numeric base index.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(index) = text.parse::<i32>() {
            return Self::from_base_index(index);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(text))
    }
}

/// Fields every pipeline kind carries. Everything here except the fields named in
/// [`BaseSettings::with_shared_from`] migrates when a pipeline changes kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseSettings {
    /// Slot in the user pipeline list. Kept dense by the manager.
    pub pipeline_index: i32,
    /// Display name, unique among user pipelines.
    pub pipeline_nickname: String,

    /// Rotation the frame provider applies before any processing.
    pub input_image_rotation_mode: ImageRotationMode,
    /// Downscale applied to the streamed output image.
    pub streaming_frame_divisor: FrameDivisor,
    /// Annotate the output frame with the detected targets.
    pub output_should_draw: bool,
    /// Report every target rather than only the best one.
    pub output_show_multiple_targets: bool,

    /// How the crosshair reference point is chosen.
    pub offset_robot_offset_mode: RobotOffsetPointMode,
    /// Reference point in pixels for [`RobotOffsetPointMode::Single`].
    pub offset_single_point: Point,
    /// Calibration line for [`RobotOffsetPointMode::Dual`].
    pub offset_dual: DualOffsetValues,

    /// Colour window the frame provider thresholds against.
    pub hsv: HsvThreshold,
    /// Percent of the image.
    pub contour_area: (f64, f64),
    /// Long side over short side of the minimum-area rectangle.
    pub contour_ratio: (f64, f64),
    /// Contour area as a percent of its minimum-area rectangle.
    pub contour_fullness: (f64, f64),
    /// Contours below this percent of the mean contour area are dropped.
    pub contour_speckle_percentage: f64,
    /// Centroid outlier cut in standard deviations; 0 on both axes disables it.
    pub contour_filter_range_x: f64,
    /// Same cut along the vertical axis.
    pub contour_filter_range_y: f64,
    /// Which way the aspect ratio is measured.
    pub contour_target_orientation: TargetOrientation,
    /// Edge of the bounding box reported as the target point.
    pub contour_target_offset_point_edge: TargetOffsetPointEdge,
    /// Ordering of reported targets.
    pub contour_sort_mode: ContourSortMode,

    /// 3D mode: estimate a camera-to-target pose for each target.
    pub solve_pnp_enabled: bool,
    /// Physical model the pose is solved against.
    pub target_model: TargetModel,

    /// How 2D corners are picked for the pose solve.
    pub corner_detection_strategy: CornerDetectionStrategy,
    /// Take corners from the convex hull instead of the raw outline.
    pub corner_detection_use_convex_hulls: bool,
    /// Reject outlines whose simplified polygon is not `corner_detection_side_count` sided.
    pub corner_detection_exact_side_count: bool,
    /// Required side count when `corner_detection_exact_side_count` is set.
    pub corner_detection_side_count: usize,
    /// Polygon simplification tolerance, 0 to 100.
    pub corner_detection_accuracy_percentage: f64,
}

impl Default for BaseSettings {
    fn default() -> Self {
        Self {
            pipeline_index: 0,
            pipeline_nickname: DEFAULT_NICKNAME.to_owned(),
            input_image_rotation_mode: ImageRotationMode::Deg0,
            streaming_frame_divisor: FrameDivisor::None,
            output_should_draw: true,
            output_show_multiple_targets: false,
            offset_robot_offset_mode: RobotOffsetPointMode::None,
            offset_single_point: Point::default(),
            offset_dual: DualOffsetValues::default(),
            hsv: HsvThreshold::default(),
            contour_area: (0.0, 100.0),
            contour_ratio: (0.0, 20.0),
            contour_fullness: (0.0, 100.0),
            contour_speckle_percentage: 5.0,
            contour_filter_range_x: 2.0,
            contour_filter_range_y: 2.0,
            contour_target_orientation: TargetOrientation::Landscape,
            contour_target_offset_point_edge: TargetOffsetPointEdge::Center,
            contour_sort_mode: ContourSortMode::Largest,
            solve_pnp_enabled: false,
            target_model: TargetModel::DualTarget2019,
            corner_detection_strategy: CornerDetectionStrategy::ExtremeCorners,
            corner_detection_use_convex_hulls: true,
            corner_detection_exact_side_count: false,
            corner_detection_side_count: 4,
            corner_detection_accuracy_percentage: 10.0,
        }
    }
}

impl BaseSettings {
    /// `source`'s shared fields with this block's identity and target model kept.
    pub fn with_shared_from(&self, source: &BaseSettings) -> BaseSettings {
        BaseSettings {
            pipeline_index: self.pipeline_index,
            pipeline_nickname: self.pipeline_nickname.clone(),
            target_model: self.target_model,
            ..source.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectiveSettings {
    pub contour_grouping_mode: ContourGroupingMode,
    pub contour_intersection: ContourIntersectionDirection,
}

impl Default for ReflectiveSettings {
    fn default() -> Self {
        Self {
            contour_grouping_mode: ContourGroupingMode::Single,
            contour_intersection: ContourIntersectionDirection::Up,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColoredShapeSettings {
    /// Shape a contour must approximate to be kept.
    pub contour_shape: ContourShape,
    /// Polygon fit accuracy, 0 to 100. Higher means a tighter fit.
    pub accuracy_percentage: f64,
    /// Minimum circularity in percent for circles.
    pub circle_accuracy: f64,
    /// Perimeter window in pixels.
    pub contour_perimeter: (f64, f64),
}

impl Default for ColoredShapeSettings {
    fn default() -> Self {
        Self {
            contour_shape: ContourShape::Triangle,
            accuracy_percentage: 10.0,
            circle_accuracy: 20.0,
            contour_perimeter: (0.0, f64::MAX),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AprilTagSettings {
    /// Family the detector decodes.
    pub tag_family: AprilTagFamily,
    pub decimate: f64,
    pub blur: f64,
    pub threads: u32,
    pub refine_edges: bool,
    /// Maximum corrected bit errors.
    pub hamming_dist: u32,
    /// Minimum decode confidence.
    pub decision_margin: f64,
    /// Pose refinement iterations.
    pub num_iterations: u32,
}

impl Default for AprilTagSettings {
    fn default() -> Self {
        Self {
            tag_family: AprilTagFamily::Tag36h11,
            decimate: 1.0,
            blur: 0.0,
            threads: 4,
            refine_edges: true,
            hamming_dist: 0,
            decision_margin: 35.0,
            num_iterations: 40,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArucoSettings {
    /// Marker dictionary to decode against.
    pub dictionary: ArucoDictionary,
    /// Adaptive threshold window sizes in pixels, smallest and largest.
    pub threshold_window: (u32, u32),
    pub threshold_step: u32,
    pub threshold_constant: f64,
    pub corner_refinement: bool,
}

impl Default for ArucoSettings {
    fn default() -> Self {
        Self {
            dictionary: ArucoDictionary::AprilTag36h11,
            threshold_window: (11, 91),
            threshold_step: 40,
            threshold_constant: 10.0,
            corner_refinement: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverModeSettings {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Calibration target geometry.
    pub board: BoardParams,
    /// Snapshots required before a calibration is attempted.
    pub min_snapshots: usize,
    pub draw_all_snapshots: bool,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            board: BoardParams {
                kind: BoardKind::Chessboard,
                columns: 8,
                rows: 8,
                square_size_m: 0.0254,
            },
            min_snapshots: 12,
            draw_all_snapshots: false,
        }
    }
}

/// Kind-specific fields. These are dropped when a pipeline changes kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pipeline_type", rename_all = "snake_case")]
pub enum KindSettings {
    Calib3d(CalibrationSettings),
    DriverMode(DriverModeSettings),
    Reflective(ReflectiveSettings),
    ColoredShape(ColoredShapeSettings),
    AprilTag(AprilTagSettings),
    Aruco(ArucoSettings),
}

impl KindSettings {
    pub fn default_for(pipeline_type: PipelineType) -> Self {
        match pipeline_type {
            PipelineType::Calib3d => KindSettings::Calib3d(CalibrationSettings::default()),
            PipelineType::DriverMode => KindSettings::DriverMode(DriverModeSettings::default()),
            PipelineType::Reflective => KindSettings::Reflective(ReflectiveSettings::default()),
            PipelineType::ColoredShape => {
                KindSettings::ColoredShape(ColoredShapeSettings::default())
            }
            PipelineType::AprilTag => KindSettings::AprilTag(AprilTagSettings::default()),
            PipelineType::Aruco => KindSettings::Aruco(ArucoSettings::default()),
        }
    }

    pub fn pipeline_type(&self) -> PipelineType {
        match self {
            KindSettings::Calib3d(_) => PipelineType::Calib3d,
            KindSettings::DriverMode(_) => PipelineType::DriverMode,
            KindSettings::Reflective(_) => PipelineType::Reflective,
            KindSettings::ColoredShape(_) => PipelineType::ColoredShape,
            KindSettings::AprilTag(_) => PipelineType::AprilTag,
            KindSettings::Aruco(_) => PipelineType::Aruco,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub base: BaseSettings,
    pub kind: KindSettings,
}

impl PipelineSettings {
    /// Defaults for a new pipeline of `pipeline_type`.
    pub fn new(pipeline_type: PipelineType, nickname: impl Into<String>) -> Self {
        let mut base = BaseSettings {
            pipeline_nickname: nickname.into(),
            ..BaseSettings::default()
        };
        match pipeline_type {
            PipelineType::AprilTag => {
                base.target_model = TargetModel::AprilTag6p5in36h11;
                base.output_show_multiple_targets = true;
                base.solve_pnp_enabled = true;
            }
            PipelineType::Aruco => {
                base.target_model = TargetModel::Aruco150mm;
                base.output_show_multiple_targets = true;
                base.solve_pnp_enabled = true;
            }
            PipelineType::ColoredShape => {
                base.target_model = TargetModel::PowerCell7in;
            }
            PipelineType::DriverMode => {
                base.pipeline_index = DRIVER_MODE_INDEX;
                base.pipeline_nickname = "Driver Mode".to_owned();
            }
            PipelineType::Calib3d => {
                base.pipeline_index = CALIBRATION_INDEX;
                base.pipeline_nickname = "Calibration".to_owned();
            }
            PipelineType::Reflective => {}
        }
        Self {
            base,
            kind: KindSettings::default_for(pipeline_type),
        }
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.kind.pipeline_type()
    }

    pub fn index(&self) -> i32 {
        self.base.pipeline_index
    }

    pub fn nickname(&self) -> &str {
        &self.base.pipeline_nickname
    }

    /// Settings of another kind at the same slot: fresh defaults for `pipeline_type` carrying
    /// over this pipeline's shared base fields.
    pub fn converted_to(&self, pipeline_type: PipelineType) -> PipelineSettings {
        let mut converted = PipelineSettings::new(pipeline_type, self.nickname());
        converted.base.pipeline_index = self.index();
        converted.base = converted.base.with_shared_from(&self.base);
        converted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_indices_round_trip_for_every_kind() {
        for kind in PipelineType::ALL {
            assert_eq!(PipelineType::from_base_index(kind.base_index()), Some(kind));
        }
        assert_eq!(PipelineType::from_base_index(4), None);
        assert!(!PipelineType::DriverMode.is_user_type());
        assert!(PipelineType::Aruco.is_user_type());
    }

    #[test]
    fn parse_accepts_labels_and_indices() {
        assert_eq!(PipelineType::parse("apriltag"), Some(PipelineType::AprilTag));
        assert_eq!(PipelineType::parse(" 1 "), Some(PipelineType::ColoredShape));
        assert_eq!(PipelineType::parse("-2"), Some(PipelineType::Calib3d));
        assert_eq!(PipelineType::parse("objects"), None);
    }

    #[test]
    fn conversion_keeps_shared_fields_and_drops_kind_fields() {
        let mut reflective = PipelineSettings::new(PipelineType::Reflective, "Goal");
        reflective.base.pipeline_index = 3;
        reflective.base.output_should_draw = false;
        reflective.base.offset_single_point = Point::new(12.0, 34.0);
        reflective.base.streaming_frame_divisor = FrameDivisor::Quarter;
        reflective.kind = KindSettings::Reflective(ReflectiveSettings {
            contour_grouping_mode: ContourGroupingMode::Dual,
            contour_intersection: ContourIntersectionDirection::Down,
        });

        let aruco = reflective.converted_to(PipelineType::Aruco);
        assert_eq!(aruco.pipeline_type(), PipelineType::Aruco);
        assert_eq!(aruco.index(), 3);
        assert_eq!(aruco.nickname(), "Goal");
        assert!(!aruco.base.output_should_draw);
        assert_eq!(aruco.base.offset_single_point, Point::new(12.0, 34.0));
        assert_eq!(aruco.base.streaming_frame_divisor, FrameDivisor::Quarter);
        assert_eq!(aruco.base.target_model, TargetModel::Aruco150mm);
        assert_eq!(aruco.kind, KindSettings::Aruco(ArucoSettings::default()));
    }

    #[test]
    fn settings_serialize_with_kind_tag() {
        let settings = PipelineSettings::new(PipelineType::AprilTag, "Tags");
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["kind"]["pipeline_type"], "april_tag");
        let back: PipelineSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
    }
}
