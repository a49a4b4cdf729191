//! Contour extraction, filtering, grouping and sorting.

use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use video_ingest::FrameStaticProperties;

use super::{Pipe, configured};
use crate::{
    backend::VisionBackend,
    error::{ParamError, VisionError, check_range},
    geometry::{Contour, Point},
    target::{PotentialTarget, TargetOrientation},
};

pub struct FindContoursPipe {
    backend: Arc<dyn VisionBackend>,
}

impl FindContoursPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self { backend }
    }
}

impl<'a> Pipe<&'a GrayImage> for FindContoursPipe {
    type Output = Vec<Contour>;
    type Params = ();

    fn set_params(&mut self, _params: ()) -> Result<(), VisionError> {
        Ok(())
    }

    fn process(&mut self, input: &'a GrayImage) -> Result<Vec<Contour>, VisionError> {
        Ok(self.backend.find_contours(input)?)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpeckleRejectParams {
    /// Minimum area as a percentage of the mean contour area.
    pub min_percent_of_avg: f64,
}

/// Drops contours much smaller than the average, which are usually sensor noise.
#[derive(Default)]
pub struct SpeckleRejectPipe {
    params: Option<SpeckleRejectParams>,
}

impl Pipe<Vec<Contour>> for SpeckleRejectPipe {
    type Output = Vec<Contour>;
    type Params = SpeckleRejectParams;

    fn set_params(&mut self, params: SpeckleRejectParams) -> Result<(), VisionError> {
        if !(0.0..=100.0).contains(&params.min_percent_of_avg) {
            return Err(ParamError::out_of_range(
                "speckle reject",
                "min_percent_of_avg",
                "0 <= x <= 100",
                params.min_percent_of_avg,
            )
            .into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, contours: Vec<Contour>) -> Result<Vec<Contour>, VisionError> {
        let params = configured(&self.params, "speckle reject")?;
        if contours.is_empty() {
            return Ok(contours);
        }
        let average = contours.iter().map(Contour::area).sum::<f64>() / contours.len() as f64;
        let min_allowed = params.min_percent_of_avg / 100.0 * average;
        Ok(contours
            .into_iter()
            .filter(|c| c.area() >= min_allowed)
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterContoursParams {
    /// Percent of the image area.
    pub area: (f64, f64),
    /// Long side over short side of the minimum-area rectangle.
    pub ratio: (f64, f64),
    /// Contour area as a percentage of its minimum-area rectangle.
    pub fullness: (f64, f64),
    /// Reject contours whose centroid lies further than this many standard deviations from the
    /// mean on each axis. Zero disables the check.
    pub x_std_devs: f64,
    pub y_std_devs: f64,
    pub orientation: TargetOrientation,
    pub props: FrameStaticProperties,
}

#[derive(Default)]
pub struct FilterContoursPipe {
    params: Option<FilterContoursParams>,
}

const FILTER: &str = "filter contours";

impl Pipe<Vec<Contour>> for FilterContoursPipe {
    type Output = Vec<Contour>;
    type Params = FilterContoursParams;

    fn set_params(&mut self, params: FilterContoursParams) -> Result<(), VisionError> {
        check_range(FILTER, "area", params.area)?;
        check_range(FILTER, "ratio", params.ratio)?;
        check_range(FILTER, "fullness", params.fullness)?;
        for (field, value) in [
            ("x_std_devs", params.x_std_devs),
            ("y_std_devs", params.y_std_devs),
        ] {
            if value < 0.0 {
                return Err(ParamError::out_of_range(FILTER, field, "x >= 0", value).into());
            }
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, contours: Vec<Contour>) -> Result<Vec<Contour>, VisionError> {
        let params = configured(&self.params, FILTER)?;
        let image_area = params.props.image_area;

        let kept: Vec<Contour> = contours
            .into_iter()
            .filter(|contour| {
                let area = contour.area();
                let area_pct = if image_area > 0.0 { area / image_area * 100.0 } else { 0.0 };
                if !in_range(area_pct, params.area) {
                    return false;
                }
                let rect = contour.min_area_rect();
                let rect_area = rect.area();
                let fullness = if rect_area > 0.0 {
                    (area / rect_area * 100.0).min(100.0)
                } else {
                    0.0
                };
                if !in_range(fullness, params.fullness) {
                    return false;
                }
                let (long, short) = (rect.width.max(rect.height), rect.width.min(rect.height));
                let ratio = match params.orientation {
                    TargetOrientation::Landscape if short > 0.0 => long / short,
                    TargetOrientation::Portrait if long > 0.0 => short / long,
                    _ => 0.0,
                };
                in_range(ratio, params.ratio)
            })
            .collect();

        Ok(reject_outliers(kept, params.x_std_devs, params.y_std_devs))
    }
}

fn in_range(value: f64, range: (f64, f64)) -> bool {
    value >= range.0 && value <= range.1
}

fn reject_outliers(contours: Vec<Contour>, x_std_devs: f64, y_std_devs: f64) -> Vec<Contour> {
    if contours.len() < 3 || (x_std_devs == 0.0 && y_std_devs == 0.0) {
        return contours;
    }
    let centroids: Vec<Point> = contours.iter().map(Contour::centroid).collect();
    let n = centroids.len() as f64;
    let mean_x = centroids.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = centroids.iter().map(|p| p.y).sum::<f64>() / n;
    let std_x = (centroids.iter().map(|p| (p.x - mean_x).powi(2)).sum::<f64>() / n).sqrt();
    let std_y = (centroids.iter().map(|p| (p.y - mean_y).powi(2)).sum::<f64>() / n).sqrt();

    contours
        .into_iter()
        .zip(centroids)
        .filter(|(_, c)| {
            let x_ok = x_std_devs == 0.0 || (c.x - mean_x).abs() <= x_std_devs * std_x;
            let y_ok = y_std_devs == 0.0 || (c.y - mean_y).abs() <= y_std_devs * std_y;
            x_ok && y_ok
        })
        .map(|(contour, _)| contour)
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourGroupingMode {
    #[default]
    Single,
    Dual,
    TwoOrMore,
}

/// Side on which the long axes of a contour pair must meet to count as one target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourIntersectionDirection {
    #[default]
    None,
    Up,
    Down,
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupContoursParams {
    pub mode: ContourGroupingMode,
    pub intersection: ContourIntersectionDirection,
}

#[derive(Default)]
pub struct GroupContoursPipe {
    params: Option<GroupContoursParams>,
}

impl Pipe<Vec<Contour>> for GroupContoursPipe {
    type Output = Vec<PotentialTarget>;
    type Params = GroupContoursParams;

    fn set_params(&mut self, params: GroupContoursParams) -> Result<(), VisionError> {
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, mut contours: Vec<Contour>) -> Result<Vec<PotentialTarget>, VisionError> {
        let params = configured(&self.params, "group contours")?;
        match params.mode {
            ContourGroupingMode::Single => {
                Ok(contours.into_iter().map(PotentialTarget::single).collect())
            }
            ContourGroupingMode::TwoOrMore => {
                if contours.len() < 2 {
                    return Ok(Vec::new());
                }
                Ok(vec![PotentialTarget::group(contours)])
            }
            ContourGroupingMode::Dual => {
                contours.sort_by(|a, b| a.centroid().x.total_cmp(&b.centroid().x));
                let mut used = vec![false; contours.len()];
                let mut groups = Vec::new();
                for i in 0..contours.len() {
                    if used[i] {
                        continue;
                    }
                    let partner = (i + 1..contours.len()).find(|&j| {
                        !used[j] && axes_intersect(&contours[i], &contours[j], params.intersection)
                    });
                    if let Some(j) = partner {
                        used[i] = true;
                        used[j] = true;
                        groups.push(PotentialTarget::group(vec![
                            contours[i].clone(),
                            contours[j].clone(),
                        ]));
                    }
                }
                Ok(groups)
            }
        }
    }
}

/// Whether the long axes of two contours, extended as lines, cross on the requested side.
fn axes_intersect(a: &Contour, b: &Contour, direction: ContourIntersectionDirection) -> bool {
    if direction == ContourIntersectionDirection::None {
        return true;
    }
    let (ra, rb) = (a.min_area_rect(), b.min_area_rect());
    let axis = |rect: &crate::geometry::RotatedRect| {
        let angle = if rect.width >= rect.height {
            rect.angle
        } else {
            rect.angle + 90.0
        };
        let (sin, cos) = angle.to_radians().sin_cos();
        (rect.center, cos, sin)
    };
    let (pa, dxa, dya) = axis(&ra);
    let (pb, dxb, dyb) = axis(&rb);

    let denom = dxa * dyb - dya * dxb;
    if denom.abs() < 1e-9 {
        return false;
    }
    let t = ((pb.x - pa.x) * dyb - (pb.y - pa.y) * dxb) / denom;
    let meet = Point::new(pa.x + t * dxa, pa.y + t * dya);

    match direction {
        ContourIntersectionDirection::None => true,
        ContourIntersectionDirection::Up => meet.y < pa.y.min(pb.y),
        ContourIntersectionDirection::Down => meet.y > pa.y.max(pb.y),
        ContourIntersectionDirection::Left => meet.x < pa.x.min(pb.x),
        ContourIntersectionDirection::Right => meet.x > pa.x.max(pb.x),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourSortMode {
    #[default]
    Largest,
    Smallest,
    Highest,
    Lowest,
    Leftmost,
    Rightmost,
    Centermost,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SortContoursParams {
    pub mode: ContourSortMode,
    pub max_targets: usize,
    pub props: FrameStaticProperties,
}

#[derive(Default)]
pub struct SortContoursPipe {
    params: Option<SortContoursParams>,
}

impl Pipe<Vec<PotentialTarget>> for SortContoursPipe {
    type Output = Vec<PotentialTarget>;
    type Params = SortContoursParams;

    fn set_params(&mut self, params: SortContoursParams) -> Result<(), VisionError> {
        if params.max_targets == 0 {
            return Err(
                ParamError::out_of_range("sort contours", "max_targets", "x >= 1", 0.0).into(),
            );
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(
        &mut self,
        mut targets: Vec<PotentialTarget>,
    ) -> Result<Vec<PotentialTarget>, VisionError> {
        let params = configured(&self.params, "sort contours")?;
        let center = Point::new(params.props.center_x, params.props.center_y);
        let key = |target: &PotentialTarget| -> f64 {
            let c = target.merged.centroid();
            match params.mode {
                ContourSortMode::Largest => -target.merged.area(),
                ContourSortMode::Smallest => target.merged.area(),
                ContourSortMode::Highest => c.y,
                ContourSortMode::Lowest => -c.y,
                ContourSortMode::Leftmost => c.x,
                ContourSortMode::Rightmost => -c.x,
                ContourSortMode::Centermost => c.distance(center),
            }
        };
        targets.sort_by(|a, b| key(a).total_cmp(&key(b)));
        targets.truncate(params.max_targets);
        Ok(targets)
    }
}
