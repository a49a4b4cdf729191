//! In-tree backend for unit tests: contour tracing and polygon simplification on small masks.
//! Everything else reports [`BackendError::Unsupported`].

use image::GrayImage;
use video_ingest::CameraCalibration;

use super::{
    AprilTagDetectorParams, ArucoDetectorParams, BoardParams, BoardSnapshot, PnpRequest,
    PnpResult, TagDetection, TagPoseConfig, TagPoseEstimator, VisionBackend,
};
use crate::{
    error::BackendError,
    geometry::{Contour, Point},
};

const NAME: &str = "software";

/// Clockwise neighbour offsets in image space (y grows downward), starting east.
const NEIGHBORS: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];
const WEST: usize = 4;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SoftwareBackend;

impl VisionBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn find_contours(&self, mask: &GrayImage) -> Result<Vec<Contour>, BackendError> {
        Ok(trace_outer_contours(mask))
    }

    fn approx_polygon(&self, contour: &Contour, epsilon: f64) -> Result<Contour, BackendError> {
        Ok(approx_closed_polygon(contour, epsilon))
    }

    fn solve_pnp(&self, _request: &PnpRequest<'_>) -> Result<PnpResult, BackendError> {
        Err(unsupported("solve pnp"))
    }

    fn detect_apriltags(
        &self,
        _image: &GrayImage,
        _params: &AprilTagDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        Err(unsupported("apriltag detection"))
    }

    fn tag_pose_estimator(
        &self,
        _config: &TagPoseConfig,
    ) -> Result<Box<dyn TagPoseEstimator>, BackendError> {
        Err(unsupported("tag pose estimator"))
    }

    fn detect_aruco(
        &self,
        _image: &GrayImage,
        _params: &ArucoDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        Err(unsupported("aruco detection"))
    }

    fn find_board_corners(
        &self,
        _image: &GrayImage,
        _board: &BoardParams,
    ) -> Result<Option<Vec<Point>>, BackendError> {
        Err(unsupported("chessboard detection"))
    }

    fn calibrate_camera(
        &self,
        _snapshots: &[BoardSnapshot],
        _board: &BoardParams,
    ) -> Result<CameraCalibration, BackendError> {
        Err(unsupported("camera calibration"))
    }
}

fn unsupported(operation: &'static str) -> BackendError {
    BackendError::Unsupported {
        backend: NAME,
        operation,
    }
}

struct Mask<'a> {
    image: &'a GrayImage,
    width: i32,
    height: i32,
}

impl Mask<'_> {
    fn is_set(&self, (x, y): (i32, i32)) -> bool {
        x >= 0
            && y >= 0
            && x < self.width
            && y < self.height
            && self.image.get_pixel(x as u32, y as u32).0[0] != 0
    }
}

/// Raster-scan for unvisited foreground, trace each component's outer boundary with Moore
/// neighbour tracing, then flood the component so it is reported once.
fn trace_outer_contours(image: &GrayImage) -> Vec<Contour> {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let mask = Mask {
        image,
        width,
        height,
    };
    let mut visited = vec![false; (width * height) as usize];
    let mut contours = Vec::new();

    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            if visited[idx] || !mask.is_set((x, y)) {
                continue;
            }
            let boundary = trace_boundary(&mask, (x, y));
            flood_component(&mask, (x, y), &mut visited);
            contours.push(Contour::new(
                boundary
                    .into_iter()
                    .map(|(px, py)| Point::new(px as f64, py as f64))
                    .collect(),
            ));
        }
    }
    contours
}

fn trace_boundary(mask: &Mask<'_>, start: (i32, i32)) -> Vec<(i32, i32)> {
    let mut boundary = vec![start];
    let mut current = start;
    let mut backtrack = WEST;
    let mut second: Option<(i32, i32)> = None;
    let limit = 4 * (mask.width as usize) * (mask.height as usize) + 8;

    while boundary.len() <= limit {
        let Some((next, dir)) = (1..=8).find_map(|step| {
            let dir = (backtrack + step) % 8;
            let (dx, dy) = NEIGHBORS[dir];
            let candidate = (current.0 + dx, current.1 + dy);
            mask.is_set(candidate).then_some((candidate, dir))
        }) else {
            break;
        };

        if current == start {
            match second {
                Some(first_step) if first_step == next => break,
                None => second = Some(next),
                _ => {}
            }
        }

        let (bx, by) = NEIGHBORS[(dir + 7) % 8];
        let back_pixel = (current.0 + bx, current.1 + by);
        backtrack = direction_of(back_pixel.0 - next.0, back_pixel.1 - next.1);
        current = next;
        boundary.push(current);
    }

    if boundary.len() > 1 && boundary.last() == Some(&start) {
        boundary.pop();
    }
    boundary
}

fn direction_of(dx: i32, dy: i32) -> usize {
    NEIGHBORS
        .iter()
        .position(|&offset| offset == (dx, dy))
        .unwrap_or(WEST)
}

fn flood_component(mask: &Mask<'_>, seed: (i32, i32), visited: &mut [bool]) {
    let mut stack = vec![seed];
    visited[(seed.1 * mask.width + seed.0) as usize] = true;
    while let Some((x, y)) = stack.pop() {
        for (dx, dy) in NEIGHBORS {
            let next = (x + dx, y + dy);
            if !mask.is_set(next) {
                continue;
            }
            let idx = (next.1 * mask.width + next.0) as usize;
            if !visited[idx] {
                visited[idx] = true;
                stack.push(next);
            }
        }
    }
}

/// Douglas-Peucker on a closed outline: split at the vertex farthest from the first point and
/// simplify both chains.
fn approx_closed_polygon(contour: &Contour, epsilon: f64) -> Contour {
    let points = &contour.points;
    if points.len() < 3 {
        return contour.clone();
    }
    let anchor = 0;
    let far = (1..points.len())
        .max_by(|&a, &b| {
            points[anchor]
                .distance(points[a])
                .total_cmp(&points[anchor].distance(points[b]))
        })
        .unwrap_or(1);

    let mut first: Vec<Point> = points[anchor..=far].to_vec();
    let mut second: Vec<Point> = points[far..].to_vec();
    second.push(points[anchor]);

    first = douglas_peucker(&first, epsilon);
    second = douglas_peucker(&second, epsilon);

    first.pop();
    second.pop();
    first.extend(second);
    Contour::new(first)
}

fn douglas_peucker(chain: &[Point], epsilon: f64) -> Vec<Point> {
    if chain.len() < 3 {
        return chain.to_vec();
    }
    let (start, end) = (chain[0], chain[chain.len() - 1]);
    let (index, distance) = chain[1..chain.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, p)| (i + 1, distance_to_segment(*p, start, end)))
        .fold((0, -1.0), |best, candidate| {
            if candidate.1 > best.1 { candidate } else { best }
        });

    if distance <= epsilon {
        return vec![start, end];
    }
    let mut left = douglas_peucker(&chain[..=index], epsilon);
    let right = douglas_peucker(&chain[index..], epsilon);
    left.pop();
    left.extend(right);
    left
}

fn distance_to_segment(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let length_sq = dx * dx + dy * dy;
    if length_sq <= f64::EPSILON {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / length_sq).clamp(0.0, 1.0);
    p.distance(Point::new(a.x + t * dx, a.y + t * dy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn mask_with_blocks(blocks: &[(u32, u32, u32, u32)]) -> GrayImage {
        let mut mask = GrayImage::new(40, 30);
        for &(x0, y0, w, h) in blocks {
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        mask
    }

    #[test]
    fn traces_one_contour_per_component() {
        let mask = mask_with_blocks(&[(2, 2, 6, 4), (20, 10, 10, 10)]);
        let contours = SoftwareBackend.find_contours(&mask).unwrap();
        assert_eq!(contours.len(), 2);
        let rect = contours[1].bounding_rect();
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (20.0, 10.0, 9.0, 9.0));
    }

    #[test]
    fn boundary_of_block_walks_its_perimeter_once() {
        let mask = mask_with_blocks(&[(5, 5, 4, 3)]);
        let contours = SoftwareBackend.find_contours(&mask).unwrap();
        assert_eq!(contours.len(), 1);
        // 4x3 block: 2*(4-1) + 2*(3-1) boundary pixels.
        assert_eq!(contours[0].len(), 10);
        assert_eq!(contours[0].area(), 6.0);
    }

    #[test]
    fn isolated_pixel_is_a_single_point_contour() {
        let mask = mask_with_blocks(&[(3, 3, 1, 1)]);
        let contours = SoftwareBackend.find_contours(&mask).unwrap();
        assert_eq!(contours, vec![Contour::new(vec![Point::new(3.0, 3.0)])]);
    }

    #[test]
    fn traced_block_simplifies_to_four_corners() {
        let mask = mask_with_blocks(&[(4, 4, 12, 8)]);
        let contour = SoftwareBackend.find_contours(&mask).unwrap().remove(0);
        let approx = SoftwareBackend.approx_polygon(&contour, 1.0).unwrap();
        assert_eq!(approx.len(), 4);
        assert_eq!(approx.area(), 11.0 * 7.0);
    }
}
