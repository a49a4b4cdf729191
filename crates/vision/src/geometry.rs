//! 2D contour geometry and 3D rigid transforms used by the pipes.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    pub fn scaled(self, factor: f64) -> Point {
        Point::new(self.x * factor, self.y * factor)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// Rectangle of arbitrary orientation. `angle` is in degrees, measured from the image x axis
/// to the `width` side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RotatedRect {
    pub center: Point,
    pub width: f64,
    pub height: f64,
    pub angle: f64,
}

impl RotatedRect {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Corners in order around the rectangle, starting from the one at `-width/2, +height/2`.
    pub fn corners(&self) -> [Point; 4] {
        let (sin, cos) = self.angle.to_radians().sin_cos();
        let (hw, hh) = (self.width / 2.0, self.height / 2.0);
        [(-hw, hh), (-hw, -hh), (hw, -hh), (hw, hh)].map(|(dx, dy)| {
            Point::new(
                self.center.x + dx * cos - dy * sin,
                self.center.y + dx * sin + dy * cos,
            )
        })
    }
}

/// Closed polygon outline, as produced by contour extraction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contour {
    pub points: Vec<Point>,
}

impl Contour {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn signed_area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            sum += a.x * b.y - b.x * a.y;
        }
        sum / 2.0
    }

    /// Shoelace area of the outline.
    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    pub fn perimeter(&self) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        (0..n)
            .map(|i| self.points[i].distance(self.points[(i + 1) % n]))
            .sum()
    }

    pub fn bounding_rect(&self) -> Rect {
        let Some(first) = self.points.first() else {
            return Rect::default();
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &self.points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Rect {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }

    /// Area-weighted centroid; degenerate outlines fall back to the bounding box centre.
    pub fn centroid(&self) -> Point {
        let signed = self.signed_area();
        if signed.abs() < f64::EPSILON {
            return self.bounding_rect().center();
        }
        let n = self.points.len();
        let (mut cx, mut cy) = (0.0, 0.0);
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let cross = a.x * b.y - b.x * a.y;
            cx += (a.x + b.x) * cross;
            cy += (a.y + b.y) * cross;
        }
        Point::new(cx / (6.0 * signed), cy / (6.0 * signed))
    }

    /// Convex hull via monotone chain, counter-clockwise in image coordinates.
    pub fn convex_hull(&self) -> Contour {
        let mut pts = self.points.clone();
        pts.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
        pts.dedup();
        if pts.len() < 3 {
            return Contour::new(pts);
        }

        fn cross(o: Point, a: Point, b: Point) -> f64 {
            (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
        }

        let mut lower: Vec<Point> = Vec::with_capacity(pts.len());
        for &p in &pts {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
                lower.pop();
            }
            lower.push(p);
        }
        let mut upper: Vec<Point> = Vec::with_capacity(pts.len());
        for &p in pts.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
                upper.pop();
            }
            upper.push(p);
        }
        lower.pop();
        upper.pop();
        lower.extend(upper);
        Contour::new(lower)
    }

    /// Minimum-area enclosing rectangle found by rotating calipers over the hull edges.
    pub fn min_area_rect(&self) -> RotatedRect {
        let hull = self.convex_hull();
        match hull.points.len() {
            0 => return RotatedRect::default(),
            1 => {
                return RotatedRect {
                    center: hull.points[0],
                    ..RotatedRect::default()
                };
            }
            _ => {}
        }

        let n = hull.points.len();
        let mut best: Option<RotatedRect> = None;
        for i in 0..n {
            let a = hull.points[i];
            let b = hull.points[(i + 1) % n];
            let theta = (b.y - a.y).atan2(b.x - a.x);
            let (sin, cos) = theta.sin_cos();

            let (mut min_u, mut max_u, mut min_v, mut max_v) =
                (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
            for p in &hull.points {
                let u = p.x * cos + p.y * sin;
                let v = -p.x * sin + p.y * cos;
                min_u = min_u.min(u);
                max_u = max_u.max(u);
                min_v = min_v.min(v);
                max_v = max_v.max(v);
            }

            let (cu, cv) = ((min_u + max_u) / 2.0, (min_v + max_v) / 2.0);
            let candidate = RotatedRect {
                center: Point::new(cu * cos - cv * sin, cu * sin + cv * cos),
                width: max_u - min_u,
                height: max_v - min_v,
                angle: normalize_angle(theta.to_degrees()),
            };
            if best.is_none_or(|b| candidate.area() < b.area()) {
                best = Some(candidate);
            }
        }
        best.unwrap_or_default()
    }

    pub fn merged<'a>(contours: impl IntoIterator<Item = &'a Contour>) -> Contour {
        let points = contours
            .into_iter()
            .flat_map(|c| c.points.iter().copied())
            .collect::<Vec<_>>();
        Contour::new(points).convex_hull()
    }

    /// Circularity in `[0, 1]`; 1 for a perfect circle.
    pub fn circularity(&self) -> f64 {
        let perimeter = self.perimeter();
        if perimeter <= 0.0 {
            return 0.0;
        }
        (4.0 * PI * self.area() / (perimeter * perimeter)).min(1.0)
    }
}

/// Map an angle in degrees to `(-90, 90]`.
fn normalize_angle(mut degrees: f64) -> f64 {
    while degrees > 90.0 {
        degrees -= 180.0;
    }
    while degrees <= -90.0 {
        degrees += 180.0;
    }
    degrees
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Translation3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Translation3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Unit quaternion rotation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rotation3 {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Rotation3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Rotation3 {
    pub const IDENTITY: Rotation3 = Rotation3 {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Build from an axis-angle (Rodrigues) vector whose norm is the angle in radians.
    pub fn from_rotation_vector(rvec: [f64; 3]) -> Self {
        let angle = (rvec[0] * rvec[0] + rvec[1] * rvec[1] + rvec[2] * rvec[2]).sqrt();
        if angle < 1e-12 {
            return Self::IDENTITY;
        }
        let (sin, cos) = (angle / 2.0).sin_cos();
        let scale = sin / angle;
        Self {
            w: cos,
            x: rvec[0] * scale,
            y: rvec[1] * scale,
            z: rvec[2] * scale,
        }
    }

    /// Build from a proper rotation matrix (row-major).
    pub fn from_matrix(m: [[f64; 3]; 3]) -> Self {
        let trace = m[0][0] + m[1][1] + m[2][2];
        let q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Rotation3 {
                w: 0.25 * s,
                x: (m[2][1] - m[1][2]) / s,
                y: (m[0][2] - m[2][0]) / s,
                z: (m[1][0] - m[0][1]) / s,
            }
        } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
            let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
            Rotation3 {
                w: (m[2][1] - m[1][2]) / s,
                x: 0.25 * s,
                y: (m[0][1] + m[1][0]) / s,
                z: (m[0][2] + m[2][0]) / s,
            }
        } else if m[1][1] > m[2][2] {
            let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
            Rotation3 {
                w: (m[0][2] - m[2][0]) / s,
                x: (m[0][1] + m[1][0]) / s,
                y: 0.25 * s,
                z: (m[1][2] + m[2][1]) / s,
            }
        } else {
            let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
            Rotation3 {
                w: (m[1][0] - m[0][1]) / s,
                x: (m[0][2] + m[2][0]) / s,
                y: (m[1][2] + m[2][1]) / s,
                z: 0.25 * s,
            }
        };
        q.normalized()
    }

    fn normalized(self) -> Self {
        let norm = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if norm < 1e-12 {
            return Self::IDENTITY;
        }
        Rotation3 {
            w: self.w / norm,
            x: self.x / norm,
            y: self.y / norm,
            z: self.z / norm,
        }
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        2.0 * self.w.abs().min(1.0).acos()
    }

    pub fn rotate(&self, v: Translation3) -> Translation3 {
        // v' = v + 2w(q x v) + 2(q x (q x v))
        let q = Translation3::new(self.x, self.y, self.z);
        let t = cross(q, v);
        let t = Translation3::new(2.0 * t.x, 2.0 * t.y, 2.0 * t.z);
        let qt = cross(q, t);
        Translation3::new(
            v.x + self.w * t.x + qt.x,
            v.y + self.w * t.y + qt.y,
            v.z + self.w * t.z + qt.z,
        )
    }
}

fn cross(a: Translation3, b: Translation3) -> Translation3 {
    Translation3::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}

/// Rigid transform, camera optical frame (x right, y down, z forward).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform3d {
    pub translation: Translation3,
    pub rotation: Rotation3,
}

impl Transform3d {
    pub fn new(translation: Translation3, rotation: Rotation3) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn apply(&self, point: Translation3) -> Translation3 {
        let r = self.rotation.rotate(point);
        Translation3::new(
            r.x + self.translation.x,
            r.y + self.translation.y,
            r.z + self.translation.z,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, side: f64) -> Contour {
        Contour::new(vec![
            Point::new(x, y),
            Point::new(x + side, y),
            Point::new(x + side, y + side),
            Point::new(x, y + side),
        ])
    }

    #[test]
    fn square_area_centroid_and_perimeter() {
        let c = square(10.0, 20.0, 4.0);
        assert_eq!(c.area(), 16.0);
        assert_eq!(c.perimeter(), 16.0);
        assert_eq!(c.centroid(), Point::new(12.0, 22.0));
    }

    #[test]
    fn hull_drops_interior_points() {
        let mut c = square(0.0, 0.0, 10.0);
        c.points.push(Point::new(5.0, 5.0));
        assert_eq!(c.convex_hull().len(), 4);
    }

    #[test]
    fn min_area_rect_of_diamond_is_rotated() {
        let diamond = Contour::new(vec![
            Point::new(0.0, 5.0),
            Point::new(5.0, 0.0),
            Point::new(10.0, 5.0),
            Point::new(5.0, 10.0),
        ]);
        let rect = diamond.min_area_rect();
        assert!((rect.area() - 50.0).abs() < 1e-9);
        assert!((rect.angle.abs() - 45.0).abs() < 1e-9);
        assert!(rect.center.distance(Point::new(5.0, 5.0)) < 1e-9);
    }

    #[test]
    fn rotated_rect_corners_span_the_rect() {
        let rect = RotatedRect {
            center: Point::new(0.0, 0.0),
            width: 4.0,
            height: 2.0,
            angle: 0.0,
        };
        let corners = rect.corners();
        assert_eq!(corners[0], Point::new(-2.0, 1.0));
        assert_eq!(corners[2], Point::new(2.0, -1.0));
    }

    #[test]
    fn matrix_round_trips_through_quaternion() {
        let rot = Rotation3::from_matrix([[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        let v = rot.rotate(Translation3::new(1.0, 0.0, 0.0));
        assert!((v.y - 1.0).abs() < 1e-12);
        assert!((rot.angle() - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn quarter_turn_about_z_maps_x_to_y() {
        let rot = Rotation3::from_rotation_vector([0.0, 0.0, PI / 2.0]);
        let v = rot.rotate(Translation3::new(1.0, 0.0, 0.0));
        assert!((v.x).abs() < 1e-12);
        assert!((v.y - 1.0).abs() < 1e-12);
    }
}
