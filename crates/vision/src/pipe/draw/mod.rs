//! Overlay pipes for the output stream.
//!
//! Targets are located in full-resolution image coordinates; every drawing pipe scales by the
//! streaming divisor so overlays line up with the downscaled output.

pub(crate) mod raster;

use image::{Rgb, RgbImage};
use video_ingest::{CameraCalibration, FrameStaticProperties};

use self::raster::{
    BLUE, GREEN, MAGENTA, ORANGE, RED, YELLOW, draw_cross, draw_dot, draw_label, draw_line,
    draw_polygon,
};
use super::{Pipe, configured};
use crate::{
    error::{ParamError, VisionError},
    geometry::{Point, Transform3d, Translation3},
    target::{DualOffsetValues, RobotOffsetPointMode, TrackedTarget, calc},
};

/// Image plus the targets to draw on it.
pub type DrawInput<'a> = (&'a mut RgbImage, &'a [TrackedTarget]);

fn check_divisor(stage: &'static str, divisor: u32) -> Result<(), VisionError> {
    if divisor == 0 {
        return Err(ParamError::out_of_range(stage, "divisor", "x >= 1", 0.0).into());
    }
    Ok(())
}

fn scale(point: Point, divisor: u32) -> Point {
    point.scaled(1.0 / divisor as f64)
}

fn visible<'t>(targets: &'t [TrackedTarget], show_multiple: bool) -> &'t [TrackedTarget] {
    if show_multiple {
        targets
    } else {
        &targets[..targets.len().min(1)]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Draw2dCrosshairParams {
    pub should_draw: bool,
    pub offset_mode: RobotOffsetPointMode,
    pub single_offset: Point,
    pub dual_offset: DualOffsetValues,
    pub props: FrameStaticProperties,
    pub divisor: u32,
}

#[derive(Default)]
pub struct Draw2dCrosshairPipe {
    params: Option<Draw2dCrosshairParams>,
}

impl<'a> Pipe<DrawInput<'a>> for Draw2dCrosshairPipe {
    type Output = ();
    type Params = Draw2dCrosshairParams;

    fn set_params(&mut self, params: Draw2dCrosshairParams) -> Result<(), VisionError> {
        check_divisor("draw crosshair", params.divisor)?;
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, (image, targets): DrawInput<'a>) -> Result<(), VisionError> {
        let params = configured(&self.params, "draw crosshair")?;
        if !params.should_draw {
            return Ok(());
        }
        let crosshair = calc::robot_offset_point(
            params.offset_mode,
            params.single_offset,
            &params.dual_offset,
            &params.props,
            targets.first().map(|t| t.area),
        );
        let arm = (image.width().min(image.height()) as f64 / 20.0).max(4.0);
        draw_cross(image, scale(crosshair, params.divisor), arm, GREEN);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Draw2dTargetsParams {
    pub should_draw: bool,
    pub show_multiple: bool,
    pub divisor: u32,
}

/// Rotated bounding box, target point and detected corners for each target.
#[derive(Default)]
pub struct Draw2dTargetsPipe {
    params: Option<Draw2dTargetsParams>,
}

impl<'a> Pipe<DrawInput<'a>> for Draw2dTargetsPipe {
    type Output = ();
    type Params = Draw2dTargetsParams;

    fn set_params(&mut self, params: Draw2dTargetsParams) -> Result<(), VisionError> {
        check_divisor("draw 2d targets", params.divisor)?;
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, (image, targets): DrawInput<'a>) -> Result<(), VisionError> {
        let params = configured(&self.params, "draw 2d targets")?;
        if !params.should_draw {
            return Ok(());
        }
        for (index, target) in visible(targets, params.show_multiple).iter().enumerate() {
            let color = if index == 0 { RED } else { BLUE };
            let rect: Vec<Point> = target
                .min_area_rect
                .corners()
                .iter()
                .map(|p| scale(*p, params.divisor))
                .collect();
            draw_polygon(image, &rect, true, color);
            draw_dot(image, scale(target.target_point, params.divisor), 2, GREEN);
            for corner in &target.corners {
                draw_dot(image, scale(*corner, params.divisor), 1, YELLOW);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Draw3dTargetsParams {
    pub should_draw: bool,
    pub show_multiple: bool,
    pub calibration: Option<CameraCalibration>,
    /// Base outline of the model in the target frame.
    pub outline: Vec<Translation3>,
    /// Extrusion toward the camera.
    pub depth_m: f64,
    pub label_ids: bool,
    pub divisor: u32,
}

fn project(point: Translation3, pose: &Transform3d, calibration: &CameraCalibration) -> Option<Point> {
    let p = pose.apply(point);
    if p.z <= 1e-6 {
        return None;
    }
    Some(Point::new(
        calibration.fx() * p.x / p.z + calibration.cx(),
        calibration.fy() * p.y / p.z + calibration.cy(),
    ))
}

/// Projects the model outline and an extruded copy through each target's pose. Targets without
/// a pose fall back to their 2D outline.
#[derive(Default)]
pub struct Draw3dTargetsPipe {
    params: Option<Draw3dTargetsParams>,
}

impl<'a> Pipe<DrawInput<'a>> for Draw3dTargetsPipe {
    type Output = ();
    type Params = Draw3dTargetsParams;

    fn set_params(&mut self, params: Draw3dTargetsParams) -> Result<(), VisionError> {
        check_divisor("draw 3d targets", params.divisor)?;
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, (image, targets): DrawInput<'a>) -> Result<(), VisionError> {
        let params = configured(&self.params, "draw 3d targets")?;
        if !params.should_draw {
            return Ok(());
        }
        for target in visible(targets, params.show_multiple) {
            let projected = match (&target.pose, &params.calibration) {
                (Some(pose), Some(calibration)) => {
                    let base: Option<Vec<Point>> = params
                        .outline
                        .iter()
                        .map(|v| project(*v, &pose.best, calibration))
                        .collect();
                    let top: Option<Vec<Point>> = params
                        .outline
                        .iter()
                        .map(|v| {
                            let raised = Translation3::new(v.x, v.y, v.z + params.depth_m);
                            project(raised, &pose.best, calibration)
                        })
                        .collect();
                    base.zip(top)
                }
                _ => None,
            };

            match projected {
                Some((base, top)) => {
                    let base: Vec<Point> = base.iter().map(|p| scale(*p, params.divisor)).collect();
                    let top: Vec<Point> = top.iter().map(|p| scale(*p, params.divisor)).collect();
                    draw_polygon(image, &base, true, GREEN);
                    for (b, t) in base.iter().zip(&top) {
                        draw_line(image, *b, *t, BLUE);
                    }
                    draw_polygon(image, &top, true, RED);
                }
                None => {
                    let outline: Vec<Point> = target
                        .contour
                        .convex_hull()
                        .points
                        .iter()
                        .map(|p| scale(*p, params.divisor))
                        .collect();
                    draw_polygon(image, &outline, true, RED);
                }
            }

            if params.label_ids {
                label_fiducial(image, target, params.divisor, MAGENTA);
            }
        }
        Ok(())
    }
}

fn label_fiducial(image: &mut RgbImage, target: &TrackedTarget, divisor: u32, color: Rgb<u8>) {
    if let Some(id) = target.fiducial_id {
        let at = scale(target.target_point, divisor);
        draw_label(image, at.x.round() as i32 - 3, at.y.round() as i32 - 3, &id.to_string(), color);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Draw2dFiducialsParams {
    pub should_draw: bool,
    pub show_multiple: bool,
    pub divisor: u32,
}

/// Tag outline with its id at the centre.
#[derive(Default)]
pub struct Draw2dFiducialsPipe {
    params: Option<Draw2dFiducialsParams>,
}

impl<'a> Pipe<DrawInput<'a>> for Draw2dFiducialsPipe {
    type Output = ();
    type Params = Draw2dFiducialsParams;

    fn set_params(&mut self, params: Draw2dFiducialsParams) -> Result<(), VisionError> {
        check_divisor("draw 2d fiducials", params.divisor)?;
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, (image, targets): DrawInput<'a>) -> Result<(), VisionError> {
        let params = configured(&self.params, "draw 2d fiducials")?;
        if !params.should_draw {
            return Ok(());
        }
        for target in visible(targets, params.show_multiple) {
            let corners: Vec<Point> = target
                .corners
                .iter()
                .map(|p| scale(*p, params.divisor))
                .collect();
            draw_polygon(image, &corners, true, ORANGE);
            if let Some(first) = corners.first() {
                draw_dot(image, *first, 2, RED);
            }
            label_fiducial(image, target, params.divisor, YELLOW);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DrawCalibrationParams {
    pub divisor: u32,
}

/// Detected board corners joined in detection order, so a mis-ordered board is obvious.
#[derive(Default)]
pub struct DrawCalibrationPipe {
    params: Option<DrawCalibrationParams>,
}

impl<'a> Pipe<DrawInput<'a>> for DrawCalibrationPipe {
    type Output = ();
    type Params = DrawCalibrationParams;

    fn set_params(&mut self, params: DrawCalibrationParams) -> Result<(), VisionError> {
        check_divisor("draw calibration", params.divisor)?;
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, (image, targets): DrawInput<'a>) -> Result<(), VisionError> {
        let params = configured(&self.params, "draw calibration")?;
        for (index, target) in targets.iter().enumerate() {
            let color = if index == 0 { YELLOW } else { BLUE };
            let corners: Vec<Point> = target
                .corners
                .iter()
                .map(|p| scale(*p, params.divisor))
                .collect();
            draw_polygon(image, &corners, false, color);
            for corner in &corners {
                draw_dot(image, *corner, 2, color);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::PnpResult,
        geometry::{Contour, Rotation3},
        target::TargetModel,
    };

    fn square_target() -> TrackedTarget {
        let contour = Contour::new(vec![
            Point::new(20.0, 20.0),
            Point::new(40.0, 20.0),
            Point::new(40.0, 40.0),
            Point::new(20.0, 40.0),
        ]);
        TrackedTarget {
            min_area_rect: contour.min_area_rect(),
            target_point: Point::new(30.0, 30.0),
            contour,
            ..TrackedTarget::default()
        }
    }

    fn ink(image: &RgbImage) -> usize {
        image.pixels().filter(|p| p.0 != [0, 0, 0]).count()
    }

    #[test]
    fn disabled_drawing_leaves_image_untouched() {
        let mut pipe = Draw2dTargetsPipe::default();
        pipe.set_params(Draw2dTargetsParams {
            should_draw: false,
            show_multiple: true,
            divisor: 1,
        })
        .unwrap();
        let mut image = RgbImage::new(64, 64);
        pipe.process((&mut image, &[square_target()])).unwrap();
        assert_eq!(ink(&image), 0);
    }

    #[test]
    fn divisor_scales_overlay_into_smaller_image() {
        let mut pipe = Draw2dTargetsPipe::default();
        pipe.set_params(Draw2dTargetsParams {
            should_draw: true,
            show_multiple: true,
            divisor: 2,
        })
        .unwrap();
        let mut image = RgbImage::new(32, 32);
        pipe.process((&mut image, &[square_target()])).unwrap();
        assert_eq!(*image.get_pixel(15, 15), GREEN);
    }

    #[test]
    fn posed_target_draws_projected_box() {
        let calibration = CameraCalibration {
            resolution: (64, 64),
            camera_intrinsics: [50.0, 0.0, 32.0, 0.0, 50.0, 32.0, 0.0, 0.0, 1.0],
            dist_coeffs: vec![],
            reprojection_error: None,
        };
        let mut target = square_target();
        target.pose = Some(PnpResult {
            best: Transform3d::new(Translation3::new(0.0, 0.0, 1.0), Rotation3::IDENTITY),
            ..PnpResult::default()
        });
        let mut pipe = Draw3dTargetsPipe::default();
        pipe.set_params(Draw3dTargetsParams {
            should_draw: true,
            show_multiple: false,
            calibration: Some(calibration),
            outline: TargetModel::Aruco150mm.vertices(),
            depth_m: -0.5,
            label_ids: false,
            divisor: 1,
        })
        .unwrap();
        let mut image = RgbImage::new(64, 64);
        pipe.process((&mut image, &[target])).unwrap();
        // Base square edge at x = 32 + 50 * 0.075.
        assert_eq!(*image.get_pixel(36, 32), GREEN);
    }
}
