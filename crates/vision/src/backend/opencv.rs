//! OpenCV backend. Fiducials go through the ArUco detector, which also carries the AprilTag
//! dictionaries.

use image::GrayImage;
use opencv::{
    calib3d,
    core::{self, Mat, Point2f, Point3f, Size, Vector},
    imgproc, objdetect,
    prelude::*,
};
use video_ingest::CameraCalibration;

use super::{
    AprilTagDetectorParams, AprilTagFamily, ArucoDetectorParams, ArucoDictionary, BoardParams,
    BoardSnapshot, PnpRequest, PnpResult, TagDetection, TagPoseConfig, TagPoseEstimator,
    VisionBackend,
};
use crate::{
    error::BackendError,
    geometry::{Contour, Point, Rotation3, Transform3d, Translation3},
};

/// The ArUco path reports no decision margin; detections pass any margin filter.
const UNREPORTED_MARGIN: f64 = 255.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvBackend;

fn cv(operation: &'static str) -> impl Fn(opencv::Error) -> BackendError {
    move |err| BackendError::Failed {
        operation,
        message: err.to_string(),
    }
}

fn gray_to_mat(image: &GrayImage) -> Result<Mat, BackendError> {
    Mat::from_slice_rows_cols(
        image.as_raw(),
        image.height() as usize,
        image.width() as usize,
    )
    .map_err(cv("image conversion"))
}

fn camera_matrix(calibration: &CameraCalibration) -> Result<Mat, BackendError> {
    let k = calibration.camera_intrinsics;
    Mat::from_slice_2d(&[[k[0], k[1], k[2]], [k[3], k[4], k[5]], [k[6], k[7], k[8]]])
        .map_err(cv("camera matrix"))
}

fn to_point2f(points: &[Point]) -> Vector<Point2f> {
    points
        .iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect()
}

fn to_point3f(points: &[Translation3]) -> Vector<Point3f> {
    points
        .iter()
        .map(|p| Point3f::new(p.x as f32, p.y as f32, p.z as f32))
        .collect()
}

fn vec3(mat: &Mat) -> Result<[f64; 3], BackendError> {
    let read = |i| mat.at::<f64>(i).copied().map_err(cv("pose readback"));
    Ok([read(0)?, read(1)?, read(2)?])
}

fn solve(
    request: &PnpRequest<'_>,
    method: i32,
) -> Result<PnpResult, BackendError> {
    let object = to_point3f(request.object_points);
    let image = to_point2f(request.image_points);
    let camera = camera_matrix(request.calibration)?;
    let dist = Vector::<f64>::from_slice(&request.calibration.dist_coeffs);
    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let solved = calib3d::solve_pnp(
        &object, &image, &camera, &dist, &mut rvec, &mut tvec, false, method,
    )
    .map_err(cv("solve pnp"))?;
    if !solved {
        return Err(BackendError::Failed {
            operation: "solve pnp",
            message: "no solution".into(),
        });
    }

    let mut projected = Vector::<Point2f>::new();
    calib3d::project_points_def(&object, &rvec, &tvec, &camera, &dist, &mut projected)
        .map_err(cv("reprojection"))?;
    let squared: f64 = projected
        .iter()
        .zip(image.iter())
        .map(|(a, b)| ((a.x - b.x) as f64).powi(2) + ((a.y - b.y) as f64).powi(2))
        .sum();

    let [tx, ty, tz] = vec3(&tvec)?;
    Ok(PnpResult {
        best: Transform3d::new(
            Translation3::new(tx, ty, tz),
            Rotation3::from_rotation_vector(vec3(&rvec)?),
        ),
        best_reprojection_error: (squared / object.len().max(1) as f64).sqrt(),
        alt: None,
        alt_reprojection_error: None,
        ambiguity: 0.0,
    })
}

fn predefined(dictionary: ArucoDictionary) -> objdetect::PredefinedDictionaryType {
    use objdetect::PredefinedDictionaryType as D;
    match dictionary {
        ArucoDictionary::Dict4x4_50 => D::DICT_4X4_50,
        ArucoDictionary::Dict5x5_100 => D::DICT_5X5_100,
        ArucoDictionary::Dict6x6_250 => D::DICT_6X6_250,
        ArucoDictionary::AprilTag36h11 => D::DICT_APRILTAG_36h11,
        ArucoDictionary::AprilTag16h5 => D::DICT_APRILTAG_16h5,
    }
}

fn detect_markers(
    image: &GrayImage,
    dictionary: objdetect::PredefinedDictionaryType,
    configure: impl FnOnce(&mut objdetect::DetectorParameters) -> opencv::Result<()>,
) -> Result<Vec<TagDetection>, BackendError> {
    let mat = gray_to_mat(image)?;
    let dictionary =
        objdetect::get_predefined_dictionary(dictionary).map_err(cv("marker dictionary"))?;
    let mut params = objdetect::DetectorParameters::default().map_err(cv("marker params"))?;
    configure(&mut params).map_err(cv("marker params"))?;
    let refine = objdetect::RefineParameters::new_def().map_err(cv("marker params"))?;
    let mut detector =
        objdetect::ArucoDetector::new(&dictionary, &params, refine).map_err(cv("marker detector"))?;

    let mut corners = Vector::<Vector<Point2f>>::new();
    let mut ids = Vector::<i32>::new();
    let mut rejected = Vector::<Vector<Point2f>>::new();
    detector
        .detect_markers(&mat, &mut corners, &mut ids, &mut rejected)
        .map_err(cv("marker detection"))?;

    let detections = ids
        .iter()
        .zip(corners.iter())
        .filter(|(_, quad)| quad.len() == 4)
        .map(|(id, quad)| {
            let pts: Vec<Point> = quad
                .iter()
                .map(|p| Point::new(p.x as f64, p.y as f64))
                .collect();
            // Detector order is TL, TR, BR, BL.
            let corners = [pts[3], pts[2], pts[1], pts[0]];
            let center = Contour::new(pts).centroid();
            TagDetection {
                id,
                hamming: 0,
                decision_margin: UNREPORTED_MARGIN,
                center,
                corners,
            }
        })
        .collect();
    Ok(detections)
}

impl VisionBackend for OpenCvBackend {
    fn name(&self) -> &'static str {
        "opencv"
    }

    fn find_contours(&self, mask: &GrayImage) -> Result<Vec<Contour>, BackendError> {
        let mat = gray_to_mat(mask)?;
        let mut contours = Vector::<Vector<core::Point>>::new();
        imgproc::find_contours_def(
            &mat,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
        )
        .map_err(cv("find contours"))?;
        Ok(contours
            .iter()
            .map(|c| {
                Contour::new(
                    c.iter()
                        .map(|p| Point::new(p.x as f64, p.y as f64))
                        .collect(),
                )
            })
            .collect())
    }

    fn approx_polygon(&self, contour: &Contour, epsilon: f64) -> Result<Contour, BackendError> {
        let input = to_point2f(&contour.points);
        let mut output = Vector::<Point2f>::new();
        imgproc::approx_poly_dp(&input, &mut output, epsilon, true)
            .map_err(cv("approx polygon"))?;
        Ok(Contour::new(
            output
                .iter()
                .map(|p| Point::new(p.x as f64, p.y as f64))
                .collect(),
        ))
    }

    fn solve_pnp(&self, request: &PnpRequest<'_>) -> Result<PnpResult, BackendError> {
        solve(request, calib3d::SOLVEPNP_ITERATIVE)
    }

    fn detect_apriltags(
        &self,
        image: &GrayImage,
        params: &AprilTagDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        let dictionary = match params.family {
            AprilTagFamily::Tag36h11 => objdetect::PredefinedDictionaryType::DICT_APRILTAG_36h11,
            AprilTagFamily::Tag25h9 => objdetect::PredefinedDictionaryType::DICT_APRILTAG_25h9,
            AprilTagFamily::Tag16h5 => objdetect::PredefinedDictionaryType::DICT_APRILTAG_16h5,
        };
        let decimate = params.decimate as f32;
        let refine = params.refine_edges;
        detect_markers(image, dictionary, |p| {
            p.set_april_tag_quad_decimate(decimate);
            if refine {
                p.set_corner_refinement_method(objdetect::CornerRefineMethod::CORNER_REFINE_APRILTAG as i32);
            }
            Ok(())
        })
    }

    fn tag_pose_estimator(
        &self,
        config: &TagPoseConfig,
    ) -> Result<Box<dyn TagPoseEstimator>, BackendError> {
        Ok(Box::new(IppeSquareEstimator {
            config: config.clone(),
            calibration: config.calibration((0, 0)),
        }))
    }

    fn detect_aruco(
        &self,
        image: &GrayImage,
        params: &ArucoDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        let params = *params;
        detect_markers(image, predefined(params.dictionary), |p| {
            p.set_adaptive_thresh_win_size_min(params.threshold_window.0 as i32);
            p.set_adaptive_thresh_win_size_max(params.threshold_window.1 as i32);
            p.set_adaptive_thresh_win_size_step(params.threshold_step as i32);
            p.set_adaptive_thresh_constant(params.threshold_constant);
            if params.corner_refinement {
                p.set_corner_refinement_method(objdetect::CornerRefineMethod::CORNER_REFINE_SUBPIX as i32);
            }
            Ok(())
        })
    }

    fn find_board_corners(
        &self,
        image: &GrayImage,
        board: &BoardParams,
    ) -> Result<Option<Vec<Point>>, BackendError> {
        let mat = gray_to_mat(image)?;
        let mut corners = Vector::<Point2f>::new();
        let found = calib3d::find_chessboard_corners(
            &mat,
            Size::new(board.columns as i32, board.rows as i32),
            &mut corners,
            calib3d::CALIB_CB_ADAPTIVE_THRESH | calib3d::CALIB_CB_NORMALIZE_IMAGE,
        )
        .map_err(cv("chessboard detection"))?;
        if !found {
            return Ok(None);
        }
        Ok(Some(
            corners
                .iter()
                .map(|p| Point::new(p.x as f64, p.y as f64))
                .collect(),
        ))
    }

    fn calibrate_camera(
        &self,
        snapshots: &[BoardSnapshot],
        board: &BoardParams,
    ) -> Result<CameraCalibration, BackendError> {
        let Some(first) = snapshots.first() else {
            return Err(BackendError::Failed {
                operation: "camera calibration",
                message: "no snapshots".into(),
            });
        };
        let model = to_point3f(&board.object_points());
        let object_points: Vector<Vector<Point3f>> =
            snapshots.iter().map(|_| model.clone()).collect();
        let image_points: Vector<Vector<Point2f>> =
            snapshots.iter().map(|s| to_point2f(&s.corners)).collect();

        let mut camera = Mat::default();
        let mut dist = Mat::default();
        let mut rvecs = Vector::<Mat>::new();
        let mut tvecs = Vector::<Mat>::new();
        let size = Size::new(first.image_size.0 as i32, first.image_size.1 as i32);
        let rms = calib3d::calibrate_camera_def(
            &object_points,
            &image_points,
            size,
            &mut camera,
            &mut dist,
            &mut rvecs,
            &mut tvecs,
        )
        .map_err(cv("camera calibration"))?;

        let mut intrinsics = [0.0; 9];
        for (i, slot) in intrinsics.iter_mut().enumerate() {
            *slot = *camera
                .at_2d::<f64>((i / 3) as i32, (i % 3) as i32)
                .map_err(cv("camera calibration"))?;
        }
        let dist_coeffs = (0..dist.total() as i32)
            .map(|i| dist.at::<f64>(i).copied())
            .collect::<opencv::Result<Vec<_>>>()
            .map_err(cv("camera calibration"))?;

        Ok(CameraCalibration {
            resolution: first.image_size,
            camera_intrinsics: intrinsics,
            dist_coeffs,
            reprojection_error: Some(rms),
        })
    }
}

struct IppeSquareEstimator {
    config: TagPoseConfig,
    calibration: CameraCalibration,
}

impl TagPoseEstimator for IppeSquareEstimator {
    fn estimate(
        &mut self,
        detection: &TagDetection,
        _iterations: u32,
    ) -> Result<PnpResult, BackendError> {
        // IPPE_SQUARE wants the model starting at (-s/2, s/2) and running clockwise. The
        // calibration carries the distortion, so solvePnP undistorts the corners first.
        let mut object = self.config.object_points();
        object.reverse();
        let mut corners = detection.corners;
        corners.reverse();
        solve(
            &PnpRequest {
                object_points: &object,
                image_points: &corners,
                calibration: &self.calibration,
            },
            calib3d::SOLVEPNP_IPPE_SQUARE,
        )
    }
}
