use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use image::{GrayImage, Rgb, RgbImage};
use video_ingest::{
    CameraCalibration, CaptureError, Frame, FrameProcessor, FrameProvider, FrameStaticProperties,
    FrameThresholdType, HsvThreshold, ImageRotationMode,
};
use vision::{
    BackendError, CvPipeline, PipelineManager, PipelineSettings, PipelineType, Step,
    VisionBackend, VisionError, VisionRunner,
    backend::{
        AprilTagDetectorParams, ArucoDetectorParams, BoardParams, BoardSnapshot, PnpRequest,
        PnpResult, TagDetection, TagPoseConfig, TagPoseEstimator,
    },
    geometry::{Contour, Point},
    pipeline::{self, AprilTagPipeline, ReflectivePipeline},
    target::TargetModel,
};

/// Backend that reports fixed detections and counts the pose work it is asked to do.
#[derive(Default)]
struct CountingBackend {
    contours: Vec<Contour>,
    fail_pose: bool,
    fail_aruco: bool,
    solve_pnp_calls: AtomicUsize,
    estimators_built: Arc<AtomicUsize>,
    estimates: Arc<AtomicUsize>,
}

struct CountingEstimator {
    estimates: Arc<AtomicUsize>,
}

impl TagPoseEstimator for CountingEstimator {
    fn estimate(
        &mut self,
        _detection: &TagDetection,
        _iterations: u32,
    ) -> Result<PnpResult, BackendError> {
        self.estimates.fetch_add(1, Ordering::SeqCst);
        Ok(PnpResult::default())
    }
}

fn tag(id: i32) -> TagDetection {
    let corners = [
        Point::new(100.0, 140.0),
        Point::new(140.0, 140.0),
        Point::new(140.0, 100.0),
        Point::new(100.0, 100.0),
    ];
    TagDetection {
        id,
        hamming: 0,
        decision_margin: 80.0,
        center: Point::new(120.0, 120.0),
        corners,
    }
}

fn failed(operation: &'static str) -> BackendError {
    BackendError::Failed {
        operation,
        message: "scripted failure".into(),
    }
}

/// Outline of the green square drawn by [`frame`].
fn square() -> Contour {
    Contour::new(vec![
        Point::new(130.0, 90.0),
        Point::new(189.0, 90.0),
        Point::new(189.0, 149.0),
        Point::new(130.0, 149.0),
    ])
}

impl VisionBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn find_contours(&self, _mask: &GrayImage) -> Result<Vec<Contour>, BackendError> {
        Ok(self.contours.clone())
    }

    fn approx_polygon(&self, contour: &Contour, _epsilon: f64) -> Result<Contour, BackendError> {
        Ok(contour.clone())
    }

    fn solve_pnp(&self, _request: &PnpRequest<'_>) -> Result<PnpResult, BackendError> {
        self.solve_pnp_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pose {
            return Err(failed("solve_pnp"));
        }
        Ok(PnpResult::default())
    }

    fn detect_apriltags(
        &self,
        _image: &GrayImage,
        _params: &AprilTagDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        Ok(vec![tag(7)])
    }

    fn tag_pose_estimator(
        &self,
        _config: &TagPoseConfig,
    ) -> Result<Box<dyn TagPoseEstimator>, BackendError> {
        if self.fail_pose {
            return Err(failed("tag_pose_estimator"));
        }
        self.estimators_built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingEstimator {
            estimates: Arc::clone(&self.estimates),
        }))
    }

    fn detect_aruco(
        &self,
        _image: &GrayImage,
        _params: &ArucoDetectorParams,
    ) -> Result<Vec<TagDetection>, BackendError> {
        if self.fail_aruco {
            return Err(failed("detect_aruco"));
        }
        Ok(vec![tag(3)])
    }

    fn find_board_corners(
        &self,
        _image: &GrayImage,
        _board: &BoardParams,
    ) -> Result<Option<Vec<Point>>, BackendError> {
        Ok(None)
    }

    fn calibrate_camera(
        &self,
        _snapshots: &[BoardSnapshot],
        _board: &BoardParams,
    ) -> Result<CameraCalibration, BackendError> {
        Err(BackendError::Unsupported {
            backend: "counting",
            operation: "calibrate_camera",
        })
    }
}

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn calibration() -> CameraCalibration {
    CameraCalibration {
        resolution: (WIDTH, HEIGHT),
        camera_intrinsics: [300.0, 0.0, 160.0, 0.0, 300.0, 120.0, 0.0, 0.0, 1.0],
        dist_coeffs: Vec::new(),
        reprojection_error: None,
    }
}

fn props(calibrated: bool) -> Arc<FrameStaticProperties> {
    let calibration = calibrated.then(calibration);
    Arc::new(FrameStaticProperties::new(WIDTH, HEIGHT, 70.0, calibration))
}

fn distorted_props() -> Arc<FrameStaticProperties> {
    let calibration = CameraCalibration {
        dist_coeffs: vec![-0.4, 0.2, 0.0, 0.0, -0.05],
        ..calibration()
    };
    Arc::new(FrameStaticProperties::new(WIDTH, HEIGHT, 70.0, Some(calibration)))
}

fn frame(
    processor: &mut FrameProcessor,
    threshold: FrameThresholdType,
    props: &Arc<FrameStaticProperties>,
) -> Frame {
    processor.set_threshold_type(threshold);
    let mut color = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([20, 20, 20]));
    for y in 90..150 {
        for x in 130..190 {
            color.put_pixel(x, y, Rgb([40, 220, 60]));
        }
    }
    processor.process(color, 0, props)
}

fn settings_3d(kind: PipelineType) -> PipelineSettings {
    let mut settings = PipelineSettings::new(kind, "deep");
    settings.base.solve_pnp_enabled = true;
    settings
}

fn apriltag_settings(solve_pnp: bool) -> PipelineSettings {
    let mut settings = PipelineSettings::new(PipelineType::AprilTag, "tags");
    settings.base.solve_pnp_enabled = solve_pnp;
    settings
}

#[test]
fn pose_stages_read_zero_when_3d_is_off() {
    let backend = Arc::new(CountingBackend::default());
    let mut settings = PipelineSettings::new(PipelineType::Reflective, "tape");
    settings.base.solve_pnp_enabled = false;
    let mut pipeline = ReflectivePipeline::new(settings, backend.clone());
    let props = props(true);
    let mut processor = FrameProcessor::new();

    for _ in 0..3 {
        let result = pipeline
            .run(frame(&mut processor, FrameThresholdType::Hsv, &props))
            .unwrap();
        assert_eq!(result.profile.nanos("corner_detection"), Some(0));
        assert_eq!(result.profile.nanos("solve_pnp"), Some(0));
        assert_eq!(result.profile.stages.len(), 8);
    }
    assert_eq!(backend.solve_pnp_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn no_pose_work_runs_for_any_kind_when_3d_is_off() {
    let backend = Arc::new(CountingBackend {
        contours: vec![square()],
        ..CountingBackend::default()
    });
    let props = props(true);
    let mut processor = FrameProcessor::new();

    for kind in [
        PipelineType::Reflective,
        PipelineType::ColoredShape,
        PipelineType::AprilTag,
        PipelineType::Aruco,
    ] {
        let mut settings = PipelineSettings::new(kind, "flat");
        settings.base.solve_pnp_enabled = false;
        let mut pipeline = pipeline::build(settings, backend.clone());
        for _ in 0..2 {
            let result = pipeline
                .run(frame(&mut processor, kind.threshold_type(), &props))
                .unwrap();
            assert!(result.targets.iter().all(|t| t.pose.is_none()), "{kind:?}");
        }
    }
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 0);
    assert_eq!(backend.estimates.load(Ordering::SeqCst), 0);
    assert_eq!(backend.solve_pnp_calls.load(Ordering::SeqCst), 0);

    for kind in [PipelineType::Reflective, PipelineType::Aruco, PipelineType::AprilTag] {
        let mut pipeline = pipeline::build(settings_3d(kind), backend.clone());
        let result = pipeline
            .run(frame(&mut processor, kind.threshold_type(), &props))
            .unwrap();
        assert_eq!(result.targets.len(), 1, "{kind:?}");
        assert!(result.targets[0].pose.is_some(), "{kind:?}");
    }
    assert_eq!(backend.solve_pnp_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 1);
}

#[test]
fn pose_backend_failures_fail_the_frame() {
    let backend = Arc::new(CountingBackend {
        contours: vec![square()],
        fail_pose: true,
        ..CountingBackend::default()
    });
    let mut processor = FrameProcessor::new();

    for kind in [PipelineType::Reflective, PipelineType::AprilTag, PipelineType::Aruco] {
        let mut pipeline = pipeline::build(settings_3d(kind), backend.clone());
        let err = pipeline
            .run(frame(&mut processor, kind.threshold_type(), &props(true)))
            .unwrap_err();
        assert!(
            matches!(err, VisionError::Backend(BackendError::Failed { .. })),
            "{kind:?}: {err}"
        );
    }

    let mut pipeline = AprilTagPipeline::new(apriltag_settings(true), backend);
    let result = pipeline
        .run(frame(&mut processor, FrameThresholdType::Greyscale, &props(false)))
        .unwrap();
    assert_eq!(result.targets.len(), 1);
    assert!(result.targets[0].pose.is_none());
}

#[test]
fn lens_distortion_change_rebuilds_the_tag_pose_estimator() {
    let backend = Arc::new(CountingBackend::default());
    let mut pipeline = AprilTagPipeline::new(apriltag_settings(true), backend.clone());
    let mut processor = FrameProcessor::new();

    for props in [props(true), props(true), distorted_props(), distorted_props()] {
        pipeline
            .run(frame(&mut processor, FrameThresholdType::Greyscale, &props))
            .unwrap();
    }
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 2);
    assert_eq!(backend.estimates.load(Ordering::SeqCst), 4);
}

#[test]
fn tag_pose_estimator_is_built_once_per_configuration() {
    let backend = Arc::new(CountingBackend::default());
    let mut pipeline = AprilTagPipeline::new(apriltag_settings(true), backend.clone());
    let props = props(true);
    let mut processor = FrameProcessor::new();

    for _ in 0..5 {
        let result = pipeline
            .run(frame(&mut processor, FrameThresholdType::Greyscale, &props))
            .unwrap();
        assert_eq!(result.targets.len(), 1);
        assert!(result.targets[0].pose.is_some());
    }
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 1);
    assert_eq!(backend.estimates.load(Ordering::SeqCst), 5);

    let mut tuned = pipeline.settings().clone();
    if let vision::settings::KindSettings::AprilTag(kind) = &mut tuned.kind {
        kind.num_iterations = 100;
    }
    pipeline.set_settings(tuned.clone()).unwrap();
    pipeline
        .run(frame(&mut processor, FrameThresholdType::Greyscale, &props))
        .unwrap();
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 1);

    tuned.base.target_model = TargetModel::AprilTag6in16h5;
    pipeline.set_settings(tuned).unwrap();
    pipeline
        .run(frame(&mut processor, FrameThresholdType::Greyscale, &props))
        .unwrap();
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 2);
}

#[test]
fn uncalibrated_camera_reports_tags_without_pose() {
    let backend = Arc::new(CountingBackend::default());
    let mut pipeline = AprilTagPipeline::new(apriltag_settings(true), backend.clone());
    let props = props(false);
    let mut processor = FrameProcessor::new();

    let result = pipeline
        .run(frame(&mut processor, FrameThresholdType::Greyscale, &props))
        .unwrap();
    assert_eq!(result.targets.len(), 1);
    assert_eq!(result.targets[0].fiducial_id, Some(7));
    assert!(result.targets[0].pose.is_none());
    assert_eq!(backend.estimators_built.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_frame_yields_a_well_formed_result() {
    let backend = Arc::new(CountingBackend::default());
    let props = props(false);
    for kind in [
        PipelineType::Reflective,
        PipelineType::ColoredShape,
        PipelineType::AprilTag,
        PipelineType::Aruco,
        PipelineType::DriverMode,
        PipelineType::Calib3d,
    ] {
        let mut pipeline = pipeline::build(PipelineSettings::new(kind, "empty"), backend.clone());
        let result = pipeline.run(Frame::empty(4, Arc::clone(&props))).unwrap();
        assert_eq!(result.sequence_id, 4, "{kind:?}");
        assert!(result.targets.is_empty(), "{kind:?}");
        assert_eq!(result.pipeline_type, kind);
    }
}

#[test]
fn backend_detection_failures_surface_to_the_caller() {
    let backend = Arc::new(CountingBackend {
        fail_aruco: true,
        ..CountingBackend::default()
    });
    let mut pipeline =
        pipeline::build(PipelineSettings::new(PipelineType::Aruco, "markers"), backend);
    let props = props(true);
    let mut processor = FrameProcessor::new();

    let err = pipeline
        .run(frame(&mut processor, FrameThresholdType::Greyscale, &props))
        .unwrap_err();
    assert!(matches!(err, VisionError::Backend(BackendError::Failed { .. })));
}

/// Replays one synthetic scene and records what the runner asked of it.
struct ScriptedProvider {
    processor: FrameProcessor,
    props: Arc<FrameStaticProperties>,
    requested: Arc<Mutex<Vec<FrameThresholdType>>>,
    remaining: usize,
}

impl FrameProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn get(&mut self) -> Result<Frame, CaptureError> {
        if self.remaining == 0 {
            return Err(CaptureError::Disconnected);
        }
        self.remaining -= 1;
        let threshold = self.processor.threshold_type();
        Ok(frame(&mut self.processor, threshold, &self.props))
    }

    fn request_frame_threshold_type(&mut self, threshold_type: FrameThresholdType) {
        self.processor.set_threshold_type(threshold_type);
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(threshold_type);
        }
    }

    fn request_hsv_settings(&mut self, threshold: HsvThreshold) {
        self.processor.set_hsv(threshold);
    }

    fn request_frame_rotation(&mut self, rotation: ImageRotationMode) {
        self.processor.set_rotation(rotation);
    }
}

fn runner_fixture(
    frames: usize,
    capacity: usize,
) -> (
    VisionRunner<ScriptedProvider>,
    crossbeam_channel::Receiver<vision::PipelineOutput>,
    Arc<Mutex<Vec<FrameThresholdType>>>,
) {
    let backend: Arc<dyn VisionBackend> = Arc::new(CountingBackend::default());
    let mut settings = PipelineSettings::new(PipelineType::Reflective, "tape");
    settings.base.pipeline_index = 0;
    let mut manager = PipelineManager::new(vec![settings], 0, backend);
    manager
        .add_pipeline(PipelineType::AprilTag, "tags")
        .unwrap();

    let requested = Arc::new(Mutex::new(Vec::new()));
    let provider = ScriptedProvider {
        processor: FrameProcessor::new(),
        props: props(true),
        requested: Arc::clone(&requested),
        remaining: frames,
    };
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let runner = VisionRunner::new(provider, manager, tx, Arc::new(AtomicBool::new(false)));
    (runner, rx, requested)
}

#[test]
fn runner_publishes_each_frame_with_its_pipeline() {
    let (mut runner, rx, requested) = runner_fixture(8, 8);
    let control = runner.manager().control(props(true));

    assert_eq!(runner.run(Some(2)).unwrap(), 2);
    control.set_index(1);
    assert_eq!(runner.run_once().unwrap(), Step::Published);

    let outputs: Vec<_> = rx.try_iter().collect();
    assert_eq!(outputs.len(), 3);
    assert_eq!(
        outputs.iter().map(|o| o.sequence_id).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(outputs[0].pipeline_type, PipelineType::Reflective);
    assert_eq!(outputs[2].pipeline_type, PipelineType::AprilTag);
    assert_eq!(outputs[2].pipeline_index, 1);
    assert_eq!(outputs[2].targets.len(), 1);
    assert_eq!(outputs[2].output.dimensions(), (WIDTH, HEIGHT));
    assert_eq!(outputs[2].output_profile.stages.len(), 12);

    let requested = requested.lock().unwrap();
    assert_eq!(requested[0], FrameThresholdType::Hsv);
    assert_eq!(requested.last(), Some(&FrameThresholdType::Greyscale));
}

#[test]
fn runner_drops_outputs_a_slow_consumer_cannot_take() {
    let (mut runner, rx, _) = runner_fixture(8, 1);
    assert_eq!(runner.run_once().unwrap(), Step::Published);
    assert_eq!(runner.run_once().unwrap(), Step::Dropped);
    assert_eq!(runner.dropped_outputs(), 1);
    assert_eq!(rx.try_iter().count(), 1);

    drop(rx);
    assert_eq!(runner.run_once().unwrap(), Step::ConsumerGone);
}

#[test]
fn runner_stops_on_capture_failure() {
    let (mut runner, _rx, _) = runner_fixture(1, 8);
    let err = runner.run(None).unwrap_err();
    assert!(matches!(err, VisionError::Capture(_)));
}
