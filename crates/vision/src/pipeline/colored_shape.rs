//! Coloured-shape tracking: HSV mask, then contours classified by shape.

use std::sync::Arc;

use image::GrayImage;
use video_ingest::{Frame, FrameStaticProperties};

use super::{
    CvPipeline, PipelineResult, corner_params, kind_settings, replace_settings, solve_pnp_params,
    sort_params, target_calculation_params,
};
use crate::{
    backend::VisionBackend,
    error::VisionError,
    pipe::{
        Pipe,
        contours::{
            FilterContoursParams, FilterContoursPipe, FindContoursPipe, SortContoursPipe,
            SpeckleRejectParams, SpeckleRejectPipe,
        },
        fps::CalculateFpsPipe,
        shapes::{FilterShapesParams, FilterShapesPipe},
        targets::{Collect2dTargetsPipe, CornerDetectionPipe, SolvePnpPipe},
    },
    profile::{PipeProfile, profile_stages},
    settings::PipelineSettings,
    target::TrackedTarget,
};

profile_stages! {
    pub enum ColoredShapeStage {
        FindContours => "find_contours",
        SpeckleReject => "speckle_reject",
        FilterContours => "filter_contours",
        FilterShapes => "filter_shapes",
        SortContours => "sort_contours",
        Collect2dTargets => "collect_2d_targets",
        CornerDetection => "corner_detection",
        SolvePnp => "solve_pnp",
    }
}

const LABEL: &str = "colored_shape";

pub struct ColoredShapePipeline {
    settings: PipelineSettings,
    find_contours: FindContoursPipe,
    speckle_reject: SpeckleRejectPipe,
    filter_contours: FilterContoursPipe,
    filter_shapes: FilterShapesPipe,
    sort_contours: SortContoursPipe,
    collect_targets: Collect2dTargetsPipe,
    corner_detection: CornerDetectionPipe,
    solve_pnp: SolvePnpPipe,
    fps: CalculateFpsPipe,
    profile: PipeProfile<ColoredShapeStage>,
}

impl ColoredShapePipeline {
    pub fn new(settings: PipelineSettings, backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            settings,
            find_contours: FindContoursPipe::new(Arc::clone(&backend)),
            speckle_reject: SpeckleRejectPipe::default(),
            filter_contours: FilterContoursPipe::default(),
            filter_shapes: FilterShapesPipe::new(Arc::clone(&backend)),
            sort_contours: SortContoursPipe::default(),
            collect_targets: Collect2dTargetsPipe::default(),
            corner_detection: CornerDetectionPipe::new(Arc::clone(&backend)),
            solve_pnp: SolvePnpPipe::new(backend),
            fps: CalculateFpsPipe::default(),
            profile: PipeProfile::new(),
        }
    }

    fn detect(&mut self, mask: &GrayImage) -> Result<Vec<TrackedTarget>, VisionError> {
        let profile = &mut self.profile;

        let contours = self.find_contours.run(mask)?;
        profile.record(ColoredShapeStage::FindContours, contours.nanos);

        let contours = self.speckle_reject.run(contours.output)?;
        profile.record(ColoredShapeStage::SpeckleReject, contours.nanos);

        let contours = self.filter_contours.run(contours.output)?;
        profile.record(ColoredShapeStage::FilterContours, contours.nanos);

        let shapes = self.filter_shapes.run(contours.output)?;
        profile.record(ColoredShapeStage::FilterShapes, shapes.nanos);

        let sorted = self.sort_contours.run(shapes.output)?;
        profile.record(ColoredShapeStage::SortContours, sorted.nanos);

        let targets = self.collect_targets.run(sorted.output)?;
        profile.record(ColoredShapeStage::Collect2dTargets, targets.nanos);

        if !self.settings.base.solve_pnp_enabled {
            profile.skip(ColoredShapeStage::CornerDetection);
            profile.skip(ColoredShapeStage::SolvePnp);
            return Ok(targets.output);
        }

        let targets = self.corner_detection.run(targets.output)?;
        profile.record(ColoredShapeStage::CornerDetection, targets.nanos);

        let targets = self.solve_pnp.run(targets.output)?;
        profile.record(ColoredShapeStage::SolvePnp, targets.nanos);
        Ok(targets.output)
    }
}

impl CvPipeline for ColoredShapePipeline {
    fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn set_settings(&mut self, settings: PipelineSettings) -> Result<(), VisionError> {
        replace_settings(&mut self.settings, settings)
    }

    fn set_pipe_params(&mut self, props: &FrameStaticProperties) -> Result<(), VisionError> {
        let kind = kind_settings!(self.settings, ColoredShape)?;
        let base = &self.settings.base;

        self.find_contours.set_params(())?;
        self.speckle_reject.set_params(SpeckleRejectParams {
            min_percent_of_avg: base.contour_speckle_percentage,
        })?;
        self.filter_contours.set_params(FilterContoursParams {
            area: base.contour_area,
            ratio: base.contour_ratio,
            fullness: base.contour_fullness,
            x_std_devs: base.contour_filter_range_x,
            y_std_devs: base.contour_filter_range_y,
            orientation: base.contour_target_orientation,
            props: props.clone(),
        })?;
        self.filter_shapes.set_params(FilterShapesParams {
            shape: kind.contour_shape,
            accuracy_percentage: kind.accuracy_percentage,
            circle_accuracy: kind.circle_accuracy,
            perimeter: kind.contour_perimeter,
            props: props.clone(),
        })?;
        self.sort_contours.set_params(sort_params(&self.settings, props))?;
        self.collect_targets
            .set_params(target_calculation_params(&self.settings, props))?;
        self.corner_detection.set_params(corner_params(&self.settings))?;
        self.solve_pnp.set_params(solve_pnp_params(&self.settings, props))?;
        Ok(())
    }

    fn process(&mut self, frame: Frame) -> Result<PipelineResult, VisionError> {
        self.profile.reset();
        let targets = match frame.processed.as_gray() {
            Some(mask) => self.detect(mask)?,
            None => Vec::new(),
        };
        self.profile.emit_metrics(LABEL);

        Ok(PipelineResult {
            sequence_id: frame.sequence_id,
            pipeline_type: self.pipeline_type(),
            processing_nanos: self.profile.total_nanos(),
            fps: self.fps.process(())?,
            targets,
            profile: self.profile.snapshot(LABEL),
            frame,
        })
    }
}
