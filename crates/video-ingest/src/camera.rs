//! OpenCV-backed live camera source.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use image::RgbImage;
use opencv::{
    core::{self, MatTraitConstManual},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{info, warn};

use crate::{
    properties::{CameraCalibration, FrameStaticProperties},
    provider::{FrameProcessor, FrameProvider},
    threshold::HsvThreshold,
    types::{CaptureError, Frame, FrameThresholdType, ImageRotationMode},
};

struct Capture {
    image: RgbImage,
    timestamp_us: i64,
}

/// Live camera provider. A background thread keeps reading the device; [`FrameProvider::get`]
/// blocks on the next capture.
pub struct CameraFrameProvider {
    name: String,
    frames: Receiver<Result<Capture, CaptureError>>,
    properties: Arc<FrameStaticProperties>,
    processor: FrameProcessor,
    connected: Arc<AtomicBool>,
}

impl CameraFrameProvider {
    pub fn open(
        uri: &str,
        target_size: (u32, u32),
        fov: f64,
        calibration: Option<CameraCalibration>,
    ) -> Result<Self, CaptureError> {
        let (tx, rx) = bounded(2);
        let connected = Arc::new(AtomicBool::new(true));
        let worker_connected = Arc::clone(&connected);
        let worker_uri = uri.to_string();
        let size = (target_size.0 as i32, target_size.1 as i32);

        thread::Builder::new()
            .name(format!("capture-{uri}"))
            .spawn(move || {
                if let Err(err) = capture_loop(&worker_uri, size, &tx) {
                    let _ = tx.send(Err(err));
                }
                worker_connected.store(false, Ordering::Release);
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        info!(uri, width = target_size.0, height = target_size.1, "camera capture started");

        Ok(Self {
            name: uri.to_string(),
            frames: rx,
            properties: Arc::new(FrameStaticProperties::new(
                target_size.0,
                target_size.1,
                fov,
                calibration,
            )),
            processor: FrameProcessor::new(),
            connected,
        })
    }
}

impl FrameProvider for CameraFrameProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self) -> Result<Frame, CaptureError> {
        let capture = self
            .frames
            .recv()
            .map_err(|_| CaptureError::Disconnected)??;
        Ok(self
            .processor
            .process(capture.image, capture.timestamp_us, &self.properties))
    }

    fn request_frame_threshold_type(&mut self, threshold_type: FrameThresholdType) {
        self.processor.set_threshold_type(threshold_type);
    }

    fn request_hsv_settings(&mut self, threshold: HsvThreshold) {
        self.processor.set_hsv(threshold);
    }

    fn request_frame_rotation(&mut self, rotation: ImageRotationMode) {
        self.processor.set_rotation(rotation);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn capture_loop(
    uri: &str,
    target_size: (i32, i32),
    tx: &Sender<Result<Capture, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut cap = open_video_capture(uri)?;
    configure_camera(&mut cap, target_size, 60.0);

    let mut frame = Mat::default();
    let mut resized = Mat::default();
    let mut rgb = Mat::default();
    let (target_w, target_h) = target_size;

    loop {
        cap.read(&mut frame).map_err(cv_error)?;
        let size = frame.size().map_err(cv_error)?;
        if size.width <= 0 {
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            imgproc::resize(
                &frame,
                &mut resized,
                core::Size::new(target_w, target_h),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )
            .map_err(cv_error)?;
            &resized
        } else {
            &frame
        };
        imgproc::cvt_color_def(working, &mut rgb, imgproc::COLOR_BGR2RGB).map_err(cv_error)?;

        let data = rgb.data_bytes().map_err(cv_error)?.to_vec();
        let image = RgbImage::from_raw(target_w as u32, target_h as u32, data)
            .ok_or_else(|| CaptureError::Other(anyhow!("capture buffer size mismatch")))?;

        let capture = Capture {
            image,
            timestamp_us: Utc::now().timestamp_micros(),
        };
        if tx.send(Ok(capture)).is_err() {
            break;
        }
    }

    Ok(())
}

fn cv_error(err: opencv::Error) -> CaptureError {
    CaptureError::Other(err.into())
}

/// Parse a numeric or `/dev/videoX` device reference.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    uri.strip_prefix("/dev/video")
        .filter(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) if cap.is_opened().map_err(cv_error)? => return Ok(cap),
                Ok(_) => {}
                Err(err) => warn!(index, backend, %err, "failed to open capture device"),
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) if cap.is_opened().map_err(cv_error)? => return Ok(cap),
            Ok(_) => {}
            Err(err) => warn!(uri, backend, %err, "failed to open capture source"),
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}

#[cfg(test)]
mod tests {
    use super::parse_device_index;

    #[test]
    fn device_paths_parse_to_indices() {
        assert_eq!(parse_device_index("2"), Some(2));
        assert_eq!(parse_device_index("/dev/video0"), Some(0));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://camera"), None);
    }
}
