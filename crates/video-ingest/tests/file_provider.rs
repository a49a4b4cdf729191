use image::{Rgb, RgbImage};
use video_ingest::{
    FileFrameProvider, FrameProvider, FrameThresholdType, HsvThreshold, ImageRotationMode,
};

fn write_fixture(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let mut image = RgbImage::from_pixel(16, 8, Rgb([10, 10, 10]));
    for y in 2..6 {
        for x in 4..8 {
            image.put_pixel(x, y, Rgb([0, 220, 0]));
        }
    }
    let path = dir.path().join("target.png");
    image.save(&path).expect("write fixture");
    path
}

#[test]
fn serves_decoded_image_with_static_properties() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_fixture(&dir);
    let mut provider = FileFrameProvider::open(&path, 68.5, None).expect("open");

    assert_eq!(provider.name(), "target.png");
    let frame = provider.get().expect("frame");
    assert_eq!(frame.color.dimensions(), (16, 8));
    assert_eq!(frame.static_properties.image_width, 16);
    assert_eq!(frame.static_properties.fov, 68.5);
    assert!(provider.is_connected());
}

#[test]
fn honours_threshold_requests_between_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_fixture(&dir);
    let mut provider = FileFrameProvider::open(&path, 70.0, None).expect("open");

    provider.request_frame_threshold_type(FrameThresholdType::Hsv);
    provider.request_hsv_settings(HsvThreshold {
        hue: (50, 70),
        saturation: (100, 255),
        value: (100, 255),
        hue_inverted: false,
    });
    let frame = provider.get().expect("frame");
    let mask = frame.processed.as_gray().expect("binary plane");
    let lit = mask.pixels().filter(|p| p.0 == [255]).count();
    assert_eq!(lit, 16);

    provider.request_frame_threshold_type(FrameThresholdType::Greyscale);
    provider.request_frame_rotation(ImageRotationMode::Deg90);
    let frame = provider.get().expect("frame");
    assert_eq!(frame.processed.channels(), 1);
    assert_eq!(frame.processed.dimensions(), (8, 16));
}

#[test]
fn missing_file_reports_decode_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = FileFrameProvider::open(dir.path().join("absent.png"), 70.0, None)
        .err()
        .expect("missing file must fail");
    assert!(err.to_string().contains("absent.png"));
}
