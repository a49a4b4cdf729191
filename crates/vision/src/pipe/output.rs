//! Output-stream image preparation: downscaling and channel expansion.

use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use video_ingest::FrameImage;

use super::{Pipe, configured};
use crate::error::{ParamError, VisionError};

/// Streaming downscale factor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDivisor {
    #[default]
    None,
    Half,
    Quarter,
    Sixth,
}

impl FrameDivisor {
    pub fn value(self) -> u32 {
        match self {
            FrameDivisor::None => 1,
            FrameDivisor::Half => 2,
            FrameDivisor::Quarter => 4,
            FrameDivisor::Sixth => 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResizeImageParams {
    pub divisor: u32,
}

impl From<FrameDivisor> for ResizeImageParams {
    fn from(divisor: FrameDivisor) -> Self {
        Self {
            divisor: divisor.value(),
        }
    }
}

#[derive(Default)]
pub struct ResizeImagePipe {
    params: Option<ResizeImageParams>,
}

impl<'a> Pipe<&'a mut FrameImage> for ResizeImagePipe {
    type Output = ();
    type Params = ResizeImageParams;

    fn set_params(&mut self, params: ResizeImageParams) -> Result<(), VisionError> {
        if params.divisor == 0 {
            return Err(ParamError::out_of_range("resize image", "divisor", "x >= 1", 0.0).into());
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, image: &'a mut FrameImage) -> Result<(), VisionError> {
        let params = configured(&self.params, "resize image")?;
        if params.divisor == 1 || image.is_empty() {
            return Ok(());
        }
        let (width, height) = image.dimensions();
        let (width, height) = ((width / params.divisor).max(1), (height / params.divisor).max(1));
        *image = match std::mem::take(image) {
            FrameImage::Gray(gray) => {
                FrameImage::Gray(imageops::resize(&gray, width, height, FilterType::Triangle))
            }
            FrameImage::Rgb(rgb) => {
                FrameImage::Rgb(imageops::resize(&rgb, width, height, FilterType::Triangle))
            }
            FrameImage::Empty => FrameImage::Empty,
        };
        Ok(())
    }
}

/// Expands a single-channel output image to three channels so overlays can be drawn in colour.
#[derive(Default)]
pub struct OutputMatPipe;

impl<'a> Pipe<&'a mut FrameImage> for OutputMatPipe {
    type Output = ();
    type Params = ();

    fn set_params(&mut self, _params: ()) -> Result<(), VisionError> {
        Ok(())
    }

    fn process(&mut self, image: &'a mut FrameImage) -> Result<(), VisionError> {
        if image.channels() == 1 {
            *image = std::mem::take(image).into_rgb();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};

    #[test]
    fn divisor_zero_is_rejected_at_configuration() {
        let mut pipe = ResizeImagePipe::default();
        assert!(matches!(
            pipe.set_params(ResizeImageParams { divisor: 0 }),
            Err(VisionError::Params(ParamError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn quarter_divisor_shrinks_both_axes() {
        let mut pipe = ResizeImagePipe::default();
        pipe.set_params(FrameDivisor::Quarter.into()).unwrap();
        let mut image = FrameImage::Rgb(RgbImage::new(640, 480));
        pipe.run(&mut image).unwrap();
        assert_eq!(image.dimensions(), (160, 120));
    }

    #[test]
    fn single_channel_output_becomes_colour() {
        let mut pipe = OutputMatPipe;
        let mut image = FrameImage::Gray(GrayImage::new(4, 4));
        pipe.process(&mut image).unwrap();
        assert_eq!(image.channels(), 3);
    }
}
