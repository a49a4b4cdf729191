//! Colour-space conversion and HSV range thresholding.
//!
//! Hue uses the 8-bit 0..=180 scale (degrees halved) so settings carried over from existing
//! camera configurations keep their meaning.

use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

pub const HUE_MAX: u8 = 180;

/// Inclusive HSV window. When `hue.0 > hue.1` the hue window wraps through zero and accepts
/// `[0, hue.1] ∪ [hue.0, 180]`. Setting `hue_inverted` on an ordered window accepts the outside
/// of it the same way: `[0, hue.0] ∪ [hue.1, 180]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvThreshold {
    pub hue: (u8, u8),
    pub saturation: (u8, u8),
    pub value: (u8, u8),
    #[serde(default)]
    pub hue_inverted: bool,
}

impl Default for HsvThreshold {
    fn default() -> Self {
        Self {
            hue: (50, 180),
            saturation: (50, 255),
            value: (50, 255),
            hue_inverted: false,
        }
    }
}

impl HsvThreshold {
    pub fn hue_in_range(&self, hue: u8) -> bool {
        let (lower, upper) = self.hue;
        if lower > upper {
            hue <= upper || hue >= lower
        } else if self.hue_inverted {
            hue <= lower || hue >= upper
        } else {
            lower <= hue && hue <= upper
        }
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        let [h, s, v] = hsv;
        self.hue_in_range(h)
            && (self.saturation.0..=self.saturation.1).contains(&s)
            && (self.value.0..=self.value.1).contains(&v)
    }

    /// Binary mask: 255 where the pixel falls inside the window, 0 elsewhere.
    pub fn apply(&self, image: &RgbImage) -> GrayImage {
        let (width, height) = image.dimensions();
        let mut mask = GrayImage::new(width, height);
        for (dst, src) in mask.pixels_mut().zip(image.pixels()) {
            if self.contains(rgb_to_hsv(src.0)) {
                *dst = Luma([255]);
            }
        }
        mask
    }
}

/// 8-bit RGB to HSV with hue on the 0..=180 scale and saturation/value on 0..=255.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(f32::from);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta * 255.0 / max } else { 0.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    [
        (hue / 2.0).round().min(f32::from(HUE_MAX)) as u8,
        saturation.round() as u8,
        max as u8,
    ]
}

/// Luma per ITU-R BT.601, matching what most capture stacks call greyscale.
pub fn rgb_to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut gray = GrayImage::new(width, height);
    for (dst, src) in gray.pixels_mut().zip(image.pixels()) {
        let [r, g, b] = src.0.map(f32::from);
        *dst = Luma([(0.299 * r + 0.587 * g + 0.114 * b).round() as u8]);
    }
    gray
}
