// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{GrayImage, Luma, Rgb};
use imageproc::map::map_colors;

use crate::frame_source::Frame;

// A color in 8-bit HSV: hue is 0..180 (degrees halved), saturation and value
// are 0..255.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

impl Hsv {
    pub fn from_rgb(pixel: &Rgb<u8>) -> Hsv {
        let [r, g, b] = pixel.0.map(i32::from);
        let v = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = v - min;
        let s = if v == 0 { 0 } else { (255 * delta + v / 2) / v };
        if delta == 0 {
            return Hsv{h: 0, s: s as u8, v: v as u8};
        }
        let delta = delta as f32;
        let mut degrees = if v == r {
            60.0 * (g - b) as f32 / delta
        } else if v == g {
            120.0 + 60.0 * (b - r) as f32 / delta
        } else {
            240.0 + 60.0 * (r - g) as f32 / delta
        };
        if degrees < 0.0 {
            degrees += 360.0;
        }
        let mut h = (degrees / 2.0).round() as i32;
        if h >= 180 {
            h -= 180;
        }
        Hsv{h: h as u8, s: s as u8, v: v as u8}
    }
}

// Inclusive bounds on all three HSV channels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorRange {
    pub low: Hsv,
    pub high: Hsv,
}

impl ColorRange {
    pub fn contains(&self, hsv: &Hsv) -> bool {
        (self.low.h..=self.high.h).contains(&hsv.h) &&
            (self.low.s..=self.high.s).contains(&hsv.s) &&
            (self.low.v..=self.high.v).contains(&hsv.v)
    }

    pub fn is_valid(&self) -> bool {
        self.low.h <= self.high.h && self.high.h < 180 &&
            self.low.s <= self.high.s && self.low.v <= self.high.v
    }
}

// Zeroth and first order moments of a binary mask.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Moments {
    // Count of mask pixels.
    pub m00: f64,
    // Sum of x coordinates of mask pixels.
    pub m10: f64,
    // Sum of y coordinates of mask pixels.
    pub m01: f64,
}

impl Moments {
    // Every non-zero pixel of `mask` has weight one.
    pub fn of_mask(mask: &GrayImage) -> Moments {
        let mut moments = Moments::default();
        for (x, y, pixel) in mask.enumerate_pixels() {
            if pixel[0] > 0 {
                moments.m00 += 1.0;
                moments.m10 += x as f64;
                moments.m01 += y as f64;
            }
        }
        moments
    }

    // None for an empty mask.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.m00 <= 0.0 {
            return None;
        }
        Some((self.m10 / self.m00, self.m01 / self.m00))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionResult {
    // Image coordinates of the target's centroid. Only meaningful when
    // `detected` is true.
    pub centroid_x: i32,
    pub centroid_y: i32,

    // Mask pixel count; zero when not detected.
    pub area: f64,

    pub detected: bool,
}

impl DetectionResult {
    pub const NOT_DETECTED: DetectionResult = DetectionResult{
        centroid_x: 0, centroid_y: 0, area: 0.0, detected: false};
}

impl Default for DetectionResult {
    fn default() -> Self {
        DetectionResult::NOT_DETECTED
    }
}

// Finds a single target of a given color by segmenting the frame in HSV
// space and taking the centroid of the resulting mask. Stateless.
#[derive(Clone, Debug)]
pub struct TargetDetector {
    color_range: ColorRange,

    // Masks with fewer pixels than this are treated as noise.
    noise_floor: f64,
}

impl TargetDetector {
    pub fn new(color_range: ColorRange, noise_floor: f64) -> Self {
        TargetDetector{color_range, noise_floor}
    }

    pub fn detect(&self, frame: &Frame) -> DetectionResult {
        self.measure(&self.segment(frame))
    }

    // Returns a mask that is 255 where the frame's pixel is within our color
    // range, 0 elsewhere.
    pub fn segment(&self, frame: &Frame) -> GrayImage {
        map_colors(&frame.image, |pixel| {
            if self.color_range.contains(&Hsv::from_rgb(&pixel)) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    pub fn measure(&self, mask: &GrayImage) -> DetectionResult {
        let moments = Moments::of_mask(mask);
        if moments.m00 < self.noise_floor {
            return DetectionResult::NOT_DETECTED;
        }
        match moments.centroid() {
            // Only reachable with a noise floor of zero.
            None => DetectionResult::NOT_DETECTED,
            Some((x, y)) => DetectionResult{
                centroid_x: x as i32,
                centroid_y: y as i32,
                area: moments.m00,
                detected: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use crate::frame_source::test_frames::frame_with_rect;
    use crate::settings::ServoSettings;
    use super::*;

    const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

    fn default_detector() -> TargetDetector {
        let settings = ServoSettings::default();
        TargetDetector::new(settings.color_range, settings.noise_floor)
    }

    #[test]
    fn test_hsv_from_rgb() {
        assert_eq!(Hsv::from_rgb(&Rgb([255, 0, 0])), Hsv{h: 0, s: 255, v: 255});
        assert_eq!(Hsv::from_rgb(&Rgb([0, 255, 0])), Hsv{h: 60, s: 255, v: 255});
        assert_eq!(Hsv::from_rgb(&BLUE), Hsv{h: 120, s: 255, v: 255});
        assert_eq!(Hsv::from_rgb(&Rgb([128, 128, 128])), Hsv{h: 0, s: 0, v: 128});
        assert_eq!(Hsv::from_rgb(&Rgb([0, 0, 0])), Hsv{h: 0, s: 0, v: 0});
        // Magenta-ish red wraps around near 180.
        assert_eq!(Hsv::from_rgb(&Rgb([255, 0, 1])).h, 0);
    }

    #[test]
    fn test_detect_target() {
        // 50x100 block; mean x is 200.5, mean y is 180.5.
        let frame = frame_with_rect(300, 300, (176, 131, 50, 100), BLUE);
        let detector = default_detector();

        let mask = detector.segment(&frame);
        assert_eq!(mask.dimensions(), (300, 300));
        assert_eq!(mask.get_pixel(176, 131).0, [255]);
        assert_eq!(mask.get_pixel(175, 131).0, [0]);
        let moments = Moments::of_mask(&mask);
        assert_eq!(moments.m00, 5000.0);
        let (cx, cy) = moments.centroid().unwrap();
        assert_abs_diff_eq!(cx, 200.5, epsilon = 1e-9);
        assert_abs_diff_eq!(cy, 180.5, epsilon = 1e-9);
        assert_abs_diff_eq!(cx, moments.m10 / moments.m00, epsilon = 1e-9);

        let result = detector.detect(&frame);
        assert!(result.detected);
        assert_eq!(result.area, 5000.0);
        assert_eq!(result.centroid_x, 200);
        assert_eq!(result.centroid_y, 180);

        // Same frame, same answer.
        assert_eq!(detector.detect(&frame), result);
    }

    #[test]
    fn test_below_noise_floor() {
        // 15x10 = 150 pixels.
        let frame = frame_with_rect(300, 300, (10, 10, 15, 10), BLUE);
        let result = default_detector().detect(&frame);
        assert!(!result.detected);
        assert_eq!(result.area, 0.0);
    }

    #[test]
    fn test_empty_mask() {
        let frame = frame_with_rect(300, 300, (0, 0, 0, 0), BLUE);
        assert_eq!(default_detector().detect(&frame), DetectionResult::NOT_DETECTED);

        // Even with no noise floor, an empty mask does not divide by zero.
        let detector = TargetDetector::new(ServoSettings::default().color_range, 0.0);
        assert_eq!(detector.detect(&frame), DetectionResult::NOT_DETECTED);
    }

    #[test]
    fn test_wrong_color_ignored() {
        let frame = frame_with_rect(300, 300, (50, 50, 100, 100), Rgb([255, 0, 0]));
        assert!(!default_detector().detect(&frame).detected);
    }

}  // mod tests.
