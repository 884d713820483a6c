// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use chrono::Local;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_circle_mut};
use log::{error, info};

use crate::target_detector::DetectionResult;

// What the frame pipeline exposes to a display layer for each frame.
pub struct FrameView<'a> {
    pub frame_id: i32,
    // Binary segmentation of the frame.
    pub mask: &'a GrayImage,
    // Copy of the frame with the centroid marked.
    pub annotated: &'a RgbImage,
    pub result: &'a DetectionResult,
}

pub trait DisplaySink {
    // Returns false to request a manual interrupt (land and exit).
    fn show(&mut self, view: &FrameView) -> bool;
}

const MARKER_COLOR: Rgb<u8> = Rgb([255, 100, 100]);

// Returns a copy of `image` with a marker at the detected centroid. Nothing is
// drawn when there was no detection.
pub fn annotate(image: &RgbImage, result: &DetectionResult) -> RgbImage {
    let mut annotated = image.clone();
    if result.detected {
        let center = (result.centroid_x, result.centroid_y);
        draw_hollow_circle_mut(&mut annotated, center, 3, MARKER_COLOR);
        draw_cross_mut(&mut annotated, MARKER_COLOR, center.0, center.1);
    }
    annotated
}

// Saves every `interval`th frame (annotated image and mask) as PNG files in
// `dir`. Never requests an interrupt.
pub struct SnapshotDisplay {
    dir: PathBuf,
    interval: i32,
}

impl SnapshotDisplay {
    pub fn new(dir: PathBuf, interval: i32) -> Self {
        info!("Saving every {} frames to {:?}", interval, dir);
        SnapshotDisplay{dir, interval: interval.max(1)}
    }
}

impl DisplaySink for SnapshotDisplay {
    fn show(&mut self, view: &FrameView) -> bool {
        if view.frame_id % self.interval != 0 {
            return true;
        }
        let stamp = Local::now().format("%H%M%S%.3f");
        let annotated_path = self.dir.join(
            format!("frame_{:06}_{}.png", view.frame_id, stamp));
        let mask_path = self.dir.join(
            format!("mask_{:06}_{}.png", view.frame_id, stamp));
        if let Err(e) = view.annotated.save(&annotated_path) {
            error!("Could not save {:?}: {:?}", annotated_path, e);
        }
        if let Err(e) = view.mask.save(&mask_path) {
            error!("Could not save {:?}: {:?}", mask_path, e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate() {
        let image = RgbImage::new(20, 20);
        let result = DetectionResult{
            centroid_x: 10, centroid_y: 10, area: 300.0, detected: true};
        let annotated = annotate(&image, &result);
        // Cross center and circle edge are marked; the input image is untouched.
        assert_eq!(annotated.get_pixel(10, 10), &MARKER_COLOR);
        assert_eq!(annotated.get_pixel(13, 10), &MARKER_COLOR);
        assert_eq!(image.get_pixel(10, 10), &Rgb([0, 0, 0]));

        let blank = annotate(&image, &DetectionResult::NOT_DETECTED);
        assert_eq!(blank, image);
    }

    #[test]
    fn test_snapshot_display() {
        let dir = std::env::temp_dir().join(
            format!("tello_track_snapshots_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut display = SnapshotDisplay::new(dir.clone(), 2);
        let mask = GrayImage::new(4, 4);
        let annotated = RgbImage::new(4, 4);
        let result = DetectionResult::NOT_DETECTED;
        for frame_id in 0..3 {
            assert!(display.show(&FrameView{
                frame_id, mask: &mask, annotated: &annotated, result: &result}));
        }
        // Frames 0 and 2, two files each.
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 4);
        std::fs::remove_dir_all(&dir).unwrap();
    }

}  // mod tests.
