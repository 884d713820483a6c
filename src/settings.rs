// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

use crate::frame_source::bgr_frame_len;
use crate::target_detector::{ColorRange, Hsv};

// Largest accepted frame width or height.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

// All tunable values of the tracker. Defaults are what the drone was flown
// with; every field can be overridden from the command line.
#[derive(Clone, Debug)]
pub struct ServoSettings {
    // Dimensions of the raw frames produced by the video transport.
    pub frame_width: u32,
    pub frame_height: u32,

    // HSV range (8-bit convention, hue 0..180) of the tracked color.
    pub color_range: ColorRange,

    // Minimum mask pixel count for a detection to be reported.
    pub noise_floor: f64,

    // Maximum per-axis command magnitude while tracking, and after the landing
    // supervisor arms.
    pub cruise_speed_scale: f64,
    pub descent_speed_scale: f64,

    // Valid range of the command interface's velocity unit is
    // -velocity_limit..=velocity_limit.
    pub velocity_limit: i32,

    // Startup prelude of the motion controller.
    pub takeoff_ascend: i32,
    pub ascend_period: Duration,
    pub settle_period: Duration,

    // If no fresh detection arrives within this time the motion controller
    // hovers.
    pub stale_detection_timeout: Duration,

    // Landing supervisor.
    pub arm_delay: Duration,
    pub landing_attempts: u32,
    pub landing_area_fraction: f64,
    pub descend_step: i32,
    pub descend_interval: Duration,

    // Processing latency is logged every this many frames. Zero disables.
    pub stats_log_interval: u32,
}

impl Default for ServoSettings {
    fn default() -> Self {
        ServoSettings {
            frame_width: 300,
            frame_height: 300,
            color_range: ColorRange {
                low: Hsv { h: 100, s: 50, v: 50 },
                high: Hsv { h: 140, s: 255, v: 255 },
            },
            noise_floor: 200.0,
            cruise_speed_scale: 50.0,
            descent_speed_scale: 20.0,
            velocity_limit: 100,
            takeoff_ascend: 40,
            ascend_period: Duration::from_secs(3),
            settle_period: Duration::from_secs(10),
            stale_detection_timeout: Duration::from_secs(1),
            arm_delay: Duration::from_secs(90),
            landing_attempts: 15,
            landing_area_fraction: 0.4,
            descend_step: 30,
            descend_interval: Duration::from_secs(2),
            stats_log_interval: 100,
        }
    }
}

impl ServoSettings {
    pub fn frame_center(&self) -> (i32, i32) {
        ((self.frame_width / 2) as i32, (self.frame_height / 2) as i32)
    }

    pub fn frame_area(&self) -> f64 {
        self.frame_width as f64 * self.frame_height as f64
    }

    // Number of bytes in one raw BGR frame.
    pub fn frame_size(&self) -> usize {
        bgr_frame_len(self.frame_width, self.frame_height)
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.frame_width < 2 || self.frame_height < 2 {
            return Err(invalid_argument_error(
                format!("Frame dimensions {}x{} too small",
                        self.frame_width, self.frame_height).as_str()));
        }
        if self.frame_width > MAX_FRAME_DIMENSION || self.frame_height > MAX_FRAME_DIMENSION {
            return Err(invalid_argument_error(
                format!("Frame dimensions {}x{} exceed {}",
                        self.frame_width, self.frame_height,
                        MAX_FRAME_DIMENSION).as_str()));
        }
        if !self.color_range.is_valid() {
            return Err(invalid_argument_error(
                format!("Color range {:?} is empty or hue exceeds 179",
                        self.color_range).as_str()));
        }
        if self.cruise_speed_scale < 0.0 || self.descent_speed_scale < 0.0 {
            return Err(invalid_argument_error("Speed scales must be non-negative"));
        }
        if self.velocity_limit <= 0 {
            return Err(invalid_argument_error(
                format!("Got non-positive velocity_limit {}",
                        self.velocity_limit).as_str()));
        }
        if !(0.0..=1.0).contains(&self.landing_area_fraction) {
            return Err(invalid_argument_error(
                format!("landing_area_fraction {} not in 0..1",
                        self.landing_area_fraction).as_str()));
        }
        Ok(())
    }
}

// mod tests.
