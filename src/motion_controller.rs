// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::thread;

use log::{debug, info, warn};

use crate::drone::Command;
use crate::flight_state::SharedFlightState;
use crate::pilot::Pilot;
use crate::settings::ServoSettings;
use crate::target_detector::DetectionResult;

// Commanded velocity, in the drone's velocity unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Velocity {
    // Positive is right.
    pub lateral: i32,
    // Positive is forward.
    pub forward: i32,
}

// Proportional mapping from the target's offset from frame center to a
// velocity. The full half-frame offset maps to `speed_scale`; the result is
// clamped to the command interface's valid range. Returns None if the target
// was not detected.
pub fn proportional_command(result: &DetectionResult, speed_scale: f64,
                            settings: &ServoSettings) -> Option<Velocity> {
    if !result.detected {
        return None;
    }
    let (center_x, center_y) = settings.frame_center();
    let dx = (result.centroid_x - center_x) as f64;
    let dy = (result.centroid_y - center_y) as f64;
    let limit = settings.velocity_limit;
    let lateral = (dx * speed_scale / center_x as f64).round() as i32;
    let forward = (dy * speed_scale / center_y as f64).round() as i32;
    Some(Velocity{
        lateral: lateral.clamp(-limit, limit),
        forward: forward.clamp(-limit, limit),
    })
}

// Keeps the target centered. After a one-time takeoff prelude, acts on each
// newly published detection until shutdown.
pub struct MotionController {
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl MotionController {
    pub fn start(flight_state: SharedFlightState, pilot: Pilot,
                 settings: ServoSettings) -> Self {
        MotionController{
            worker_thread: Some(thread::spawn(move || {
                MotionController::worker(flight_state, pilot, settings);
            })),
        }
    }

    // Waits for the worker to exit. Call after shutdown has been requested.
    pub fn join(&mut self) {
        if let Some(handle) = self.worker_thread.take() {
            if handle.join().is_err() {
                warn!("Motion controller thread panicked");
            }
        }
    }

    // Returns false if shutdown occurred during the prelude.
    fn startup(flight_state: &SharedFlightState, pilot: &Pilot,
               settings: &ServoSettings) -> bool {
        info!("Taking off");
        pilot.send(Command::TakeOff);
        pilot.send(Command::up(settings.takeoff_ascend));
        if !flight_state.sleep(settings.ascend_period) {
            return false;
        }
        pilot.send(Command::Hover);
        flight_state.sleep(settings.settle_period)
    }

    fn worker(flight_state: SharedFlightState, pilot: Pilot,
              settings: ServoSettings) {
        if !MotionController::startup(&flight_state, &pilot, &settings) {
            info!("Motion controller stopped during startup");
            return;
        }
        info!("Tracking");
        let mut prev_frame_id: Option<i32> = None;
        loop {
            let snapshot = match flight_state.wait_for_detection(
                prev_frame_id, settings.stale_detection_timeout)
            {
                Some(s) => s,
                None => {
                    warn!("No fresh detection within {:?}, hovering",
                          settings.stale_detection_timeout);
                    pilot.send(Command::Hover);
                    continue;
                }
            };
            if snapshot.shutdown {
                break;
            }
            prev_frame_id = snapshot.frame_id;
            match proportional_command(&snapshot.latest, snapshot.speed_scale, &settings) {
                None => {
                    debug!("Not detected");
                    pilot.send(Command::Hover);
                },
                Some(velocity) => {
                    debug!("Right {} Forward {}", velocity.lateral, velocity.forward);
                    pilot.send(Command::right(velocity.lateral));
                    pilot.send(Command::forward(velocity.forward));
                }
            }
        }
        info!("Motion controller stopped");
    }
}

impl Drop for MotionController {
    fn drop(&mut self) {
        self.join();
    }
}

// mod tests.
