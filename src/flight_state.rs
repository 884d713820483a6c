// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::info;

use crate::target_detector::DetectionResult;

// The state shared between the frame pipeline, motion controller and landing
// supervisor. Readers always receive a whole copy, never a mix of fields from
// different updates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlightState {
    // Result from the most recently processed frame.
    pub latest: DetectionResult,

    // Identifies the frame that `latest` came from. None until the first frame
    // is processed.
    pub frame_id: Option<i32>,

    // Maximum per-axis command magnitude.
    pub speed_scale: f64,

    // Set once the flight is over; all actors stop issuing commands and exit.
    pub shutdown: bool,
}

#[derive(Clone)]
pub struct SharedFlightState {
    state: Arc<Mutex<FlightState>>,

    // Signalled whenever a new detection is published, and when shutdown is
    // requested.
    changed: Arc<Condvar>,
}

impl SharedFlightState {
    pub fn new(speed_scale: f64) -> Self {
        SharedFlightState{
            state: Arc::new(Mutex::new(FlightState{
                latest: DetectionResult::NOT_DETECTED,
                frame_id: None,
                speed_scale,
                shutdown: false,
            })),
            changed: Arc::new(Condvar::new()),
        }
    }

    pub fn snapshot(&self) -> FlightState {
        *self.state.lock().unwrap()
    }

    // Called by the frame pipeline once per processed frame.
    pub fn publish(&self, frame_id: i32, result: DetectionResult) {
        let mut locked_state = self.state.lock().unwrap();
        locked_state.latest = result;
        locked_state.frame_id = Some(frame_id);
        self.changed.notify_all();
    }

    pub fn set_speed_scale(&self, speed_scale: f64) {
        self.state.lock().unwrap().speed_scale = speed_scale;
    }

    pub fn request_shutdown(&self) {
        let mut locked_state = self.state.lock().unwrap();
        if !locked_state.shutdown {
            info!("Shutdown requested");
            locked_state.shutdown = true;
        }
        self.changed.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    /// Waits for a state whose `frame_id` differs from `prev_frame_id`, or for
    /// shutdown. Returns None if neither happens within `timeout`.
    pub fn wait_for_detection(&self, prev_frame_id: Option<i32>, timeout: Duration)
                              -> Option<FlightState> {
        let deadline = Instant::now() + timeout;
        let mut locked_state = self.state.lock().unwrap();
        loop {
            if locked_state.shutdown ||
                (locked_state.frame_id.is_some() && locked_state.frame_id != prev_frame_id)
            {
                return Some(*locked_state);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            locked_state = self.changed.wait_timeout(
                locked_state, deadline - now).unwrap().0;
        }
    }

    /// Sleeps for `duration`, waking early if shutdown is requested.
    /// Returns: true if the full duration elapsed, false on shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut locked_state = self.state.lock().unwrap();
        loop {
            if locked_state.shutdown {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            locked_state = self.changed.wait_timeout(
                locked_state, deadline - now).unwrap().0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use super::*;

    fn detection(x: i32, y: i32, area: f64) -> DetectionResult {
        DetectionResult{centroid_x: x, centroid_y: y, area, detected: true}
    }

    #[test]
    fn test_publish_and_snapshot() {
        let state = SharedFlightState::new(50.0);
        let initial = state.snapshot();
        assert_eq!(initial.frame_id, None);
        assert!(!initial.latest.detected);
        assert_eq!(initial.speed_scale, 50.0);

        state.publish(3, detection(10, 20, 500.0));
        state.set_speed_scale(20.0);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.frame_id, Some(3));
        assert_eq!(snapshot.latest, detection(10, 20, 500.0));
        assert_eq!(snapshot.speed_scale, 20.0);
    }

    #[test]
    fn test_wait_for_detection() {
        let state = SharedFlightState::new(50.0);
        // Nothing published yet.
        assert!(state.wait_for_detection(None, Duration::from_millis(10)).is_none());

        state.publish(0, detection(1, 1, 300.0));
        assert_eq!(state.wait_for_detection(None, Duration::ZERO).unwrap().frame_id,
                   Some(0));
        // Already seen frame 0.
        assert!(state.wait_for_detection(Some(0), Duration::from_millis(10)).is_none());

        let cloned_state = state.clone();
        let publisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cloned_state.publish(1, detection(2, 2, 300.0));
        });
        let next = state.wait_for_detection(Some(0), Duration::from_secs(5)).unwrap();
        assert_eq!(next.frame_id, Some(1));
        assert_eq!(next.latest.centroid_x, 2);
        publisher.join().unwrap();
    }

    #[test]
    fn test_sleep_interrupted_by_shutdown() {
        let state = SharedFlightState::new(50.0);
        assert!(state.sleep(Duration::from_millis(5)));

        let cloned_state = state.clone();
        let start = Instant::now();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cloned_state.request_shutdown();
        });
        assert!(!state.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        stopper.join().unwrap();

        assert!(state.is_shutdown());
        // Shutdown also releases detection waiters.
        assert!(state.wait_for_detection(None, Duration::from_secs(30)).unwrap().shutdown);
    }

}  // mod tests.
