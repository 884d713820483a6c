// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::thread;

use log::{info, warn};

use crate::drone::Command;
use crate::flight_state::SharedFlightState;
use crate::pilot::Pilot;
use crate::settings::ServoSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LandingOutcome {
    // The target filled enough of the frame; landed at this attempt
    // (zero-based).
    TargetReached { attempt: u32 },
    // Ran out of descent attempts; landed anyway.
    AttemptsExhausted,
    // Shutdown happened before we issued Land.
    Cancelled,
}

// Ends the flight. After `arm_delay` the speed scale is lowered and the drone
// descends in steps until the target is close enough to land on, or the
// attempt bound is reached, at which point it lands unconditionally.
pub struct LandingSupervisor {
    worker_thread: Option<thread::JoinHandle<LandingOutcome>>,
}

impl LandingSupervisor {
    pub fn start(flight_state: SharedFlightState, pilot: Pilot,
                 settings: ServoSettings) -> Self {
        LandingSupervisor{
            worker_thread: Some(thread::spawn(move || {
                LandingSupervisor::worker(flight_state, pilot, settings)
            })),
        }
    }

    // Waits for the worker to exit. Returns None if already joined or if the
    // worker panicked.
    pub fn join(&mut self) -> Option<LandingOutcome> {
        match self.worker_thread.take()?.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!("Landing supervisor thread panicked");
                None
            }
        }
    }

    fn worker(flight_state: SharedFlightState, pilot: Pilot,
              settings: ServoSettings) -> LandingOutcome {
        if !flight_state.sleep(settings.arm_delay) {
            info!("Landing supervisor cancelled before arming");
            return LandingOutcome::Cancelled;
        }
        info!("Landing supervisor armed, speed scale now {}",
              settings.descent_speed_scale);
        flight_state.set_speed_scale(settings.descent_speed_scale);

        let area_goal = settings.landing_area_fraction * settings.frame_area();
        for attempt in 0..settings.landing_attempts {
            let snapshot = flight_state.snapshot();
            if snapshot.shutdown {
                info!("Landing supervisor cancelled at attempt {}", attempt);
                return LandingOutcome::Cancelled;
            }
            if snapshot.latest.area > area_goal {
                info!("Target area {} exceeds {}, landing", snapshot.latest.area, area_goal);
                pilot.send(Command::Land);
                return LandingOutcome::TargetReached{attempt};
            }
            info!("Descending, attempt {}", attempt);
            pilot.send(Command::down(settings.descend_step));
            if !flight_state.sleep(settings.descend_interval) {
                info!("Landing supervisor cancelled at attempt {}", attempt);
                return LandingOutcome::Cancelled;
            }
        }
        info!("Descent attempts exhausted, landing");
        pilot.send(Command::Land);
        LandingOutcome::AttemptsExhausted
    }
}

impl Drop for LandingSupervisor {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use canonical_error::CanonicalError;
    use crate::drone::{DroneLink, SimulatedDrone};
    use crate::target_detector::DetectionResult;
    use super::*;

    fn quick_settings() -> ServoSettings {
        ServoSettings{
            arm_delay: Duration::ZERO,
            descend_interval: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn target_with_area(area: f64) -> DetectionResult {
        DetectionResult{centroid_x: 150, centroid_y: 150, area, detected: true}
    }

    #[test]
    fn test_attempts_exhausted() {
        let drone = SimulatedDrone::new();
        let flight_state = SharedFlightState::new(50.0);
        let pilot = Pilot::new(Box::new(drone.clone()), flight_state.clone());
        // Large, but not 40% of the frame.
        flight_state.publish(0, target_with_area(0.39 * 90000.0));

        let settings = ServoSettings{
            descend_interval: Duration::from_millis(20), ..quick_settings()
        };
        let mut supervisor = LandingSupervisor::start(
            flight_state.clone(), pilot, settings);
        assert_eq!(supervisor.join(), Some(LandingOutcome::AttemptsExhausted));

        let mut expected = vec![Command::down(30); 15];
        expected.push(Command::Land);
        assert_eq!(drone.commands(), expected);
        assert_eq!(flight_state.snapshot().speed_scale, 20.0);
        assert!(flight_state.is_shutdown());

        // Downs are spaced by the descend interval.
        let timed = drone.timed_commands();
        for pair in timed.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(20));
        }
    }

    // Publishes a near-frame-filling target once it has seen `trigger` Down
    // commands, as if the descent brought the drone close.
    struct ApproachingDrone {
        recorder: SimulatedDrone,
        flight_state: SharedFlightState,
        downs: u32,
        trigger: u32,
    }

    impl DroneLink for ApproachingDrone {
        fn send(&mut self, command: &Command) -> Result<(), CanonicalError> {
            if *command == Command::down(30) {
                self.downs += 1;
                if self.downs == self.trigger {
                    self.flight_state.publish(1, target_with_area(0.45 * 90000.0));
                }
            }
            self.recorder.send(command)
        }
    }

    #[test]
    fn test_target_reached() {
        let recorder = SimulatedDrone::new();
        let flight_state = SharedFlightState::new(50.0);
        let link = ApproachingDrone{
            recorder: recorder.clone(),
            flight_state: flight_state.clone(),
            downs: 0,
            trigger: 3,
        };
        let pilot = Pilot::new(Box::new(link), flight_state.clone());
        flight_state.publish(0, target_with_area(1000.0));

        let mut supervisor = LandingSupervisor::start(
            flight_state.clone(), pilot, quick_settings());
        assert_eq!(supervisor.join(),
                   Some(LandingOutcome::TargetReached{attempt: 3}));
        assert_eq!(recorder.commands(),
                   vec![Command::down(30), Command::down(30), Command::down(30),
                        Command::Land]);
    }

    #[test]
    fn test_cancelled_before_arming() {
        let drone = SimulatedDrone::new();
        let flight_state = SharedFlightState::new(50.0);
        let pilot = Pilot::new(Box::new(drone.clone()), flight_state.clone());
        let mut supervisor = LandingSupervisor::start(
            flight_state.clone(), pilot.clone(), ServoSettings::default());
        // Someone else lands first.
        pilot.send(Command::Land);
        assert_eq!(supervisor.join(), Some(LandingOutcome::Cancelled));
        assert_eq!(drone.commands(), vec![Command::Land]);
        // Speed scale was never lowered.
        assert_eq!(flight_state.snapshot().speed_scale, 50.0);
    }

}  // mod tests.
