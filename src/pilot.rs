// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::drone::{Command, DroneLink};
use crate::flight_state::SharedFlightState;

// What became of a command handed to Pilot::send().
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    // Dropped because the drone has already been told to land.
    Suppressed,
    // The link reported an error; already logged.
    Failed,
}

// The single path by which the motion controller, landing supervisor and
// frame pipeline talk to the drone. Once Land has gone out, no further flight
// commands are dispatched and shutdown is requested.
#[derive(Clone)]
pub struct Pilot {
    state: Arc<Mutex<PilotState>>,
    flight_state: SharedFlightState,
}

struct PilotState {
    link: Box<dyn DroneLink + Send>,
    landed: bool,
}

impl Pilot {
    pub fn new(link: Box<dyn DroneLink + Send>, flight_state: SharedFlightState) -> Self {
        Pilot{
            state: Arc::new(Mutex::new(PilotState{link, landed: false})),
            flight_state,
        }
    }

    pub fn has_landed(&self) -> bool {
        self.state.lock().unwrap().landed
    }

    pub fn send(&self, command: Command) -> Dispatch {
        // The lock is held across the link write so that commands from
        // different actors are totally ordered with respect to Land.
        let mut locked_state = self.state.lock().unwrap();
        if locked_state.landed && command.is_flight_command() {
            debug!("Suppressing {} after Land", command);
            return Dispatch::Suppressed;
        }
        if command == Command::Land {
            locked_state.landed = true;
            info!("Landing");
        }
        let dispatch = match locked_state.link.send(&command) {
            Ok(()) => {
                debug!("Sent {}", command);
                Dispatch::Sent
            },
            Err(e) => {
                error!("Error sending {}: {}", command, &e.to_string());
                Dispatch::Failed
            }
        };
        drop(locked_state);
        if command == Command::Land {
            self.flight_state.request_shutdown();
        }
        dispatch
    }
}

// mod tests.
