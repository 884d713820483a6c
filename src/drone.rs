// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use canonical_error::{CanonicalError, unavailable_error};
use log::info;
use tello::{Drone, Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    // Positive is right.
    Lateral,
    // Positive is forward.
    Longitudinal,
    // Positive is up.
    Vertical,
    // Positive is clockwise.
    Yaw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TakeOff,
    Land,
    // Zero all axes.
    Hover,
    // Signed magnitude in the drone's velocity unit.
    Move(Axis, i32),
    // Asks the drone to (keep) streaming video.
    StartVideo,
}

impl Command {
    pub fn up(n: i32) -> Command { Command::Move(Axis::Vertical, n) }
    pub fn down(n: i32) -> Command { Command::Move(Axis::Vertical, -n) }
    pub fn right(n: i32) -> Command { Command::Move(Axis::Lateral, n) }
    pub fn forward(n: i32) -> Command { Command::Move(Axis::Longitudinal, n) }

    // True for commands that make the drone fly.
    pub fn is_flight_command(&self) -> bool {
        !matches!(self, Command::StartVideo)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Move(Axis::Lateral, n) => write!(f, "Right({})", n),
            Command::Move(Axis::Longitudinal, n) => write!(f, "Forward({})", n),
            Command::Move(Axis::Vertical, n) if *n < 0 => write!(f, "Down({})", -n),
            Command::Move(Axis::Vertical, n) => write!(f, "Up({})", n),
            Command::Move(Axis::Yaw, n) => write!(f, "Clockwise({})", n),
            other => write!(f, "{:?}", other),
        }
    }
}

// The drone's command interface. Commands are fire-and-forget: Ok means the
// command was handed to the transport, not that the drone acted on it.
pub trait DroneLink {
    fn send(&mut self, command: &Command) -> Result<(), CanonicalError>;
}

// Move magnitudes are in percent of full stick deflection.
pub const TELLO_STICK_LIMIT: i32 = 100;

// Camera settings applied once the drone is reporting flight status.
pub const VIDEO_BITRATE_AUTO: u8 = 0;
pub const CAMERA_EXPOSURE: u8 = 1;

// Most messages returned by one TelloLink::poll_messages() call.
const MAX_MESSAGES_PER_POLL: usize = 32;

fn stick(magnitude: i32) -> f32 {
    magnitude.clamp(-TELLO_STICK_LIMIT, TELLO_STICK_LIMIT) as f32 / TELLO_STICK_LIMIT as f32
}

fn sent(what: &str, result: Result<(), ()>) -> Result<(), CanonicalError> {
    result.map_err(|_| unavailable_error(format!("Could not send {} to drone", what).as_str()))
}

// Flies a Tello using its native protocol. Move and Hover only update the
// stick state; the stick state reaches the drone from poll_messages(), which
// must be called at least 30 times per second (see TelloPoller). Clones share
// the same connection.
#[derive(Clone)]
pub struct TelloLink {
    drone: Arc<Mutex<Drone>>,
}

impl TelloLink {
    // Binds the command port (8889) and `video_port`, and asks the drone to
    // connect. Panics if either port is unavailable.
    pub fn connect(drone_addr: SocketAddr, video_port: u16) -> TelloLink {
        let mut drone = Drone::new(drone_addr.to_string().as_str());
        drone.connect(video_port);
        info!("Connecting to drone at {}, video on port {}", drone_addr, video_port);
        TelloLink{drone: Arc::new(Mutex::new(drone))}
    }

    // Sends the current stick state if due, and returns whatever the drone has
    // sent since the last call.
    pub fn poll_messages(&self) -> Vec<Message> {
        let mut drone = self.drone.lock().unwrap();
        let mut messages = Vec::new();
        while messages.len() < MAX_MESSAGES_PER_POLL {
            match drone.poll() {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    }

    pub fn configure_camera(&self) -> Result<(), CanonicalError> {
        let mut drone = self.drone.lock().unwrap();
        sent("video bitrate", drone.set_video_bitrate(VIDEO_BITRATE_AUTO))?;
        sent("exposure", drone.set_exposure(CAMERA_EXPOSURE))
    }
}

impl DroneLink for TelloLink {
    fn send(&mut self, command: &Command) -> Result<(), CanonicalError> {
        let mut drone = self.drone.lock().unwrap();
        match command {
            Command::TakeOff => sent("takeoff", drone.take_off()),
            Command::Land => {
                stop_sticks(&mut drone);
                sent("land", drone.land())
            },
            Command::StartVideo => sent("start video", drone.start_video()),
            Command::Hover => {
                stop_sticks(&mut drone);
                Ok(())
            },
            Command::Move(axis, magnitude) => {
                let value = stick(*magnitude);
                let rc_state = &mut drone.rc_state;
                match axis {
                    Axis::Lateral => rc_state.go_left_right(value),
                    Axis::Longitudinal => rc_state.go_forward_back(value),
                    Axis::Vertical => rc_state.go_up_down(value),
                    Axis::Yaw => rc_state.turn(value),
                }
                Ok(())
            },
        }
    }
}

fn stop_sticks(drone: &mut Drone) {
    drone.rc_state.stop_left_right();
    drone.rc_state.stop_forward_back();
    drone.rc_state.stop_up_down();
    drone.rc_state.stop_turn();
}

// Records commands instead of flying. Used for dry runs and tests; clones
// share the same record.
#[derive(Clone, Default)]
pub struct SimulatedDrone {
    sent: Arc<Mutex<Vec<(Instant, Command)>>>,
}

impl SimulatedDrone {
    pub fn new() -> Self {
        SimulatedDrone::default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.sent.lock().unwrap().iter().map(|(_, c)| *c).collect()
    }

    pub fn timed_commands(&self) -> Vec<(Instant, Command)> {
        self.sent.lock().unwrap().clone()
    }
}

impl DroneLink for SimulatedDrone {
    fn send(&mut self, command: &Command) -> Result<(), CanonicalError> {
        info!("Simulated drone: {}", command);
        self.sent.lock().unwrap().push((Instant::now(), *command));
        Ok(())
    }
}

// mod tests.
