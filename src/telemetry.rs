// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tello::{Message, Package, PackageData, ResponseMsg};

use crate::drone::TelloLink;
use crate::flight_state::SharedFlightState;
use crate::video_transport::PacketSink;

// The drone needs its stick state at least every 33ms, and video frames
// arrive faster than that.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// The tello crate sends its own camera defaults along with the third flight
// status after connecting; ours go out right after.
const CAMERA_SETUP_STATUS_COUNT: u32 = 3;

// Keeps the drone connection alive: polls the drone, which sends the stick
// state and requests video key frames, logs battery level changes, and
// forwards video frames to the decoder. Runs until shutdown, then closes the
// decoder's input so the frame pipeline is not left waiting.
pub struct TelloPoller {
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl TelloPoller {
    pub fn start(link: TelloLink, video: Option<PacketSink>,
                 flight_state: SharedFlightState) -> Self {
        TelloPoller{
            worker_thread: Some(thread::spawn(move || {
                TelloPoller::worker(link, video, flight_state);
            })),
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }

    fn worker(link: TelloLink, video: Option<PacketSink>, flight_state: SharedFlightState) {
        let mut status_count = 0_u32;
        let mut battery: Option<u8> = None;
        let mut frame_count = 0_u64;
        loop {
            for message in link.poll_messages() {
                match message {
                    Message::Response(ResponseMsg::Connected(reply)) => {
                        info!("Drone connected: {}", reply.trim_matches(char::from(0)).trim());
                        status_count = 0;
                    },
                    Message::Response(ResponseMsg::UnknownCommand(command)) => {
                        debug!("Drone did not understand {:?}", command);
                    },
                    Message::Data(Package{data: PackageData::FlightData(flight_data), ..}) => {
                        status_count += 1;
                        if status_count == CAMERA_SETUP_STATUS_COUNT {
                            match link.configure_camera() {
                                Ok(()) => info!("Configured camera"),
                                Err(e) => warn!("Camera setup failed: {}", &e.to_string()),
                            }
                        }
                        if battery != Some(flight_data.battery_percentage) {
                            battery = Some(flight_data.battery_percentage);
                            info!("Battery: {}%", flight_data.battery_percentage);
                        }
                        debug!("Height {}dm, flight time {}",
                               flight_data.height, flight_data.fly_time);
                    },
                    Message::Frame(_, data) => {
                        let Some(sink) = video.as_ref() else { continue; };
                        if frame_count == 0 {
                            info!("Receiving video");
                        }
                        frame_count += 1;
                        if let Err(e) = sink.write_packet(&data) {
                            warn!("Dropped video frame: {}", &e.to_string());
                        }
                    },
                    Message::Data(_) => (),
                }
            }
            if !flight_state.sleep(POLL_INTERVAL) {
                break;
            }
        }
        if let Some(sink) = video {
            sink.close();
        }
        info!("Drone polling stopped after {} video frames", frame_count);
    }
}

impl Drop for TelloPoller {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::process::Command as ProcessCommand;
    use crate::drone::{Command, DroneLink};
    use crate::frame_source::FrameSource;
    use crate::video_transport::FfmpegDecoder;
    use super::*;

    // Waits for a native protocol packet carrying `command`. Stick updates
    // and key frame requests go out continually and are skipped.
    fn expect_command(drone: &UdpSocket, command: tello::CommandIds) {
        let mut buf = [0_u8; 1500];
        loop {
            let (len, _) = drone.recv_from(&mut buf).unwrap();
            if len >= 7 && buf[0] == 0xcc &&
                u16::from_le_bytes([buf[5], buf[6]]) == command as u16 {
                return;
            }
        }
    }

    // The native protocol binds the fixed command port, so the whole link is
    // exercised from this one test.
    #[test]
    fn test_tello_link_and_poller() {
        let drone = UdpSocket::bind("127.0.0.1:0").unwrap();
        drone.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let video_port = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let link = TelloLink::connect(drone.local_addr().unwrap(), video_port);
        expect_command(&drone, tello::CommandIds::VideoStartCmd);

        let (mut decoder, mut reader) =
            FfmpegDecoder::spawn(&mut ProcessCommand::new("cat"), 2, 1).unwrap();
        let flight_state = SharedFlightState::new(50.0);
        let mut poller = TelloPoller::start(
            link.clone(), Some(decoder.packet_sink()), flight_state.clone());

        let mut commands = link.clone();
        commands.send(&Command::TakeOff).unwrap();
        expect_command(&drone, tello::CommandIds::TakeoffCmd);
        commands.send(&Command::right(17)).unwrap();
        commands.send(&Command::Hover).unwrap();
        commands.send(&Command::Land).unwrap();
        expect_command(&drone, tello::CommandIds::LandCmd);

        // A video frame arrives as numbered pieces; the last has the high
        // bit of its sequence number set.
        let piece_addr = format!("127.0.0.1:{}", video_port);
        drone.send_to(&[7, 0, 1, 2, 3], piece_addr.as_str()).unwrap();
        drone.send_to(&[7, 0x80, 4, 5, 6], piece_addr.as_str()).unwrap();
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.image.get_pixel(1, 0).0, [6, 5, 4]);

        // Shutdown closes the decoder input, ending the frame stream.
        flight_state.request_shutdown();
        poller.join();
        assert!(reader.read_frame().unwrap().is_none());
        decoder.stop();
    }

}  // mod tests.
