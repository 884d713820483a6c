// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use canonical_error::CanonicalError;
use clap::Parser;
use log::{error, info};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use tello_track::display::{DisplaySink, SnapshotDisplay};
use tello_track::drone::{Command, DroneLink, SimulatedDrone, TelloLink};
use tello_track::flight_state::SharedFlightState;
use tello_track::frame_pipeline::FramePipeline;
use tello_track::frame_source::{FrameSource, RawVideoReader};
use tello_track::landing_supervisor::LandingSupervisor;
use tello_track::motion_controller::MotionController;
use tello_track::pilot::Pilot;
use tello_track::settings::ServoSettings;
use tello_track::target_detector::{ColorRange, Hsv};
use tello_track::telemetry::TelloPoller;
use tello_track::video_transport::FfmpegDecoder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Address of the drone's command port.
    #[arg(long, default_value = "192.168.10.1:8889")]
    drone_addr: SocketAddr,

    /// Local port on which the drone's video stream arrives.
    #[arg(long, default_value = "11111")]
    video_port: u16,

    /// ffmpeg executable used to decode the video stream.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Frame rate of the decoded video.
    #[arg(long, default_value = "20")]
    frame_rate: u32,

    /// Raw BGR video file to use instead of the drone's video stream.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Log flight commands instead of sending them to the drone. Video is
    /// still taken from the drone unless `replay` is given.
    #[arg(long)]
    dry_run: bool,

    /// Directory in which annotated frames and masks are saved.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Save every Nth frame to `snapshot_dir`.
    #[arg(long, default_value = "20")]
    snapshot_interval: i32,

    #[arg(long, default_value = "300")]
    frame_width: u32,

    #[arg(long, default_value = "300")]
    frame_height: u32,

    /// Lower HSV bound of the target color, as h,s,v. Hue is 0..179.
    #[arg(long, value_parser = parse_hsv, default_value = "100,50,50")]
    color_low: Hsv,

    /// Upper HSV bound of the target color, as h,s,v.
    #[arg(long, value_parser = parse_hsv, default_value = "140,255,255")]
    color_high: Hsv,

    /// Minimum mask pixel count for a detection.
    #[arg(long, default_value = "200")]
    noise_floor: f64,

    /// Maximum per-axis command magnitude while tracking.
    #[arg(long, default_value = "50")]
    cruise_speed: f64,

    /// Maximum per-axis command magnitude once landing has begun.
    #[arg(long, default_value = "20")]
    descent_speed: f64,

    /// Commands are clamped to +/- this value.
    #[arg(long, default_value = "100")]
    velocity_limit: i32,

    /// Climb magnitude after takeoff.
    #[arg(long, default_value = "40")]
    takeoff_ascend: i32,

    /// Seconds spent climbing after takeoff.
    #[arg(long, value_parser = parse_duration, default_value = "3.0")]
    ascend_period: Duration,

    /// Seconds spent hovering before tracking begins.
    #[arg(long, value_parser = parse_duration, default_value = "10.0")]
    settle_period: Duration,

    /// Hover if no new frame has been processed for this many seconds.
    #[arg(long, value_parser = parse_duration, default_value = "1.0")]
    stale_timeout: Duration,

    /// Seconds after startup at which the landing sequence begins.
    #[arg(long, value_parser = parse_duration, default_value = "90.0")]
    arm_delay: Duration,

    /// Number of descent steps before landing unconditionally.
    #[arg(long, default_value = "15")]
    landing_attempts: u32,

    /// Land once the target covers more than this fraction of the frame.
    #[arg(long, default_value = "0.4")]
    landing_area_fraction: f64,

    /// Magnitude of each descent step.
    #[arg(long, default_value = "30")]
    descend_step: i32,

    /// Seconds between descent steps.
    #[arg(long, value_parser = parse_duration, default_value = "2.0")]
    descend_interval: Duration,

    /// Log processing latency every this many frames; 0 disables.
    #[arg(long, default_value = "100")]
    stats_interval: u32,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "tello_track_log.txt")]
    log_file: String,
}

fn parse_duration(arg: &str) -> Result<std::time::Duration, String> {
    let seconds: f32 = arg.parse().map_err(|e| format!("'{}': {}", arg, e))?;
    std::time::Duration::try_from_secs_f32(seconds)
        .map_err(|_| format!("'{}' is not a non-negative number of seconds", arg))
}

fn parse_hsv(arg: &str) -> Result<Hsv, String> {
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected h,s,v, got '{}'", arg));
    }
    let mut values = [0_u8; 3];
    for (value, part) in values.iter_mut().zip(parts) {
        *value = part.trim().parse().map_err(|e| format!("'{}': {}", part, e))?;
    }
    Ok(Hsv{h: values[0], s: values[1], v: values[2]})
}

fn settings_from_args(args: &Args) -> ServoSettings {
    ServoSettings{
        frame_width: args.frame_width,
        frame_height: args.frame_height,
        color_range: ColorRange{low: args.color_low, high: args.color_high},
        noise_floor: args.noise_floor,
        cruise_speed_scale: args.cruise_speed,
        descent_speed_scale: args.descent_speed,
        velocity_limit: args.velocity_limit,
        takeoff_ascend: args.takeoff_ascend,
        ascend_period: args.ascend_period,
        settle_period: args.settle_period,
        stale_detection_timeout: args.stale_timeout,
        arm_delay: args.arm_delay,
        landing_attempts: args.landing_attempts,
        landing_area_fraction: args.landing_area_fraction,
        descend_step: args.descend_step,
        descend_interval: args.descend_interval,
        stats_log_interval: args.stats_interval,
    }
}

// Setup failures are unrecoverable.
fn or_exit<T>(result: Result<T, CanonicalError>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("{}: {}", what, &e.to_string());
            std::process::exit(1);
        }
    }
}

fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = tracing_appender::rolling::never(&args.log_dir, &args.log_file);
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let settings = settings_from_args(&args);
    or_exit(settings.validate(), "Invalid settings");
    let flight_state = SharedFlightState::new(settings.cruise_speed_scale);

    // The drone is needed for anything but a dry run replay.
    let tello = if args.dry_run && args.replay.is_some() {
        None
    } else {
        Some(TelloLink::connect(args.drone_addr, args.video_port))
    };
    let link: Box<dyn DroneLink + Send> = match &tello {
        Some(tello) if !args.dry_run => Box::new(tello.clone()),
        _ => {
            info!("Dry run, flight commands will not be sent");
            Box::new(SimulatedDrone::new())
        },
    };
    let pilot = Pilot::new(link, flight_state.clone());

    let interrupt = Arc::new(AtomicBool::new(false));
    let cloned_interrupt = interrupt.clone();
    let cloned_pilot = pilot.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        cloned_interrupt.store(true, AtomicOrdering::Relaxed);
        // The frame pipeline may be blocked waiting for video, so land from
        // here too.
        cloned_pilot.send(Command::Land);
    }) {
        error!("Could not install signal handler: {:?}", e);
        std::process::exit(1);
    }

    let mut decoder: Option<FfmpegDecoder> = None;
    let mut video_sink = None;
    let source: Box<dyn FrameSource + Send> = match &args.replay {
        Some(path) => {
            let file = match File::open(path) {
                Ok(f) => f,
                Err(e) => {
                    error!("Could not open {:?}: {:?}", path, e);
                    std::process::exit(1);
                }
            };
            info!("Replaying {:?}", path);
            Box::new(RawVideoReader::new(BufReader::new(file),
                                         settings.frame_width, settings.frame_height))
        },
        None => {
            let (ffmpeg, reader) = or_exit(
                FfmpegDecoder::start(&args.ffmpeg, settings.frame_width,
                                     settings.frame_height, args.frame_rate),
                "Could not start video decoder");
            video_sink = Some(ffmpeg.packet_sink());
            decoder = Some(ffmpeg);
            Box::new(reader)
        },
    };
    let mut poller = tello.map(|tello| {
        let poller = TelloPoller::start(tello.clone(), video_sink, flight_state.clone());
        if let Err(e) = tello.clone().send(&Command::StartVideo) {
            error!("Could not start video: {}", &e.to_string());
        }
        poller
    });
    let display = args.snapshot_dir.as_ref().map(|dir| {
        Box::new(SnapshotDisplay::new(dir.clone(), args.snapshot_interval))
            as Box<dyn DisplaySink + Send>
    });

    let mut motion_controller = MotionController::start(
        flight_state.clone(), pilot.clone(), settings.clone());
    let mut landing_supervisor = LandingSupervisor::start(
        flight_state.clone(), pilot.clone(), settings.clone());

    let mut pipeline = FramePipeline::new(source, display, flight_state.clone(),
                                          pilot.clone(), interrupt, &settings);
    let exit = pipeline.run();
    info!("Frame pipeline finished: {:?}", exit);

    motion_controller.join();
    info!("Landing supervisor finished: {:?}", landing_supervisor.join());
    if let Some(poller) = poller.as_mut() {
        poller.join();
    }
    if let Some(mut ffmpeg) = decoder {
        ffmpeg.stop();
    }
    info!("Exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2.5").unwrap(), Duration::from_millis(2500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("inf").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_negative_arg_rejected() {
        assert!(Args::try_parse_from(["tello-track", "--arm-delay=-1"]).is_err());
        let args = Args::try_parse_from(["tello-track", "--arm-delay", "45"]).unwrap();
        assert_eq!(args.arm_delay, Duration::from_secs(45));
    }

    #[test]
    fn test_parse_hsv() {
        assert_eq!(parse_hsv("100, 50,50").unwrap(), Hsv{h: 100, s: 50, v: 50});
        assert!(parse_hsv("100,50").is_err());
        assert!(parse_hsv("100,50,300").is_err());
    }

}  // mod tests.
