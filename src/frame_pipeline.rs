// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use canonical_error::CanonicalErrorCode;
use log::{error, info, warn};

use crate::display::{DisplaySink, FrameView, annotate};
use crate::drone::Command;
use crate::flight_state::SharedFlightState;
use crate::frame_source::{Frame, FrameSource};
use crate::pilot::Pilot;
use crate::settings::ServoSettings;
use crate::target_detector::{DetectionResult, TargetDetector};
use crate::value_stats::ValueStatsAccumulator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineExit {
    // Another actor ended the flight.
    Shutdown,
    // Manual interrupt from the signal handler or display sink.
    Interrupted,
    // The video transport has no more frames.
    EndOfStream,
    // The video transport kept failing.
    SourceFailed,
}

// Consecutive read failures, other than partial frames, after which the
// flight is ended.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

// Pause after a failed read before retrying.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

// Drives the system's cadence: pulls frames from the video transport, runs
// the detector, publishes the result and feeds the optional display.
pub struct FramePipeline {
    source: Box<dyn FrameSource + Send>,
    display: Option<Box<dyn DisplaySink + Send>>,
    detector: TargetDetector,
    flight_state: SharedFlightState,
    pilot: Pilot,

    // Set asynchronously (e.g. by a ctrl-c handler) to request landing.
    interrupt: Arc<AtomicBool>,

    // Time from frame capture to published result, in milliseconds.
    latency_stats: ValueStatsAccumulator,
    stats_log_interval: u32,
}

impl FramePipeline {
    pub fn new(source: Box<dyn FrameSource + Send>,
               display: Option<Box<dyn DisplaySink + Send>>,
               flight_state: SharedFlightState, pilot: Pilot,
               interrupt: Arc<AtomicBool>, settings: &ServoSettings) -> Self {
        FramePipeline{
            source,
            display,
            detector: TargetDetector::new(settings.color_range, settings.noise_floor),
            flight_state,
            pilot,
            interrupt,
            latency_stats: ValueStatsAccumulator::new(100),
            stats_log_interval: settings.stats_log_interval,
        }
    }

    // Runs until the flight is over. Lands the drone on interrupt, end of
    // stream or a persistently failing source; always leaves shutdown
    // requested.
    pub fn run(&mut self) -> PipelineExit {
        let mut read_errors = 0;
        let exit = loop {
            if self.flight_state.is_shutdown() {
                break PipelineExit::Shutdown;
            }
            if self.interrupt.load(Ordering::Relaxed) {
                info!("Manual interrupt, landing");
                self.pilot.send(Command::Land);
                break PipelineExit::Interrupted;
            }
            let frame = match self.source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Video stream ended, landing");
                    self.pilot.send(Command::Land);
                    break PipelineExit::EndOfStream;
                },
                Err(e) if matches!(e.code, CanonicalErrorCode::Aborted) => {
                    warn!("Skipping frame: {}", &e.to_string());
                    continue;
                },
                Err(e) => {
                    read_errors += 1;
                    if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        error!("Video failed {} times in a row, landing: {}",
                               read_errors, &e.to_string());
                        self.pilot.send(Command::Land);
                        break PipelineExit::SourceFailed;
                    }
                    warn!("Frame read failed, retrying: {}", &e.to_string());
                    self.flight_state.sleep(READ_RETRY_DELAY);
                    continue;
                }
            };
            read_errors = 0;
            self.process_frame(&frame);
        };
        self.flight_state.request_shutdown();
        let stats = &self.latency_stats.value_stats;
        if stats.count > 0 {
            info!("Processed {} frames; latency ms {}", stats.count, stats.overall);
        }
        exit
    }

    pub fn process_frame(&mut self, frame: &Frame) -> DetectionResult {
        let mask = self.detector.segment(frame);
        let result = self.detector.measure(&mask);
        self.flight_state.publish(frame.frame_id, result);
        self.record_latency(frame.capture_time);

        if let Some(display) = self.display.as_mut() {
            let annotated = annotate(&frame.image, &result);
            let keep_going = display.show(&FrameView{
                frame_id: frame.frame_id,
                mask: &mask,
                annotated: &annotated,
                result: &result,
            });
            if !keep_going {
                self.interrupt.store(true, Ordering::Relaxed);
            }
        }
        result
    }

    pub fn latency_stats(&self) -> &ValueStatsAccumulator {
        &self.latency_stats
    }

    fn record_latency(&mut self, capture_time: Instant) {
        self.latency_stats.add_value(capture_time.elapsed().as_secs_f64() * 1000.0);
        let stats = &self.latency_stats.value_stats;
        if self.stats_log_interval > 0 && stats.count % self.stats_log_interval as u64 == 0 {
            info!("Processed {} frames; recent latency ms {}", stats.count, stats.recent);
        }
    }
}

// mod tests.
