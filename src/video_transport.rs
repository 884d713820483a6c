// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use canonical_error::{CanonicalError, failed_precondition_error, unavailable_error};
use log::{debug, error, info, warn};

use crate::frame_source::RawVideoReader;

// Runs ffmpeg as a subprocess to decode the drone's compressed video into
// raw BGR frames. Compressed packets are written to its stdin through a
// PacketSink; frames are read from its stdout through the RawVideoReader
// returned by start().
pub struct FfmpegDecoder {
    child: Child,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    stderr_worker: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

// Cloneable writer of compressed video packets into the decoder.
#[derive(Clone)]
pub struct PacketSink {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl PacketSink {
    pub fn write_packet(&self, packet: &[u8]) -> Result<(), CanonicalError> {
        let mut locked_stdin = self.stdin.lock().unwrap();
        let stdin = match locked_stdin.as_mut() {
            Some(s) => s,
            None => { return Err(unavailable_error("Decoder is stopped")); }
        };
        match stdin.write_all(packet) {
            Ok(()) => Ok(()),
            Err(e) => Err(unavailable_error(
                format!("Error writing to decoder: {:?}", e).as_str())),
        }
    }

    // Ends the decoder's input. ffmpeg flushes what it has, then exits, so
    // the frame reader sees end of stream.
    pub fn close(&self) {
        if self.stdin.lock().unwrap().take().is_some() {
            info!("Closed video decoder input");
        }
    }
}

impl FfmpegDecoder {
    pub fn ffmpeg_command(ffmpeg: impl AsRef<OsStr>, width: u32, height: u32,
                          frame_rate: u32) -> Command {
        let rate = frame_rate.to_string();
        let size = format!("{}x{}", width, height);
        let mut command = Command::new(ffmpeg);
        command.args(["-hwaccel", "auto", "-i", "pipe:0",
                      "-pix_fmt", "bgr24",
                      "-r", rate.as_str(),
                      "-s", size.as_str(),
                      "-f", "rawvideo", "-preset", "ultrafast", "pipe:1"]);
        command
    }

    pub fn start(ffmpeg: impl AsRef<OsStr>, width: u32, height: u32, frame_rate: u32)
                 -> Result<(FfmpegDecoder, RawVideoReader<ChildStdout>), CanonicalError> {
        let mut command = Self::ffmpeg_command(ffmpeg, width, height, frame_rate);
        Self::spawn(&mut command, width, height)
    }

    // Spawns `command`, which must read compressed video on stdin and write
    // width*height BGR frames on stdout.
    pub fn spawn(command: &mut Command, width: u32, height: u32)
                 -> Result<(FfmpegDecoder, RawVideoReader<ChildStdout>), CanonicalError> {
        let mut child = match command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn() {
                Err(e) => {
                    return Err(failed_precondition_error(
                        format!("Command::spawn error: {:?}", e).as_str()));
                },
                Ok(child) => child,
            };
        info!("Video decoder started");
        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(i), Some(o), Some(e)) => (i, o, e),
                _ => {
                    let _ = child.kill();
                    return Err(failed_precondition_error("Decoder pipes unavailable"));
                }
            };
        let decoder = FfmpegDecoder{
            child,
            stdin: Arc::new(Mutex::new(Some(stdin))),
            stderr_worker: Some(Self::make_stderr_worker(stderr)),
            stopped: false,
        };
        Ok((decoder, RawVideoReader::new(stdout, width, height)))
    }

    pub fn packet_sink(&self) -> PacketSink {
        PacketSink{stdin: self.stdin.clone()}
    }

    fn make_stderr_worker(stderr: ChildStderr) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut reader = BufReader::new(stderr);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,  // Reached EOF.
                    Ok(_) => debug!("ffmpeg: {}", line.trim_end()),
                    Err(e) => {
                        warn!("Error reading decoder stderr: {:?}", e);
                        break;
                    }
                }
            }
        })
    }

    // Closes the decoder's input and terminates it. The RawVideoReader then
    // reaches end of stream.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stdin.lock().unwrap().take();
        if let Err(e) = self.child.kill() {
            debug!("Decoder kill: {:?}", e);
        }
        match self.child.wait() {
            Ok(status) => info!("Video decoder stopped with {:?}", status),
            Err(e) => error!("Error waiting for decoder: {:?}", e),
        }
        if let Some(worker) = self.stderr_worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::frame_source::FrameSource;
    use super::*;

    #[test]
    fn test_ffmpeg_command() {
        let command = FfmpegDecoder::ffmpeg_command("ffmpeg", 300, 200, 20);
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args.join(" "),
                   "-hwaccel auto -i pipe:0 -pix_fmt bgr24 -r 20 -s 300x200 \
                    -f rawvideo -preset ultrafast pipe:1");
    }

    // `cat` stands in for ffmpeg: packets come back out as frame bytes.
    #[test]
    fn test_decoder_subprocess() {
        let (mut decoder, mut reader) =
            FfmpegDecoder::spawn(&mut Command::new("cat"), 2, 2).unwrap();
        let sink = decoder.packet_sink();
        sink.write_packet(&[1, 2, 3, 4, 5, 6]).unwrap();
        sink.write_packet(&[7, 8, 9, 10, 11, 12]).unwrap();
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.image.get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(frame.image.get_pixel(1, 1).0, [12, 11, 10]);

        decoder.stop();
        assert!(sink.write_packet(&[0]).is_err());
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_close_input_ends_stream() {
        let (mut decoder, mut reader) =
            FfmpegDecoder::spawn(&mut Command::new("cat"), 1, 1).unwrap();
        let sink = decoder.packet_sink();
        sink.write_packet(&[1, 2, 3, 4]).unwrap();
        sink.close();
        assert!(reader.read_frame().unwrap().is_some());
        // The trailing partial frame.
        assert!(reader.read_frame().is_err());
        assert!(reader.read_frame().unwrap().is_none());
        decoder.stop();
    }

}  // mod tests.
