// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::{ErrorKind, Read};
use std::time::Instant;

use canonical_error::{CanonicalError, aborted_error, invalid_argument_error,
                      unavailable_error};
use image::{Rgb, RgbImage};

// One decoded video frame.
#[derive(Clone)]
pub struct Frame {
    // Increases by one for every frame successfully read from a source.
    pub frame_id: i32,

    // When the frame's bytes finished arriving.
    pub capture_time: Instant,

    // Pixels in RGB order; the transport's BGR byte order is undone when the
    // frame is constructed.
    pub image: RgbImage,
}

// Number of bytes in one raw BGR frame.
pub fn bgr_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

impl Frame {
    // `bgr` must hold exactly width*height*3 bytes, row major, B G R per pixel.
    pub fn from_bgr(width: u32, height: u32, bgr: &[u8], frame_id: i32)
                    -> Result<Frame, CanonicalError> {
        let expected = bgr_frame_len(width, height);
        if bgr.len() != expected {
            return Err(invalid_argument_error(
                format!("Got {} bytes for {}x{} frame, expected {}",
                        bgr.len(), width, height, expected).as_str()));
        }
        let mut image = RgbImage::new(width, height);
        for (pixel, chunk) in image.pixels_mut().zip(bgr.chunks_exact(3)) {
            *pixel = Rgb([chunk[2], chunk[1], chunk[0]]);
        }
        Ok(Frame{frame_id, capture_time: Instant::now(), image})
    }
}

// Supplier of frames to the frame pipeline.
pub trait FrameSource {
    // Blocks until a full frame is available.
    // Returns:
    // Ok(Some(frame)): the next frame.
    // Ok(None): the stream ended cleanly; no more frames will arrive.
    // Err: the read failed (e.g. a short read); the caller may try again.
    fn read_frame(&mut self) -> Result<Option<Frame>, CanonicalError>;
}

// Reads fixed-size raw BGR frames from a byte stream, such as the stdout of
// the ffmpeg decoder or a recorded .bgr file.
pub struct RawVideoReader<R: Read> {
    reader: R,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
    next_frame_id: i32,
}

impl<R: Read> RawVideoReader<R> {
    pub fn new(reader: R, width: u32, height: u32) -> Self {
        RawVideoReader{
            reader,
            width,
            height,
            buffer: vec![0_u8; bgr_frame_len(width, height)],
            next_frame_id: 0,
        }
    }
}

impl<R: Read> FrameSource for RawVideoReader<R> {
    fn read_frame(&mut self) -> Result<Option<Frame>, CanonicalError> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.reader.read(&mut self.buffer[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(aborted_error(
                        format!("Short frame read: got {} of {} bytes",
                                filled, self.buffer.len()).as_str()));
                },
                Ok(n) => { filled += n; },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(unavailable_error(
                        format!("Frame read error: {:?}", e).as_str()));
                }
            }
        }
        let frame = Frame::from_bgr(self.width, self.height,
                                    &self.buffer, self.next_frame_id)?;
        self.next_frame_id += 1;
        Ok(Some(frame))
    }
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use super::*;

    #[test]
    fn test_from_bgr_swaps_channels() {
        let bgr = [10_u8, 20, 30, 40, 50, 60];
        let frame = Frame::from_bgr(2, 1, &bgr, 7).unwrap();
        assert_eq!(frame.frame_id, 7);
        assert_eq!(frame.image.get_pixel(0, 0), &Rgb([30, 20, 10]));
        assert_eq!(frame.image.get_pixel(1, 0), &Rgb([60, 50, 40]));

        assert!(Frame::from_bgr(2, 2, &bgr, 0).is_err());
    }

    #[test]
    fn test_raw_video_reader() {
        // Two full 2x2 frames followed by a partial one.
        let mut bytes = vec![0_u8; 12];
        bytes.extend(vec![255_u8; 12]);
        bytes.extend(vec![1_u8; 5]);
        let mut reader = RawVideoReader::new(Cursor::new(bytes), 2, 2);

        let first = reader.read_frame().unwrap().unwrap();
        assert_eq!(first.frame_id, 0);
        assert_eq!(first.image.get_pixel(1, 1), &Rgb([0, 0, 0]));
        let second = reader.read_frame().unwrap().unwrap();
        assert_eq!(second.frame_id, 1);
        assert_eq!(second.image.get_pixel(0, 1), &Rgb([255, 255, 255]));

        // Short read is an error, after which the stream is exhausted.
        assert!(reader.read_frame().is_err());
        assert!(reader.read_frame().unwrap().is_none());
    }

}  // mod tests.
