use std::collections::VecDeque;

use image::RgbImage;

use crate::error::Result;

/// One decoded frame, tagged with its 1-based position in the source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A sequential supplier of frames: a decoder, a camera, a test fixture.
///
/// Reading the next frame is the only blocking point of a session.
pub trait FrameSource: Send {
    /// Frame dimensions, known once the source is open.
    fn frame_size(&self) -> (u32, u32);

    /// The next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Releases the underlying handle. Called exactly once by the session that owns the source.
    fn release(&mut self) {}

    fn name(&self) -> String {
        "frame source".to_string()
    }
}

/// A finite, in-memory source.
pub struct MemorySource {
    frames: VecDeque<RgbImage>,
    size: (u32, u32),
    position: u64,
}

impl MemorySource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        let size = frames
            .first()
            .map(|f| (f.width(), f.height()))
            .unwrap_or((0, 0));
        Self {
            frames: frames.into(),
            size,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for MemorySource {
    fn frame_size(&self) -> (u32, u32) {
        self.size
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front().map(|image| {
            self.position += 1;
            Frame::new(self.position, image)
        }))
    }

    fn release(&mut self) {
        self.frames.clear();
    }

    fn name(&self) -> String {
        "in-memory frames".to_string()
    }
}
