use std::path::Path;

use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use pitch_vision::{Frame, FrameSource, Result, VisionError};
use tracing::warn;

fn frame_err(err: opencv::Error) -> VisionError {
    VisionError::Frame(err.to_string())
}

/// Decodes a video file with OpenCV.
pub struct VideoFileSource {
    capture: VideoCapture,
    path: String,
    size: (u32, u32),
    bgr: Mat,
    rgb: Mat,
}

impl VideoFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let path = path.display().to_string();
        let open_err = |reason: String| VisionError::SourceOpen {
            source_name: path.clone(),
            reason,
        };

        let capture = VideoCapture::from_file(&path, videoio::CAP_ANY).map_err(|e| open_err(e.to_string()))?;
        if !capture.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("not a readable video".to_string()));
        }
        let width = capture
            .get(videoio::CAP_PROP_FRAME_WIDTH)
            .map_err(|e| open_err(e.to_string()))? as u32;
        let height = capture
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| open_err(e.to_string()))? as u32;

        Ok(Self {
            capture,
            path,
            size: (width, height),
            bgr: Mat::default(),
            rgb: Mat::default(),
        })
    }
}

impl FrameSource for VideoFileSource {
    fn frame_size(&self) -> (u32, u32) {
        self.size
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.capture.read(&mut self.bgr).map_err(frame_err)? || self.bgr.empty() {
            return Ok(None);
        }

        // OpenCV decodes to BGR; the engine works in RGB.
        imgproc::cvt_color(&self.bgr, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0).map_err(frame_err)?;
        let (width, height) = (self.rgb.cols() as u32, self.rgb.rows() as u32);
        let buffer = self.rgb.data_bytes().map_err(frame_err)?.to_vec();
        let image = RgbImage::from_raw(width, height, buffer)
            .ok_or_else(|| VisionError::Frame(format!("decoded buffer does not match {width}x{height}")))?;

        // Position after the read, so the first frame is 1.
        let index = self.capture.get(videoio::CAP_PROP_POS_FRAMES).map_err(frame_err)? as u64;
        Ok(Some(Frame::new(index, image)))
    }

    fn release(&mut self) {
        if let Err(err) = self.capture.release() {
            warn!(source = %self.path, %err, "failed to release video capture");
        }
    }

    fn name(&self) -> String {
        self.path.clone()
    }
}
