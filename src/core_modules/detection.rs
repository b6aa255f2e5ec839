// THEORY:
// The `detection` module is the boundary between the engine and whatever object
// detector produced the boxes. The detector itself is a black box; the engine
// only promises to turn its untyped output into clean, typed `Detection`s and to
// never let one bad row poison a frame.
//
// Key architectural principles:
// 1.  **Capability, not Implementation**: `Detector` is a one-method trait. A
//     learned model, a recorded replay or a test script are interchangeable.
// 2.  **Drop, Don't Fail**: `sanitize` filters malformed rows (wrong arity,
//     non-finite values, unknown classes) and reports how many it dropped. The
//     valid rows of the same frame always survive.
// 3.  **Ephemeral**: a `Detection` lives for one frame. Anything that needs to
//     persist is promoted to a track by the trackers.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core_modules::frame_source::Frame;
use crate::core_modules::geometry::BBox;
use crate::error::Result;

/// The object classes the detector is trained on, with their wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Ball,
    Goalkeeper,
    Player,
    Referee,
}

impl ObjectClass {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(ObjectClass::Ball),
            1 => Some(ObjectClass::Goalkeeper),
            2 => Some(ObjectClass::Player),
            3 => Some(ObjectClass::Referee),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            ObjectClass::Ball => 0,
            ObjectClass::Goalkeeper => 1,
            ObjectClass::Player => 2,
            ObjectClass::Referee => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Ball => "ball",
            ObjectClass::Goalkeeper => "goalkeeper",
            ObjectClass::Player => "player",
            ObjectClass::Referee => "referee",
        }
    }

    /// Players and goalkeepers wear team shirts.
    pub fn wears_team_shirt(self) -> bool {
        matches!(self, ObjectClass::Player | ObjectClass::Goalkeeper)
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated detection for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class: ObjectClass,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, class: ObjectClass, confidence: f32) -> Self {
        Self { bbox, class, confidence }
    }
}

/// Untyped detector output, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: Vec<f32>,
    pub class_id: i64,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(bbox: Vec<f32>, class_id: i64, confidence: f32) -> Self {
        Self { bbox, class_id, confidence }
    }

    /// Reads a `[x1, y1, x2, y2, cls, conf]` row. The last two numbers are always
    /// taken as class and confidence; whatever precedes them is the box, so a
    /// short row yields a short box that validation rejects.
    pub fn from_row(row: &[f64]) -> Option<Self> {
        let (tail, coords) = row.split_last_chunk::<2>().map(|(c, t)| (t, c))?;
        let [class_id, confidence] = *tail;
        if class_id.fract() != 0.0 {
            return None;
        }
        Some(Self::new(
            coords.iter().map(|&c| c as f32).collect(),
            class_id as i64,
            confidence as f32,
        ))
    }

    pub fn validate(&self) -> Option<Detection> {
        let bbox = BBox::from_slice(&self.bbox)?;
        let class = ObjectClass::from_id(self.class_id)?;
        if !self.confidence.is_finite() {
            return None;
        }
        Some(Detection::new(bbox, class, self.confidence))
    }
}

/// Keeps every well-formed detection and counts the rest.
pub fn sanitize(raw: &[RawDetection]) -> (Vec<Detection>, usize) {
    let detections: Vec<Detection> = raw.iter().filter_map(RawDetection::validate).collect();
    let dropped = raw.len() - detections.len();
    (detections, dropped)
}

/// The black-box object detector.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

impl<F> Detector for F
where
    F: FnMut(&Frame) -> Result<Vec<RawDetection>> + Send,
{
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        self(frame)
    }
}

/// Replays detections recorded by an external model. Line `n` of the file holds
/// the detections for frame `n + 1` as a JSON array of
/// `[x1, y1, x2, y2, cls, conf]` rows.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesDetector {
    frames: Vec<Vec<RawDetection>>,
}

impl JsonLinesDetector {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut frames = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                frames.push(Vec::new());
                continue;
            }
            let rows: Vec<Value> = serde_json::from_str(line)?;
            frames.push(rows.iter().filter_map(Self::row_to_raw).collect());
        }
        debug!(frames = frames.len(), "loaded recorded detections");
        Ok(Self { frames })
    }

    fn row_to_raw(row: &Value) -> Option<RawDetection> {
        let numbers: Option<Vec<f64>> = row.as_array()?.iter().map(Value::as_f64).collect();
        RawDetection::from_row(&numbers?)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Detector for JsonLinesDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let slot = frame.index.checked_sub(1).map(|i| i as usize);
        Ok(slot
            .and_then(|i| self.frames.get(i))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(index: u64) -> Frame {
        Frame::new(index, RgbImage::new(4, 4))
    }

    #[test]
    fn one_malformed_row_does_not_drop_the_rest() {
        let raw = vec![
            RawDetection::new(vec![10.0, 10.0, 20.0, 40.0], 2, 0.9),
            RawDetection::new(vec![10.0, 10.0, 20.0], 2, 0.9),
            RawDetection::new(vec![50.0, 10.0, 60.0, 40.0], 3, 0.8),
            RawDetection::new(vec![50.0, 10.0, 60.0, 40.0], 9, 0.8),
        ];
        let (detections, dropped) = sanitize(&raw);
        assert_eq!(dropped, 2);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class, ObjectClass::Player);
        assert_eq!(detections[1].class, ObjectClass::Referee);
    }

    #[test]
    fn rows_split_into_box_class_and_confidence() {
        let raw = RawDetection::from_row(&[1.0, 2.0, 3.0, 4.0, 0.0, 0.75]).unwrap();
        assert_eq!(raw.bbox, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(raw.class_id, 0);
        assert!((raw.confidence - 0.75).abs() < 1e-6);

        assert!(RawDetection::from_row(&[1.0]).is_none());
        assert!(RawDetection::from_row(&[1.0, 2.0, 3.0, 4.0, 1.5, 0.5]).is_none());
    }

    #[test]
    fn recorded_detections_are_looked_up_by_frame_position() {
        let mut detector = JsonLinesDetector::parse(
            "[[0,0,10,10,2,0.9]]\n\n[[5,5,8,8,0,0.6],[1,2,3],\"junk\"]\n",
        )
        .unwrap();
        assert_eq!(detector.len(), 3);

        assert_eq!(detector.detect(&frame(1)).unwrap().len(), 1);
        assert!(detector.detect(&frame(2)).unwrap().is_empty());

        let third = detector.detect(&frame(3)).unwrap();
        assert_eq!(third.len(), 2);
        let (valid, dropped) = sanitize(&third);
        assert_eq!(dropped, 1);
        assert_eq!(valid[0].class, ObjectClass::Ball);

        assert!(detector.detect(&frame(99)).unwrap().is_empty());
        assert!(detector.detect(&frame(0)).unwrap().is_empty());
    }

    #[test]
    fn closures_are_detectors() {
        let mut detector = |_: &Frame| -> Result<Vec<RawDetection>> {
            Ok(vec![RawDetection::new(vec![0.0, 0.0, 1.0, 1.0], 0, 1.0)])
        };
        assert_eq!(detector.detect(&frame(1)).unwrap().len(), 1);
    }
}
