// THEORY:
// The `geometry` module holds the raw pixel-space primitives every other stage
// speaks in. There is no pitch calibration anywhere in the engine: a bounding
// box is four floats in frame coordinates and every rule (possession, kicks,
// offside) is phrased directly against those numbers.
//
// Key architectural principles:
// 1.  **Dumb Data Containers**: `Point` and `BBox` carry no identity and no
//     history. Identity belongs to the trackers, history to `TrackHistory`.
// 2.  **One Convention**: boxes are always `[x1, y1, x2, y2]` with the origin at
//     the top-left of the frame, matching what the detector emits.
// 3.  **Validation at the Edge**: `BBox::from_slice` is the single place where an
//     untyped coordinate list becomes a box. Anything with the wrong arity or a
//     non-finite value is rejected there, never deeper in the pipeline.

use serde::{Deserialize, Serialize};

/// A 2D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// An axis-aligned bounding box, `[x1, y1, x2, y2]` in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a box from an untyped coordinate list. Returns `None` for anything
    /// that is not exactly four finite numbers.
    pub fn from_slice(coords: &[f32]) -> Option<Self> {
        match coords {
            [x1, y1, x2, y2] if coords.iter().all(|c| c.is_finite()) => {
                Some(Self::new(*x1, *y1, *x2, *y2))
            }
            _ => None,
        }
    }

    /// A box of the given size centred on `centre`.
    pub fn centred_at(centre: Point, width: f32, height: f32) -> Self {
        Self::new(
            centre.x - width / 2.0,
            centre.y - height / 2.0,
            centre.x + width / 2.0,
            centre.y + height / 2.0,
        )
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn centre(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn bottom_left(&self) -> Point {
        Point::new(self.x1, self.y2)
    }

    pub fn bottom_right(&self) -> Point {
        Point::new(self.x2, self.y2)
    }

    /// The same box shifted by `(dx, dy)`.
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    /// Distance between the nearest edges of two boxes. Zero when they touch or overlap.
    pub fn edge_distance(&self, other: &BBox) -> f32 {
        let horizontal = (other.x1 - self.x2).max(self.x1 - other.x2).max(0.0);
        let vertical = (other.y1 - self.y2).max(self.y1 - other.y2).max(0.0);
        horizontal.hypot(vertical)
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }

    /// Clamps each coordinate into the frame and truncates to whole pixels.
    /// The result may be degenerate (`x2 <= x1` or `y2 <= y1`).
    pub fn clamp_to_frame(&self, width: u32, height: u32) -> PixelRect {
        let clamp = |value: f32, limit: u32| value.max(0.0).min(limit as f32) as u32;
        PixelRect {
            x1: clamp(self.x1, width),
            y1: clamp(self.y1, height),
            x2: clamp(self.x2, width),
            y2: clamp(self.y2, height),
        }
    }
}

impl From<[f32; 4]> for BBox {
    fn from(coords: [f32; 4]) -> Self {
        Self::new(coords[0], coords[1], coords[2], coords[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(bbox: BBox) -> Self {
        bbox.to_array()
    }
}

/// A box snapped to integer pixel coordinates inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}
