// THEORY:
// The `color` module turns a region of pixels into a compact colour signature.
// Averaging is the core operation: pooling a shirt region down to one colour
// cancels out stripes, numbers, shadows and compression noise, leaving the one
// value that separates two teams.
//
// Two signatures are produced here:
// - `shirt_sample`: the mean RGB of the upper half of a box, pooled through a
//   small fixed-size patch first. This feeds team clustering.
// - `appearance_histogram`: a coarse joint RGB histogram of the whole box. This
//   feeds the identity matcher's appearance gate.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::BBox;

/// An RGB colour sample in `0.0..=255.0` per channel.
pub type ColorSample = [f64; 3];

/// What an unusable shirt region samples as.
pub const NO_SAMPLE: ColorSample = [0.0; 3];

/// Bins per channel of the appearance histogram.
const HISTOGRAM_BINS: usize = 4;
/// Shirt regions smaller than this on either side are treated as unusable.
const MIN_SHIRT_SIDE: u32 = 3;

/// A display colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    /// Tracks without a team.
    pub const NEUTRAL: Rgb = Rgb::new(128, 128, 128);
    pub const BALL: Rgb = Rgb::new(0, 255, 0);
    pub const REFEREE: Rgb = Rgb::new(0, 255, 255);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Truncates a sample to whole channel values.
    pub fn from_sample(sample: &ColorSample) -> Self {
        let channel = |v: f64| v.clamp(0.0, 255.0) as u8;
        Self::new(channel(sample[0]), channel(sample[1]), channel(sample[2]))
    }
}

impl From<[u8; 3]> for Rgb {
    fn from(c: [u8; 3]) -> Self {
        Rgb::new(c[0], c[1], c[2])
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(c: Rgb) -> Self {
        [c.red, c.green, c.blue]
    }
}

/// Euclidean distance between two samples in RGB space.
pub fn color_distance(a: &ColorSample, b: &ColorSample) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Mean colour of every pixel in the image.
pub fn average_color(image: &RgbImage) -> ColorSample {
    let num_pixels = (image.width() as u64) * (image.height() as u64);
    if num_pixels == 0 {
        return NO_SAMPLE;
    }

    // Accumulate in blocks for better cache locality.
    const BLOCK: usize = 64;
    let mut sum = [0u64; 3];
    for block in image.as_raw().chunks(3 * BLOCK) {
        for pixel in block.chunks_exact(3) {
            sum[0] += pixel[0] as u64;
            sum[1] += pixel[1] as u64;
            sum[2] += pixel[2] as u64;
        }
    }

    sum.map(|s| s as f64 / num_pixels as f64)
}

/// Estimates shirt colour from the upper half of `bbox`.
///
/// The box is clamped to the frame first. A degenerate or tiny region yields
/// black rather than an error.
pub fn shirt_sample(frame: &RgbImage, bbox: &BBox, patch_size: u32) -> ColorSample {
    let rect = bbox.clamp_to_frame(frame.width(), frame.height());
    if rect.is_empty() {
        return NO_SAMPLE;
    }

    let shirt_height = rect.height() / 2;
    if shirt_height < MIN_SHIRT_SIDE || rect.width() < MIN_SHIRT_SIDE || patch_size == 0 {
        return NO_SAMPLE;
    }

    let region = imageops::crop_imm(frame, rect.x1, rect.y1, rect.width(), shirt_height).to_image();
    let patch = imageops::resize(&region, patch_size, patch_size, FilterType::Triangle);
    average_color(&patch)
}

/// Normalised joint RGB histogram of the pixels inside `bbox`. Empty when the
/// box lies outside the frame.
pub fn appearance_histogram(frame: &RgbImage, bbox: &BBox) -> Vec<f32> {
    let rect = bbox.clamp_to_frame(frame.width(), frame.height());
    if rect.is_empty() {
        return Vec::new();
    }

    let bin = |v: u8| (v as usize * HISTOGRAM_BINS) / 256;
    let mut histogram = vec![0.0f32; HISTOGRAM_BINS.pow(3)];
    for y in rect.y1..rect.y2 {
        for x in rect.x1..rect.x2 {
            let [r, g, b] = frame.get_pixel(x, y).0;
            histogram[(bin(r) * HISTOGRAM_BINS + bin(g)) * HISTOGRAM_BINS + bin(b)] += 1.0;
        }
    }

    let total: f32 = histogram.iter().sum();
    histogram.iter_mut().for_each(|h| *h /= total);
    histogram
}

/// `1 - cosine similarity`. Zero when either signature is missing, so an
/// unknown appearance never blocks a match.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (1.0 - dot / (norm_a * norm_b)).max(0.0)
}
