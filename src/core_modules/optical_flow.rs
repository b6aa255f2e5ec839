// THEORY:
// The `optical_flow` module answers one question for the ball tracker: where did
// the pixel under the ball's last centre move to between two frames? It is only
// consulted when the detector missed the ball, so it needs to be right for a few
// frames at a time, not forever.
//
// `LucasKanade` is the classic pyramidal single-point solver: build a coarse to
// fine image pyramid, and at each level iteratively solve the 2x2 normal
// equations of the brightness-constancy error over a square window. The guess
// from a coarse level seeds the next finer one, which lets it follow motions
// larger than the window.
//
// A point is reported as lost (the "status flag" of other flow APIs) when the
// window has no texture to lock onto, or when the result falls outside the frame.

use image::GrayImage;

use crate::core_modules::geometry::Point;

/// Sparse optical flow for a single point.
pub trait PointFlow: Send {
    /// The position of `point` in `current`, or `None` if it could not be followed.
    fn track_point(&mut self, previous: &GrayImage, current: &GrayImage, point: Point) -> Option<Point>;
}

/// One pyramid level, intensities scaled to `0.0..=1.0`.
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    /// Halves the resolution by averaging 2x2 blocks.
    fn downsample(&self) -> Self {
        let (width, height) = (self.width / 2, self.height / 2);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = (2 * x, 2 * y);
                let sum = self.at(sx, sy) + self.at(sx + 1, sy) + self.at(sx, sy + 1) + self.at(sx + 1, sy + 1);
                data.push(sum / 4.0);
            }
        }
        Self { width, height, data }
    }

    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample with edge clamping.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let (x, y) = (x.clamp(0.0, max_x), y.clamp(0.0, max_y));
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
        let (fx, fy) = (x - x0 as f32, y - y0 as f32);
        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn gradient(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (self.sample(x + 1.0, y) - self.sample(x - 1.0, y)) / 2.0,
            (self.sample(x, y + 1.0) - self.sample(x, y - 1.0)) / 2.0,
        )
    }
}

/// Pure-Rust pyramidal Lucas-Kanade.
#[derive(Debug, Clone)]
pub struct LucasKanade {
    pub window_radius: i32,
    pub max_levels: usize,
    pub max_iterations: usize,
    pub epsilon: f32,
    /// Minimum eigenvalue of the window's structure tensor, per pixel.
    pub min_eigenvalue: f32,
}

impl Default for LucasKanade {
    fn default() -> Self {
        Self {
            window_radius: 10,
            max_levels: 3,
            max_iterations: 30,
            epsilon: 0.01,
            min_eigenvalue: 1e-4,
        }
    }
}

impl LucasKanade {
    fn pyramid(&self, image: &GrayImage) -> Vec<Plane> {
        let window = (2 * self.window_radius + 1) as usize;
        let mut levels = vec![Plane::from_gray(image)];
        while levels.len() < self.max_levels {
            let Some(last) = levels.last() else { break };
            if last.width / 2 < window || last.height / 2 < window {
                break;
            }
            let next = last.downsample();
            levels.push(next);
        }
        levels
    }

    /// Refines the displacement of `point` on one level, starting from `guess`.
    fn refine(&self, previous: &Plane, current: &Plane, point: Point, guess: (f32, f32)) -> Option<(f32, f32)> {
        let r = self.window_radius;
        let area = ((2 * r + 1) * (2 * r + 1)) as f32;

        let mut window = Vec::with_capacity(area as usize);
        let (mut gxx, mut gxy, mut gyy) = (0.0f32, 0.0f32, 0.0f32);
        for dy in -r..=r {
            for dx in -r..=r {
                let (x, y) = (point.x + dx as f32, point.y + dy as f32);
                let (ix, iy) = previous.gradient(x, y);
                gxx += ix * ix;
                gxy += ix * iy;
                gyy += iy * iy;
                window.push((dx as f32, dy as f32, previous.sample(x, y), ix, iy));
            }
        }

        let trace_half = (gxx + gyy) / 2.0;
        let min_eigen = trace_half - (((gxx - gyy) / 2.0).powi(2) + gxy * gxy).sqrt();
        let det = gxx * gyy - gxy * gxy;
        if min_eigen / area < self.min_eigenvalue || det <= f32::EPSILON {
            return None;
        }

        let mut flow = guess;
        for _ in 0..self.max_iterations {
            let (mut bx, mut by) = (0.0f32, 0.0f32);
            for &(dx, dy, value, ix, iy) in &window {
                let moved = current.sample(point.x + flow.0 + dx, point.y + flow.1 + dy);
                let error = value - moved;
                bx += error * ix;
                by += error * iy;
            }
            let eta_x = (gyy * bx - gxy * by) / det;
            let eta_y = (gxx * by - gxy * bx) / det;
            flow = (flow.0 + eta_x, flow.1 + eta_y);
            if eta_x.hypot(eta_y) < self.epsilon {
                break;
            }
        }
        Some(flow)
    }
}

impl PointFlow for LucasKanade {
    fn track_point(&mut self, previous: &GrayImage, current: &GrayImage, point: Point) -> Option<Point> {
        if previous.dimensions() != current.dimensions() || previous.width() < 2 || previous.height() < 2 {
            return None;
        }
        let previous_levels = self.pyramid(previous);
        let current_levels = self.pyramid(current);

        let mut guess = (0.0f32, 0.0f32);
        for level in (0..previous_levels.len()).rev() {
            let scale = (1u32 << level) as f32;
            let scaled = Point::new(point.x / scale, point.y / scale);
            let flow = self.refine(&previous_levels[level], &current_levels[level], scaled, guess)?;
            guess = if level > 0 { (flow.0 * 2.0, flow.1 * 2.0) } else { flow };
        }

        let tracked = Point::new(point.x + guess.0, point.y + guess.1);
        let inside = tracked.x >= 0.0
            && tracked.y >= 0.0
            && tracked.x <= (previous.width() - 1) as f32
            && tracked.y <= (previous.height() - 1) as f32;
        (inside && tracked.x.is_finite() && tracked.y.is_finite()).then_some(tracked)
    }
}
