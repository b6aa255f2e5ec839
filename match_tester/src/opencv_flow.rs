use image::GrayImage;
use opencv::{
    core::{Mat, Point2f, Scalar, Size, TermCriteria, TermCriteria_Type, Vector, CV_8UC1},
    prelude::*,
    video,
};
use pitch_vision::core_modules::optical_flow::PointFlow;
use pitch_vision::Point;
use tracing::warn;

/// OpenCV's pyramidal Lucas-Kanade, for when OpenCV is available anyway.
pub struct OpenCvFlow {
    win_size: i32,
    max_level: i32,
    max_iterations: i32,
    epsilon: f64,
}

impl Default for OpenCvFlow {
    fn default() -> Self {
        Self {
            win_size: 21,
            max_level: 3,
            max_iterations: 30,
            epsilon: 0.01,
        }
    }
}

/// Copies a grey image into an owned single-channel Mat.
fn to_mat(image: &GrayImage) -> opencv::Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(image.height() as i32, image.width() as i32, CV_8UC1, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

impl OpenCvFlow {
    fn track(&self, previous: &GrayImage, current: &GrayImage, point: Point) -> opencv::Result<Option<Point>> {
        let previous = to_mat(previous)?;
        let current = to_mat(current)?;
        let previous_points = Vector::<Point2f>::from_iter([Point2f::new(point.x, point.y)]);
        let mut next_points = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();
        let criteria = TermCriteria::new(
            TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
            self.max_iterations,
            self.epsilon,
        )?;

        video::calc_optical_flow_pyr_lk(
            &previous,
            &current,
            &previous_points,
            &mut next_points,
            &mut status,
            &mut err,
            Size::new(self.win_size, self.win_size),
            self.max_level,
            criteria,
            0,
            1e-4,
        )?;

        if status.get(0)? == 0 {
            return Ok(None);
        }
        let tracked = next_points.get(0)?;
        Ok(Some(Point::new(tracked.x, tracked.y)))
    }
}

impl PointFlow for OpenCvFlow {
    fn track_point(&mut self, previous: &GrayImage, current: &GrayImage, point: Point) -> Option<Point> {
        self.track(previous, current, point).unwrap_or_else(|err| {
            warn!(%err, "OpenCV optical flow failed");
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grey_images_copy_into_mats_row_major() {
        let image = GrayImage::from_fn(4, 3, |x, y| image::Luma([(y * 4 + x) as u8]));
        let mat = to_mat(&image).unwrap();
        assert_eq!((mat.rows(), mat.cols()), (3, 4));
        assert_eq!(mat.data_bytes().unwrap(), image.as_raw().as_slice());
    }
}
