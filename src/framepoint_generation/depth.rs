//! Depth framepoint generation: back-projection through a registered depth
//! image.

use opencv::core::{KeyPoint, Mat, Vector, CV_16UC1, CV_32FC1};
use opencv::prelude::*;

use crate::config::{
    BaseFramepointGenerationParameters, DepthFramepointGenerationParameters,
};
use crate::error::Result;
use crate::geometry::Camera;
use crate::map::FramePoint;

use super::detector::KeypointDetector;
use super::{FramepointGeneration, GeneratorOutput, MatchingDistanceState};

/// Back-projects left keypoints using the registered depth image. Keypoints
/// without valid depth are dropped; depths beyond the far bound as well.
pub struct DepthFramePointGenerator {
    parameters: DepthFramepointGenerationParameters,
    detector: KeypointDetector,
    matching_distance: MatchingDistanceState,
    /// Scale converting raw depth values to meters (16-bit images).
    depth_scale: f64,
}

impl DepthFramePointGenerator {
    pub fn new(
        base: BaseFramepointGenerationParameters,
        parameters: DepthFramepointGenerationParameters,
        depth_scale: f64,
    ) -> Self {
        Self {
            parameters,
            detector: KeypointDetector::new(base),
            matching_distance: MatchingDistanceState::new(&base),
            depth_scale,
        }
    }

    /// Depth in meters at a pixel, or `None` when invalid.
    fn depth_at(&self, depth_image: &Mat, row: i32, column: i32) -> Result<Option<f64>> {
        if row < 0 || column < 0 || row >= depth_image.rows() || column >= depth_image.cols() {
            return Ok(None);
        }
        let depth_meters = match depth_image.typ() {
            t if t == CV_16UC1 => *depth_image.at_2d::<u16>(row, column)? as f64 * self.depth_scale,
            t if t == CV_32FC1 => *depth_image.at_2d::<f32>(row, column)? as f64,
            _ => return Ok(None),
        };
        if !depth_meters.is_finite() || depth_meters <= 0.0 {
            return Ok(None);
        }
        Ok(Some(depth_meters))
    }
}

impl FramepointGeneration for DepthFramePointGenerator {
    fn compute_keypoints_and_descriptors(
        &mut self,
        image: &Mat,
    ) -> Result<(Vector<KeyPoint>, Mat)> {
        self.detector.compute_keypoints_and_descriptors(image)
    }

    fn generate(
        &mut self,
        left: &Mat,
        right_or_depth: &Mat,
        camera: &Camera,
    ) -> Result<GeneratorOutput> {
        let (keypoints_left, descriptors_left) = self.compute_keypoints_and_descriptors(left)?;

        let mut points = Vec::new();
        for index in 0..keypoints_left.len() as i32 {
            let keypoint = keypoints_left.get(index as usize)?;
            let point = keypoint.pt();
            let Some(depth_meters) = self.depth_at(
                right_or_depth,
                point.y.round() as i32,
                point.x.round() as i32,
            )?
            else {
                continue;
            };
            if depth_meters > self.parameters.maximum_depth_far_meters {
                continue;
            }

            let camera_coordinates =
                camera.back_project(point.x as f64, point.y as f64, depth_meters);
            points.push(FramePoint::new(
                keypoint,
                None,
                descriptors_left.row(index)?.try_clone()?,
                None,
                camera_coordinates,
                depth_meters <= self.parameters.maximum_depth_near_meters,
            ));
        }

        Ok(GeneratorOutput {
            points,
            keypoints_left,
            keypoints_right: Vector::new(),
            descriptors_left,
            descriptors_right: Mat::default(),
        })
    }

    fn matching_distance_tracking(&self) -> u32 {
        self.matching_distance.current()
    }

    fn adapt_matching_distance(&mut self, inlier_ratio: f64, target_ratio: f64) {
        self.matching_distance.adapt(inlier_ratio, target_ratio);
    }

    fn maximum_depth_near_meters(&self) -> f64 {
        self.parameters.maximum_depth_near_meters
    }

    /// Depth tracking has no second view to re-find a lost landmark
    /// against, so recovery is not available in this variant.
    fn supports_landmark_recovery(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> DepthFramePointGenerator {
        DepthFramePointGenerator::new(
            BaseFramepointGenerationParameters::default(),
            DepthFramepointGenerationParameters {
                maximum_depth_near_meters: 5.0,
                maximum_depth_far_meters: 20.0,
            },
            1.0e-3,
        )
    }

    fn depth_image_u16(values: &[u16], rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_data(rows, cols, values)
            .unwrap()
            .try_clone()
            .unwrap()
    }

    #[test]
    fn test_depth_lookup_scales_millimeters() {
        let generator = generator();
        let image = depth_image_u16(&[0, 1500, 3000, 0], 2, 2);

        assert_eq!(generator.depth_at(&image, 0, 1).unwrap(), Some(1.5));
        assert_eq!(generator.depth_at(&image, 1, 0).unwrap(), Some(3.0));
    }

    #[test]
    fn test_zero_depth_is_invalid() {
        let generator = generator();
        let image = depth_image_u16(&[0], 1, 1);

        assert_eq!(generator.depth_at(&image, 0, 0).unwrap(), None);
    }

    #[test]
    fn test_out_of_bounds_is_invalid() {
        let generator = generator();
        let image = depth_image_u16(&[1000], 1, 1);

        assert_eq!(generator.depth_at(&image, 2, 0).unwrap(), None);
        assert_eq!(generator.depth_at(&image, 0, -1).unwrap(), None);
    }

    #[test]
    fn test_recovery_is_not_supported() {
        assert!(!generator().supports_landmark_recovery());
    }
}
