//! Stereo framepoint generation: epipolar matching and triangulation.

use std::collections::HashSet;

use opencv::core::{KeyPoint, Mat, Vector};
use opencv::prelude::*;

use crate::config::{
    BaseFramepointGenerationParameters, StereoFramepointGenerationParameters,
};
use crate::error::Result;
use crate::geometry::Camera;
use crate::map::FramePoint;

use super::detector::KeypointDetector;
use super::{descriptor_distance, FramepointGeneration, GeneratorOutput, MatchingDistanceState};

/// Matches left/right keypoints along epipolar lines and triangulates depth
/// from disparity.
pub struct StereoFramePointGenerator {
    parameters: StereoFramepointGenerationParameters,
    detector: KeypointDetector,
    matching_distance: MatchingDistanceState,
    /// Depth boundary between near and far points, derived from the stereo
    /// baseline (`baseline_factor` × baseline).
    maximum_depth_near_meters: f64,
}

impl StereoFramePointGenerator {
    pub fn new(
        base: BaseFramepointGenerationParameters,
        parameters: StereoFramepointGenerationParameters,
        camera: &Camera,
    ) -> Self {
        Self {
            detector: KeypointDetector::new(base),
            matching_distance: MatchingDistanceState::new(&base),
            maximum_depth_near_meters: parameters.baseline_factor * camera.baseline_meters,
            parameters,
        }
    }

    /// Best right-image match for one left keypoint inside the epipolar
    /// band, honoring minimum disparity and the triangulation descriptor
    /// gate. Right keypoints already claimed by a previous left keypoint
    /// are skipped.
    fn match_on_epipolar_line(
        &self,
        keypoint_left: &KeyPoint,
        descriptors_left: &Mat,
        left_index: i32,
        keypoints_right: &Vector<KeyPoint>,
        descriptors_right: &Mat,
        claimed_right: &HashSet<i32>,
    ) -> Result<Option<(i32, u32)>> {
        let left_point = keypoint_left.pt();
        let mut best: Option<(i32, u32)> = None;

        for right_index in 0..keypoints_right.len() as i32 {
            if claimed_right.contains(&right_index) {
                continue;
            }
            let right_point = keypoints_right.get(right_index as usize)?.pt();

            // Rectified input: correspondences lie in a thin horizontal band.
            if (left_point.y - right_point.y).abs() as f64
                > self.parameters.epipolar_line_thickness_pixels
            {
                continue;
            }
            let disparity = (left_point.x - right_point.x) as f64;
            if disparity < self.parameters.minimum_disparity_pixels {
                continue;
            }

            let distance =
                descriptor_distance(descriptors_left, left_index, descriptors_right, right_index)?;
            if distance > self.parameters.maximum_matching_distance_triangulation {
                continue;
            }
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((right_index, distance));
            }
        }
        Ok(best)
    }
}

impl FramepointGeneration for StereoFramePointGenerator {
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
        let (keypoints_right, descriptors_right) =
            self.compute_keypoints_and_descriptors(right_or_depth)?;

        let mut points = Vec::new();
        let mut claimed_right: HashSet<i32> = HashSet::new();

        for left_index in 0..keypoints_left.len() as i32 {
            let keypoint_left = keypoints_left.get(left_index as usize)?;
            let Some((right_index, _distance)) = self.match_on_epipolar_line(
                &keypoint_left,
                &descriptors_left,
                left_index,
                &keypoints_right,
                &descriptors_right,
                &claimed_right,
            )?
            else {
                continue;
            };
            claimed_right.insert(right_index);

            let keypoint_right = keypoints_right.get(right_index as usize)?;
            let disparity = (keypoint_left.pt().x - keypoint_right.pt().x) as f64;
            let depth = camera.depth_from_disparity(disparity);
            let camera_coordinates = camera.back_project(
                keypoint_left.pt().x as f64,
                keypoint_left.pt().y as f64,
                depth,
            );

            points.push(FramePoint::new(
                keypoint_left,
                Some(keypoint_right),
                descriptors_left.row(left_index)?.try_clone()?,
                Some(descriptors_right.row(right_index)?.try_clone()?),
                camera_coordinates,
                depth <= self.maximum_depth_near_meters,
            ));
        }

        Ok(GeneratorOutput {
            points,
            keypoints_left,
            keypoints_right,
            descriptors_left,
            descriptors_right,
        })
    }

    fn matching_distance_tracking(&self) -> u32 {
        self.matching_distance.current()
    }

    fn adapt_matching_distance(&mut self, inlier_ratio: f64, target_ratio: f64) {
        self.matching_distance.adapt(inlier_ratio, target_ratio);
    }

    fn maximum_depth_near_meters(&self) -> f64 {
        self.maximum_depth_near_meters
    }

    fn supports_landmark_recovery(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> Camera {
        Camera {
            width: 640,
            height: 480,
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            baseline_meters: 0.1,
        }
    }

    fn generator() -> StereoFramePointGenerator {
        StereoFramePointGenerator::new(
            BaseFramepointGenerationParameters::default(),
            StereoFramepointGenerationParameters {
                maximum_matching_distance_triangulation: 10,
                baseline_factor: 50.0,
                minimum_disparity_pixels: 1.0,
                epipolar_line_thickness_pixels: 1.0,
            },
            &test_camera(),
        )
    }

    fn keypoint(x: f32, y: f32) -> KeyPoint {
        KeyPoint::new_coords(x, y, 7.0, -1.0, 0.0, 0, -1).unwrap()
    }

    fn descriptors(rows: &[&[u8]]) -> Mat {
        let flat: Vec<u8> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Mat::new_rows_cols_with_data(rows.len() as i32, rows[0].len() as i32, &flat)
            .unwrap()
            .try_clone()
            .unwrap()
    }

    #[test]
    fn test_epipolar_match_picks_best_descriptor() {
        let generator = generator();
        let left_descriptors = descriptors(&[&[0b1111_0000]]);
        // Two right candidates on the epipolar line; the second differs less.
        let right_descriptors = descriptors(&[&[0b0000_1111], &[0b1111_0001]]);
        let mut keypoints_right = Vector::<KeyPoint>::new();
        keypoints_right.push(keypoint(90.0, 100.0));
        keypoints_right.push(keypoint(95.0, 100.0));

        let best = generator
            .match_on_epipolar_line(
                &keypoint(100.0, 100.0),
                &left_descriptors,
                0,
                &keypoints_right,
                &right_descriptors,
                &HashSet::new(),
            )
            .unwrap();

        assert_eq!(best, Some((1, 1)));
    }

    #[test]
    fn test_epipolar_band_and_disparity_gates() {
        let generator = generator();
        let left_descriptors = descriptors(&[&[0u8]]);
        let right_descriptors = descriptors(&[&[0u8], &[0u8]]);
        let mut keypoints_right = Vector::<KeyPoint>::new();
        // Outside the band.
        keypoints_right.push(keypoint(90.0, 104.0));
        // Negative disparity (behind the camera).
        keypoints_right.push(keypoint(105.0, 100.0));

        let best = generator
            .match_on_epipolar_line(
                &keypoint(100.0, 100.0),
                &left_descriptors,
                0,
                &keypoints_right,
                &right_descriptors,
                &HashSet::new(),
            )
            .unwrap();

        assert_eq!(best, None);
    }

    #[test]
    fn test_near_boundary_follows_baseline_factor() {
        let generator = generator();
        // 50 × 0.1 m baseline.
        assert!((generator.maximum_depth_near_meters() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_claimed_right_keypoints_are_skipped() {
        let generator = generator();
        let left_descriptors = descriptors(&[&[0u8]]);
        let right_descriptors = descriptors(&[&[0u8]]);
        let mut keypoints_right = Vector::<KeyPoint>::new();
        keypoints_right.push(keypoint(90.0, 100.0));
        let claimed: HashSet<i32> = [0].into_iter().collect();

        let best = generator
            .match_on_epipolar_line(
                &keypoint(100.0, 100.0),
                &left_descriptors,
                0,
                &keypoints_right,
                &right_descriptors,
                &claimed,
            )
            .unwrap();

        assert_eq!(best, None);
    }
}
