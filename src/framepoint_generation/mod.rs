//! FramePoint generation: from images to matched 2D keypoints with 3D
//! camera-frame coordinates.
//!
//! Two variants exist behind the [`FramepointGeneration`] trait: stereo
//! (epipolar matching + triangulation) and depth (back-projection through a
//! registered depth image). Both share the adaptive keypoint detector and
//! the adaptive descriptor-matching threshold used by the tracker.

pub mod depth;
pub mod detector;
pub mod stereo;

use opencv::core::{KeyPoint, Mat, Vector};
use opencv::prelude::*;

use crate::config::{
    BaseFramepointGenerationParameters, DepthFramepointGenerationParameters,
    StereoFramepointGenerationParameters, TrackerMode,
};
use crate::error::Result;
use crate::geometry::Camera;
use crate::map::FramePoint;

pub use depth::DepthFramePointGenerator;
pub use detector::KeypointDetector;
pub use stereo::StereoFramePointGenerator;

/// Everything a generator produces for one frame.
pub struct GeneratorOutput {
    pub points: Vec<FramePoint>,
    pub keypoints_left: Vector<KeyPoint>,
    pub keypoints_right: Vector<KeyPoint>,
    pub descriptors_left: Mat,
    pub descriptors_right: Mat,
}

/// Capability set of a framepoint generator variant.
pub trait FramepointGeneration {
    /// Adaptive keypoint detection plus descriptor extraction.
    fn compute_keypoints_and_descriptors(&mut self, image: &Mat)
        -> Result<(Vector<KeyPoint>, Mat)>;

    /// Produce matched FramePoints carrying 3D camera-frame coordinates.
    /// `right_or_depth` is the right intensity image (stereo) or the
    /// registered depth image (depth).
    fn generate(
        &mut self,
        left: &Mat,
        right_or_depth: &Mat,
        camera: &Camera,
    ) -> Result<GeneratorOutput>;

    /// Current descriptor-distance gate for frame-to-frame tracking.
    fn matching_distance_tracking(&self) -> u32;

    /// Adapt the tracking gate: tighten on high inlier ratios, loosen on
    /// low, bounded by the configured interval.
    fn adapt_matching_distance(&mut self, inlier_ratio: f64, target_ratio: f64);

    /// Depth boundary between near (full residual) and far (bearing-only)
    /// points.
    fn maximum_depth_near_meters(&self) -> f64;

    /// Whether this variant can re-find lost landmarks in the current image.
    fn supports_landmark_recovery(&self) -> bool;
}

/// Construct the generator variant for the configured tracker mode.
pub fn make_generator(
    mode: TrackerMode,
    base: BaseFramepointGenerationParameters,
    stereo: StereoFramepointGenerationParameters,
    depth: DepthFramepointGenerationParameters,
    camera: &Camera,
    depth_scale: f64,
) -> Box<dyn FramepointGeneration> {
    match mode {
        TrackerMode::RgbStereo => Box::new(StereoFramePointGenerator::new(base, stereo, camera)),
        TrackerMode::RgbDepth => Box::new(DepthFramePointGenerator::new(base, depth, depth_scale)),
    }
}

/// Hamming distance between two binary descriptor rows.
pub fn descriptor_distance(a: &Mat, row_a: i32, b: &Mat, row_b: i32) -> Result<u32> {
    let mut distance = 0u32;
    for column in 0..a.cols().min(b.cols()) {
        let left = *a.at_2d::<u8>(row_a, column)?;
        let right = *b.at_2d::<u8>(row_b, column)?;
        distance += (left ^ right).count_ones();
    }
    Ok(distance)
}

/// Shared adaptive matching-distance state of both generator variants.
pub(crate) struct MatchingDistanceState {
    current: u32,
    minimum: u32,
    maximum: u32,
    step_size: u32,
}

impl MatchingDistanceState {
    pub(crate) fn new(parameters: &BaseFramepointGenerationParameters) -> Self {
        Self {
            current: parameters.matching_distance_tracking_threshold,
            minimum: parameters.matching_distance_tracking_threshold_minimum,
            maximum: parameters.matching_distance_tracking_threshold_maximum,
            step_size: parameters.matching_distance_tracking_step_size,
        }
    }

    pub(crate) fn current(&self) -> u32 {
        self.current
    }

    pub(crate) fn adapt(&mut self, inlier_ratio: f64, target_ratio: f64) {
        if inlier_ratio >= target_ratio {
            self.current = self.current.saturating_sub(self.step_size).max(self.minimum);
        } else {
            self.current = (self.current + self.step_size).min(self.maximum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(bytes: &[u8]) -> Mat {
        Mat::new_rows_cols_with_data(1, bytes.len() as i32, bytes)
            .unwrap()
            .try_clone()
            .unwrap()
    }

    #[test]
    fn test_descriptor_distance_counts_bits() {
        let a = descriptor(&[0b1111_0000, 0b0000_0000]);
        let b = descriptor(&[0b0000_0000, 0b0000_0001]);

        assert_eq!(descriptor_distance(&a, 0, &b, 0).unwrap(), 5);
        assert_eq!(descriptor_distance(&a, 0, &a, 0).unwrap(), 0);
    }

    #[test]
    fn test_matching_distance_adapts_within_bounds() {
        let parameters = BaseFramepointGenerationParameters {
            matching_distance_tracking_threshold: 40,
            matching_distance_tracking_threshold_minimum: 25,
            matching_distance_tracking_threshold_maximum: 50,
            matching_distance_tracking_step_size: 10,
            ..Default::default()
        };
        let mut state = MatchingDistanceState::new(&parameters);

        // High inlier ratio tightens.
        state.adapt(0.9, 0.5);
        assert_eq!(state.current(), 30);
        state.adapt(0.9, 0.5);
        assert_eq!(state.current(), 25);

        // Low inlier ratio loosens, bounded by the maximum.
        state.adapt(0.1, 0.5);
        assert_eq!(state.current(), 35);
        state.adapt(0.1, 0.5);
        state.adapt(0.1, 0.5);
        assert_eq!(state.current(), 50);
    }
}
