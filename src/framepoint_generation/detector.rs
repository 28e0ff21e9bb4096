//! Adaptive keypoint detection and descriptor extraction.

use opencv::core::{no_array, KeyPoint, Mat, Vector};
use opencv::features2d::{FastFeatureDetector, FastFeatureDetector_DetectorType, ORB};
use opencv::prelude::*;
use tracing::trace;

use crate::config::BaseFramepointGenerationParameters;
use crate::error::Result;

/// FAST detector with a threshold that adapts towards a target keypoint
/// count, plus ORB descriptor extraction.
pub struct KeypointDetector {
    parameters: BaseFramepointGenerationParameters,
    detector_threshold: i32,
}

impl KeypointDetector {
    pub fn new(parameters: BaseFramepointGenerationParameters) -> Self {
        Self {
            detector_threshold: parameters.detector_threshold,
            parameters,
        }
    }

    pub fn detector_threshold(&self) -> i32 {
        self.detector_threshold
    }

    /// Detect keypoints and extract their binary descriptors.
    ///
    /// On under/overshoot of the target keypoint count the detector
    /// threshold is stepped for the next call, bounded from below by
    /// `detector_threshold_minimum`.
    pub fn compute_keypoints_and_descriptors(
        &mut self,
        image: &Mat,
    ) -> Result<(Vector<KeyPoint>, Mat)> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut detector = FastFeatureDetector::create(
            self.detector_threshold,
            true,
            FastFeatureDetector_DetectorType::TYPE_9_16,
        )?;
        detector.detect(image, &mut keypoints, &no_array())?;

        self.adapt_threshold(keypoints.len());

        // ORB compute drops keypoints too close to the border, keeping the
        // keypoint vector and descriptor rows aligned.
        let mut extractor = ORB::create_def()?;
        let mut descriptors = Mat::default();
        extractor.compute(image, &mut keypoints, &mut descriptors)?;

        trace!(
            keypoints = keypoints.len(),
            threshold = self.detector_threshold,
            "detected keypoints"
        );
        Ok((keypoints, descriptors))
    }

    fn adapt_threshold(&mut self, number_of_keypoints: usize) {
        let target = self.parameters.target_number_of_keypoints as f64;
        let tolerance = self.parameters.target_number_of_keypoints_tolerance;
        let detected = number_of_keypoints as f64;

        if detected < target * (1.0 - tolerance) {
            self.detector_threshold = (self.detector_threshold
                - self.parameters.detector_threshold_step_size)
                .max(self.parameters.detector_threshold_minimum);
        } else if detected > target * (1.0 + tolerance) {
            self.detector_threshold += self.parameters.detector_threshold_step_size;
        }
    }
}
