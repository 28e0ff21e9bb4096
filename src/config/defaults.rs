//! Default parameter values.

pub const MINIMUM_NUMBER_OF_FORCED_UPDATES: usize = 2;
pub const MAXIMUM_TRANSLATION_ERROR_TO_DEPTH_RATIO: f64 = 0.1;

pub const MINIMUM_NUMBER_OF_LANDMARKS: usize = 50;

pub const MINIMUM_DISTANCE_TRAVELED_FOR_LOCAL_MAP: f64 = 0.5;
pub const MINIMUM_DEGREES_ROTATED_FOR_LOCAL_MAP: f64 = 30.0;
pub const MINIMUM_NUMBER_OF_FRAMES_FOR_LOCAL_MAP: usize = 4;

pub const TARGET_NUMBER_OF_KEYPOINTS: usize = 700;
pub const TARGET_NUMBER_OF_KEYPOINTS_TOLERANCE: f64 = 0.1;
pub const DETECTOR_THRESHOLD: i32 = 15;
pub const DETECTOR_THRESHOLD_MINIMUM: i32 = 5;
pub const DETECTOR_THRESHOLD_STEP_SIZE: i32 = 2;
pub const MATCHING_DISTANCE_TRACKING_THRESHOLD: u32 = 50;
pub const MATCHING_DISTANCE_TRACKING_THRESHOLD_MINIMUM: u32 = 25;
pub const MATCHING_DISTANCE_TRACKING_STEP_SIZE: u32 = 1;

pub const MAXIMUM_MATCHING_DISTANCE_TRIANGULATION: u32 = 50;
pub const BASELINE_FACTOR: f64 = 50.0;
pub const MINIMUM_DISPARITY_PIXELS: f64 = 1.0;
pub const EPIPOLAR_LINE_THICKNESS_PIXELS: f64 = 1.0;

pub const MAXIMUM_DEPTH_NEAR_METERS: f64 = 5.0;
pub const MAXIMUM_DEPTH_FAR_METERS: f64 = 20.0;

pub const ERROR_DELTA_FOR_CONVERGENCE: f64 = 1e-3;
pub const MAXIMUM_ERROR_KERNEL: f64 = 9.0;
pub const DAMPING: f64 = 1.0;
pub const MAXIMUM_NUMBER_OF_ITERATIONS: usize = 1000;
pub const MINIMUM_NUMBER_OF_INLIERS: usize = 50;
pub const MINIMUM_INLIER_RATIO: f64 = 0.75;

pub const MINIMUM_TRACK_LENGTH_FOR_LANDMARK_CREATION: usize = 3;
pub const MINIMUM_NUMBER_OF_LANDMARKS_TO_TRACK: usize = 5;
pub const MINIMUM_THRESHOLD_DISTANCE_TRACKING_PIXELS: f64 = 4.0;
pub const MAXIMUM_THRESHOLD_DISTANCE_TRACKING_PIXELS: f64 = 7.0;
pub const MAXIMUM_NUMBER_OF_LANDMARK_RECOVERIES: usize = 3;
pub const BIN_SIZE_PIXELS: usize = 16;
pub const RATIO_KEYPOINTS_TO_BINS: f64 = 1.0;

pub const PRELIMINARY_MINIMUM_INTERSPACE_QUERIES: usize = 5;
pub const PRELIMINARY_MINIMUM_MATCHING_RATIO: f64 = 0.1;
pub const MINIMUM_NUMBER_OF_MATCHES_PER_LANDMARK: usize = 5;
pub const MAXIMUM_DESCRIPTOR_DISTANCE: u32 = 25;
pub const RELOCALIZATION_MINIMUM_NUMBER_OF_INLIERS: usize = 25;
pub const RELOCALIZATION_MINIMUM_INLIER_RATIO: f64 = 0.5;

pub const IDENTIFIER_SPACE: u64 = 1_000_000;
pub const NUMBER_OF_FRAMES_PER_BUNDLE_ADJUSTMENT: usize = 100;
pub const BASE_INFORMATION_FRAME: f64 = 1e5;
