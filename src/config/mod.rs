//! Parameter schema and configuration loading.
//!
//! The configuration is a YAML document with one group per subsystem.
//! Missing keys retain their defaults. Command-line flags are parsed in two
//! passes: the configuration file is located and loaded first, then the
//! remaining flags overwrite values from the file.

mod defaults;

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Result, SlamError};

pub const BANNER: &str = "\
sparse_vslam_app: simple SLAM application
usage: sparse_vslam_app [options] <dataset>

<dataset>: path to a dataset directory

[options]
-configuration (-c)            <string>: path to configuration file to load
-topic-image-left (-il)        <string>: sets left image topic name
-topic-image-right (-ir)       <string>: sets right image topic name
-topic-camera-info-left (-cl)  <string>: sets left camera info topic
-topic-camera-info-right (-cr) <string>: sets right camera info topic
-use-gui (-ug):                          displays GUI elements
-use-odometry (-uo):                     uses odometry instead of inner motion model for prediction
-depth-mode (-dm):                       depth tracking (-topic-image-left: intensity image, -topic-image-right: depth)
-open-loop (-ol):                        disables relocalization and loop closing (open loop mode)
-show-top (-st):                         enable top map viewer
-drop-framepoints (-df):                 deallocation of past framepoints at runtime (reduces memory demand)
-equalize-histogram (-eh):               equalize stereo image histogram before processing
-undistort-rectify (-ur):                undistorts and rectifies input images based on camera info
-recover-landmarks (-rl):                enables landmark track recovery
-h (--help):                             prints this help text";

/// Selects the framepoint generation and tracking variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TrackerMode {
    #[serde(rename = "RGB_STEREO")]
    RgbStereo,
    #[serde(rename = "RGB_DEPTH")]
    RgbDepth,
}

impl Default for TrackerMode {
    fn default() -> Self {
        Self::RgbStereo
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandLineParameters {
    pub configuration_file_name: String,
    pub topic_image_left: String,
    pub topic_image_right: String,
    pub topic_camera_info_left: String,
    pub topic_camera_info_right: String,
    pub dataset_file_name: String,
    pub tracker_mode: TrackerMode,
    pub option_use_gui: bool,
    pub option_use_odometry: bool,
    pub option_use_relocalization: bool,
    pub option_show_top_viewer: bool,
    pub option_drop_framepoints: bool,
    pub option_equalize_histogram: bool,
    pub option_undistort_and_rectify: bool,
    pub option_recover_landmarks: bool,
}

impl Default for CommandLineParameters {
    fn default() -> Self {
        Self {
            configuration_file_name: String::new(),
            topic_image_left: String::new(),
            topic_image_right: String::new(),
            topic_camera_info_left: String::new(),
            topic_camera_info_right: String::new(),
            dataset_file_name: String::new(),
            tracker_mode: TrackerMode::RgbStereo,
            option_use_gui: false,
            option_use_odometry: false,
            option_use_relocalization: true,
            option_show_top_viewer: false,
            option_drop_framepoints: false,
            option_equalize_histogram: false,
            option_undistort_and_rectify: false,
            option_recover_landmarks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LandmarkParameters {
    /// Number of off-average measurements accepted before the position guard
    /// starts invalidating.
    pub minimum_number_of_forced_updates: usize,
    pub maximum_translation_error_to_depth_ratio: f64,
}

impl Default for LandmarkParameters {
    fn default() -> Self {
        Self {
            minimum_number_of_forced_updates: defaults::MINIMUM_NUMBER_OF_FORCED_UPDATES,
            maximum_translation_error_to_depth_ratio:
                defaults::MAXIMUM_TRANSLATION_ERROR_TO_DEPTH_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LocalMapParameters {
    /// Local maps with fewer landmarks are skipped by the relocalizer.
    pub minimum_number_of_landmarks: usize,
}

impl Default for LocalMapParameters {
    fn default() -> Self {
        Self {
            minimum_number_of_landmarks: defaults::MINIMUM_NUMBER_OF_LANDMARKS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorldMapParameters {
    pub minimum_distance_traveled_for_local_map: f64,
    pub minimum_degrees_rotated_for_local_map: f64,
    pub minimum_number_of_frames_for_local_map: usize,
    pub landmark: LandmarkParameters,
    pub local_map: LocalMapParameters,
}

impl Default for WorldMapParameters {
    fn default() -> Self {
        Self {
            minimum_distance_traveled_for_local_map:
                defaults::MINIMUM_DISTANCE_TRAVELED_FOR_LOCAL_MAP,
            minimum_degrees_rotated_for_local_map: defaults::MINIMUM_DEGREES_ROTATED_FOR_LOCAL_MAP,
            minimum_number_of_frames_for_local_map:
                defaults::MINIMUM_NUMBER_OF_FRAMES_FOR_LOCAL_MAP,
            landmark: LandmarkParameters::default(),
            local_map: LocalMapParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BaseFramepointGenerationParameters {
    pub target_number_of_keypoints: usize,
    pub target_number_of_keypoints_tolerance: f64,
    pub detector_threshold: i32,
    pub detector_threshold_minimum: i32,
    pub detector_threshold_step_size: i32,
    pub matching_distance_tracking_threshold: u32,
    pub matching_distance_tracking_threshold_maximum: u32,
    pub matching_distance_tracking_threshold_minimum: u32,
    pub matching_distance_tracking_step_size: u32,
}

impl Default for BaseFramepointGenerationParameters {
    fn default() -> Self {
        Self {
            target_number_of_keypoints: defaults::TARGET_NUMBER_OF_KEYPOINTS,
            target_number_of_keypoints_tolerance: defaults::TARGET_NUMBER_OF_KEYPOINTS_TOLERANCE,
            detector_threshold: defaults::DETECTOR_THRESHOLD,
            detector_threshold_minimum: defaults::DETECTOR_THRESHOLD_MINIMUM,
            detector_threshold_step_size: defaults::DETECTOR_THRESHOLD_STEP_SIZE,
            matching_distance_tracking_threshold: defaults::MATCHING_DISTANCE_TRACKING_THRESHOLD,
            matching_distance_tracking_threshold_maximum:
                defaults::MATCHING_DISTANCE_TRACKING_THRESHOLD,
            matching_distance_tracking_threshold_minimum:
                defaults::MATCHING_DISTANCE_TRACKING_THRESHOLD_MINIMUM,
            matching_distance_tracking_step_size: defaults::MATCHING_DISTANCE_TRACKING_STEP_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StereoFramepointGenerationParameters {
    pub maximum_matching_distance_triangulation: u32,
    /// Near/far depth boundary as a multiple of the stereo baseline.
    pub baseline_factor: f64,
    pub minimum_disparity_pixels: f64,
    pub epipolar_line_thickness_pixels: f64,
}

impl Default for StereoFramepointGenerationParameters {
    fn default() -> Self {
        Self {
            maximum_matching_distance_triangulation:
                defaults::MAXIMUM_MATCHING_DISTANCE_TRIANGULATION,
            baseline_factor: defaults::BASELINE_FACTOR,
            minimum_disparity_pixels: defaults::MINIMUM_DISPARITY_PIXELS,
            epipolar_line_thickness_pixels: defaults::EPIPOLAR_LINE_THICKNESS_PIXELS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DepthFramepointGenerationParameters {
    pub maximum_depth_near_meters: f64,
    pub maximum_depth_far_meters: f64,
}

impl Default for DepthFramepointGenerationParameters {
    fn default() -> Self {
        Self {
            maximum_depth_near_meters: defaults::MAXIMUM_DEPTH_NEAR_METERS,
            maximum_depth_far_meters: defaults::MAXIMUM_DEPTH_FAR_METERS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AlignerParameters {
    pub error_delta_for_convergence: f64,
    /// Squared-pixel threshold of the robust kernel; residuals above it are
    /// down-weighted and counted as outliers.
    pub maximum_error_kernel: f64,
    pub damping: f64,
    pub maximum_number_of_iterations: usize,
    pub minimum_number_of_inliers: usize,
    pub minimum_inlier_ratio: f64,
}

impl Default for AlignerParameters {
    fn default() -> Self {
        Self {
            error_delta_for_convergence: defaults::ERROR_DELTA_FOR_CONVERGENCE,
            maximum_error_kernel: defaults::MAXIMUM_ERROR_KERNEL,
            damping: defaults::DAMPING,
            maximum_number_of_iterations: defaults::MAXIMUM_NUMBER_OF_ITERATIONS,
            minimum_number_of_inliers: defaults::MINIMUM_NUMBER_OF_INLIERS,
            minimum_inlier_ratio: defaults::MINIMUM_INLIER_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TrackingParameters {
    pub minimum_track_length_for_landmark_creation: usize,
    pub minimum_number_of_landmarks_to_track: usize,
    pub minimum_threshold_distance_tracking_pixels: f64,
    pub maximum_threshold_distance_tracking_pixels: f64,
    pub enable_landmark_recovery: bool,
    pub maximum_number_of_landmark_recoveries: usize,
    pub bin_size_pixels: usize,
    pub ratio_keypoints_to_bins: f64,
    pub aligner: AlignerParameters,
}

impl Default for TrackingParameters {
    fn default() -> Self {
        Self {
            minimum_track_length_for_landmark_creation:
                defaults::MINIMUM_TRACK_LENGTH_FOR_LANDMARK_CREATION,
            minimum_number_of_landmarks_to_track: defaults::MINIMUM_NUMBER_OF_LANDMARKS_TO_TRACK,
            minimum_threshold_distance_tracking_pixels:
                defaults::MINIMUM_THRESHOLD_DISTANCE_TRACKING_PIXELS,
            maximum_threshold_distance_tracking_pixels:
                defaults::MAXIMUM_THRESHOLD_DISTANCE_TRACKING_PIXELS,
            enable_landmark_recovery: false,
            maximum_number_of_landmark_recoveries: defaults::MAXIMUM_NUMBER_OF_LANDMARK_RECOVERIES,
            bin_size_pixels: defaults::BIN_SIZE_PIXELS,
            ratio_keypoints_to_bins: defaults::RATIO_KEYPOINTS_TO_BINS,
            aligner: AlignerParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RelocalizationParameters {
    /// Most recent local maps excluded from querying (trivial matches).
    pub preliminary_minimum_interspace_queries: usize,
    pub preliminary_minimum_matching_ratio: f64,
    pub minimum_number_of_matches_per_landmark: usize,
    pub maximum_descriptor_distance: u32,
    pub aligner: AlignerParameters,
}

impl Default for RelocalizationParameters {
    fn default() -> Self {
        Self {
            preliminary_minimum_interspace_queries:
                defaults::PRELIMINARY_MINIMUM_INTERSPACE_QUERIES,
            preliminary_minimum_matching_ratio: defaults::PRELIMINARY_MINIMUM_MATCHING_RATIO,
            minimum_number_of_matches_per_landmark:
                defaults::MINIMUM_NUMBER_OF_MATCHES_PER_LANDMARK,
            maximum_descriptor_distance: defaults::MAXIMUM_DESCRIPTOR_DISTANCE,
            aligner: AlignerParameters {
                minimum_number_of_inliers: defaults::RELOCALIZATION_MINIMUM_NUMBER_OF_INLIERS,
                minimum_inlier_ratio: defaults::RELOCALIZATION_MINIMUM_INLIER_RATIO,
                ..AlignerParameters::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GraphOptimizationParameters {
    /// Offset separating landmark vertex identifiers from frame ones.
    pub identifier_space: u64,
    pub number_of_frames_per_bundle_adjustment: usize,
    pub base_information_frame: f64,
    pub enable_robust_kernel_for_landmark_measurements: bool,
}

impl Default for GraphOptimizationParameters {
    fn default() -> Self {
        Self {
            identifier_space: defaults::IDENTIFIER_SPACE,
            number_of_frames_per_bundle_adjustment:
                defaults::NUMBER_OF_FRAMES_PER_BUNDLE_ADJUSTMENT,
            base_information_frame: defaults::BASE_INFORMATION_FRAME,
            enable_robust_kernel_for_landmark_measurements: true,
        }
    }
}

/// Raw YAML document layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigurationFile {
    command_line: CommandLineParameters,
    world_map: WorldMapParameters,
    landmark: Option<LandmarkParameters>,
    local_map: Option<LocalMapParameters>,
    base_framepoint_generation: BaseFramepointGenerationParameters,
    stereo_framepoint_generation: StereoFramepointGenerationParameters,
    depth_framepoint_generation: DepthFramepointGenerationParameters,
    base_tracking: TrackingParameters,
    relocalization: RelocalizationParameters,
    graph_optimization: GraphOptimizationParameters,
}

/// The full parameter set of the pipeline.
#[derive(Debug, Clone)]
pub struct ParameterCollection {
    pub command_line: CommandLineParameters,
    pub world_map: WorldMapParameters,
    pub base_framepoint_generation: BaseFramepointGenerationParameters,
    pub stereo_framepoint_generation: StereoFramepointGenerationParameters,
    pub depth_framepoint_generation: DepthFramepointGenerationParameters,
    pub tracking: TrackingParameters,
    pub relocalization: RelocalizationParameters,
    pub graph_optimization: GraphOptimizationParameters,
}

impl Default for ParameterCollection {
    fn default() -> Self {
        Self {
            command_line: CommandLineParameters::default(),
            world_map: WorldMapParameters::default(),
            base_framepoint_generation: BaseFramepointGenerationParameters::default(),
            stereo_framepoint_generation: StereoFramepointGenerationParameters::default(),
            depth_framepoint_generation: DepthFramepointGenerationParameters::default(),
            tracking: TrackingParameters::default(),
            relocalization: RelocalizationParameters::default(),
            graph_optimization: GraphOptimizationParameters::default(),
        }
    }
}

impl ParameterCollection {
    /// Parse a YAML configuration document.
    ///
    /// An unknown `tracker_mode` value is a fatal configuration error.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: ConfigurationFile = serde_yaml::from_str(yaml)
            .map_err(|error| SlamError::Configuration(error.to_string()))?;

        let mut world_map = file.world_map;
        // The landmark and local_map groups are top-level in the document but
        // owned by the world map at runtime.
        if let Some(landmark) = file.landmark {
            world_map.landmark = landmark;
        }
        if let Some(local_map) = file.local_map {
            world_map.local_map = local_map;
        }

        Ok(Self {
            command_line: file.command_line,
            world_map,
            base_framepoint_generation: file.base_framepoint_generation,
            stereo_framepoint_generation: file.stereo_framepoint_generation,
            depth_framepoint_generation: file.depth_framepoint_generation,
            tracking: file.base_tracking,
            relocalization: file.relocalization,
            graph_optimization: file.graph_optimization,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let collection = Self::from_yaml(&contents)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(collection)
    }

    /// Parse command-line arguments, loading the configuration file first so
    /// the remaining flags overwrite values from it.
    pub fn from_command_line(arguments: &[String]) -> Result<Self> {
        // First pass: locate the configuration file.
        let mut configuration_file = None;
        let mut iterator = arguments.iter();
        while let Some(argument) = iterator.next() {
            if argument == "-configuration" || argument == "-c" {
                configuration_file = iterator.next().cloned();
                break;
            }
        }

        let mut collection = match &configuration_file {
            Some(path) => Self::from_file(Path::new(path))?,
            None => {
                warn!("no configuration file specified (running with internal settings)");
                Self::default()
            }
        };
        if let Some(path) = configuration_file {
            collection.command_line.configuration_file_name = path;
        }

        // Second pass: flags overwrite file values.
        let mut iterator = arguments.iter();
        while let Some(argument) = iterator.next() {
            match argument.as_str() {
                "-configuration" | "-c" => {
                    iterator.next();
                }
                "-topic-image-left" | "-il" => {
                    if let Some(value) = iterator.next() {
                        collection.command_line.topic_image_left = value.clone();
                    }
                }
                "-topic-image-right" | "-ir" => {
                    if let Some(value) = iterator.next() {
                        collection.command_line.topic_image_right = value.clone();
                    }
                }
                "-topic-camera-info-left" | "-cl" => {
                    if let Some(value) = iterator.next() {
                        collection.command_line.topic_camera_info_left = value.clone();
                    }
                }
                "-topic-camera-info-right" | "-cr" => {
                    if let Some(value) = iterator.next() {
                        collection.command_line.topic_camera_info_right = value.clone();
                    }
                }
                "-h" | "--h" | "-help" | "--help" => return Err(SlamError::HelpRequested),
                "-use-gui" | "-ug" => collection.command_line.option_use_gui = true,
                "-open-loop" | "-ol" => collection.command_line.option_use_relocalization = false,
                "-show-top" | "-st" => collection.command_line.option_show_top_viewer = true,
                "-drop-framepoints" | "-df" => {
                    collection.command_line.option_drop_framepoints = true
                }
                "-equalize-histogram" | "-eh" => {
                    collection.command_line.option_equalize_histogram = true
                }
                "-undistort-rectify" | "-ur" => {
                    collection.command_line.option_undistort_and_rectify = true
                }
                "-depth-mode" | "-dm" => {
                    collection.command_line.tracker_mode = TrackerMode::RgbDepth
                }
                "-use-odometry" | "-uo" => collection.command_line.option_use_odometry = true,
                "-recover-landmarks" | "-rl" => {
                    collection.command_line.option_recover_landmarks = true
                }
                positional => {
                    if collection.command_line.dataset_file_name.is_empty() {
                        collection.command_line.dataset_file_name = positional.to_string();
                    }
                }
            }
        }

        if collection.command_line.option_recover_landmarks {
            collection.tracking.enable_landmark_recovery = true;
        }

        collection.validate()?;
        Ok(collection)
    }

    /// Fatal-at-startup validation.
    pub fn validate(&self) -> Result<()> {
        if self.command_line.topic_image_left.is_empty() {
            return Err(SlamError::Configuration(
                "empty value entered for parameter: -topic-image-left (-il)".to_string(),
            ));
        }
        if self.command_line.topic_image_right.is_empty() {
            return Err(SlamError::Configuration(
                "empty value entered for parameter: -topic-image-right (-ir)".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arguments(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_complete() {
        let collection = ParameterCollection::default();

        assert_eq!(collection.command_line.tracker_mode, TrackerMode::RgbStereo);
        assert!(collection.command_line.option_use_relocalization);
        assert!(collection.tracking.aligner.maximum_number_of_iterations > 0);
    }

    #[test]
    fn test_yaml_missing_keys_retain_defaults() {
        let collection = ParameterCollection::from_yaml(
            "world_map:\n  minimum_number_of_frames_for_local_map: 10\n",
        )
        .unwrap();

        assert_eq!(collection.world_map.minimum_number_of_frames_for_local_map, 10);
        // Untouched group keeps its default.
        assert_eq!(
            collection.tracking.minimum_track_length_for_landmark_creation,
            TrackingParameters::default().minimum_track_length_for_landmark_creation
        );
    }

    #[test]
    fn test_yaml_tracker_mode() {
        let collection = ParameterCollection::from_yaml(
            "command_line:\n  tracker_mode: RGB_DEPTH\n",
        )
        .unwrap();
        assert_eq!(collection.command_line.tracker_mode, TrackerMode::RgbDepth);

        let invalid = ParameterCollection::from_yaml(
            "command_line:\n  tracker_mode: RGB_MONO\n",
        );
        assert!(matches!(invalid, Err(SlamError::Configuration(_))));
    }

    #[test]
    fn test_yaml_top_level_landmark_group() {
        let collection = ParameterCollection::from_yaml(
            "landmark:\n  minimum_number_of_forced_updates: 7\n",
        )
        .unwrap();

        assert_eq!(collection.world_map.landmark.minimum_number_of_forced_updates, 7);
    }

    #[test]
    fn test_command_line_flags() {
        let collection = ParameterCollection::from_command_line(&arguments(&[
            "-il",
            "/camera_left/image_raw",
            "-ir",
            "/camera_right/image_raw",
            "-dm",
            "-ol",
            "-rl",
            "dataset_directory",
        ]))
        .unwrap();

        assert_eq!(collection.command_line.topic_image_left, "/camera_left/image_raw");
        assert_eq!(collection.command_line.tracker_mode, TrackerMode::RgbDepth);
        assert!(!collection.command_line.option_use_relocalization);
        assert!(collection.tracking.enable_landmark_recovery);
        assert_eq!(collection.command_line.dataset_file_name, "dataset_directory");
    }

    #[test]
    fn test_missing_topics_are_fatal() {
        let result = ParameterCollection::from_command_line(&arguments(&["dataset"]));
        assert!(matches!(result, Err(SlamError::Configuration(_))));
    }

    #[test]
    fn test_help_is_requested() {
        let result = ParameterCollection::from_command_line(&arguments(&["-h"]));
        assert!(matches!(result, Err(SlamError::HelpRequested)));
    }
}
