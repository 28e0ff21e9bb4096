//! Frame-to-frame tracker: motion prediction, correspondence search,
//! iterative pose refinement and landmark lifecycle.

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use opencv::core::Mat;
use opencv::prelude::*;
use tracing::{debug, info, warn};

use crate::config::TrackingParameters;
use crate::error::Result;
use crate::framepoint_generation::{descriptor_distance, FramepointGeneration};
use crate::geometry::{Camera, SE3};
use crate::map::{FrameId, FramePoint, FramePointRef, FrameStatus, LandmarkId, WorldMap};

use super::aligner::{self, AlignmentCorrespondence};
use super::motion_model::MotionModel;

/// Tracker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    /// Accumulating tracks; pose follows the prediction.
    Localizing,
    /// Pose refined against the landmark map each frame.
    Tracking,
    /// Tracking failed on this frame; a new track was started.
    BrokenTrack,
}

/// Per-frame tracking report.
#[derive(Debug, Clone)]
pub struct TrackerOutput {
    pub frame: FrameId,
    pub status: TrackerStatus,
    pub robot_to_world: SE3,
    pub number_of_points: usize,
    pub number_of_tracked_points: usize,
    pub number_of_tracked_landmarks: usize,
    pub number_of_created_landmarks: usize,
    pub number_of_recovered_landmarks: usize,
    pub number_of_inliers: usize,
    pub inlier_ratio: f64,
}

/// A planned current-to-previous correspondence.
struct TrackMatch {
    previous: FramePointRef,
    current_index: usize,
    previous_track_length: usize,
    landmark: Option<LandmarkId>,
}

/// Snapshot of one previous-frame point used during matching.
struct PreviousPoint {
    reference: FramePointRef,
    world_coordinates: Vector3<f64>,
    descriptor: Mat,
    landmark: Option<LandmarkId>,
    track_length: usize,
}

pub struct Tracker {
    parameters: TrackingParameters,
    camera: Camera,
    generator: Box<dyn FramepointGeneration>,
    motion_model: MotionModel,
    use_odometry: bool,
    status: TrackerStatus,
    /// Adaptive pixel radius of the projection search region.
    threshold_distance_tracking_pixels: f64,
}

impl Tracker {
    pub fn new(
        parameters: TrackingParameters,
        camera: Camera,
        generator: Box<dyn FramepointGeneration>,
        use_odometry: bool,
    ) -> Self {
        Self {
            threshold_distance_tracking_pixels: parameters
                .maximum_threshold_distance_tracking_pixels,
            parameters,
            camera,
            generator,
            motion_model: MotionModel::new(),
            use_odometry,
            status: TrackerStatus::Localizing,
        }
    }

    pub fn status(&self) -> TrackerStatus {
        self.status
    }

    /// Process one acquisition: create the frame, establish correspondences
    /// to the previous frame, refine the pose and advance landmarks.
    pub fn process(
        &mut self,
        world_map: &mut WorldMap,
        left: &Mat,
        right_or_depth: &Mat,
        timestamp_seconds: f64,
        odometry_delta: Option<&SE3>,
    ) -> Result<TrackerOutput> {
        // Motion prediction: external odometry or constant velocity.
        let predicted = if self.use_odometry {
            odometry_delta.and_then(|delta| self.motion_model.predict_with_odometry(delta))
        } else {
            self.motion_model.predict()
        }
        .unwrap_or_else(|| world_map.robot_to_world().clone());

        let previous_frame = world_map.current_frame_id();
        let frame_id = world_map.create_frame(predicted.clone(), timestamp_seconds, self.camera);

        // Generate framepoints and store the acquisition on the frame.
        let generated = self.generator.generate(left, right_or_depth, &self.camera)?;
        let points = self.bin_points(generated.points);
        let number_of_points = points.len();
        if let Some(frame) = world_map.frame_mut(frame_id) {
            frame.intensity_image_left = left.clone();
            frame.intensity_image_right = right_or_depth.clone();
            frame.keypoints_left = generated.keypoints_left;
            frame.keypoints_right = generated.keypoints_right;
            frame.descriptors_left = generated.descriptors_left;
            frame.descriptors_right = generated.descriptors_right;
            frame.set_points(points);
        }
        if number_of_points == 0 {
            warn!(frame = %frame_id, "no framepoints generated");
        }

        let mut output = TrackerOutput {
            frame: frame_id,
            status: self.status,
            robot_to_world: predicted.clone(),
            number_of_points,
            number_of_tracked_points: 0,
            number_of_tracked_landmarks: 0,
            number_of_created_landmarks: 0,
            number_of_recovered_landmarks: 0,
            number_of_inliers: 0,
            inlier_ratio: 0.0,
        };

        let Some(previous_frame) = previous_frame else {
            // First frame of a track.
            self.status = TrackerStatus::Localizing;
            output.status = self.status;
            world_map.set_robot_to_world(predicted.clone());
            self.motion_model.update(&predicted);
            return Ok(output);
        };

        // Current-to-previous correspondence search around the predicted
        // projections.
        let previous_points = self.snapshot_points(world_map, previous_frame);
        let mut claimed: HashSet<usize> = HashSet::new();
        let matches = self.match_points(
            world_map,
            frame_id,
            &previous_points,
            &predicted,
            self.threshold_distance_tracking_pixels,
            &mut claimed,
        )?;
        output.number_of_tracked_points = matches.len();
        self.apply_matches(world_map, frame_id, &matches);

        let landmark_matches: Vec<&TrackMatch> =
            matches.iter().filter(|m| m.landmark.is_some()).collect();
        output.number_of_tracked_landmarks = landmark_matches.len();

        match self.status {
            TrackerStatus::Localizing | TrackerStatus::BrokenTrack => {
                // Pose follows the prediction until enough landmarks exist.
                world_map.set_robot_to_world(predicted.clone());
                self.motion_model.update(&predicted);
                output.number_of_created_landmarks = self.create_landmarks(world_map, frame_id);
                self.update_tracked_cache(world_map, frame_id);

                if world_map
                    .frame(frame_id)
                    .map(|frame| frame.count_points(1, Some(true)))
                    .unwrap_or(0)
                    >= self.parameters.minimum_number_of_landmarks_to_track
                {
                    debug!(frame = %frame_id, "gathered enough landmarks, tracking");
                    self.status = TrackerStatus::Tracking;
                }
                output.status = TrackerStatus::Localizing;
            }
            TrackerStatus::Tracking => {
                if landmark_matches.len() < self.parameters.minimum_number_of_landmarks_to_track {
                    self.handle_track_break(world_map, frame_id, &mut output);
                    return Ok(output);
                }

                // Iterative alignment over the landmark correspondences.
                let correspondences =
                    self.build_correspondences(world_map, frame_id, &landmark_matches);
                let alignment = aligner::align(
                    &self.parameters.aligner,
                    &self.camera,
                    &predicted.inverse(),
                    &correspondences,
                );

                if !alignment.has_succeeded(&self.parameters.aligner) {
                    self.handle_track_break(world_map, frame_id, &mut output);
                    return Ok(output);
                }

                let robot_to_world = alignment.world_to_camera.inverse();
                if let Some(frame) = world_map.frame_mut(frame_id) {
                    frame.set_robot_to_world(robot_to_world.clone());
                    frame.status = FrameStatus::Tracking;
                }
                world_map.set_robot_to_world(robot_to_world.clone());
                self.motion_model.update(&robot_to_world);

                output.robot_to_world = robot_to_world;
                output.number_of_inliers = alignment.number_of_inliers;
                output.inlier_ratio = alignment.inlier_ratio;
                output.status = TrackerStatus::Tracking;

                // Successful tracking: tighten the search region and the
                // descriptor gate.
                self.threshold_distance_tracking_pixels = (self
                    .threshold_distance_tracking_pixels
                    - 1.0)
                    .max(self.parameters.minimum_threshold_distance_tracking_pixels);
                self.generator.adapt_matching_distance(
                    alignment.inlier_ratio,
                    self.parameters.aligner.minimum_inlier_ratio,
                );

                self.update_landmarks(world_map, frame_id, &landmark_matches, &alignment.inlier_mask);
                output.number_of_created_landmarks = self.create_landmarks(world_map, frame_id);

                if self.parameters.enable_landmark_recovery
                    && self.generator.supports_landmark_recovery()
                {
                    output.number_of_recovered_landmarks = self.recover_landmarks(
                        world_map,
                        frame_id,
                        &previous_points,
                        &matches,
                        &mut claimed,
                    )?;
                }

                self.update_tracked_cache(world_map, frame_id);
                if world_map.currently_tracked_landmarks().len()
                    < self.parameters.minimum_number_of_landmarks_to_track
                {
                    self.handle_track_break(world_map, frame_id, &mut output);
                    return Ok(output);
                }
            }
        }

        Ok(output)
    }

    /// Enforce an even keypoint distribution over the image.
    ///
    /// The image is tiled into `bin_size_pixels` cells; when the detection
    /// exceeds `ratio_keypoints_to_bins` points per cell, only the strongest
    /// response per cell survives.
    fn bin_points(&self, points: Vec<FramePoint>) -> Vec<FramePoint> {
        let bin_size = self.parameters.bin_size_pixels;
        if bin_size == 0 {
            return points;
        }
        let columns = (self.camera.width as usize / bin_size).max(1);
        let rows = (self.camera.height as usize / bin_size).max(1);
        let budget =
            (self.parameters.ratio_keypoints_to_bins * (columns * rows) as f64).ceil() as usize;
        if points.len() <= budget {
            return points;
        }

        let mut best_per_bin: Vec<Option<usize>> = vec![None; columns * rows];
        for (index, point) in points.iter().enumerate() {
            let (u, v) = point.image_coordinates();
            let column = ((u as usize) / bin_size).min(columns - 1);
            let row = ((v as usize) / bin_size).min(rows - 1);
            let bin = row * columns + column;
            let better = match best_per_bin[bin] {
                None => true,
                Some(existing) => {
                    point.keypoint_left.response() > points[existing].keypoint_left.response()
                }
            };
            if better {
                best_per_bin[bin] = Some(index);
            }
        }

        let selected: HashSet<usize> = best_per_bin.into_iter().flatten().collect();
        points
            .into_iter()
            .enumerate()
            .filter(|(index, _)| selected.contains(index))
            .map(|(_, point)| point)
            .collect()
    }

    /// Collect the previous frame's points with the world coordinates used
    /// for projection: the landmark position where one exists, the frame's
    /// own triangulation otherwise.
    fn snapshot_points(&self, world_map: &WorldMap, frame_id: FrameId) -> Vec<PreviousPoint> {
        let Some(frame) = world_map.frame(frame_id) else {
            return Vec::new();
        };
        frame
            .points()
            .iter()
            .enumerate()
            .map(|(index, point)| {
                let landmark = point
                    .landmark
                    .filter(|id| world_map.landmark(*id).map_or(false, |l| l.is_valid()));
                let world_coordinates = match landmark.and_then(|id| world_map.landmark(id)) {
                    Some(landmark) => landmark.world_coordinates,
                    None => frame
                        .robot_to_world()
                        .transform_point(&point.camera_coordinates),
                };
                PreviousPoint {
                    reference: FramePointRef {
                        frame: frame_id,
                        index,
                    },
                    world_coordinates,
                    descriptor: point.descriptor_left.clone(),
                    landmark,
                    track_length: point.track_length,
                }
            })
            .collect()
    }

    /// For each previous point, search the best descriptor match among the
    /// current frame's points inside a bounded region around its predicted
    /// projection.
    fn match_points(
        &self,
        world_map: &WorldMap,
        frame_id: FrameId,
        previous_points: &[PreviousPoint],
        predicted_robot_to_world: &SE3,
        search_radius_pixels: f64,
        claimed: &mut HashSet<usize>,
    ) -> Result<Vec<TrackMatch>> {
        let Some(frame) = world_map.frame(frame_id) else {
            return Ok(Vec::new());
        };
        let world_to_camera = predicted_robot_to_world.inverse();
        let matching_distance = self.generator.matching_distance_tracking();

        let mut matches = Vec::new();
        for previous in previous_points {
            let point_camera = world_to_camera.transform_point(&previous.world_coordinates);
            let Some(projection) = self.camera.project(&point_camera) else {
                continue;
            };
            if !self.camera.is_in_image(projection.x, projection.y, 0.0) {
                continue;
            }

            if let Some((current_index, _distance)) = self.find_best_match(
                frame.points(),
                &previous.descriptor,
                &projection,
                search_radius_pixels,
                matching_distance,
                claimed,
            )? {
                claimed.insert(current_index);
                matches.push(TrackMatch {
                    previous: previous.reference,
                    current_index,
                    previous_track_length: previous.track_length,
                    landmark: previous.landmark,
                });
            }
        }
        Ok(matches)
    }

    fn find_best_match(
        &self,
        current_points: &[FramePoint],
        descriptor: &Mat,
        projection: &Vector2<f64>,
        search_radius_pixels: f64,
        maximum_descriptor_distance: u32,
        claimed: &HashSet<usize>,
    ) -> Result<Option<(usize, u32)>> {
        let mut best: Option<(usize, u32)> = None;
        for (index, point) in current_points.iter().enumerate() {
            if claimed.contains(&index) {
                continue;
            }
            let (u, v) = point.image_coordinates();
            let offset = Vector2::new(u - projection.x, v - projection.y);
            if offset.norm() > search_radius_pixels {
                continue;
            }
            let distance = descriptor_distance(descriptor, 0, &point.descriptor_left, 0)?;
            if distance > maximum_descriptor_distance {
                continue;
            }
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }
        Ok(best)
    }

    fn apply_matches(&self, world_map: &mut WorldMap, frame_id: FrameId, matches: &[TrackMatch]) {
        let Some(frame) = world_map.frame_mut(frame_id) else {
            return;
        };
        for track in matches {
            if let Some(point) = frame.points_mut().get_mut(track.current_index) {
                point.set_previous(track.previous, track.previous_track_length, track.landmark);
            }
        }
    }

    fn build_correspondences(
        &self,
        world_map: &WorldMap,
        frame_id: FrameId,
        landmark_matches: &[&TrackMatch],
    ) -> Vec<AlignmentCorrespondence> {
        let Some(frame) = world_map.frame(frame_id) else {
            return Vec::new();
        };
        landmark_matches
            .iter()
            .filter_map(|track| {
                let landmark = world_map.landmark(track.landmark?)?;
                let point = frame.points().get(track.current_index)?;
                let (u, v) = point.image_coordinates();
                Some(AlignmentCorrespondence {
                    world_coordinates: landmark.world_coordinates,
                    image_coordinates: Vector2::new(u, v),
                    depth_meters: point.depth_meters,
                    is_near: point.is_near,
                })
            })
            .collect()
    }

    /// Integrate the refined observations into the tracked landmarks.
    fn update_landmarks(
        &self,
        world_map: &mut WorldMap,
        frame_id: FrameId,
        landmark_matches: &[&TrackMatch],
        inlier_mask: &[bool],
    ) {
        struct PlannedUpdate {
            landmark: LandmarkId,
            world_measurement: Vector3<f64>,
            depth_meters: f64,
            observation: FramePointRef,
            descriptor: Mat,
        }

        let landmark_parameters = world_map.parameters().landmark;
        let updates: Vec<PlannedUpdate> = {
            let Some(frame) = world_map.frame(frame_id) else {
                return;
            };
            landmark_matches
                .iter()
                .enumerate()
                .filter(|(index, _)| inlier_mask.get(*index).copied().unwrap_or(false))
                .filter_map(|(_, track)| {
                    let landmark = track.landmark?;
                    let point = frame.points().get(track.current_index)?;
                    Some(PlannedUpdate {
                        landmark,
                        world_measurement: frame
                            .robot_to_world()
                            .transform_point(&point.camera_coordinates),
                        depth_meters: point.depth_meters,
                        observation: FramePointRef {
                            frame: frame_id,
                            index: track.current_index,
                        },
                        descriptor: point.descriptor_left.clone(),
                    })
                })
                .collect()
        };

        for update in updates {
            if let Some(landmark) = world_map.landmark_mut(update.landmark) {
                landmark.add_observation(update.observation);
                landmark.descriptor = update.descriptor;
                landmark.update(
                    update.world_measurement,
                    update.depth_meters,
                    &landmark_parameters,
                );
            }
        }
    }

    /// Promote matured tracks to landmarks.
    fn create_landmarks(&self, world_map: &mut WorldMap, frame_id: FrameId) -> usize {
        let candidates: Vec<usize> = match world_map.frame(frame_id) {
            Some(frame) => frame
                .points()
                .iter()
                .enumerate()
                .filter(|(_, point)| {
                    point.landmark.is_none()
                        && point.is_near
                        && point.track_length
                            >= self.parameters.minimum_track_length_for_landmark_creation
                })
                .map(|(index, _)| index)
                .collect(),
            None => return 0,
        };

        let mut created = 0;
        for index in candidates {
            if world_map
                .create_landmark(FramePointRef {
                    frame: frame_id,
                    index,
                })
                .is_some()
            {
                created += 1;
            }
        }
        created
    }

    /// Second-chance search for landmarks that went unmatched: with the
    /// refined pose the projections are more accurate than at matching time.
    fn recover_landmarks(
        &self,
        world_map: &mut WorldMap,
        frame_id: FrameId,
        previous_points: &[PreviousPoint],
        matches: &[TrackMatch],
        claimed: &mut HashSet<usize>,
    ) -> Result<usize> {
        let matched_previous: HashSet<FramePointRef> =
            matches.iter().map(|track| track.previous).collect();
        let robot_to_world = match world_map.frame(frame_id) {
            Some(frame) => frame.robot_to_world().clone(),
            None => return Ok(0),
        };
        let world_to_camera = robot_to_world.inverse();

        let mut planned: Vec<TrackMatch> = Vec::new();
        {
            let Some(frame) = world_map.frame(frame_id) else {
                return Ok(0);
            };
            for previous in previous_points {
                let Some(landmark_id) = previous.landmark else {
                    continue;
                };
                if matched_previous.contains(&previous.reference) {
                    continue;
                }
                let Some(landmark) = world_map.landmark(landmark_id) else {
                    continue;
                };
                if !landmark.is_valid()
                    || landmark.number_of_recoveries
                        >= self.parameters.maximum_number_of_landmark_recoveries
                {
                    continue;
                }

                let point_camera = world_to_camera.transform_point(&landmark.world_coordinates);
                let Some(projection) = self.camera.project(&point_camera) else {
                    continue;
                };
                if !self.camera.is_in_image(projection.x, projection.y, 0.0) {
                    continue;
                }

                if let Some((current_index, _distance)) = self.find_best_match(
                    frame.points(),
                    &previous.descriptor,
                    &projection,
                    self.parameters.maximum_threshold_distance_tracking_pixels,
                    self.generator.matching_distance_tracking(),
                    claimed,
                )? {
                    claimed.insert(current_index);
                    planned.push(TrackMatch {
                        previous: previous.reference,
                        current_index,
                        previous_track_length: previous.track_length,
                        landmark: Some(landmark_id),
                    });
                }
            }
        }

        self.apply_matches(world_map, frame_id, &planned);
        for track in &planned {
            let Some(landmark_id) = track.landmark else {
                continue;
            };
            if let Some(landmark) = world_map.landmark_mut(landmark_id) {
                landmark.number_of_recoveries += 1;
                landmark.add_observation(FramePointRef {
                    frame: frame_id,
                    index: track.current_index,
                });
            }
        }
        Ok(planned.len())
    }

    /// Refresh the world map's tracked-landmark cache from the frame.
    fn update_tracked_cache(&self, world_map: &mut WorldMap, frame_id: FrameId) {
        let tracked: Vec<LandmarkId> = world_map
            .frame(frame_id)
            .map(|frame| {
                frame
                    .points()
                    .iter()
                    .filter_map(|point| point.landmark)
                    .filter(|id| world_map.landmark(*id).map_or(false, |l| l.is_valid()))
                    .collect()
            })
            .unwrap_or_default();
        world_map.set_currently_tracked_landmarks(tracked);
    }

    fn handle_track_break(
        &mut self,
        world_map: &mut WorldMap,
        frame_id: FrameId,
        output: &mut TrackerOutput,
    ) {
        info!(frame = %frame_id, "tracking failed, breaking track");
        world_map.break_track(frame_id);
        self.status = TrackerStatus::Localizing;
        self.motion_model.reset();
        self.threshold_distance_tracking_pixels =
            self.parameters.maximum_threshold_distance_tracking_pixels;
        output.status = TrackerStatus::BrokenTrack;
    }
}
