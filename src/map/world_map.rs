//! WorldMap - owner of all frames, landmarks and local maps.
//!
//! All entities live in identifier-keyed tables owned here; identifier
//! counters are scoped to the WorldMap so independent maps can coexist.
//! Cross-references are typed identifiers, never shared pointers, which
//! makes reclamation on track break and landmark merge straightforward.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::WorldMapParameters;
use crate::error::Result;
use crate::geometry::{Camera, SE3};
use crate::io::trajectory;

use super::frame::Frame;
use super::landmark::Landmark;
use super::local_map::{LandmarkCorrespondence, LocalMap, LocalMapLandmark};
use super::types::{FrameId, FramePointRef, LandmarkId, LocalMapId};

pub struct WorldMap {
    parameters: WorldMapParameters,

    frames: HashMap<FrameId, Frame>,
    landmarks: HashMap<LandmarkId, Landmark>,
    local_maps: HashMap<LocalMapId, LocalMap>,
    /// Local maps in creation order.
    local_map_order: Vec<LocalMapId>,

    next_frame_id: u64,
    next_landmark_id: u64,
    next_local_map_id: u64,

    current_frame: Option<FrameId>,
    previous_frame: Option<FrameId>,
    root_frame: Option<FrameId>,
    current_local_map: Option<LocalMapId>,
    root_local_map: Option<LocalMapId>,

    /// Frames accumulated for the next local map.
    frame_window: Vec<FrameId>,
    distance_traveled_window: f64,
    degrees_rotated_window: f64,

    /// Landmarks seen by the tracker in the current frame.
    currently_tracked_landmarks: Vec<LandmarkId>,

    last_frame_before_track_break: Option<FrameId>,
    last_local_map_before_track_break: Option<LocalMapId>,

    relocalized: bool,
    number_of_closures: usize,
    number_of_merged_landmarks: usize,

    /// Current pose estimate head.
    robot_to_world: SE3,
}

impl WorldMap {
    pub fn new(parameters: WorldMapParameters) -> Self {
        Self {
            parameters,
            frames: HashMap::new(),
            landmarks: HashMap::new(),
            local_maps: HashMap::new(),
            local_map_order: Vec::new(),
            next_frame_id: 0,
            next_landmark_id: 0,
            next_local_map_id: 0,
            current_frame: None,
            previous_frame: None,
            root_frame: None,
            current_local_map: None,
            root_local_map: None,
            frame_window: Vec::new(),
            distance_traveled_window: 0.0,
            degrees_rotated_window: 0.0,
            currently_tracked_landmarks: Vec::new(),
            last_frame_before_track_break: None,
            last_local_map_before_track_break: None,
            relocalized: false,
            number_of_closures: 0,
            number_of_merged_landmarks: 0,
            robot_to_world: SE3::identity(),
        }
    }

    pub fn parameters(&self) -> &WorldMapParameters {
        &self.parameters
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frames
    // ─────────────────────────────────────────────────────────────────────

    /// Allocate a new frame, link it to its predecessor and enqueue it for
    /// the pending local-map window.
    pub fn create_frame(
        &mut self,
        robot_to_world: SE3,
        timestamp_seconds: f64,
        camera: Camera,
    ) -> FrameId {
        let id = FrameId::new(self.next_frame_id);
        self.next_frame_id += 1;

        let mut frame = Frame::new(id, robot_to_world, timestamp_seconds, camera);

        self.previous_frame = self.current_frame;
        if let Some(previous_id) = self.previous_frame {
            if let Some(previous) = self.frames.get_mut(&previous_id) {
                previous.next = Some(id);
                frame.previous = Some(previous_id);
                frame.set_root(previous.root());
            }
        } else {
            // New root frame: begins a track.
            self.root_frame = Some(id);
        }

        self.frames.insert(id, frame);
        self.frame_window.push(id);
        self.current_frame = Some(id);
        id
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(&id)
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame_id(&self) -> Option<FrameId> {
        self.current_frame
    }

    pub fn previous_frame_id(&self) -> Option<FrameId> {
        self.previous_frame
    }

    pub fn root_frame_id(&self) -> Option<FrameId> {
        self.root_frame
    }

    /// Frame identifiers in ascending creation order.
    pub fn frame_ids_ordered(&self) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = self.frames.keys().copied().collect();
        ids.sort();
        ids
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmarks
    // ─────────────────────────────────────────────────────────────────────

    /// Promote a FramePoint track to a landmark. The origin point receives
    /// the landmark link; the position is the origin's world coordinate.
    pub fn create_landmark(&mut self, origin: FramePointRef) -> Option<LandmarkId> {
        let frame = self.frames.get(&origin.frame)?;
        let point = frame.points().get(origin.index)?;
        let world_coordinates = frame
            .robot_to_world()
            .transform_point(&point.camera_coordinates);
        let descriptor = point.descriptor_left.clone();

        let id = LandmarkId::new(self.next_landmark_id);
        self.next_landmark_id += 1;
        self.landmarks
            .insert(id, Landmark::new(id, world_coordinates, descriptor, origin));

        if let Some(frame) = self.frames.get_mut(&origin.frame) {
            if let Some(point) = frame.points_mut().get_mut(origin.index) {
                point.landmark = Some(id);
            }
        }
        Some(id)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn currently_tracked_landmarks(&self) -> &[LandmarkId] {
        &self.currently_tracked_landmarks
    }

    pub fn set_currently_tracked_landmarks(&mut self, landmarks: Vec<LandmarkId>) {
        self.currently_tracked_landmarks = landmarks;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local maps
    // ─────────────────────────────────────────────────────────────────────

    pub fn local_map(&self, id: LocalMapId) -> Option<&LocalMap> {
        self.local_maps.get(&id)
    }

    pub fn local_map_mut(&mut self, id: LocalMapId) -> Option<&mut LocalMap> {
        self.local_maps.get_mut(&id)
    }

    pub fn local_maps_in_order(&self) -> &[LocalMapId] {
        &self.local_map_order
    }

    pub fn num_local_maps(&self) -> usize {
        self.local_maps.len()
    }

    pub fn current_local_map_id(&self) -> Option<LocalMapId> {
        self.current_local_map
    }

    pub fn relocalized(&self) -> bool {
        self.relocalized
    }

    pub fn number_of_closures(&self) -> usize {
        self.number_of_closures
    }

    pub fn number_of_merged_landmarks(&self) -> usize {
        self.number_of_merged_landmarks
    }

    pub fn robot_to_world(&self) -> &SE3 {
        &self.robot_to_world
    }

    pub fn set_robot_to_world(&mut self, robot_to_world: SE3) {
        self.robot_to_world = robot_to_world;
    }

    /// Close the pending window into a local map if the motion or window
    /// size justifies one.
    ///
    /// Returns true when a local map was created. With `drop_framepoints`
    /// all frames of the closed window except the last two release their
    /// FramePoints: the newest is needed for the next tracking step, the
    /// penultimate for flow visualization.
    pub fn try_create_local_map(&mut self, drop_framepoints: bool) -> bool {
        let (Some(previous_id), Some(current_id)) = (self.previous_frame, self.current_frame)
        else {
            return false;
        };

        self.relocalized = false;

        // Accumulate inter-frame motion over the window.
        if let (Some(previous), Some(current)) =
            (self.frames.get(&previous_id), self.frames.get(&current_id))
        {
            let last_to_current = previous.world_to_robot().compose(current.robot_to_world());
            self.distance_traveled_window += last_to_current.translation.norm();
            self.degrees_rotated_window += last_to_current.angle().to_degrees();
        }

        let window_size = self.frame_window.len();
        let rotated =
            self.degrees_rotated_window > self.parameters.minimum_degrees_rotated_for_local_map;
        let traveled = self.distance_traveled_window
            > self.parameters.minimum_distance_traveled_for_local_map
            && window_size > self.parameters.minimum_number_of_frames_for_local_map;
        let bootstrap = window_size > self.parameters.minimum_number_of_frames_for_local_map
            && self.local_maps.len() < 5;

        if !(rotated || traveled || bootstrap) {
            return false;
        }

        self.create_local_map_from_window(current_id);
        self.reset_window_for_local_map_creation(drop_framepoints);
        true
    }

    fn create_local_map_from_window(&mut self, anchor_id: FrameId) {
        let id = LocalMapId::new(self.next_local_map_id);
        self.next_local_map_id += 1;

        let (local_map_to_world, world_to_local_map) = {
            let anchor = &self.frames[&anchor_id];
            (
                anchor.robot_to_world().clone(),
                anchor.world_to_robot().clone(),
            )
        };

        // Collect landmarks observed in the window, expressed in local-map
        // coordinates, gathering every appearance descriptor of the window.
        let mut entry_index: HashMap<LandmarkId, usize> = HashMap::new();
        let mut entries: Vec<LocalMapLandmark> = Vec::new();
        for frame_id in &self.frame_window {
            let Some(frame) = self.frames.get(frame_id) else {
                continue;
            };
            for point in frame.points() {
                let Some(landmark_id) = point.landmark else {
                    continue;
                };
                if let Some(&index) = entry_index.get(&landmark_id) {
                    entries[index].appearances.push(point.descriptor_left.clone());
                    continue;
                }
                let Some(landmark) = self.landmarks.get(&landmark_id) else {
                    continue;
                };
                if !landmark.is_valid() {
                    continue;
                }
                entry_index.insert(landmark_id, entries.len());
                entries.push(LocalMapLandmark {
                    landmark: landmark_id,
                    coordinates_in_local_map: world_to_local_map
                        .transform_point(&landmark.world_coordinates),
                    appearances: vec![point.descriptor_left.clone()],
                });
            }
        }
        for entry in &entries {
            if let Some(landmark) = self.landmarks.get_mut(&entry.landmark) {
                landmark.local_maps.insert(id);
            }
        }

        // Assign membership and relative transforms; the anchor becomes the
        // keyframe of the new local map.
        for frame_id in &self.frame_window {
            if let Some(frame) = self.frames.get_mut(frame_id) {
                frame.local_map = Some(id);
                let frame_to_local_map = world_to_local_map.compose(frame.robot_to_world());
                frame.set_frame_to_local_map(frame_to_local_map);
            }
        }
        if let Some(anchor) = self.frames.get_mut(&anchor_id) {
            anchor.set_is_keyframe(true);
        }

        let local_map = LocalMap::new(
            id,
            anchor_id,
            self.frame_window.clone(),
            entries,
            local_map_to_world,
            self.root_local_map,
            self.current_local_map,
        );
        if let Some(previous_id) = self.current_local_map {
            if let Some(previous) = self.local_maps.get_mut(&previous_id) {
                previous.next = Some(id);
            }
        }
        self.local_maps.insert(id, local_map);
        self.local_map_order.push(id);
        self.current_local_map = Some(id);

        if self.root_local_map.is_none() {
            self.root_local_map = Some(id);
        }

        debug!(local_map = %id, keyframe = %anchor_id, "created local map");
    }

    fn reset_window_for_local_map_creation(&mut self, drop_framepoints: bool) {
        self.distance_traveled_window = 0.0;
        self.degrees_rotated_window = 0.0;

        if drop_framepoints {
            // The newest frame is needed for the next tracking step, the
            // penultimate for flow visualization; everything older goes.
            let retained = self.frame_window.len().saturating_sub(2);
            for frame_id in self.frame_window.iter().take(retained) {
                if let Some(frame) = self.frames.get_mut(frame_id) {
                    frame.release_points();
                }
            }
        }
        self.frame_window.clear();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loop closures and track management
    // ─────────────────────────────────────────────────────────────────────

    /// Record a loop-closure constraint on the query local map. If the
    /// current track's root differs from the global one the closure also
    /// stitches the broken track.
    pub fn add_loop_closure(
        &mut self,
        query: LocalMapId,
        reference: LocalMapId,
        query_to_reference: SE3,
        correspondences: Vec<LandmarkCorrespondence>,
        information: f64,
    ) {
        let first_root = self
            .frame_ids_ordered()
            .first()
            .and_then(|id| self.frames.get(id))
            .map(|frame| frame.root());
        let current_root = self
            .current_frame
            .and_then(|id| self.frames.get(&id))
            .map(|frame| frame.root());
        if let (Some(first_root), Some(current_root), Some(current_id)) =
            (first_root, current_root, self.current_frame)
        {
            if first_root != current_root {
                self.set_track(current_id);
            }
        }

        if let Some(local_map) = self.local_maps.get_mut(&query) {
            local_map.add_correspondence(
                reference,
                query_to_reference,
                correspondences,
                information,
            );
        }
        self.relocalized = true;
        self.number_of_closures += 1;
    }

    /// Abandon the current track at the given frame: the frame becomes the
    /// root of a new track and the pre-break head is saved for stitching.
    pub fn break_track(&mut self, frame_id: FrameId) {
        if self.last_frame_before_track_break.is_none() {
            self.last_frame_before_track_break = self.previous_frame;
            self.last_local_map_before_track_break = self.current_local_map;
        }

        if let Some(frame) = self.frames.get_mut(&frame_id) {
            frame.break_track();
            self.robot_to_world = frame.robot_to_world().clone();
        }

        self.previous_frame = None;
        self.root_frame = Some(frame_id);
        self.root_local_map = None;
        self.currently_tracked_landmarks.clear();
        self.reset_window_for_local_map_creation(false);
    }

    /// Stitch a relocalized frame onto the track that broke.
    ///
    /// A no-op unless a break is pending, which also makes a second call for
    /// the same stitch idempotent.
    pub fn set_track(&mut self, frame_id: FrameId) {
        let (Some(last_frame_id), Some(last_local_map_id)) = (
            self.last_frame_before_track_break,
            self.last_local_map_before_track_break,
        ) else {
            return;
        };
        let Some(frame_local_map_id) = self.frames.get(&frame_id).and_then(|f| f.local_map)
        else {
            warn!(frame = %frame_id, "set_track on a frame without local map");
            return;
        };

        info!(
            last_frame = %last_frame_id,
            last_local_map = %last_local_map_id,
            frame = %frame_id,
            local_map = %frame_local_map_id,
            "relocalized, reconnecting track"
        );

        // Return to the original roots.
        let root_frame = self
            .frames
            .get(&last_frame_id)
            .map(|frame| frame.root())
            .unwrap_or(last_frame_id);
        self.root_frame = Some(root_frame);
        if let Some(frame) = self.frames.get_mut(&frame_id) {
            frame.set_root(root_frame);
        }
        let root_local_map = self
            .local_maps
            .get(&last_local_map_id)
            .map(|local_map| local_map.root())
            .unwrap_or(last_local_map_id);
        self.root_local_map = Some(root_local_map);
        if let Some(local_map) = self.local_maps.get_mut(&frame_local_map_id) {
            local_map.set_root(root_local_map);
        }

        // Connect the relocalized frame to the last one before the break.
        if let Some(last_frame) = self.frames.get_mut(&last_frame_id) {
            last_frame.next = Some(frame_id);
        }
        if let Some(frame) = self.frames.get_mut(&frame_id) {
            frame.previous = Some(last_frame_id);
        }
        if let Some(last_local_map) = self.local_maps.get_mut(&last_local_map_id) {
            last_local_map.next = Some(frame_local_map_id);
        }
        if let Some(local_map) = self.local_maps.get_mut(&frame_local_map_id) {
            local_map.previous = Some(last_local_map_id);
        }

        self.last_frame_before_track_break = None;
        self.last_local_map_before_track_break = None;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmark merging
    // ─────────────────────────────────────────────────────────────────────

    /// Merge corresponding landmarks across the given closure batches.
    ///
    /// Pairs are normalized to merge the newer landmark into the older one.
    /// Per query only the correspondence with the highest matching count
    /// survives filtering; repeated references are routed through the
    /// redirection map built up by earlier merges in the same batch. Pairs
    /// whose landmarks share a local map are skipped: such collisions need
    /// in-place treatment within the local map.
    pub fn merge_landmarks(&mut self, closures: &[Vec<LandmarkCorrespondence>]) {
        // Determine the merge configuration across all closures.
        let mut queries_to_references: BTreeMap<LandmarkId, (LandmarkId, usize)> = BTreeMap::new();
        let mut references_to_queries: BTreeMap<LandmarkId, (LandmarkId, usize)> = BTreeMap::new();

        for correspondences in closures {
            for correspondence in correspondences {
                let mut query = correspondence.query;
                let mut reference = correspondence.reference;
                // Always merge the newer landmark into the older one.
                if query < reference {
                    std::mem::swap(&mut query, &mut reference);
                }
                if !correspondence.is_inlier || query == reference {
                    continue;
                }
                let count = correspondence.matching_count;

                match queries_to_references.get(&query).copied() {
                    None => {
                        queries_to_references.insert(query, (reference, count));
                        match references_to_queries.get(&reference).copied() {
                            Some((previous_query, previous_count)) if count > previous_count => {
                                // The stronger query claims the reference.
                                queries_to_references.remove(&previous_query);
                                references_to_queries.insert(reference, (query, count));
                            }
                            Some(_) => {}
                            None => {
                                references_to_queries.insert(reference, (query, count));
                            }
                        }
                    }
                    Some((previous_reference, previous_count)) if count > previous_count => {
                        references_to_queries.remove(&previous_reference);
                        queries_to_references.insert(query, (reference, count));
                        references_to_queries.insert(reference, (query, count));
                    }
                    Some(_) => {}
                }
            }
        }

        // Absorbing landmark per merged identifier, for chained merges.
        let mut merged: BTreeMap<LandmarkId, LandmarkId> = BTreeMap::new();

        for (&query_id, &(reference_id, _count)) in &queries_to_references {
            if !self.landmarks.contains_key(&query_id) {
                warn!(landmark = %query_id, "already merged landmark");
                continue;
            }

            // Route to the absorbing landmark if the reference was itself a
            // query earlier in this batch.
            let reference_id = if self.landmarks.contains_key(&reference_id) {
                reference_id
            } else if let Some(&absorbing) = merged.get(&reference_id) {
                absorbing
            } else {
                warn!(landmark = %reference_id, "missing reference landmark");
                continue;
            };
            if query_id == reference_id {
                continue;
            }

            // A shared local map would create intra-local-map collisions.
            let shared_local_map = {
                let query = &self.landmarks[&query_id];
                let reference = &self.landmarks[&reference_id];
                query
                    .local_maps
                    .intersection(&reference.local_maps)
                    .next()
                    .is_some()
            };
            if shared_local_map {
                continue;
            }

            // Redirect the tracked-landmark cache.
            for tracked in &mut self.currently_tracked_landmarks {
                if *tracked == query_id || *tracked == reference_id {
                    *tracked = reference_id;
                }
            }

            let Some(query_landmark) = self.landmarks.remove(&query_id) else {
                continue;
            };

            // No FramePoint may keep referencing the absorbed landmark.
            for observation in &query_landmark.observations {
                if let Some(frame) = self.frames.get_mut(&observation.frame) {
                    if let Some(point) = frame.points_mut().get_mut(observation.index) {
                        if point.landmark == Some(query_id) {
                            point.landmark = Some(reference_id);
                        }
                    }
                }
            }
            // Keep local-map landmark entries resolvable.
            for local_map_id in &query_landmark.local_maps {
                if let Some(local_map) = self.local_maps.get_mut(local_map_id) {
                    for entry in &mut local_map.landmarks {
                        if entry.landmark == query_id {
                            entry.landmark = reference_id;
                        }
                    }
                }
            }

            if let Some(reference_landmark) = self.landmarks.get_mut(&reference_id) {
                reference_landmark.merge(query_landmark);
            }
            merged.insert(query_id, reference_id);
        }

        debug!(merged = merged.len(), "merged landmarks");
        self.number_of_merged_landmarks += merged.len();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Trajectory output
    // ─────────────────────────────────────────────────────────────────────

    pub fn write_trajectory_kitti(&self, path: &Path) -> Result<()> {
        let poses: Vec<SE3> = self
            .frame_ids_ordered()
            .iter()
            .map(|id| self.frames[id].robot_to_world().clone())
            .collect();
        trajectory::write_kitti(path, &poses)?;
        info!(path = %path.display(), "saved trajectory (KITTI format)");
        Ok(())
    }

    pub fn write_trajectory_tum(&self, path: &Path) -> Result<()> {
        let stamped: Vec<(f64, SE3)> = self
            .frame_ids_ordered()
            .iter()
            .map(|id| {
                let frame = &self.frames[id];
                (frame.timestamp_seconds, frame.robot_to_world().clone())
            })
            .collect();
        trajectory::write_tum(path, &stamped)?;
        info!(path = %path.display(), "saved trajectory (TUM format)");
        Ok(())
    }

    /// Drop all contents, retaining parameters.
    pub fn clear(&mut self) {
        info!(
            frames = self.frames.len(),
            landmarks = self.landmarks.len(),
            local_maps = self.local_maps.len(),
            "clearing world map"
        );
        self.frames.clear();
        self.landmarks.clear();
        self.local_maps.clear();
        self.local_map_order.clear();
        self.frame_window.clear();
        self.currently_tracked_landmarks.clear();
        self.current_frame = None;
        self.previous_frame = None;
        self.root_frame = None;
        self.current_local_map = None;
        self.root_local_map = None;
        self.last_frame_before_track_break = None;
        self.last_local_map_before_track_break = None;
        self.distance_traveled_window = 0.0;
        self.degrees_rotated_window = 0.0;
        self.relocalized = false;
    }
}

impl std::fmt::Debug for WorldMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldMap")
            .field("frames", &self.frames.len())
            .field("landmarks", &self.landmarks.len())
            .field("local_maps", &self.local_maps.len())
            .field("number_of_closures", &self.number_of_closures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LandmarkParameters;
    use crate::map::frame_point::FramePoint;
    use nalgebra::Vector3;
    use opencv::core::{KeyPoint, Mat};

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

    fn test_parameters(minimum_frames: usize) -> WorldMapParameters {
        WorldMapParameters {
            minimum_distance_traveled_for_local_map: 0.5,
            minimum_degrees_rotated_for_local_map: 30.0,
            minimum_number_of_frames_for_local_map: minimum_frames,
            landmark: LandmarkParameters::default(),
            local_map: Default::default(),
        }
    }

    fn test_point(camera_coordinates: Vector3<f64>) -> FramePoint {
        FramePoint::new(
            KeyPoint::default().unwrap(),
            None,
            Mat::default(),
            None,
            camera_coordinates,
            true,
        )
    }

    fn pose_at(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    /// Drive `count` frames in a straight line, `step` meters apart.
    fn advance_frames(map: &mut WorldMap, count: usize, step: f64) -> Vec<FrameId> {
        let start = map.num_frames();
        (0..count)
            .map(|i| {
                map.create_frame(
                    pose_at((start + i) as f64 * step),
                    (start + i) as f64 * 0.1,
                    test_camera(),
                )
            })
            .collect()
    }

    #[test]
    fn test_temporal_links_are_consistent() {
        let mut map = WorldMap::new(test_parameters(10));
        let ids = advance_frames(&mut map, 3, 0.1);

        // previous(f).next == f for every linked frame.
        for window in ids.windows(2) {
            assert_eq!(map.frame(window[0]).unwrap().next, Some(window[1]));
            assert_eq!(map.frame(window[1]).unwrap().previous, Some(window[0]));
        }
        assert_eq!(map.frame(ids[0]).unwrap().previous, None);
        assert_eq!(map.frame(ids[0]).unwrap().root(), ids[0]);
        assert_eq!(map.frame(ids[2]).unwrap().root(), ids[0]);
    }

    #[test]
    fn test_frame_identifiers_are_unique_and_monotonic() {
        let mut map = WorldMap::new(test_parameters(10));
        let ids = advance_frames(&mut map, 5, 0.0);

        let mut seen = HashSet::new();
        for id in &ids {
            assert!(seen.insert(*id));
        }
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_two_identical_frames_no_local_map() {
        // Scenario: two sequential identical frames.
        let mut map = WorldMap::new(test_parameters(10));
        advance_frames(&mut map, 2, 0.0);
        map.try_create_local_map(false);

        assert_eq!(map.num_frames(), 2);
        assert_eq!(map.num_local_maps(), 0);
    }

    #[test]
    fn test_local_map_created_by_translation_and_window() {
        // Scenario: 0.5 m over 11 frames with a 10-frame minimum window.
        let mut map = WorldMap::new(test_parameters(10));
        let mut created = false;
        for i in 0..11usize {
            map.create_frame(pose_at(i as f64 * 0.05), i as f64 * 0.1, test_camera());
            if map.try_create_local_map(false) {
                created = true;
            }
        }

        assert!(created);
        assert_eq!(map.num_local_maps(), 1);
        let local_map_id = map.current_local_map_id().unwrap();
        let local_map = map.local_map(local_map_id).unwrap();
        // Anchored at the newest frame of the window.
        assert_eq!(local_map.keyframe, FrameId::new(10));
        assert!(map.frame(FrameId::new(10)).unwrap().is_keyframe());
    }

    #[test]
    fn test_exact_minimum_window_does_not_trigger() {
        // Boundary: exactly minimum_number_of_frames_for_local_map frames,
        // zero motion. The bootstrap clause requires a strictly larger
        // window, so nothing is created.
        let mut map = WorldMap::new(test_parameters(3));
        for i in 0..3usize {
            map.create_frame(SE3::identity(), i as f64, test_camera());
            assert!(!map.try_create_local_map(false));
        }
        assert_eq!(map.num_local_maps(), 0);

        // One more zero-motion frame exceeds the window minimum and the
        // bootstrap clause (< 5 local maps) fires.
        map.create_frame(SE3::identity(), 3.0, test_camera());
        assert!(map.try_create_local_map(false));
        assert_eq!(map.num_local_maps(), 1);
    }

    #[test]
    fn test_local_map_transform_consistency() {
        let mut map = WorldMap::new(test_parameters(2));
        for i in 0..4usize {
            map.create_frame(pose_at(i as f64 * 0.3), i as f64, test_camera());
            map.try_create_local_map(false);
        }
        let local_map_id = map.current_local_map_id().expect("local map created");
        let local_map = map.local_map(local_map_id).unwrap();

        for frame_id in &local_map.frames {
            let frame = map.frame(*frame_id).unwrap();
            let recomposed = local_map
                .local_map_to_world()
                .compose(frame.frame_to_local_map());
            let error = (recomposed.translation - frame.robot_to_world().translation).norm();
            assert!(error < 1e-6);
            assert!(
                (recomposed.rotation.inverse() * frame.robot_to_world().rotation).angle() < 1e-6
            );
        }
    }

    #[test]
    fn test_drop_framepoints_retains_last_two_frames() {
        // Scenario: closed window of 12 frames, the ten oldest release their
        // points, the last two retain them.
        let mut map = WorldMap::new(test_parameters(11));
        let mut ids = Vec::new();
        let mut created = false;
        for i in 0..12usize {
            let id = map.create_frame(pose_at(i as f64 * 0.1), i as f64, test_camera());
            map.frame_mut(id)
                .unwrap()
                .set_points(vec![test_point(Vector3::new(0.0, 0.0, 2.0))]);
            ids.push(id);
            created |= map.try_create_local_map(true);
        }
        assert!(created);

        for id in &ids[..10] {
            assert!(map.frame(*id).unwrap().points().is_empty());
        }
        for id in &ids[10..] {
            assert_eq!(map.frame(*id).unwrap().points().len(), 1);
        }
    }

    #[test]
    fn test_break_track() {
        // Scenario: track lost at frame 5.
        let mut map = WorldMap::new(test_parameters(10));
        let ids = advance_frames(&mut map, 6, 0.1);
        let frame_5 = ids[5];
        let frame_4 = ids[4];

        map.break_track(frame_5);

        let frame = map.frame(frame_5).unwrap();
        assert_eq!(frame.previous, None);
        assert_eq!(frame.root(), frame_5);
        assert_eq!(map.root_frame_id(), Some(frame_5));
        assert_eq!(map.previous_frame_id(), None);
        assert!(map.currently_tracked_landmarks().is_empty());
        // Pre-break head is saved for stitching.
        assert_eq!(map.last_frame_before_track_break, Some(frame_4));
    }

    /// Build a map with a local map before a break and one after it.
    fn map_with_broken_track() -> (WorldMap, FrameId, FrameId) {
        let mut map = WorldMap::new(test_parameters(2));
        // First track: frames 0..=4 with at least one local map.
        for i in 0..5usize {
            map.create_frame(pose_at(i as f64 * 0.3), i as f64, test_camera());
            map.try_create_local_map(false);
        }
        assert!(map.num_local_maps() > 0);
        let frame_4 = map.current_frame_id().unwrap();

        // Track breaks at frame 5.
        let frame_5 = map.create_frame(pose_at(1.5), 5.0, test_camera());
        map.break_track(frame_5);

        // Second track accumulates its own local map; the current frame ends
        // up as its anchor, as in the live pipeline when a closure is found.
        for i in 6..9usize {
            map.create_frame(pose_at(i as f64 * 0.3), i as f64, test_camera());
            map.try_create_local_map(false);
        }
        assert!(map
            .frame(map.current_frame_id().unwrap())
            .unwrap()
            .local_map
            .is_some());
        (map, frame_4, frame_5)
    }

    #[test]
    fn test_add_loop_closure_stitches_track() {
        // Scenario: relocalization after a break reconnects the tracks.
        let (mut map, frame_4, _frame_5) = map_with_broken_track();
        let current = map.current_frame_id().unwrap();
        let query = map.current_local_map_id().unwrap();
        let reference = map.local_maps_in_order()[0];

        map.add_loop_closure(query, reference, SE3::identity(), Vec::new(), 1.0);

        assert_eq!(map.number_of_closures(), 1);
        assert!(map.relocalized());
        let current_frame = map.frame(current).unwrap();
        assert_eq!(current_frame.root(), FrameId::new(0));
        assert_eq!(current_frame.previous, Some(frame_4));
        assert_eq!(map.frame(frame_4).unwrap().next, Some(current));
        // Closure recorded on the query local map.
        assert_eq!(map.local_map(query).unwrap().closures.len(), 1);
    }

    #[test]
    fn test_set_track_is_idempotent() {
        let (mut map, frame_4, _frame_5) = map_with_broken_track();
        let current = map.current_frame_id().unwrap();

        map.set_track(current);
        let next_after_first = map.frame(frame_4).unwrap().next;
        // Second application is a no-op: the saved pre-break pointers are
        // cleared by the first call.
        map.set_track(current);

        assert_eq!(map.frame(frame_4).unwrap().next, next_after_first);
        assert_eq!(map.last_frame_before_track_break, None);
    }

    /// Create a landmark at the given world position observed by a dedicated
    /// frame, returning its identifier.
    fn landmark_with_observation(map: &mut WorldMap, position: Vector3<f64>) -> LandmarkId {
        let frame_id = map.create_frame(SE3::identity(), 0.0, test_camera());
        map.frame_mut(frame_id)
            .unwrap()
            .set_points(vec![test_point(position)]);
        map.create_landmark(FramePointRef {
            frame: frame_id,
            index: 0,
        })
        .unwrap()
    }

    fn correspondence(
        query: LandmarkId,
        reference: LandmarkId,
        matching_count: usize,
    ) -> LandmarkCorrespondence {
        LandmarkCorrespondence {
            query,
            reference,
            matching_count,
            is_inlier: true,
        }
    }

    #[test]
    fn test_merge_landmarks_batch() {
        // Scenario: correspondences {(10,3,50), (10,7,30), (4,3,40)}.
        let mut map = WorldMap::new(test_parameters(10));
        let mut ids = Vec::new();
        for i in 0..11u64 {
            ids.push(landmark_with_observation(
                &mut map,
                Vector3::new(i as f64, 0.0, 2.0),
            ));
        }
        let (l3, l4, l7, l10) = (ids[3], ids[4], ids[7], ids[10]);
        map.set_currently_tracked_landmarks(vec![l3, l4, l10]);

        map.merge_landmarks(&[vec![
            correspondence(l10, l3, 50),
            correspondence(l10, l7, 30),
            correspondence(l4, l3, 40),
        ]]);

        // Landmarks 10 and 4 are gone, 3 holds the union of observations.
        assert!(map.landmark(l10).is_none());
        assert!(map.landmark(l4).is_none());
        assert!(map.landmark(l7).is_some());
        let absorbed = map.landmark(l3).unwrap();
        assert_eq!(absorbed.observations.len(), 3);

        // No FramePoint references the absorbed landmarks anymore.
        for frame in map.frames() {
            for point in frame.points() {
                assert_ne!(point.landmark, Some(l10));
                assert_ne!(point.landmark, Some(l4));
            }
        }

        // Tracked cache entries were redirected.
        assert!(map
            .currently_tracked_landmarks()
            .iter()
            .all(|id| *id == l3));
        assert_eq!(map.number_of_merged_landmarks(), 2);
    }

    #[test]
    fn test_merge_skips_self_correspondence() {
        let mut map = WorldMap::new(test_parameters(10));
        let id = landmark_with_observation(&mut map, Vector3::new(0.0, 0.0, 2.0));

        map.merge_landmarks(&[vec![correspondence(id, id, 10)]]);

        assert!(map.landmark(id).is_some());
        assert_eq!(map.number_of_merged_landmarks(), 0);
    }

    #[test]
    fn test_merge_rejects_shared_local_map() {
        let mut map = WorldMap::new(test_parameters(10));
        let a = landmark_with_observation(&mut map, Vector3::new(0.0, 0.0, 2.0));
        let b = landmark_with_observation(&mut map, Vector3::new(1.0, 0.0, 2.0));
        let shared = LocalMapId::new(0);
        map.landmark_mut(a).unwrap().local_maps.insert(shared);
        map.landmark_mut(b).unwrap().local_maps.insert(shared);

        map.merge_landmarks(&[vec![correspondence(b, a, 10)]]);

        assert!(map.landmark(a).is_some());
        assert!(map.landmark(b).is_some());
        assert_eq!(map.number_of_merged_landmarks(), 0);
    }
}
