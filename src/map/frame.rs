//! Frame - one image acquisition and everything derived from it.

use nalgebra::Vector3;
use opencv::core::{KeyPoint, Mat, Vector};

use crate::geometry::{Camera, SE3};

use super::frame_point::FramePoint;
use super::types::{FrameId, LocalMapId};

/// Tracker state at the time a frame was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough landmarks yet to refine the pose against the map.
    Localizing,
    /// Normal operation: pose refined from landmark correspondences.
    Tracking,
}

/// Per-acquisition container: images, keypoints, descriptors, pose and the
/// FramePoints generated from them.
///
/// Frames form a doubly-linked temporal list (`previous`/`next`) per track;
/// `root` points at the first frame of the track and is reassigned when a
/// broken track is stitched back by relocalization.
pub struct Frame {
    id: FrameId,
    pub status: FrameStatus,

    pub previous: Option<FrameId>,
    pub next: Option<FrameId>,
    root: FrameId,

    pub timestamp_seconds: f64,

    pub camera_left: Camera,
    pub camera_right: Camera,

    /// Left intensity image; right intensity image or registered depth image.
    pub intensity_image_left: Mat,
    pub intensity_image_right: Mat,

    pub keypoints_left: Vector<KeyPoint>,
    pub keypoints_right: Vector<KeyPoint>,
    pub descriptors_left: Mat,
    pub descriptors_right: Mat,

    robot_to_world: SE3,
    world_to_robot: SE3,

    frame_to_local_map: SE3,
    local_map_to_frame: SE3,
    pub local_map: Option<LocalMapId>,
    is_keyframe: bool,

    points: Vec<FramePoint>,

    /// Ground-truth pose, when the dataset provides one. Informative only.
    pub robot_to_world_ground_truth: Option<SE3>,
}

impl Frame {
    pub fn new(id: FrameId, robot_to_world: SE3, timestamp_seconds: f64, camera: Camera) -> Self {
        Self {
            id,
            status: FrameStatus::Localizing,
            previous: None,
            next: None,
            root: id,
            timestamp_seconds,
            camera_left: camera,
            camera_right: camera,
            intensity_image_left: Mat::default(),
            intensity_image_right: Mat::default(),
            keypoints_left: Vector::new(),
            keypoints_right: Vector::new(),
            descriptors_left: Mat::default(),
            descriptors_right: Mat::default(),
            world_to_robot: robot_to_world.inverse(),
            robot_to_world,
            frame_to_local_map: SE3::identity(),
            local_map_to_frame: SE3::identity(),
            local_map: None,
            is_keyframe: false,
            points: Vec::new(),
            robot_to_world_ground_truth: None,
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn root(&self) -> FrameId {
        self.root
    }

    pub fn set_root(&mut self, root: FrameId) {
        self.root = root;
    }

    pub fn robot_to_world(&self) -> &SE3 {
        &self.robot_to_world
    }

    pub fn world_to_robot(&self) -> &SE3 {
        &self.world_to_robot
    }

    /// Set the pose, keeping the cached inverse in sync.
    pub fn set_robot_to_world(&mut self, robot_to_world: SE3) {
        self.world_to_robot = robot_to_world.inverse();
        self.robot_to_world = robot_to_world;
    }

    pub fn frame_to_local_map(&self) -> &SE3 {
        &self.frame_to_local_map
    }

    pub fn local_map_to_frame(&self) -> &SE3 {
        &self.local_map_to_frame
    }

    pub fn set_frame_to_local_map(&mut self, frame_to_local_map: SE3) {
        self.local_map_to_frame = frame_to_local_map.inverse();
        self.frame_to_local_map = frame_to_local_map;
    }

    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    pub fn set_is_keyframe(&mut self, is_keyframe: bool) {
        self.is_keyframe = is_keyframe;
    }

    pub fn points(&self) -> &[FramePoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [FramePoint] {
        &mut self.points
    }

    pub fn set_points(&mut self, points: Vec<FramePoint>) {
        self.points = points;
    }

    /// World coordinates of a point observed in this frame.
    pub fn point_world_coordinates(&self, index: usize) -> Vector3<f64> {
        self.robot_to_world
            .transform_point(&self.points[index].camera_coordinates)
    }

    /// Count points with at least the given track length, optionally
    /// filtering on landmark association.
    pub fn count_points(&self, minimum_track_length: usize, has_landmark: Option<bool>) -> usize {
        self.points
            .iter()
            .filter(|point| point.track_length >= minimum_track_length)
            .filter(|point| match has_landmark {
                Some(required) => point.has_landmark() == required,
                None => true,
            })
            .count()
    }

    /// Release FramePoints, descriptor matrices and images to reclaim
    /// memory once the frame left the local-map window.
    pub fn release_points(&mut self) {
        self.points.clear();
        self.points.shrink_to_fit();
        self.keypoints_left.clear();
        self.keypoints_right.clear();
        self.descriptors_left = Mat::default();
        self.descriptors_right = Mat::default();
        self.intensity_image_left = Mat::default();
        self.intensity_image_right = Mat::default();
    }

    /// Begin a new track at this frame: drop the predecessor link and make
    /// the frame its own root.
    pub fn break_track(&mut self) {
        self.previous = None;
        self.root = self.id;
        self.status = FrameStatus::Localizing;
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("previous", &self.previous)
            .field("next", &self.next)
            .field("root", &self.root)
            .field("points", &self.points.len())
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}
