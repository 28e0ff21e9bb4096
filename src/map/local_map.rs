//! LocalMap - a submap spanning a window of frames, anchored at a keyframe.

use nalgebra::Vector3;
use opencv::core::Mat;

use crate::geometry::SE3;

use super::types::{FrameId, LandmarkId, LocalMapId};

/// One landmark as seen from a local map: its position expressed in
/// local-map coordinates plus the appearance descriptors gathered over the
/// window, used by relocalization matching.
pub struct LocalMapLandmark {
    pub landmark: LandmarkId,
    pub coordinates_in_local_map: Vector3<f64>,
    pub appearances: Vec<Mat>,
}

/// One query→reference landmark correspondence backing a loop closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandmarkCorrespondence {
    pub query: LandmarkId,
    pub reference: LandmarkId,
    /// Number of matched appearances supporting this correspondence.
    pub matching_count: usize,
    pub is_inlier: bool,
}

/// A loop-closure constraint from this (query) local map to a reference one.
pub struct ClosureConstraint {
    pub reference: LocalMapId,
    pub query_to_reference: SE3,
    pub correspondences: Vec<LandmarkCorrespondence>,
    pub information: f64,
}

/// Submap built from a contiguous window of frames.
///
/// The anchor is the newest frame of the window and is marked as keyframe;
/// every member frame carries `frame_to_local_map` relative to it. Local
/// maps form a doubly-linked list in creation order.
pub struct LocalMap {
    id: LocalMapId,
    pub keyframe: FrameId,
    pub frames: Vec<FrameId>,
    pub landmarks: Vec<LocalMapLandmark>,

    local_map_to_world: SE3,
    world_to_local_map: SE3,

    pub closures: Vec<ClosureConstraint>,

    pub previous: Option<LocalMapId>,
    pub next: Option<LocalMapId>,
    root: LocalMapId,
}

impl LocalMap {
    pub fn new(
        id: LocalMapId,
        keyframe: FrameId,
        frames: Vec<FrameId>,
        landmarks: Vec<LocalMapLandmark>,
        local_map_to_world: SE3,
        root: Option<LocalMapId>,
        previous: Option<LocalMapId>,
    ) -> Self {
        Self {
            id,
            keyframe,
            frames,
            landmarks,
            world_to_local_map: local_map_to_world.inverse(),
            local_map_to_world,
            closures: Vec::new(),
            previous,
            next: None,
            root: root.unwrap_or(id),
        }
    }

    pub fn id(&self) -> LocalMapId {
        self.id
    }

    pub fn root(&self) -> LocalMapId {
        self.root
    }

    pub fn set_root(&mut self, root: LocalMapId) {
        self.root = root;
    }

    pub fn local_map_to_world(&self) -> &SE3 {
        &self.local_map_to_world
    }

    pub fn world_to_local_map(&self) -> &SE3 {
        &self.world_to_local_map
    }

    pub fn set_local_map_to_world(&mut self, local_map_to_world: SE3) {
        self.world_to_local_map = local_map_to_world.inverse();
        self.local_map_to_world = local_map_to_world;
    }

    pub fn add_correspondence(
        &mut self,
        reference: LocalMapId,
        query_to_reference: SE3,
        correspondences: Vec<LandmarkCorrespondence>,
        information: f64,
    ) {
        self.closures.push(ClosureConstraint {
            reference,
            query_to_reference,
            correspondences,
            information,
        });
    }

    pub fn contains_landmark(&self, landmark: LandmarkId) -> bool {
        self.landmarks.iter().any(|entry| entry.landmark == landmark)
    }
}

impl std::fmt::Debug for LocalMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMap")
            .field("id", &self.id)
            .field("keyframe", &self.keyframe)
            .field("frames", &self.frames.len())
            .field("landmarks", &self.landmarks.len())
            .field("closures", &self.closures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_local_map() -> LocalMap {
        LocalMap::new(
            LocalMapId::new(0),
            FrameId::new(10),
            vec![FrameId::new(8), FrameId::new(9), FrameId::new(10)],
            vec![LocalMapLandmark {
                landmark: LandmarkId::new(5),
                coordinates_in_local_map: Vector3::new(0.0, 0.0, 2.0),
                appearances: vec![Mat::default()],
            }],
            SE3::identity(),
            None,
            None,
        )
    }

    #[test]
    fn test_first_local_map_is_its_own_root() {
        let local_map = test_local_map();
        assert_eq!(local_map.root(), local_map.id());
    }

    #[test]
    fn test_contains_landmark() {
        let local_map = test_local_map();
        assert!(local_map.contains_landmark(LandmarkId::new(5)));
        assert!(!local_map.contains_landmark(LandmarkId::new(6)));
    }

    #[test]
    fn test_add_correspondence() {
        let mut local_map = test_local_map();
        local_map.add_correspondence(
            LocalMapId::new(3),
            SE3::identity(),
            vec![LandmarkCorrespondence {
                query: LandmarkId::new(5),
                reference: LandmarkId::new(1),
                matching_count: 4,
                is_inlier: true,
            }],
            1.0,
        );

        assert_eq!(local_map.closures.len(), 1);
        assert_eq!(local_map.closures[0].reference, LocalMapId::new(3));
    }
}
