//! FramePoint - one 2D observation with a 3D camera-frame coordinate.
//!
//! A FramePoint lives inside exactly one Frame and is destroyed with it.
//! Track links (`previous`) point into the preceding frame's point vector;
//! once a track is long enough the tracker attaches a Landmark which all
//! linked FramePoints then share.

use nalgebra::Vector3;
use opencv::core::{KeyPoint, Mat};
use opencv::prelude::*;

use super::types::{FramePointRef, LandmarkId};

#[derive(Clone)]
pub struct FramePoint {
    /// Keypoint in the left intensity image.
    pub keypoint_left: KeyPoint,

    /// Matched keypoint in the right image (stereo only).
    pub keypoint_right: Option<KeyPoint>,

    /// Binary descriptor of the left keypoint (single-row matrix).
    pub descriptor_left: Mat,

    /// Binary descriptor of the right keypoint (stereo only).
    pub descriptor_right: Option<Mat>,

    /// 3D coordinates in the left camera frame.
    pub camera_coordinates: Vector3<f64>,

    /// Depth along the optical axis in meters.
    pub depth_meters: f64,

    /// Near points carry a full reprojection-plus-depth residual in
    /// optimization; far points are bearing-only.
    pub is_near: bool,

    /// Track link to the corresponding FramePoint in the previous frame.
    pub previous: Option<FramePointRef>,

    /// Landmark this observation contributes to, once the track is promoted.
    pub landmark: Option<LandmarkId>,

    /// Number of frames this track spans (1 for a fresh detection).
    pub track_length: usize,
}

impl FramePoint {
    /// A fresh, unlinked observation.
    pub fn new(
        keypoint_left: KeyPoint,
        keypoint_right: Option<KeyPoint>,
        descriptor_left: Mat,
        descriptor_right: Option<Mat>,
        camera_coordinates: Vector3<f64>,
        is_near: bool,
    ) -> Self {
        Self {
            keypoint_left,
            keypoint_right,
            descriptor_left,
            descriptor_right,
            depth_meters: camera_coordinates.z,
            camera_coordinates,
            is_near,
            previous: None,
            landmark: None,
            track_length: 1,
        }
    }

    /// Link this observation to its predecessor, inheriting the landmark and
    /// extending the track.
    pub fn set_previous(
        &mut self,
        previous: FramePointRef,
        previous_track_length: usize,
        landmark: Option<LandmarkId>,
    ) {
        self.previous = Some(previous);
        self.track_length = previous_track_length + 1;
        self.landmark = landmark;
    }

    pub fn has_landmark(&self) -> bool {
        self.landmark.is_some()
    }

    /// Pixel coordinates of the left keypoint.
    pub fn image_coordinates(&self) -> (f64, f64) {
        let pt = self.keypoint_left.pt();
        (pt.x as f64, pt.y as f64)
    }
}

impl std::fmt::Debug for FramePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePoint")
            .field("camera_coordinates", &self.camera_coordinates)
            .field("depth_meters", &self.depth_meters)
            .field("is_near", &self.is_near)
            .field("landmark", &self.landmark)
            .field("track_length", &self.track_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::types::FrameId;

    fn test_point(depth: f64) -> FramePoint {
        FramePoint::new(
            KeyPoint::default().unwrap(),
            None,
            Mat::default(),
            None,
            Vector3::new(0.1, 0.2, depth),
            true,
        )
    }

    #[test]
    fn test_new_point_is_fresh() {
        let point = test_point(4.0);

        assert_eq!(point.track_length, 1);
        assert!(point.previous.is_none());
        assert!(!point.has_landmark());
        assert_eq!(point.depth_meters, 4.0);
    }

    #[test]
    fn test_set_previous_extends_track() {
        let mut point = test_point(4.0);
        let predecessor = FramePointRef {
            frame: FrameId::new(3),
            index: 17,
        };

        point.set_previous(predecessor, 2, Some(LandmarkId::new(9)));

        assert_eq!(point.track_length, 3);
        assert_eq!(point.previous, Some(predecessor));
        assert_eq!(point.landmark, Some(LandmarkId::new(9)));
    }
}
