//! Pose prediction for the next frame.
//!
//! Two exclusive prediction modes: a constant-velocity model fed by the
//! refined poses, or an external odometry delta supplied by the host.

use crate::geometry::SE3;

/// Constant-velocity motion model.
///
/// Predicts the next pose by replaying the previous inter-frame transform.
pub struct MotionModel {
    previous_pose: Option<SE3>,
    /// Last observed pose-to-pose transform.
    velocity: SE3,
}

impl MotionModel {
    pub fn new() -> Self {
        Self {
            previous_pose: None,
            velocity: SE3::identity(),
        }
    }

    /// Update the model with the refined pose of the processed frame.
    pub fn update(&mut self, robot_to_world: &SE3) {
        if let Some(previous) = &self.previous_pose {
            self.velocity = previous.inverse().compose(robot_to_world);
        }
        self.previous_pose = Some(robot_to_world.clone());
    }

    /// Predicted pose under the constant-velocity assumption.
    pub fn predict(&self) -> Option<SE3> {
        self.previous_pose
            .as_ref()
            .map(|previous| previous.compose(&self.velocity))
    }

    /// Predicted pose from an external odometry delta.
    pub fn predict_with_odometry(&self, odometry_delta: &SE3) -> Option<SE3> {
        self.previous_pose
            .as_ref()
            .map(|previous| previous.compose(odometry_delta))
    }

    pub fn reset(&mut self) {
        self.previous_pose = None;
        self.velocity = SE3::identity();
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new()
    }
}
