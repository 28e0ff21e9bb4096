//! Geometry utilities: SE3 transforms, camera projection.

pub mod camera;
pub mod se3;

pub use camera::Camera;
pub use se3::{skew, SE3};
