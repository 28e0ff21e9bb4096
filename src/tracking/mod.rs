//! Frame-to-frame motion estimation: prediction, matching, pose refinement
//! and landmark management.

pub mod aligner;
pub mod motion_model;
pub mod tracker;

pub use aligner::{AlignmentCorrespondence, AlignmentResult};
pub use motion_model::MotionModel;
pub use tracker::{Tracker, TrackerOutput, TrackerStatus};
