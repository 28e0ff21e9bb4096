//! World-map data structures: frames, framepoints, landmarks, local maps.

pub mod frame;
pub mod frame_point;
pub mod landmark;
pub mod local_map;
pub mod types;
pub mod world_map;

pub use frame::{Frame, FrameStatus};
pub use frame_point::FramePoint;
pub use landmark::Landmark;
pub use local_map::{ClosureConstraint, LandmarkCorrespondence, LocalMap, LocalMapLandmark};
pub use types::{FrameId, FramePointRef, LandmarkId, LocalMapId};
pub use world_map::WorldMap;
