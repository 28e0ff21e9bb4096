//! Core ID types for the world-map structures.

/// Unique identifier for a Frame within a WorldMap.
///
/// Identifiers are assigned sequentially by the owning WorldMap and never
/// reused. They serve as lightweight handles for cross-referencing without
/// needing Arc/Rc, which avoids ownership cycles across the frame graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Unique identifier for a Landmark within a WorldMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Unique identifier for a LocalMap within a WorldMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMapId(pub u64);

impl LocalMapId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LocalMapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Reference to one FramePoint: the owning frame plus its index in that
/// frame's point vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramePointRef {
    pub frame: FrameId,
    pub index: usize,
}
