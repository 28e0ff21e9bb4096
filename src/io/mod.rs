//! Dataset input and trajectory output.

pub mod dataset;
pub mod trajectory;

pub use dataset::{ImagePair, ImageSequenceDataset};
