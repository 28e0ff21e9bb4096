//! Crate-wide error type.
//!
//! Only configuration and I/O failures abort the host. Tracking loss,
//! degenerate input and relocalization misses are ordinary values carried in
//! the per-frame results, never `Err`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlamError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),

    #[error("help requested")]
    HelpRequested,
}

pub type Result<T> = std::result::Result<T, SlamError>;
