//! Error types for the AV1 decoder.

use thiserror::Error;

/// AV1 decoder errors.
#[derive(Error, Debug)]
pub enum Av1Error {
    /// Allocation failure.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The coded data violates the bitstream syntax or its own signalled
    /// constraints; the current frame is dropped.
    #[error("Invalid bitstream: {0}")]
    InvalidBitstream(&'static str),

    /// The stream requires a profile or feature this build does not decode.
    #[error("Unsupported profile: {0}")]
    UnsupportedProfile(&'static str),

    /// A frame references an empty reference slot.
    #[error("Missing reference frame in slot {0}")]
    ReferenceMissing(usize),

    /// Frame submitted before any sequence header.
    #[error("No sequence header seen yet")]
    NoSequenceHeader,

    /// Core-layer failure.
    #[error(transparent)]
    Core(#[from] overture_core::Error),
}

/// Result type alias for decoder operations.
pub type Result<T> = std::result::Result<T, Av1Error>;

impl Av1Error {
    /// Whether dropping the current frame recovers the decoder.
    #[must_use]
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Av1Error::InvalidBitstream(_) | Av1Error::ReferenceMissing(_)
        )
    }
}
