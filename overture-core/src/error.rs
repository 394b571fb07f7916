//! Error types shared across the Overture workspace.
//!
//! Codec crates define their own error enums for codec-specific failures and
//! wrap these core errors where the failure originates in shared machinery.

use thiserror::Error;

/// Main error type for the core crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bitstream parsing errors.
    #[error("Bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid parameter provided by the caller.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Unsupported feature or format.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Allocation failure or resource limit.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// End of stream reached.
    #[error("End of stream")]
    EndOfStream,
}

/// Bitstream parsing errors.
#[derive(Error, Debug)]
pub enum BitstreamError {
    /// Read past the end of the coded payload.
    #[error("Unexpected end of bitstream")]
    UnexpectedEnd,

    /// A syntax element decoded to a value the format does not allow.
    #[error("Invalid syntax element: {element} = {value}")]
    InvalidSyntax { element: &'static str, value: i64 },

    /// Generic bitstream error message.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid parameter error.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Check if this is an end-of-stream error.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            Error::EndOfStream | Error::Bitstream(BitstreamError::UnexpectedEnd)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidParameter("test parameter".into());
        assert_eq!(err.to_string(), "Invalid parameter: test parameter");
    }

    #[test]
    fn test_bitstream_error_conversion() {
        let err: Error = BitstreamError::UnexpectedEnd.into();
        assert!(matches!(
            err,
            Error::Bitstream(BitstreamError::UnexpectedEnd)
        ));
        assert!(err.is_eof());
    }

    #[test]
    fn test_is_eof() {
        assert!(Error::EndOfStream.is_eof());
        assert!(!Error::unsupported("x").is_eof());
    }
}
