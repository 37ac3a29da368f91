//! Error types for zenjxl

use std::fmt;

/// Result type for zenjxl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for zenjxl operations
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid compression parameter value
    InvalidParams {
        param: &'static str,
        reason: &'static str,
    },
    /// A metric-guided search was requested without a reference image
    MissingReference,
    /// The perceptual comparator failed
    Comparator { reason: String },
    /// The roundtrip codec failed
    Roundtrip { reason: String },
}

impl Error {
    /// Wraps a comparator implementation failure.
    #[must_use]
    pub fn comparator(reason: impl Into<String>) -> Self {
        Error::Comparator {
            reason: reason.into(),
        }
    }

    /// Wraps a roundtrip codec failure.
    #[must_use]
    pub fn roundtrip(reason: impl Into<String>) -> Self {
        Error::Roundtrip {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParams { param, reason } => {
                write!(f, "Invalid parameter {}: {}", param, reason)
            }
            Error::MissingReference => {
                write!(f, "Metric-guided quantization requires a reference image")
            }
            Error::Comparator { reason } => write!(f, "Comparator failed: {}", reason),
            Error::Roundtrip { reason } => write!(f, "Roundtrip failed: {}", reason),
        }
    }
}

impl std::error::Error for Error {}
