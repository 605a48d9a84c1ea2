//! Error types for Cadence.

use thiserror::Error;

use crate::types::SampleFormat;

/// Result type alias using Cadence's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cadence.
#[derive(Error, Debug)]
pub enum Error {
    // Output device errors
    #[error("Audio device error during {op} on '{device}': {reason}")]
    Device {
        op: &'static str,
        device: String,
        reason: String,
    },

    // Decoder errors
    #[error("Decode error for track '{track}': {reason}")]
    Decode { track: String, reason: String },

    #[error("Stream format [{stream}] cannot be played on device format [{device}]")]
    FormatMismatch {
        stream: SampleFormat,
        device: SampleFormat,
    },

    #[error("Invalid PCM data: {0}")]
    InvalidFormat(String),

    // Control flow signals
    #[error("Operation cancelled")]
    Cancelled,

    #[error("End of stream")]
    EndOfStream,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a device error carrying the failing operation and device name.
    pub fn device(op: &'static str, device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Device {
            op,
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a decode error carrying the track identity.
    pub fn decode(track: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            track: track.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error marks a deliberately aborted operation.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this error is the end-of-stream control signal.
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Returns true if this error came from the output device.
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::Device { .. } | Self::FormatMismatch { .. })
    }

    /// Returns true if this error came from opening or running a decoder.
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::InvalidFormat(_))
    }
}
