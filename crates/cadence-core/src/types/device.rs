//! Output device state as reported by an audio sink.

use serde::{Deserialize, Serialize};

/// State of an open output device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// The device failed and needs to be re-acquired.
    Error,
    /// Prepared for a format, not yet started.
    Ready,
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl DeviceState {
    /// Whether the device holds a negotiated format it can resume with.
    pub const fn is_prepared(self) -> bool {
        matches!(self, Self::Ready | Self::Playing | Self::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_states() {
        assert!(DeviceState::Ready.is_prepared());
        assert!(DeviceState::Paused.is_prepared());
        assert!(!DeviceState::Stopped.is_prepared());
        assert!(!DeviceState::Error.is_prepared());
        assert_eq!(DeviceState::default(), DeviceState::Stopped);
    }
}
