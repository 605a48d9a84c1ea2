//! Engine tuning parameters and their live updates.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::time::Duration;

use cadence_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Playback engine configuration.
///
/// Durations are stored as whole milliseconds when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Audio decoded per write cycle.
    ///
    /// Default: 1000 ms.
    #[serde(default = "default_buffer_time", with = "millis")]
    pub buffer_time: Duration,

    /// Remaining track time below which the next track is opened early.
    ///
    /// Default: 1000 ms.
    #[serde(default = "default_gapless_preload_time", with = "millis")]
    pub gapless_preload_time: Duration,

    /// Delay between running out of tracks and stopping the device, so the
    /// tail of the last write can drain.
    ///
    /// Default: 100 ms.
    #[serde(default = "default_end_of_stream_grace", with = "millis")]
    pub end_of_stream_grace: Duration,

    /// Worker count for the default thread pool.
    ///
    /// Default: 2.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_time: default_buffer_time(),
            gapless_preload_time: default_gapless_preload_time(),
            end_of_stream_grace: default_end_of_stream_grace(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_time.is_zero() {
            return Err(Error::Config("buffer_time must be > 0".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be > 0".to_string()));
        }
        Ok(())
    }

    /// Apply a live update, rejecting values that would stall the engine.
    pub fn apply(&mut self, update: ConfigUpdate) -> Result<()> {
        match update {
            ConfigUpdate::BufferTime(time) if time.is_zero() => {
                return Err(Error::Config("buffer_time must be > 0".to_string()));
            }
            ConfigUpdate::BufferTime(time) => self.buffer_time = time,
            ConfigUpdate::GaplessPreloadTime(time) => self.gapless_preload_time = time,
        }
        Ok(())
    }
}

/// A single changed configuration value, delivered while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdate {
    BufferTime(Duration),
    GaplessPreloadTime(Duration),
}

impl ConfigUpdate {
    /// Map a configuration key and its millisecond value to an update.
    ///
    /// Keys are accepted both snake cased and in their human readable form.
    pub fn from_key_value(key: &str, millis: u64) -> Result<Self> {
        let time = Duration::from_millis(millis);
        match key {
            "buffer_time" | "buffer time" => Ok(Self::BufferTime(time)),
            "gapless_preload_time" | "gapless preload time" => Ok(Self::GaplessPreloadTime(time)),
            other => Err(Error::Config(format!("unknown key '{other}'"))),
        }
    }
}

const fn default_buffer_time() -> Duration {
    Duration::from_millis(1000)
}

const fn default_gapless_preload_time() -> Duration {
    Duration::from_millis(1000)
}

const fn default_end_of_stream_grace() -> Duration {
    Duration::from_millis(100)
}

const fn default_worker_threads() -> usize {
    2
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
