//! Core domain types for Cadence.

pub mod chunk;
pub mod device;
pub mod format;
pub mod playlist;
pub mod track;

pub use chunk::{convert_sample_width, PcmChunk};
pub use device::DeviceState;
pub use format::SampleFormat;
pub use playlist::{Playlist, Retreat};
pub use track::Track;
