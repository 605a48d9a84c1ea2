//! # cadence-core
//!
//! Core types and error handling for the Cadence playback engine.
//!
//! - [`SampleFormat`] describes raw PCM and converts between time, samples and bytes
//! - [`PcmChunk`] is an owned, format-tagged block of PCM bytes
//! - [`Playlist`] tracks the active list of [`Track`]s and the playback position

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
