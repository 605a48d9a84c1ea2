//! # cadence-audio
//!
//! Gapless playback engine for Cadence.
//!
//! Features:
//! - State machine over Stopped, Playing, Paused and Error
//! - Self re-arming decode, buffer and write cycle on a pluggable executor
//! - Bit-depth negotiation with the output device and gapless preloading
//! - Symphonia decoding and cpal output adapters

pub mod buffer;
pub mod config;
pub mod decode;
pub mod engine;
pub mod executor;
pub mod output;
pub mod sink;
pub mod state;

pub use buffer::BufferQueue;
pub use config::{ConfigUpdate, EngineConfig};
pub use decode::{DecodeStatus, Decoder, DecoderManager, SymphoniaDecoder, SymphoniaDecoderManager};
pub use engine::{EngineEvent, PlaybackEngine};
pub use executor::{Executor, Job, ThreadPool, TokioExecutor};
pub use output::{CpalOutputManager, CpalSink};
pub use sink::{AudioSink, OutputManager, WriteCallback, WriteCompletion};
pub use state::PlaybackState;
