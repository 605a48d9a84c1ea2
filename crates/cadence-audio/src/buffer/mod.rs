//! Buffering between the decoder and the output device.

pub mod queue;
pub mod ring;

pub use queue::BufferQueue;
pub use ring::RingBuffer;
