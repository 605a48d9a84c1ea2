//! FIFO of decoded chunks waiting to be written to the device.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;

use cadence_core::PcmChunk;

/// Ordered queue of [`PcmChunk`]s awaiting a device write.
///
/// The front chunk may be partially consumed: after a short write the
/// unwritten remainder goes back to the front with [`push_front`](Self::push_front).
#[derive(Debug, Default)]
pub struct BufferQueue {
    chunks: VecDeque<PcmChunk>,
    bytes: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a freshly decoded chunk. Empty chunks are dropped.
    pub fn push_back(&mut self, chunk: PcmChunk) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Return an unwritten remainder so it is written before anything else.
    pub fn push_front(&mut self, chunk: PcmChunk) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_front(chunk);
    }

    pub fn pop_front(&mut self) -> Option<PcmChunk> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    /// Take at most `max` bytes from the front chunk.
    ///
    /// A larger front chunk is split on a frame boundary and its tail stays
    /// queued. A `max` smaller than one frame still yields one frame so the
    /// queue always makes progress.
    pub fn pop_bytes(&mut self, max: usize) -> Option<PcmChunk> {
        let mut chunk = self.pop_front()?;
        let frame = chunk.format().frame_size();
        if chunk.len() > max.max(frame) {
            let head = chunk.split_to(max.max(frame));
            self.push_front(chunk);
            return Some(head);
        }
        Some(chunk)
    }

    pub fn front(&self) -> Option<&PcmChunk> {
        self.chunks.front()
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total queued bytes across all chunks.
    pub const fn queued_bytes(&self) -> usize {
        self.bytes
    }

    /// Release every queued chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &PcmChunk> {
        self.chunks.iter()
    }
}
