//! Owned, format-tagged PCM buffers.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BytesMut};

use super::SampleFormat;
use crate::{Error, Result};

/// A contiguous block of interleaved PCM owned by whoever holds it.
///
/// The byte length is always a whole number of frames of `format`. The
/// chunk moves from decoder to queue to device write; it is never shared.
pub struct PcmChunk {
    data: BytesMut,
    format: SampleFormat,
}

impl PcmChunk {
    /// Wrap existing PCM bytes, rejecting partial frames.
    pub fn new(format: SampleFormat, data: impl AsRef<[u8]>) -> Result<Self> {
        let data = BytesMut::from(data.as_ref());
        let frame = format.frame_size();
        if frame == 0 {
            return Err(Error::InvalidFormat(format!("format not set: {format}")));
        }
        if data.len() % frame != 0 {
            return Err(Error::InvalidFormat(format!(
                "{} bytes is not a whole number of {frame}-byte frames",
                data.len()
            )));
        }
        Ok(Self { data, format })
    }

    /// A zero-filled chunk of at most `len` bytes, rounded down to whole frames.
    pub fn zeroed(format: SampleFormat, len: usize) -> Self {
        let len = align_down(len, format.frame_size());
        Self {
            data: BytesMut::zeroed(len),
            format,
        }
    }

    pub const fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn frames(&self) -> u64 {
        self.format.bytes_to_samples(self.data.len())
    }

    /// Playing time of the chunk.
    pub fn duration(&self) -> Duration {
        self.format.bytes_to_time(self.data.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view, for decoders writing straight into the chunk.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shorten to `len` bytes, rounded down to whole frames.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(align_down(len, self.format.frame_size()));
    }

    /// Drop the first `n` bytes, as after a partial device write.
    ///
    /// A count that ends inside a frame drops that whole frame so the
    /// remainder stays frame aligned.
    pub fn consume(&mut self, n: usize) {
        let n = align_up(n, self.format.frame_size()).min(self.data.len());
        self.data.advance(n);
    }

    /// Split off the first `n` bytes (rounded down to whole frames).
    pub fn split_to(&mut self, n: usize) -> Self {
        let n = align_down(n.min(self.data.len()), self.format.frame_size());
        Self {
            data: self.data.split_to(n),
            format: self.format,
        }
    }

    /// Re-encode every sample to `bits` wide containers.
    ///
    /// Channels and sample rate are unchanged, so the chunk keeps its frame
    /// count.
    pub fn convert_bits(self, bits: u8) -> Result<Self> {
        if bits == self.format.bits_per_sample {
            return Ok(self);
        }
        let data = convert_sample_width(&self.data, self.format.bits_per_sample, bits)?;
        Ok(Self {
            data,
            format: self.format.with_bits(bits),
        })
    }
}

impl fmt::Debug for PcmChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmChunk")
            .field("len", &self.data.len())
            .field("format", &self.format)
            .finish()
    }
}

/// Move every sample of `input` from `from_bits` to `to_bits` containers.
///
/// Widening writes `to - from` zero bytes ahead of each original sample, which
/// for little-endian PCM leaves the sample left justified in the wider
/// container. Narrowing drops the same leading bytes again, so a widen then
/// narrow round trip is lossless.
pub fn convert_sample_width(input: &[u8], from_bits: u8, to_bits: u8) -> Result<BytesMut> {
    for bits in [from_bits, to_bits] {
        if !SampleFormat::SUPPORTED_BITS.contains(&bits) {
            return Err(Error::InvalidFormat(format!(
                "unsupported bit depth {bits}"
            )));
        }
    }

    let from = usize::from(from_bits / 8);
    let to = usize::from(to_bits / 8);
    if input.len() % from != 0 {
        return Err(Error::InvalidFormat(format!(
            "{} bytes is not a whole number of {from}-byte samples",
            input.len()
        )));
    }

    let mut output = BytesMut::with_capacity(input.len() / from * to);
    if to >= from {
        let padding = [0u8; 4];
        for sample in input.chunks_exact(from) {
            output.extend_from_slice(&padding[..to - from]);
            output.extend_from_slice(sample);
        }
    } else {
        for sample in input.chunks_exact(from) {
            output.extend_from_slice(&sample[from - to..]);
        }
    }

    Ok(output)
}

const fn align_down(n: usize, frame: usize) -> usize {
    if frame == 0 {
        0
    } else {
        n - n % frame
    }
}

const fn align_up(n: usize, frame: usize) -> usize {
    match frame {
        0 => n,
        frame => n.div_ceil(frame) * frame,
    }
}
