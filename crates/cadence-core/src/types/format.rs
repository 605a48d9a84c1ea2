//! PCM sample format description and time/sample/byte conversions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Layout of interleaved, signed little-endian PCM.
///
/// "Samples" in the conversion helpers are per channel, i.e. one sample is
/// one frame across all channels. A zero `bits_per_sample` means the format
/// has not been negotiated yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SampleFormat {
    pub channels: u8,
    pub bits_per_sample: u8,
    pub sample_rate: u32,
    /// Total samples in the stream, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_samples: Option<u64>,
}

impl SampleFormat {
    /// Bit depths an output device can be negotiated to.
    pub const SUPPORTED_BITS: [u8; 4] = [8, 16, 24, 32];

    pub const fn new(channels: u8, bits_per_sample: u8, sample_rate: u32) -> Self {
        Self {
            channels,
            bits_per_sample,
            sample_rate,
            total_samples: None,
        }
    }

    pub const fn with_total_samples(mut self, total: u64) -> Self {
        self.total_samples = Some(total);
        self
    }

    pub const fn with_bits(mut self, bits_per_sample: u8) -> Self {
        self.bits_per_sample = bits_per_sample;
        self
    }

    /// Whether every field needed to size buffers is set.
    pub const fn is_set(&self) -> bool {
        self.channels > 0 && self.bits_per_sample > 0 && self.sample_rate > 0
    }

    /// Whether the bit depth is one a device accepts.
    pub fn has_device_bits(&self) -> bool {
        Self::SUPPORTED_BITS.contains(&self.bits_per_sample)
    }

    /// Same channel count and sample rate; bit depth may differ.
    pub const fn same_layout(&self, other: &Self) -> bool {
        self.channels == other.channels && self.sample_rate == other.sample_rate
    }

    pub const fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Bytes in one interleaved frame (one sample for every channel).
    pub const fn frame_size(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub const fn samples_to_bytes(&self, samples: u64) -> usize {
        samples as usize * self.frame_size()
    }

    pub const fn bytes_to_samples(&self, bytes: usize) -> u64 {
        match self.frame_size() {
            0 => 0,
            frame => (bytes / frame) as u64,
        }
    }

    pub fn time_to_samples(&self, time: Duration) -> u64 {
        (u128::from(self.sample_rate) * time.as_nanos() / NANOS_PER_SEC) as u64
    }

    pub fn samples_to_time(&self, samples: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = u128::from(samples) * NANOS_PER_SEC / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    /// Byte length of `time` worth of audio, always a whole number of frames.
    pub fn time_to_bytes(&self, time: Duration) -> usize {
        self.samples_to_bytes(self.time_to_samples(time))
    }

    pub fn bytes_to_time(&self, bytes: usize) -> Duration {
        self.samples_to_time(self.bytes_to_samples(bytes))
    }

    /// Stream length derived from `total_samples`.
    pub fn duration(&self) -> Option<Duration> {
        self.total_samples.map(|total| self.samples_to_time(total))
    }
}

/// Equality ignores `total_samples`: stream and device formats are compared
/// by what the device has to be configured for.
impl PartialEq for SampleFormat {
    fn eq(&self, other: &Self) -> bool {
        self.channels == other.channels
            && self.bits_per_sample == other.bits_per_sample
            && self.sample_rate == other.sample_rate
    }
}

impl Eq for SampleFormat {}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ch {}bit {}Hz",
            self.channels, self.bits_per_sample, self.sample_rate
        )
    }
}
