//! Decoder contracts and the symphonia-backed implementation.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use cadence_core::{Error, Result, SampleFormat, Track};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};
use tracing::{debug, trace, warn};

/// How a [`Decoder::decode`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// More data may follow.
    Ok,
    /// The track has no more samples; the bytes written are the last.
    Eof,
}

/// Turns one track into interleaved PCM.
pub trait Decoder: Send {
    fn seek(&mut self, position: Duration) -> Result<()>;

    /// Position of the next sample `decode` will produce.
    fn tell(&self) -> Duration;

    /// Total length, or zero when unknown.
    fn duration(&self) -> Duration;

    /// Format of the produced PCM, including `total_samples` when known.
    fn format(&self) -> SampleFormat;

    /// Fill `buf` with whole frames. Returns the bytes written and whether
    /// the end of the track was reached.
    fn decode(&mut self, buf: &mut [u8]) -> Result<(usize, DecodeStatus)>;

    /// Rewind to the start and drop any buffered output.
    fn reset(&mut self);

    /// False once the decoder hit an unrecoverable error.
    fn is_valid(&self) -> bool;
}

/// Opens decoders for playlist tracks.
pub trait DecoderManager: Send + Sync {
    fn open(&self, track: &Track) -> Result<Box<dyn Decoder>>;
}

/// Decoder for local files using symphonia's probe and codec registry.
///
/// Output is signed little-endian PCM at the source bit depth rounded up to
/// a whole byte. Codecs that do not report a bit depth (the lossy ones)
/// decode to 16 bits.
pub struct SymphoniaDecoder {
    name: String,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    format: SampleFormat,
    /// Converted bytes not yet handed out.
    pending: Vec<u8>,
    pending_offset: usize,
    frames_out: u64,
    finished: bool,
    valid: bool,
}

impl SymphoniaDecoder {
    /// Probe and open a local file.
    pub fn open(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let file = File::open(path).map_err(|e| Error::decode(&name, e))?;
        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::decode(&name, format!("Failed to probe format: {e}")))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::decode(&name, "No audio tracks found"))?;

        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::decode(&name, "Unknown sample rate"))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .filter(|&c| c > 0 && c <= usize::from(u8::MAX))
            .ok_or_else(|| Error::decode(&name, "Unsupported channel layout"))?;
        let bits = output_bits(params.bits_per_sample);

        let mut format = SampleFormat::new(channels as u8, bits, sample_rate);
        if let Some(frames) = params.n_frames {
            format = format.with_total_samples(frames);
        }

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| Error::decode(&name, format!("Failed to create decoder: {e}")))?;
        let track_id = track.id;

        debug!("Opened '{}': track={}, format={}", name, track_id, format);

        Ok(Self {
            name,
            reader,
            decoder,
            track_id,
            format,
            pending: Vec::new(),
            pending_offset: 0,
            frames_out: 0,
            finished: false,
            valid: true,
        })
    }

    /// Decode the next packet of our track into `pending`.
    ///
    /// Returns false at end of stream.
    fn refill(&mut self) -> Result<bool> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    debug!("'{}' requires a decoder reset, treating as end", self.name);
                    return Ok(false);
                }
                Err(e) => {
                    self.valid = false;
                    return Err(Error::decode(
                        &self.name,
                        format!("Failed to read packet: {e}"),
                    ));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Corrupt packet in '{}' (skipping): {e}", self.name);
                    continue;
                }
                Err(e) => {
                    self.valid = false;
                    return Err(Error::decode(&self.name, format!("Decode failed: {e}")));
                }
            };

            if decoded.frames() == 0 {
                continue;
            }

            let mut samples = SampleBuffer::<i32>::new(decoded.capacity() as u64, *decoded.spec());
            samples.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending_offset = 0;
            let width = self.format.bytes_per_sample();
            for sample in samples.samples() {
                // Full-scale i32; keep the most significant bytes.
                self.pending
                    .extend_from_slice(&sample.to_le_bytes()[4 - width..]);
            }
            trace!("Decoded {} bytes from '{}'", self.pending.len(), self.name);
            return Ok(true);
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn seek(&mut self, position: Duration) -> Result<()> {
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(position.as_secs_f64()),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::decode(&self.name, format!("Seek failed: {e}")))?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;
        self.finished = false;
        self.frames_out = self.format.time_to_samples(position);
        debug!(
            "Seeked '{}' to {:?} (ts {})",
            self.name, position, seeked.actual_ts
        );
        Ok(())
    }

    fn tell(&self) -> Duration {
        self.format.samples_to_time(self.frames_out)
    }

    fn duration(&self) -> Duration {
        self.format.duration().unwrap_or_default()
    }

    fn format(&self) -> SampleFormat {
        self.format
    }

    fn decode(&mut self, buf: &mut [u8]) -> Result<(usize, DecodeStatus)> {
        let frame = self.format.frame_size();
        let wanted = buf.len() - buf.len() % frame;
        let mut written = 0;

        while written < wanted {
            if self.pending_offset >= self.pending.len() && (self.finished || !self.refill()?) {
                self.finished = true;
                break;
            }
            let available = &self.pending[self.pending_offset..];
            let n = available.len().min(wanted - written);
            buf[written..written + n].copy_from_slice(&available[..n]);
            self.pending_offset += n;
            written += n;
        }

        self.frames_out += self.format.bytes_to_samples(written);
        let drained = self.pending_offset >= self.pending.len();
        let status = if self.finished && drained {
            DecodeStatus::Eof
        } else {
            DecodeStatus::Ok
        };
        Ok((written, status))
    }

    fn reset(&mut self) {
        if let Err(e) = self.seek(Duration::ZERO) {
            warn!("Failed to rewind '{}': {e}", self.name);
            self.valid = false;
        }
        self.frames_out = 0;
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Opens [`SymphoniaDecoder`]s for tracks on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoderManager;

impl DecoderManager for SymphoniaDecoderManager {
    fn open(&self, track: &Track) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(SymphoniaDecoder::open(track.path())?))
    }
}

/// Container width for a source bit depth.
fn output_bits(source: Option<u32>) -> u8 {
    match source {
        None | Some(0) => 16,
        Some(1..=8) => 8,
        Some(9..=16) => 16,
        Some(17..=24) => 24,
        Some(_) => 32,
    }
}
