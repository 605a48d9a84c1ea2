//! Test doubles for driving the playback engine deterministically.
//!
//! - `ManualExecutor` queues jobs and runs them when the test says so
//! - `MockDecoderManager` hands out decoders producing a known byte pattern
//! - `MockOutputManager` hands out sinks that record calls and can complete
//!   writes partially or on demand
//! - every call lands in one ordered `Journal`

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_audio::{
    AudioSink, DecodeStatus, Decoder, DecoderManager, EngineConfig, EngineEvent, Executor, Job,
    OutputManager, PlaybackEngine, PlaybackState, WriteCallback, WriteCompletion,
};
use cadence_core::{DeviceState, Error, PcmChunk, Playlist, Result, SampleFormat, Track};
use parking_lot::Mutex;

pub const CD: SampleFormat = SampleFormat::new(2, 16, 44_100);

/// Value of the byte at `offset` in every mock track.
pub fn pattern(offset: usize) -> u8 {
    (offset % 251) as u8
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Open(usize),
    Decode(usize),
    Prepare(SampleFormat),
    Play,
    Pause,
    Stop,
    Cancel,
    Write {
        len: usize,
        first: Option<u8>,
        format: SampleFormat,
    },
}

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Entry>>>);

impl Journal {
    pub fn record(&self, entry: Entry) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0.lock().clone()
    }

    pub fn count(&self, wanted: &Entry) -> usize {
        self.0.lock().iter().filter(|e| *e == wanted).count()
    }

    pub fn decodes(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| matches!(e, Entry::Decode(_)))
            .count()
    }

    pub fn writes(&self) -> Vec<(usize, Option<u8>, SampleFormat)> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                Entry::Write { len, first, format } => Some((*len, *first, *format)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualExecutor {
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run the oldest queued job, if any.
    pub fn run_one(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until none are left, including ones queued along the way.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
            assert!(ran < 100_000, "executor never went idle");
        }
        ran
    }
}

impl Executor for ManualExecutor {
    fn submit(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

// ============================================================================
// Decoders
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct MockTrack {
    pub format: SampleFormat,
    pub duration: Duration,
    pub fail_open: bool,
    pub fail_decode: bool,
}

impl MockTrack {
    pub fn new(format: SampleFormat, duration: Duration) -> Self {
        Self {
            format,
            duration,
            fail_open: false,
            fail_decode: false,
        }
    }

    pub fn cd(millis: u64) -> Self {
        Self::new(CD, Duration::from_millis(millis))
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }
}

pub struct MockDecoder {
    index: usize,
    track: MockTrack,
    total: usize,
    pos: usize,
    journal: Journal,
}

impl Decoder for MockDecoder {
    fn seek(&mut self, position: Duration) -> Result<()> {
        self.pos = self.track.format.time_to_bytes(position).min(self.total);
        Ok(())
    }

    fn tell(&self) -> Duration {
        self.track.format.bytes_to_time(self.pos)
    }

    fn duration(&self) -> Duration {
        self.track.format.bytes_to_time(self.total)
    }

    fn format(&self) -> SampleFormat {
        let frames = self.track.format.bytes_to_samples(self.total);
        self.track.format.with_total_samples(frames)
    }

    fn decode(&mut self, buf: &mut [u8]) -> Result<(usize, DecodeStatus)> {
        self.journal.record(Entry::Decode(self.index));
        if self.track.fail_decode {
            return Err(Error::decode(format!("track-{}", self.index), "corrupt"));
        }
        let frame = self.track.format.frame_size();
        let wanted = buf.len() - buf.len() % frame;
        let n = wanted.min(self.total - self.pos);
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            *byte = pattern(self.pos + i);
        }
        self.pos += n;
        let status = if n < wanted {
            DecodeStatus::Eof
        } else {
            DecodeStatus::Ok
        };
        Ok((n, status))
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn is_valid(&self) -> bool {
        !self.track.fail_decode
    }
}

/// Runs once, from inside `open`, when the given track is opened.
type OpenHook = (usize, Box<dyn FnOnce() + Send>);

pub struct MockDecoderManager {
    tracks: Vec<MockTrack>,
    journal: Journal,
    on_open: Mutex<Option<OpenHook>>,
}

impl MockDecoderManager {
    pub fn playlist(&self) -> Playlist {
        Playlist::from_tracks(
            (0..self.tracks.len())
                .map(|i| Track::new(format!("track-{i}.wav")))
                .collect(),
        )
    }
}

impl DecoderManager for MockDecoderManager {
    fn open(&self, track: &Track) -> Result<Box<dyn Decoder>> {
        let index: usize = track
            .path()
            .to_str()
            .and_then(|p| p.strip_prefix("track-"))
            .and_then(|p| p.strip_suffix(".wav"))
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::decode(track.display_name(), "unknown track"))?;
        self.journal.record(Entry::Open(index));

        let hook = {
            let mut on_open = self.on_open.lock();
            match on_open.take() {
                Some((wanted, hook)) if wanted == index => Some(hook),
                other => {
                    *on_open = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }

        let mock = self.tracks[index];
        if mock.fail_open {
            return Err(Error::decode(track.display_name(), "unsupported codec"));
        }
        Ok(Box::new(MockDecoder {
            index,
            track: mock,
            total: mock.format.time_to_bytes(mock.duration),
            pos: 0,
            journal: self.journal.clone(),
        }))
    }
}

// ============================================================================
// Sinks
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct SinkOptions {
    /// Negotiate this bit depth regardless of the request.
    pub force_bits: Option<u8>,
    /// Take at most this many bytes per write.
    pub max_write: Option<usize>,
    /// Hold writes until the test completes them.
    pub deferred: bool,
}

type PendingWrite = (PcmChunk, WriteCallback);

/// State shared by the manager and every sink it created.
#[derive(Default)]
pub struct SinkShared {
    pub fail_create: AtomicBool,
    pub fail_prepare: AtomicBool,
    pub device_state: Mutex<DeviceState>,
    pending: Mutex<VecDeque<PendingWrite>>,
    created: Mutex<usize>,
}

pub struct MockSink {
    options: SinkOptions,
    shared: Arc<SinkShared>,
    journal: Journal,
    state: DeviceState,
    format: SampleFormat,
}

impl MockSink {
    fn set_state(&mut self, state: DeviceState) {
        self.state = state;
        *self.shared.device_state.lock() = state;
    }
}

impl AudioSink for MockSink {
    fn name(&self) -> &str {
        "mock"
    }

    fn assign(&mut self, _device: &str) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self, requested: SampleFormat) -> Result<SampleFormat> {
        self.journal.record(Entry::Prepare(requested));
        if self.shared.fail_prepare.load(Ordering::SeqCst) {
            self.set_state(DeviceState::Error);
            return Err(Error::device("prepare", "mock", "device unplugged"));
        }
        self.format = match self.options.force_bits {
            Some(bits) => requested.with_bits(bits),
            None => requested,
        };
        self.format.total_samples = None;
        self.set_state(DeviceState::Ready);
        Ok(self.format)
    }

    fn play(&mut self) -> Result<()> {
        self.journal.record(Entry::Play);
        self.set_state(DeviceState::Playing);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.journal.record(Entry::Pause);
        self.set_state(DeviceState::Paused);
        Ok(())
    }

    fn unpause(&mut self) -> Result<()> {
        self.play()
    }

    fn stop(&mut self) -> Result<()> {
        self.journal.record(Entry::Stop);
        self.cancel()?;
        self.set_state(DeviceState::Stopped);
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        self.journal.record(Entry::Cancel);
        let pending: Vec<_> = self.shared.pending.lock().drain(..).collect();
        for (chunk, done) in pending {
            done(WriteCompletion {
                chunk,
                result: Err(Error::Cancelled),
            });
        }
        Ok(())
    }

    fn write_async(&mut self, chunk: PcmChunk, done: WriteCallback) {
        self.journal.record(Entry::Write {
            len: chunk.len(),
            first: chunk.as_bytes().first().copied(),
            format: chunk.format(),
        });
        if self.options.deferred {
            self.shared.pending.lock().push_back((chunk, done));
            return;
        }
        let written = self
            .options
            .max_write
            .map_or(chunk.len(), |max| max.min(chunk.len()));
        done(WriteCompletion {
            chunk,
            result: Ok(written),
        });
    }

    fn write_sync(&mut self, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    fn current_format(&self) -> SampleFormat {
        self.format
    }

    fn state(&self) -> DeviceState {
        self.state
    }
}

pub struct MockOutputManager {
    options: SinkOptions,
    pub shared: Arc<SinkShared>,
    journal: Journal,
}

impl OutputManager for MockOutputManager {
    fn current_device(&self) -> String {
        "mock".to_string()
    }

    fn create_sink(&self) -> Result<Box<dyn AudioSink>> {
        if self.shared.fail_create.load(Ordering::SeqCst) {
            return Err(Error::device("open", "mock", "no such device"));
        }
        *self.shared.created.lock() += 1;
        *self.shared.device_state.lock() = DeviceState::Stopped;
        Ok(Box::new(MockSink {
            options: self.options,
            shared: Arc::clone(&self.shared),
            journal: self.journal.clone(),
            state: DeviceState::Stopped,
            format: SampleFormat::default(),
        }))
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Small buffers and no end-of-playlist grace so tests stay fast.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        buffer_time: Duration::from_millis(250),
        gapless_preload_time: Duration::from_millis(1000),
        end_of_stream_grace: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: PlaybackEngine,
    pub executor: Arc<ManualExecutor>,
    pub decoders: Arc<MockDecoderManager>,
    pub outputs: Arc<MockOutputManager>,
    pub journal: Journal,
}

impl Harness {
    pub fn new(tracks: Vec<MockTrack>, options: SinkOptions, config: EngineConfig) -> Self {
        let journal = Journal::default();
        let executor = Arc::new(ManualExecutor::default());
        let decoders = Arc::new(MockDecoderManager {
            tracks,
            journal: journal.clone(),
            on_open: Mutex::new(None),
        });
        let outputs = Arc::new(MockOutputManager {
            options,
            shared: Arc::new(SinkShared::default()),
            journal: journal.clone(),
        });

        let engine = PlaybackEngine::new(
            Arc::clone(&decoders) as Arc<dyn DecoderManager>,
            Arc::clone(&outputs) as Arc<dyn OutputManager>,
            Arc::clone(&executor) as Arc<dyn Executor>,
            config,
        );
        engine.set_playlist(decoders.playlist());

        let harness = Self {
            engine,
            executor,
            decoders,
            outputs,
            journal,
        };
        harness.events();
        harness
    }

    /// A harness whose sink holds every write until completed by the test.
    pub fn deferred(tracks: Vec<MockTrack>) -> Self {
        Self::new(
            tracks,
            SinkOptions {
                deferred: true,
                ..SinkOptions::default()
            },
            test_config(),
        )
    }

    pub fn run(&self) -> usize {
        self.executor.run_until_idle()
    }

    /// Drain every event published so far.
    pub fn events(&self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.engine.try_recv_event()).collect()
    }

    pub fn states(events: &[EngineEvent]) -> Vec<PlaybackState> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn pending_writes(&self) -> usize {
        self.outputs.shared.pending.lock().len()
    }

    /// Complete the oldest held write with `written` bytes (all of it when
    /// `None`), then let the engine react.
    pub fn complete_write(&self, written: Option<usize>) {
        let (chunk, done) = self
            .outputs
            .shared
            .pending
            .lock()
            .pop_front()
            .expect("no write in flight");
        let len = chunk.len();
        done(WriteCompletion {
            chunk,
            result: Ok(written.map_or(len, |n| n.min(len))),
        });
        self.run();
    }

    /// Fail the oldest held write.
    pub fn fail_write(&self, err: Error) {
        let (chunk, done) = self
            .outputs
            .shared
            .pending
            .lock()
            .pop_front()
            .expect("no write in flight");
        done(WriteCompletion {
            chunk,
            result: Err(err),
        });
        self.run();
    }

    pub fn device_state(&self) -> DeviceState {
        *self.outputs.shared.device_state.lock()
    }

    pub fn sinks_created(&self) -> usize {
        *self.outputs.shared.created.lock()
    }

    /// Run `hook` in the middle of opening track `index`.
    pub fn on_open(&self, index: usize, hook: impl FnOnce() + Send + 'static) {
        *self.decoders.on_open.lock() = Some((index, Box::new(hook)));
    }

    pub fn set_fail_prepare(&self, fail: bool) {
        self.outputs.shared.fail_prepare.store(fail, Ordering::SeqCst);
    }
}
