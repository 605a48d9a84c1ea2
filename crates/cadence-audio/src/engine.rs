//! Playback engine driving the decode, buffer and write cycle.
//!
//! All engine state lives behind one mutex. Public operations lock it for
//! their synchronous part; the write cycle runs as executor jobs that lock
//! it per step and release it while a decoder is busy. A step either
//! re-arms the cycle (through a device write whose completion comes back as
//! a job, or by submitting the next step directly) or lets it go dormant.

use std::sync::{Arc, Weak};
use std::time::Duration;

use cadence_core::{DeviceState, Error, PcmChunk, Playlist, Result, Retreat, SampleFormat, Track};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::BufferQueue;
use crate::config::{ConfigUpdate, EngineConfig};
use crate::decode::{DecodeStatus, Decoder, DecoderManager};
use crate::executor::Executor;
use crate::sink::{AudioSink, OutputManager, WriteCompletion};
use crate::state::{self, Applied, Effect, Event, PlaybackState, Transitions};

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The playback state changed.
    StateChanged(PlaybackState),
    /// Progress through the current track, sent every write cycle.
    PlayPosition { position: Duration, duration: Duration },
    /// The playlist position moved; `None` once the playlist is exhausted.
    TrackChanged(Option<usize>),
    /// The last track ran out.
    PlaylistFinished,
}

/// An open decoder and the playlist index it was opened for.
struct Loaded {
    index: usize,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
}

impl Loaded {
    /// Reset and release the decoder.
    fn teardown(self) {
        self.decoder.lock().reset();
        trace!("Released decoder for track {}", self.index);
    }
}

struct Inner {
    state: PlaybackState,
    playlist: Playlist,
    queue: BufferQueue,
    current: Option<Loaded>,
    preloaded: Option<Loaded>,
    /// Index whose preload already failed, so it is not retried every cycle.
    preload_failed: Option<usize>,
    sink: Option<Box<dyn AudioSink>>,
    config: EngineConfig,
    /// Bumped whenever the device pipeline restarts; older jobs are stale.
    epoch: u64,
    /// Bumped whenever the playback position jumps.
    seek_generation: u64,
    /// A write cycle is alive for the current epoch.
    cycle: bool,
    in_flight: bool,
    /// Drop whatever the in-flight write leaves unwritten.
    discard_in_flight: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    executor: Arc<dyn Executor>,
    decoders: Arc<dyn DecoderManager>,
    outputs: Arc<dyn OutputManager>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(mut sink) = self.inner.get_mut().sink.take() {
            let _ = sink.cancel();
            let _ = sink.stop();
        }
    }
}

/// Gapless playback engine.
///
/// A cheap handle; clones share the same engine. No operation returns an
/// error: failures are logged and show up in [`state`](Self::state) and
/// the event stream.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<Shared>,
}

impl PlaybackEngine {
    pub fn new(
        decoders: Arc<dyn DecoderManager>,
        outputs: Arc<dyn OutputManager>,
        executor: Arc<dyn Executor>,
        config: EngineConfig,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        let inner = Inner {
            state: PlaybackState::Stopped,
            playlist: Playlist::new(),
            queue: BufferQueue::new(),
            current: None,
            preloaded: None,
            preload_failed: None,
            sink: None,
            config,
            epoch: 0,
            seek_generation: 0,
            cycle: false,
            in_flight: false,
            discard_in_flight: false,
        };

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                executor,
                decoders,
                outputs,
                events_tx,
                events_rx,
            }),
        }
    }

    fn session(&self) -> Session<'_> {
        Session::lock(&self.shared)
    }

    /// Start or resume playback.
    pub fn play(&self) {
        state::dispatch(&mut self.session(), Event::Play);
    }

    pub fn pause(&self) {
        state::dispatch(&mut self.session(), Event::Pause);
    }

    /// Stop playback. A no-op when already stopped.
    pub fn stop(&self) {
        state::dispatch(&mut self.session(), Event::Stop);
    }

    /// Move within the current track.
    pub fn seek(&self, position: Duration) {
        self.session().seek(position);
    }

    /// Position in the current track; zero unless playing or paused.
    pub fn tell(&self) -> Duration {
        let session = self.session();
        if !session.inner.state.has_position() {
            return Duration::ZERO;
        }
        session
            .progress()
            .map_or(Duration::ZERO, |(position, _)| position)
    }

    pub fn state(&self) -> PlaybackState {
        self.session().inner.state
    }

    /// Skip to the next track.
    pub fn next(&self) {
        let mut session = self.session();
        session.inner.playlist.advance();
        session.track_moved();
    }

    /// Go back one track, or rewind the current one when it is the first.
    pub fn previous(&self) {
        let mut session = self.session();
        match session.inner.playlist.retreat() {
            Retreat::Moved => session.track_moved(),
            Retreat::AtStart => session.seek(Duration::ZERO),
        }
    }

    pub fn jump_to(&self, index: usize) {
        let mut session = self.session();
        if session.inner.playlist.jump_to(index).is_none() {
            warn!(
                "Cannot jump to track {}: playlist has {} tracks",
                index,
                session.inner.playlist.len()
            );
            return;
        }
        session.track_moved();
    }

    /// Replace the playlist, stopping playback and starting over at its
    /// first track.
    pub fn set_playlist(&self, playlist: Playlist) {
        let mut session = self.session();
        state::dispatch(&mut session, Event::Stop);
        session.reset_pipeline();

        info!("Playlist changed: {} tracks", playlist.len());
        session.inner.playlist = playlist;
        session.inner.playlist.rewind();
        let first = session.inner.playlist.has_current().then_some(0);
        session.emit(EngineEvent::TrackChanged(first));
    }

    pub fn playlist(&self) -> Playlist {
        self.session().inner.playlist.clone()
    }

    /// The active output device went away or was switched.
    pub fn output_device_changed(&self) {
        state::dispatch(&mut self.session(), Event::SinkChange);
    }

    pub fn update_config(&self, update: ConfigUpdate) {
        let mut session = self.session();
        match session.inner.config.apply(update) {
            Ok(()) => debug!("Config updated: {:?}", update),
            Err(e) => warn!("Ignoring config update {:?}: {e}", update),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.session().inner.config.clone()
    }

    /// Stop playback and release the output device.
    pub fn shutdown(&self) {
        let mut session = self.session();
        state::dispatch(&mut session, Event::Stop);
        session.reset_pipeline();
        if let Some(mut sink) = session.inner.sink.take() {
            if let Err(e) = sink.cancel() {
                debug!("Cancel on shutdown failed: {e}");
            }
            if let Err(e) = sink.stop() {
                debug!("Stop on shutdown failed: {e}");
            }
        }
        info!("Playback engine shut down");
    }

    /// A receiver for engine events.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.shared.events_rx.clone()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.shared.events_rx.try_recv().ok()
    }

    /// Receive events, blocking until one is available.
    pub fn recv_event(&self) -> Option<EngineEvent> {
        self.shared.events_rx.recv().ok()
    }
}

/// The engine, locked.
struct Session<'a> {
    shared: &'a Arc<Shared>,
    inner: MutexGuard<'a, Inner>,
}

impl<'a> Session<'a> {
    fn lock(shared: &'a Arc<Shared>) -> Self {
        Self {
            shared,
            inner: shared.inner.lock(),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.shared.events_tx.send(event);
    }

    /// Run `step` on the executor against the engine, if it still exists.
    fn submit(&self, step: impl FnOnce(&mut Session<'_>) + Send + 'static) {
        let weak: Weak<Shared> = Arc::downgrade(self.shared);
        self.shared.executor.submit(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                step(&mut Session::lock(&shared));
            }
        }));
    }

    /// Queue the next write cycle step.
    fn rearm(&self) {
        let epoch = self.inner.epoch;
        self.submit(move |session| session.write_handler(epoch, Ok(())));
    }

    /// Bootstrap the write cycle unless one is already running.
    fn kick(&mut self) {
        if self.inner.state == PlaybackState::Playing && !self.inner.cycle {
            self.inner.cycle = true;
            trace!("Starting write cycle (epoch {})", self.inner.epoch);
            self.rearm();
        }
    }

    /// Abandon the running cycle; its pending jobs become stale.
    fn bump_epoch(&mut self) {
        self.inner.epoch += 1;
        self.inner.cycle = false;
        self.inner.in_flight = false;
        self.inner.discard_in_flight = false;
    }

    /// Drop queued audio after the position jumped.
    fn flush(&mut self) {
        self.inner.queue.clear();
        self.inner.discard_in_flight = self.inner.in_flight;
        self.inner.seek_generation += 1;
    }

    /// Release both decoders and all queued audio, and orphan the cycle.
    fn reset_pipeline(&mut self) {
        if let Some(current) = self.inner.current.take() {
            current.teardown();
        }
        if let Some(preloaded) = self.inner.preloaded.take() {
            preloaded.teardown();
        }
        self.inner.preload_failed = None;
        self.inner.queue.clear();
        self.bump_epoch();
    }

    fn progress(&self) -> Option<(Duration, Duration)> {
        let current = self.inner.current.as_ref()?;
        let decoder = current.decoder.lock();
        Some((decoder.tell(), decoder.duration()))
    }

    fn track_at(&self, index: usize) -> Result<Track> {
        self.inner
            .playlist
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no track at index {index}")))
    }

    fn loaded(index: usize, track: &Track, decoder: Box<dyn Decoder>) -> Loaded {
        debug!(
            "Opened decoder for track {} ({}): {}",
            index,
            track.display_name(),
            decoder.format()
        );
        Loaded {
            index,
            decoder: Arc::new(Mutex::new(decoder)),
        }
    }

    /// Open a decoder with the engine locked, for state transitions.
    fn open_track(&self, index: usize) -> Result<Loaded> {
        let track = self.track_at(index)?;
        let decoder = self.shared.decoders.open(&track)?;
        Ok(Self::loaded(index, &track, decoder))
    }

    /// Open a decoder from the write cycle with the engine unlocked.
    ///
    /// Returns `None` when the pipeline restarted or the position moved while
    /// the file was being opened; the result no longer applies then.
    fn open_track_unlocked(&mut self, index: usize) -> Result<Option<Loaded>> {
        let track = self.track_at(index)?;
        let epoch = self.inner.epoch;
        let generation = self.inner.seek_generation;
        let shared = self.shared;

        let opened = MutexGuard::unlocked(&mut self.inner, || shared.decoders.open(&track));

        if self.inner.epoch != epoch || self.inner.seek_generation != generation {
            trace!("Position moved while opening track {}", index);
            if let Ok(decoder) = opened {
                Self::loaded(index, &track, decoder).teardown();
            }
            return Ok(None);
        }
        opened.map(|decoder| Some(Self::loaded(index, &track, decoder)))
    }

    /// Take the preloaded decoder if it was opened for `index` and can
    /// still decode.
    fn adopt_preload(&mut self, index: usize) -> Option<Loaded> {
        if !self.inner.preloaded.as_ref().is_some_and(|p| p.index == index) {
            return None;
        }
        let preloaded = self.inner.preloaded.take()?;
        let valid = preloaded.decoder.lock().is_valid();
        if valid {
            return Some(preloaded);
        }
        warn!("Preloaded decoder for track {} is unusable, reopening", index);
        preloaded.teardown();
        None
    }

    /// Keep the current decoder if it belongs to the current position, or
    /// adopt a matching preload. Returns whether a decoder is ready.
    fn reuse_decoder(&mut self) -> bool {
        let index = self.inner.playlist.position();
        if self.inner.current.as_ref().is_some_and(|c| c.index == index) {
            return true;
        }
        if let Some(stale) = self.inner.current.take() {
            stale.teardown();
        }
        if let Some(preloaded) = self.adopt_preload(index) {
            debug!("Adopting preloaded decoder for track {}", index);
            self.inner.current = Some(preloaded);
            return true;
        }
        false
    }

    /// Make sure the current decoder belongs to the current position.
    fn ensure_decoder(&mut self) -> Result<()> {
        if !self.reuse_decoder() {
            let index = self.inner.playlist.position();
            self.inner.current = Some(self.open_track(index)?);
        }
        Ok(())
    }

    /// The cycle of `epoch` must not go on: it is stale, or playback left
    /// the Playing state while the engine was unlocked.
    fn cycle_interrupted(&mut self, epoch: u64) -> bool {
        if epoch != self.inner.epoch {
            return true;
        }
        if self.inner.state != PlaybackState::Playing {
            self.inner.cycle = false;
            return true;
        }
        false
    }

    fn current_format(&self) -> Option<SampleFormat> {
        self.inner
            .current
            .as_ref()
            .map(|c| c.decoder.lock().format())
    }

    fn sink_mut(&mut self) -> Result<&mut Box<dyn AudioSink>> {
        self.inner
            .sink
            .as_mut()
            .ok_or_else(|| Error::Internal("no output sink".to_string()))
    }

    /// Swap in a fresh sink for the active output device.
    fn replace_sink(&mut self) -> Result<()> {
        if let Some(mut old) = self.inner.sink.take() {
            if let Err(e) = old.cancel() {
                debug!("Cancel on '{}' failed: {e}", old.name());
            }
            if let Err(e) = old.stop() {
                debug!("Stop on '{}' failed: {e}", old.name());
            }
        }
        let sink = self.shared.outputs.create_sink()?;
        info!("Using output device '{}'", sink.name());
        self.inner.sink = Some(sink);
        Ok(())
    }

    /// Open the current track, configure the device for it and start it.
    fn start_current(&mut self) -> Result<()> {
        self.ensure_decoder()?;
        let stream = self
            .current_format()
            .ok_or_else(|| Error::Internal("no current decoder".to_string()))?;

        let sink = self.sink_mut()?;
        let device = sink.prepare(stream)?;
        if !device.same_layout(&stream) || !device.has_device_bits() {
            return Err(Error::FormatMismatch { stream, device });
        }
        if device.bits_per_sample != stream.bits_per_sample {
            debug!(
                "Device '{}' accepted {} for a {} stream",
                sink.name(),
                device,
                stream
            );
        }
        sink.play()
    }

    fn open_and_start(&mut self) -> Result<Applied> {
        if self.inner.playlist.is_empty() {
            debug!("Nothing to play: playlist is empty");
            return Ok(Applied::Skipped);
        }
        if !self.inner.playlist.has_current() {
            self.inner.playlist.rewind();
        }

        let reusable = self
            .inner
            .sink
            .as_ref()
            .is_some_and(|s| s.state() != DeviceState::Error);
        if !reusable {
            self.replace_sink()?;
        }

        self.inner.queue.clear();
        self.bump_epoch();
        self.start_current()?;
        Ok(Applied::Done)
    }

    fn stop_sink(&mut self) -> Result<Applied> {
        let result = match self.inner.sink.as_mut() {
            Some(sink) => sink.stop(),
            None => Ok(()),
        };
        self.reset_pipeline();
        result.map(|()| Applied::Done)
    }

    /// Move playback to a new sink and carry on from the same position.
    fn reopen(&mut self, paused: bool) -> Result<Applied> {
        let position = self.progress().map_or(Duration::ZERO, |(p, _)| p);
        info!("Output device changed, resuming at {:?}", position);

        if let Some(sink) = self.inner.sink.as_mut() {
            if let Err(e) = sink.stop() {
                debug!("Stop on the old device failed: {e}");
            }
        }
        self.reset_pipeline();
        self.replace_sink()?;
        self.start_current()?;

        if let Some(current) = &self.inner.current {
            current.decoder.lock().seek(position)?;
        }
        if paused {
            self.sink_mut()?.pause()?;
        } else {
            self.kick();
        }
        Ok(Applied::Done)
    }

    fn seek(&mut self, position: Duration) {
        if !self.inner.state.has_position() {
            debug!("Ignoring seek while {}", self.inner.state);
            return;
        }
        let Some(current) = &self.inner.current else {
            return;
        };
        if let Err(e) = current.decoder.lock().seek(position) {
            warn!("Seek in track {} failed: {e}", current.index);
            return;
        }
        debug!("Seeked track {} to {:?}", current.index, position);
        self.flush();
        self.kick();
    }

    /// Follow an explicit move of the playlist position: tear down the
    /// current decoder and keep the preloaded one only if it was opened for
    /// the new position.
    fn track_moved(&mut self) {
        let target = self.inner.playlist.position();
        if let Some(current) = self.inner.current.take() {
            current.teardown();
        }
        if let Some(preloaded) = self.adopt_preload(target) {
            debug!("Adopting preloaded decoder for track {}", target);
            self.inner.current = Some(preloaded);
        }
        if let Some(other) = self.inner.preloaded.take() {
            other.teardown();
        }
        self.inner.preload_failed = None;
        self.flush();

        debug!("Moved to track {}", target);
        self.emit(EngineEvent::TrackChanged(
            self.inner.playlist.has_current().then_some(target),
        ));
        self.kick();
    }

    /// Continue after the current decoder ran out.
    fn advance_track(&mut self) {
        if let Some(current) = self.inner.current.take() {
            current.teardown();
        }
        self.inner.playlist.advance();
        self.inner.preload_failed = None;

        let index = self.inner.playlist.position();
        if let Some(preloaded) = self.adopt_preload(index) {
            debug!("Gapless transition to track {}", index);
            self.inner.current = Some(preloaded);
        }
        if let Some(other) = self.inner.preloaded.take() {
            other.teardown();
        }
        self.emit(EngineEvent::TrackChanged(
            self.inner.playlist.has_current().then_some(index),
        ));
    }

    /// Publish the position and open the next track early when the current
    /// one is nearly done.
    fn report_progress(&mut self) {
        let Some((position, duration)) = self.progress() else {
            return;
        };
        self.emit(EngineEvent::PlayPosition { position, duration });

        let remaining = duration.saturating_sub(position);
        if duration.is_zero()
            || remaining >= self.inner.config.gapless_preload_time
            || self.inner.preloaded.is_some()
        {
            return;
        }
        let Some(next) = self.inner.playlist.next_index() else {
            return;
        };
        if self.inner.preload_failed == Some(next) {
            return;
        }
        match self.open_track_unlocked(next) {
            Ok(Some(loaded)) => {
                debug!("Preloaded track {} with {:?} left", next, remaining);
                self.inner.preloaded = Some(loaded);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to preload track {}: {e}", next);
                self.inner.preload_failed = Some(next);
            }
        }
    }

    /// Stop, skip the track that failed and try the one after it.
    fn recover_from_decode_failure(&mut self, err: &Error) {
        let index = self.inner.playlist.position();
        let name = self
            .inner
            .playlist
            .get(index)
            .map(|t| t.display_name())
            .unwrap_or_default();
        warn!("Skipping track {} ({}): {err}", index, name);

        state::dispatch(self, Event::Stop);
        self.inner.playlist.advance();
        let index = self.inner.playlist.position();
        self.emit(EngineEvent::TrackChanged(
            self.inner.playlist.has_current().then_some(index),
        ));
        if self.inner.playlist.has_current() {
            state::dispatch(self, Event::Play);
        }
    }

    /// The playlist ran out: stop once the device had time to drain.
    fn finish_playlist(&mut self) {
        info!("Playlist finished");
        self.emit(EngineEvent::PlaylistFinished);

        let epoch = self.inner.epoch;
        let grace = self.inner.config.end_of_stream_grace;
        let weak = Arc::downgrade(self.shared);
        self.shared.executor.submit(Box::new(move || {
            if !grace.is_zero() {
                std::thread::sleep(grace);
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut session = Session::lock(&shared);
            if session.inner.epoch != epoch {
                return;
            }
            if session.inner.playlist.has_current() {
                // Moved back onto a track during the grace period.
                session.inner.cycle = false;
                session.kick();
                return;
            }
            state::dispatch(&mut session, Event::Stop);
            session.inner.playlist.rewind();
            let first = session.inner.playlist.has_current().then_some(0);
            session.emit(EngineEvent::TrackChanged(first));
        }));
    }

    /// One step of the write cycle, run after every write completion.
    fn write_handler(&mut self, epoch: u64, status: Result<()>) {
        if epoch != self.inner.epoch {
            trace!("Dropping stale write cycle step (epoch {})", epoch);
            return;
        }
        if self.inner.state != PlaybackState::Playing {
            trace!("Write cycle dormant while {}", self.inner.state);
            self.inner.cycle = false;
            return;
        }

        self.report_progress();
        if self.cycle_interrupted(epoch) {
            return;
        }

        match status {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => {
                trace!("Write cancelled");
                self.inner.cycle = false;
                return;
            }
            Err(e) => {
                error!("Write to the output device failed: {e}");
                state::dispatch(self, Event::Stop);
                return;
            }
        }

        if !self.inner.playlist.has_current() {
            if self.inner.queue.is_empty() {
                self.finish_playlist();
            } else {
                self.read_handler();
            }
            return;
        }

        if !self.reuse_decoder() {
            let index = self.inner.playlist.position();
            let opened = self.open_track_unlocked(index);
            if epoch != self.inner.epoch {
                return;
            }
            let paused = self.inner.state != PlaybackState::Playing;
            match opened {
                Ok(Some(loaded)) => self.inner.current = Some(loaded),
                Ok(None) => {
                    self.rearm();
                    return;
                }
                // Retried once playback resumes.
                Err(_) if paused => {}
                Err(e) => {
                    self.recover_from_decode_failure(&e);
                    return;
                }
            }
            if self.cycle_interrupted(epoch) {
                return;
            }
        }

        if !self.inner.queue.is_empty() {
            self.read_handler();
            return;
        }

        self.decode_step();
    }

    /// Decode one buffer's worth from the current track and queue it.
    fn decode_step(&mut self) {
        let Some(current) = &self.inner.current else {
            return;
        };
        let decoder = Arc::clone(&current.decoder);
        let index = current.index;
        let epoch = self.inner.epoch;
        let generation = self.inner.seek_generation;
        let buffer_time = self.inner.config.buffer_time;

        let outcome = MutexGuard::unlocked(&mut self.inner, || {
            let mut decoder = decoder.lock();
            let format = decoder.format();
            if !format.is_set() {
                return Err(Error::InvalidFormat(format!("decoder reports {format}")));
            }
            let mut chunk = PcmChunk::zeroed(
                format,
                format.time_to_bytes(buffer_time).max(format.frame_size()),
            );
            let requested = chunk.len();
            decoder.decode(chunk.as_mut_bytes()).map(|(n, status)| {
                chunk.truncate(n);
                (chunk, requested, status)
            })
        });

        if self.inner.epoch != epoch {
            return;
        }
        if self.inner.seek_generation != generation {
            trace!("Position moved during decode, dropping chunk");
            self.rearm();
            return;
        }

        let (chunk, requested, status) = match outcome {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Decoding track {} failed: {e}", index);
                self.recover_from_decode_failure(&e);
                return;
            }
        };
        trace!(
            "Decoded {} of {} bytes from track {}",
            chunk.len(),
            requested,
            index
        );

        if chunk.len() < requested && status == DecodeStatus::Eof {
            self.advance_track();
        }

        if chunk.is_empty() {
            self.rearm();
            return;
        }

        let Some(chunk) = self.match_device(chunk) else {
            return;
        };
        self.inner.queue.push_back(chunk);
        self.read_handler();
    }

    /// Bring a chunk to the device's bit depth, or restart the device when
    /// the layout changed.
    fn match_device(&mut self, chunk: PcmChunk) -> Option<PcmChunk> {
        let device = self.inner.sink.as_ref()?.current_format();
        let stream = chunk.format();
        if stream == device {
            return Some(chunk);
        }

        if stream.same_layout(&device) {
            return match chunk.convert_bits(device.bits_per_sample) {
                Ok(converted) => Some(converted),
                Err(e) => {
                    error!("Cannot convert {} to {}: {e}", stream, device);
                    state::dispatch(self, Event::Stop);
                    None
                }
            };
        }

        info!(
            "Stream format {} does not fit device format {}, reconfiguring",
            stream, device
        );
        state::dispatch(self, Event::Stop);
        state::dispatch(self, Event::Play);
        None
    }

    /// Hand the front of the queue to the device.
    fn read_handler(&mut self) {
        if self.inner.state != PlaybackState::Playing {
            self.inner.cycle = false;
            return;
        }

        let limit = self.inner.queue.front().map_or(0, |chunk| {
            chunk.format().time_to_bytes(self.inner.config.buffer_time)
        });
        let Some(chunk) = self.inner.queue.pop_bytes(limit) else {
            self.rearm();
            return;
        };

        let epoch = self.inner.epoch;
        let weak = Arc::downgrade(self.shared);
        let executor = Arc::clone(&self.shared.executor);
        self.inner.in_flight = true;
        self.inner.discard_in_flight = false;
        trace!(
            "Writing {} bytes, {} left queued",
            chunk.len(),
            self.inner.queue.queued_bytes()
        );

        let Some(sink) = self.inner.sink.as_mut() else {
            self.inner.in_flight = false;
            self.inner.cycle = false;
            return;
        };
        sink.write_async(
            chunk,
            Box::new(move |completion| {
                // Never re-enter the engine from the device's callback.
                executor.submit(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        Session::lock(&shared).write_completed(epoch, completion);
                    }
                }));
            }),
        );
    }

    fn write_completed(&mut self, epoch: u64, completion: WriteCompletion) {
        if epoch != self.inner.epoch {
            trace!("Releasing chunk from a stopped write cycle");
            return;
        }
        self.inner.in_flight = false;
        let discard = std::mem::take(&mut self.inner.discard_in_flight);

        let WriteCompletion { mut chunk, result } = completion;
        let status = result.map(|written| {
            trace!("Device took {} of {} bytes", written, chunk.len());
            chunk.consume(written);
        });
        let requeue = match &status {
            Ok(()) => true,
            Err(e) => !e.is_cancellation(),
        };
        if requeue && !discard {
            self.inner.queue.push_front(chunk);
        }

        self.write_handler(epoch, status);
    }
}

impl Transitions for Session<'_> {
    fn current(&self) -> PlaybackState {
        self.inner.state
    }

    fn apply(&mut self, effect: Effect) -> Result<Applied> {
        match effect {
            Effect::OpenAndStart => self.open_and_start(),
            Effect::PauseSink => self.sink_mut()?.pause().map(|()| Applied::Done),
            Effect::ResumeSink => self.sink_mut()?.play().map(|()| Applied::Done),
            Effect::StopSink => self.stop_sink(),
            Effect::AcquireSink => self.replace_sink().map(|()| Applied::Done),
            Effect::Reopen { paused } => self.reopen(paused),
            Effect::Revalidate => {
                if !self.inner.playlist.has_current() {
                    self.inner.playlist.rewind();
                }
                Ok(Applied::Done)
            }
        }
    }

    fn change_state(&mut self, next: PlaybackState) -> PlaybackState {
        let previous = std::mem::replace(&mut self.inner.state, next);
        self.emit(EngineEvent::StateChanged(next));

        if next == PlaybackState::Playing {
            debug_assert!(
                self.inner
                    .sink
                    .as_ref()
                    .is_some_and(|s| s.state() == DeviceState::Playing),
                "entered Playing with an idle device"
            );
            self.kick();
        }
        previous
    }
}
