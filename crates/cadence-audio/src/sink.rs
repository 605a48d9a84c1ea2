//! Output device contracts.
//!
//! An [`AudioSink`] is one open session on an output device. Sinks come
//! from an [`OutputManager`], which hands out a fresh sink whenever the
//! active device changes.

use cadence_core::{DeviceState, PcmChunk, Result, SampleFormat};

/// Outcome of an asynchronous write.
///
/// The chunk travels back to the caller with the result so an unwritten
/// remainder can be re-queued without copying.
#[derive(Debug)]
pub struct WriteCompletion {
    /// The chunk as it was submitted.
    pub chunk: PcmChunk,
    /// Bytes the device accepted, or why it accepted none.
    pub result: Result<usize>,
}

/// Invoked exactly once per [`AudioSink::write_async`], on any thread.
pub type WriteCallback = Box<dyn FnOnce(WriteCompletion) + Send + 'static>;

/// An open audio output session.
pub trait AudioSink: Send {
    /// Name of the device this sink is assigned to.
    fn name(&self) -> &str;

    /// Bind the sink to a named device. Only valid while stopped.
    fn assign(&mut self, device: &str) -> Result<()>;

    /// Configure the device for `requested` and return what it actually
    /// accepted. The returned format may differ; callers must compare.
    fn prepare(&mut self, requested: SampleFormat) -> Result<SampleFormat>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn unpause(&mut self) -> Result<()>;

    /// Stop the device and fail any pending writes with `Cancelled`.
    fn stop(&mut self) -> Result<()>;

    /// Fail pending writes with `Cancelled` without changing device state.
    fn cancel(&mut self) -> Result<()>;

    /// Queue `chunk` for the device. `done` receives the chunk back along
    /// with the number of bytes written, which may be less than its length.
    fn write_async(&mut self, chunk: PcmChunk, done: WriteCallback);

    /// Write as much of `data` as the device takes right now.
    fn write_sync(&mut self, data: &[u8]) -> Result<usize>;

    /// The negotiated format, or an unset format before `prepare`.
    fn current_format(&self) -> SampleFormat;

    fn state(&self) -> DeviceState;
}

/// Source of sinks for the active output device.
pub trait OutputManager: Send + Sync {
    /// Name of the device new sinks are assigned to.
    fn current_device(&self) -> String;

    /// Create a sink assigned to the current device.
    fn create_sink(&self) -> Result<Box<dyn AudioSink>>;
}
