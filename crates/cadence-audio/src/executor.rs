//! Where the engine's asynchronous steps run.
//!
//! The engine never blocks a caller on device I/O. Completions, grace delays
//! and restarts are handed to an [`Executor`] as boxed jobs.

use std::sync::Arc;

use cadence_core::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, trace, warn};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs at some later point, on any thread.
pub trait Executor: Send + Sync {
    fn submit(&self, job: Job);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn submit(&self, job: Job) {
        (**self).submit(job);
    }
}

/// Fixed-size pool of named worker threads fed through a channel.
///
/// Workers exit once the pool is dropped and the queue has drained.
pub struct ThreadPool {
    jobs: Sender<Job>,
    size: usize,
}

impl ThreadPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "thread pool needs at least one worker".to_string(),
            ));
        }

        let (jobs, rx) = unbounded::<Job>();
        for i in 0..size {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("cadence-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    trace!("Worker {} exiting", i);
                })
                .map_err(|e| Error::Internal(format!("Failed to spawn worker thread: {e}")))?;
        }
        debug!("Thread pool started with {} workers", size);

        Ok(Self { jobs, size })
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Executor for ThreadPool {
    fn submit(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("Thread pool is gone, dropping job");
        }
    }
}

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub const fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running inside.
    pub fn current() -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Internal(format!("No tokio runtime: {e}")))
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, job: Job) {
        // Jobs may sleep or wait on a device, so keep them off the async workers.
        drop(self.handle.spawn_blocking(job));
    }
}
