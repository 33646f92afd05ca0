//! Named worker threads connected by bounded channels.
//!
//! Workers own everything they use, so a worker that does not finish in time can be abandoned
//! instead of blocking the caller forever.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{Error, Result};

/// Default queue size between pipeline stages.
pub const DEFAULT_QUEUE_SIZE: usize = 10;

/// Default maximum time to wait for a worker to finish.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Signals the completion of the worker when dropped, also when the worker panics.
struct DoneGuard(mpsc::SyncSender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct Worker<T> {
    name: String,
    handle: JoinHandle<Result<T>>,
    done: Receiver<()>,
}

/// Starts a named worker thread.
pub fn spawn_worker<T, F>(name: impl Into<String>, f: F) -> Result<Worker<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let name = name.into();
    let (done_tx, done_rx) = mpsc::sync_channel(1);

    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let _guard = DoneGuard(done_tx);
        f()
    })?;

    log::debug!("Started worker '{name}'");
    Ok(Worker {
        name,
        handle,
        done: done_rx,
    })
}

impl<T> Worker<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the worker to finish and returns its result.
    /// Fails with `WorkerTimeout` when the worker does not finish within the timeout,
    /// the thread is detached in that case.
    pub fn join(self, timeout: Duration) -> Result<T> {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::error!("Worker '{}' did not finish within {timeout:?}", self.name);
                return Err(Error::WorkerTimeout(self.name, timeout));
            }
        }

        match self.handle.join() {
            Ok(result) => {
                log::debug!("Worker '{}' finished", self.name);
                result
            }
            Err(_) => Err(Error::WorkerPanic(self.name)),
        }
    }
}

/// Joins all workers and returns their results, the first error is returned.
/// All workers are joined, also when one of them failed.
pub fn join_all<T>(workers: Vec<Worker<T>>, timeout: Duration) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(workers.len());
    let mut first_error = None;

    for worker in workers {
        match worker.join(timeout) {
            Ok(value) => results.push(value),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    log::warn!("Additional worker failure: {err}");
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}
