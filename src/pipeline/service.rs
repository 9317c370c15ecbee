//! Long-running worker lifecycle: start, cooperative stop, bounded wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between a run loop and its controller.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped()
    }

    /// Sleep for up to `duration`, returning early once stopped.
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SLICE));
        }
        false
    }
}

/// Result of waiting on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Running,
}

/// A controllable background worker.
pub trait Service: Send {
    fn name(&self) -> &str;

    /// Spawn the run loop. Fails if already started.
    fn start(&mut self) -> Result<()>;

    /// Ask the run loop to exit. Idempotent and non-blocking.
    fn stop(&self);

    /// Wait up to `timeout` (forever if `None`) for the run loop to exit.
    fn wait(&mut self, timeout: Option<Duration>) -> Completion;

    /// Like [`wait`](Self::wait), but a still-running loop is an [`Error::Timeout`].
    fn wait_finish(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.wait(timeout) {
            Completion::Finished => Ok(()),
            Completion::Running => Err(Error::Timeout),
        }
    }
}

/// Thread plus stop token plus completion signal; the building block every service wraps.
pub struct Worker {
    name: String,
    token: StopToken,
    handle: Option<JoinHandle<()>>,
    done: Option<flume::Receiver<()>>,
    started: bool,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: StopToken::new(),
            handle: None,
            done: None,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, run: F) -> Result<()>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        if self.started {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        // The sender is dropped when the thread ends, panicking or not
        let (done_tx, done_rx) = flume::bounded::<()>(0);
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _done = done_tx;
                run(token);
            })?;
        self.handle = Some(handle);
        self.done = Some(done_rx);
        self.started = true;
        Ok(())
    }

    pub fn stop(&self) {
        self.token.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Completion {
        let Some(done) = self.done.as_ref() else {
            return Completion::Finished;
        };
        let outcome = match timeout {
            Some(timeout) => done.recv_timeout(timeout).map_err(|e| match e {
                flume::RecvTimeoutError::Timeout => Completion::Running,
                flume::RecvTimeoutError::Disconnected => Completion::Finished,
            }),
            None => done.recv().map_err(|_| Completion::Finished),
        };
        if let Err(Completion::Running) = outcome {
            return Completion::Running;
        }

        self.done = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(service = %self.name, "service thread panicked");
            } else {
                debug!(service = %self.name, "service thread joined");
            }
        }
        Completion::Finished
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.token.stop();
    }
}
