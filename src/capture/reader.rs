//! Capture subprocess supervision.
//!
//! A [`Reader`] keeps one capture program alive, slices its stdout into
//! frames of the configured shape and pushes them into a [`FrameSink`].
//! When the program dies it is respawned after a bounded, growing delay.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::frame::{Frame, Shape};
use crate::error::{Error, Result};
use crate::ffmpeg::{CaptureProgram, ChildProcess, KillSwitch, PipeMode};
use crate::pipeline::queue::FrameSink;
use crate::pipeline::service::{Completion, Service, StopToken, Worker};
use crate::stats::SharedStats;

/// Bounded exponential delay between subprocess restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

/// Floor for any restart delay, so a zero policy cannot respawn in a tight loop.
const MIN_RESTART_DELAY: Duration = Duration::from_millis(10);

struct BackoffState {
    policy: Backoff,
    next: Duration,
}

impl BackoffState {
    fn new(policy: Backoff) -> Self {
        let policy = Backoff {
            initial: policy.initial.max(MIN_RESTART_DELAY),
            max: policy.max.max(MIN_RESTART_DELAY),
        };
        Self {
            policy,
            next: policy.initial,
        }
    }

    /// Delay to apply now; doubles the following one up to the cap.
    fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.policy.max);
        self.next = (self.next * 2).min(self.policy.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}

#[derive(Default)]
struct Progress {
    frames: Mutex<u64>,
    first_frame: Condvar,
}

impl Progress {
    fn record(&self) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        *frames += 1;
        if *frames == 1 {
            self.first_frame.notify_all();
        }
    }

    fn count(&self) -> u64 {
        *self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Static settings of a [`Reader`].
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub name: String,
    pub shape: Shape,
    pub backoff: Backoff,
}

pub struct Reader {
    config: ReaderConfig,
    program: Arc<dyn CaptureProgram>,
    sink: Arc<dyn FrameSink>,
    stats: SharedStats,
    progress: Arc<Progress>,
    current: Arc<Mutex<Option<KillSwitch>>>,
    worker: Worker,
}

impl Reader {
    pub fn new(
        config: ReaderConfig,
        program: Arc<dyn CaptureProgram>,
        sink: Arc<dyn FrameSink>,
        stats: SharedStats,
    ) -> Self {
        let worker = Worker::new(format!("capture-{}", config.name));
        Self {
            config,
            program,
            sink,
            stats,
            progress: Arc::new(Progress::default()),
            current: Arc::new(Mutex::new(None)),
            worker,
        }
    }

    /// Frames pushed since start.
    pub fn frames(&self) -> u64 {
        self.progress.count()
    }

    /// Block until the first frame has been pushed, or `timeout` elapses.
    pub fn wait_first_frame(&self, timeout: Option<Duration>) -> Result<()> {
        let frames = self.progress.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let frames = match timeout {
            Some(timeout) => {
                self.progress
                    .first_frame
                    .wait_timeout_while(frames, timeout, |n| *n == 0)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .progress
                .first_frame
                .wait_while(frames, |n| *n == 0)
                .unwrap_or_else(PoisonError::into_inner),
        };
        if *frames == 0 {
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

impl Service for Reader {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<()> {
        let capture = CaptureLoop {
            config: self.config.clone(),
            program: Arc::clone(&self.program),
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            progress: Arc::clone(&self.progress),
            current: Arc::clone(&self.current),
            keys: CaptureKeys::new(&self.config.name),
        };
        self.worker.spawn(move |token| capture.run(&token))
    }

    fn stop(&self) {
        self.worker.stop();
        // A stalled source would keep the loop blocked in read
        if let Some(process) = self.current.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            process.kill();
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Completion {
        self.worker.wait(timeout)
    }
}

struct CaptureKeys {
    looped: String,
    frame: String,
    invalid: String,
    queue: String,
    restart: String,
}

impl CaptureKeys {
    fn new(name: &str) -> Self {
        Self {
            looped: format!("capture.{name}.loop"),
            frame: format!("capture.{name}.frame"),
            invalid: format!("capture.{name}.invalid"),
            queue: format!("capture.{name}.queue"),
            restart: format!("capture.{name}.restart"),
        }
    }
}

/// Pause after a short read while the process is still alive.
const STALL_PAUSE: Duration = Duration::from_millis(10);

struct CaptureLoop {
    config: ReaderConfig,
    program: Arc<dyn CaptureProgram>,
    sink: Arc<dyn FrameSink>,
    stats: SharedStats,
    progress: Arc<Progress>,
    current: Arc<Mutex<Option<KillSwitch>>>,
    keys: CaptureKeys,
}

impl CaptureLoop {
    fn run(&self, token: &StopToken) {
        let name = &self.config.name;
        let frame_size = self.config.shape.frame_size();
        let mut backoff = BackoffState::new(self.config.backoff);
        let mut process: Option<ChildProcess> = None;
        let mut spawned_before = false;

        info!(source = %name, shape = %self.config.shape, "capture loop started");
        while token.is_running() {
            let loop_started = Instant::now();

            let Some(child) = process.as_mut() else {
                if spawned_before {
                    self.stats.incr(&self.keys.restart, 1);
                }
                let command = self.program.command(self.config.shape);
                match ChildProcess::spawn(command, PipeMode::Read, format!("capture-{name}")) {
                    Ok(child) => {
                        info!(source = %name, pid = child.id(), "capture process started");
                        self.register(Some(child.kill_switch()), token);
                        process = Some(child);
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!(source = %name, "failed to spawn capture process: {e}, retrying in {delay:?}");
                        token.sleep(delay);
                    }
                }
                spawned_before = true;
                continue;
            };

            let mut buf = vec![0u8; frame_size];
            let read_started = Instant::now();
            let read = child.read_frame(&mut buf);
            self.stats.timing(&self.keys.frame, read_started.elapsed());

            match read {
                Ok(()) => {
                    backoff.reset();
                    self.deliver(buf);
                }
                Err(e) => match child.try_exit() {
                    Ok(Some(status)) => {
                        error!(source = %name, %status, "capture process has died");
                        if let Some(dead) = process.take() {
                            self.register(None, token);
                            drain(dead.terminate(), name);
                        }
                        let delay = backoff.next_delay();
                        debug!(source = %name, "restarting capture in {delay:?}");
                        token.sleep(delay);
                    }
                    Ok(None) => {
                        debug!(source = %name, "incomplete frame read: {e}");
                        self.stats.incr(&self.keys.invalid, 1);
                        std::thread::sleep(STALL_PAUSE);
                    }
                    Err(wait_err) => {
                        error!(source = %name, "cannot query capture process: {wait_err}");
                        if let Some(lost) = process.take() {
                            self.register(None, token);
                            drain(lost.terminate(), name);
                        }
                        token.sleep(backoff.next_delay());
                    }
                },
            }
            self.stats.timing(&self.keys.looped, loop_started.elapsed());
        }

        info!(source = %name, frames = self.progress.count(), "capture loop terminated");
        if let Some(child) = process.take() {
            self.register(None, token);
            drain(child.terminate(), name);
        }
    }

    fn register(&self, process: Option<KillSwitch>, token: &StopToken) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = process;
        // A stop that raced the spawn
        if let (Some(process), true) = (current.as_ref(), token.is_stopped()) {
            process.kill();
        }
    }

    fn deliver(&self, buf: Vec<u8>) {
        let started = Instant::now();
        match Frame::from_raw(self.config.shape, buf) {
            Ok(frame) => {
                self.sink.push(Arc::new(frame));
                self.progress.record();
            }
            Err(e) => {
                warn!(source = %self.config.name, "invalid frame: {e}");
                self.stats.incr(&self.keys.invalid, 1);
            }
        }
        self.stats.timing(&self.keys.queue, started.elapsed());
    }
}

fn drain(outcome: io::Result<std::process::ExitStatus>, name: &str) {
    if let Err(e) = outcome {
        warn!(source = %name, "failed to reap capture process: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = BackoffState::new(Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
        });
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_initial_above_cap_is_clamped() {
        let mut backoff = BackoffState::new(Backoff {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(1),
        });
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn zero_backoff_still_waits_between_restarts() {
        let mut backoff = BackoffState::new(Backoff {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        });
        for _ in 0..3 {
            assert_eq!(backoff.next_delay(), MIN_RESTART_DELAY);
        }

        let mut backoff = BackoffState::new(Backoff {
            initial: Duration::ZERO,
            max: Duration::from_millis(100),
        });
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100]);
    }

    #[test]
    fn progress_counts_frames() {
        let progress = Progress::default();
        assert_eq!(progress.count(), 0);
        progress.record();
        progress.record();
        assert_eq!(progress.count(), 2);
    }
}
