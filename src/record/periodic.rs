//! Output file rotation.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::ffmpeg::EncodeProgram;
use crate::pipeline::queue::FrameSource;
use crate::pipeline::service::{Completion, Service, StopToken, Worker};
use crate::record::pattern::TargetPattern;
use crate::record::writer::{Writer, WriterConfig};
use crate::stats::SharedStats;

/// Delay before the next attempt after a failed directory, start or writer.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Static settings of a [`PeriodicWriter`].
#[derive(Debug, Clone)]
pub struct PeriodicWriterConfig {
    pub name: String,
    pub period: Duration,
    pub pattern: TargetPattern,
    pub fps: u32,
    pub pop_timeout: Duration,
}

impl PeriodicWriterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(Error::Config(format!("recorder '{}' needs a non-zero period", self.name)));
        }
        if self.fps == 0 {
            return Err(Error::Config(format!("recorder '{}' needs a non-zero fps", self.name)));
        }
        Ok(())
    }
}

/// Records into a fresh file every `period`, one [`Writer`] at a time.
///
/// The outgoing writer is stopped and joined before the next one starts, so
/// the shared queue never has two consumers. Frames that arrive during the
/// hand-over wait in the queue.
pub struct PeriodicWriter {
    config: PeriodicWriterConfig,
    source: Arc<dyn FrameSource>,
    program: Arc<dyn EncodeProgram>,
    stats: SharedStats,
    current: Arc<Mutex<Option<StopToken>>>,
    files: Arc<AtomicU64>,
    worker: Worker,
}

impl PeriodicWriter {
    pub fn new(
        config: PeriodicWriterConfig,
        source: Arc<dyn FrameSource>,
        program: Arc<dyn EncodeProgram>,
        stats: SharedStats,
    ) -> Result<Self> {
        config.validate()?;
        let worker = Worker::new(format!("rotate-{}", config.name));
        Ok(Self {
            config,
            source,
            program,
            stats,
            current: Arc::new(Mutex::new(None)),
            files: Arc::new(AtomicU64::new(0)),
            worker,
        })
    }

    /// Number of output files started so far.
    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }
}

impl Service for PeriodicWriter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<()> {
        let rotation = Rotation {
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            program: Arc::clone(&self.program),
            stats: Arc::clone(&self.stats),
            current: Arc::clone(&self.current),
            files: Arc::clone(&self.files),
        };
        self.worker.spawn(move |token| rotation.run(&token))
    }

    fn stop(&self) {
        self.worker.stop();
        // The child does not watch our token; stop it explicitly
        if let Some(writer) = self.current.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            writer.stop();
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Completion {
        self.worker.wait(timeout)
    }
}

struct Rotation {
    config: PeriodicWriterConfig,
    source: Arc<dyn FrameSource>,
    program: Arc<dyn EncodeProgram>,
    stats: SharedStats,
    current: Arc<Mutex<Option<StopToken>>>,
    files: Arc<AtomicU64>,
}

impl Rotation {
    fn run(&self, token: &StopToken) {
        let name = &self.config.name;
        let rotate_key = format!("store.{name}.rotate");
        let early_key = format!("store.{name}.early_exit");
        let mut sequence: u64 = 1;

        info!(recorder = %name, period = ?self.config.period, pattern = self.config.pattern.as_str(), "rotation started");
        while token.is_running() {
            let target = self.config.pattern.render(&Local::now(), sequence);
            if let Err(e) = ensure_parent(&target) {
                error!(recorder = %name, target = %target.display(), "cannot create output directory: {e}");
                token.sleep(RETRY_DELAY);
                continue;
            }

            let mut writer = Writer::new(
                WriterConfig {
                    name: name.clone(),
                    target: target.clone(),
                    fps: self.config.fps,
                    pop_timeout: self.config.pop_timeout,
                },
                Arc::clone(&self.source),
                Arc::clone(&self.program),
                Arc::clone(&self.stats),
            );
            if let Err(e) = writer.start() {
                error!(recorder = %name, "failed to start writer: {e}");
                token.sleep(RETRY_DELAY);
                continue;
            }
            self.files.fetch_add(1, Ordering::Relaxed);
            info!(recorder = %name, target = %target.display(), "new file");

            {
                let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
                *current = Some(writer.token());
                // A stop that raced the registration above
                if token.is_stopped() {
                    writer.stop();
                }
            }

            match writer.wait(Some(self.config.period)) {
                Completion::Running => {
                    writer.stop();
                    let _ = writer.wait(None);
                    self.stats.incr(&rotate_key, 1);
                    info!(recorder = %name, target = %target.display(), frames = writer.frames(), "file complete");
                    sequence += 1;
                }
                Completion::Finished if token.is_running() => {
                    // Never reuse the name: the encoder would overwrite the short file
                    self.stats.incr(&early_key, 1);
                    warn!(recorder = %name, target = %target.display(), "writer exited before the period elapsed");
                    sequence += 1;
                    *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    token.sleep(RETRY_DELAY);
                    continue;
                }
                Completion::Finished => {}
            }
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
        info!(recorder = %name, files = self.files.load(Ordering::Relaxed), "rotation terminated");
    }
}

fn ensure_parent(target: &Path) -> std::io::Result<()> {
    match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}
