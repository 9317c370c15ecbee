//! Fixed-rate recording of one output file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::Result;
use crate::ffmpeg::{ChildProcess, EncodeProgram, PipeMode};
use crate::pipeline::queue::{Delivery, FrameSource};
use crate::pipeline::service::{Completion, Service, StopToken, Worker};
use crate::record::pacing::Pacer;
use crate::stats::SharedStats;

/// Static settings of a [`Writer`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub name: String,
    pub target: PathBuf,
    pub fps: u32,
    /// Upper bound on how long a stop request can go unnoticed while idle
    pub pop_timeout: Duration,
}

/// Consumes frames, re-times them to `fps` and streams them to one encoder process.
///
/// The encoder is spawned on the first frame so its input geometry matches
/// what the source actually produces. Stopping closes the encoder's input and
/// waits for it to finalize the file.
pub struct Writer {
    config: WriterConfig,
    source: Arc<dyn FrameSource>,
    program: Arc<dyn EncodeProgram>,
    stats: SharedStats,
    frames: Arc<AtomicU64>,
    worker: Worker,
}

impl Writer {
    pub fn new(
        config: WriterConfig,
        source: Arc<dyn FrameSource>,
        program: Arc<dyn EncodeProgram>,
        stats: SharedStats,
    ) -> Self {
        let worker = Worker::new(format!("store-{}", config.name));
        Self {
            config,
            source,
            program,
            stats,
            frames: Arc::new(AtomicU64::new(0)),
            worker,
        }
    }

    pub fn target(&self) -> &Path {
        &self.config.target
    }

    /// Frames written to the encoder so far, duplicates included.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn token(&self) -> StopToken {
        self.worker.token()
    }
}

impl Service for Writer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<()> {
        let store = StoreLoop {
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            program: Arc::clone(&self.program),
            stats: Arc::clone(&self.stats),
            frames: Arc::clone(&self.frames),
            keys: StoreKeys::new(&self.config.name),
        };
        self.worker.spawn(move |token| store.run(&token))
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Completion {
        self.worker.wait(timeout)
    }
}

struct StoreKeys {
    looped: String,
    inframe: String,
    starve: String,
    outframe: String,
    discard: String,
    duplicate: String,
    write: String,
    write_failed: String,
}

impl StoreKeys {
    fn new(name: &str) -> Self {
        Self {
            looped: format!("store.{name}.loop"),
            inframe: format!("store.{name}.inframe"),
            starve: format!("store.{name}.starve"),
            outframe: format!("store.{name}.outframe"),
            discard: format!("store.{name}.discard"),
            duplicate: format!("store.{name}.duplicate"),
            write: format!("store.{name}.write"),
            write_failed: format!("store.{name}.write_failed"),
        }
    }
}

struct StoreLoop {
    config: WriterConfig,
    source: Arc<dyn FrameSource>,
    program: Arc<dyn EncodeProgram>,
    stats: SharedStats,
    frames: Arc<AtomicU64>,
    keys: StoreKeys,
}

impl StoreLoop {
    fn run(&self, token: &StopToken) {
        let name = &self.config.name;
        let target = self.config.target.display();
        let mut pacer = Pacer::new(self.config.fps);
        let mut encoder: Option<ChildProcess> = None;
        let mut encoder_broken = false;
        let mut starving_since: Option<Instant> = None;

        debug!(recorder = %name, %target, "store loop started");
        while token.is_running() {
            let loop_started = Instant::now();
            let starving = *starving_since.get_or_insert(loop_started);

            let frame = match self.source.pop(Some(self.config.pop_timeout)) {
                Delivery::Delivered(frame) => frame,
                Delivery::TimedOut => continue,
            };
            self.stats.incr(&self.keys.inframe, 1);
            self.stats.timing(&self.keys.starve, starving.elapsed());
            starving_since = None;

            if encoder.is_none() {
                match self.spawn_encoder(&frame) {
                    Ok(process) => encoder = Some(process),
                    Err(e) => {
                        error!(recorder = %name, %target, "failed to spawn encoder: {e}");
                        token.sleep(self.config.pop_timeout);
                        continue;
                    }
                }
            }

            let repeats = pacer.advance(frame.timestamp());
            self.stats.incr(&self.keys.outframe, u64::from(repeats));
            if repeats == 0 {
                self.stats.incr(&self.keys.discard, 1);
                debug!(recorder = %name, overflow = ?pacer.overflow(), "discarded frame");
            } else {
                if repeats > 1 {
                    self.stats.incr(&self.keys.duplicate, u64::from(repeats - 1));
                }
                debug!(recorder = %name, repeats, overflow = ?pacer.overflow(), "writing frame");
            }

            if let Some(process) = encoder.as_mut() {
                for _ in 0..repeats {
                    let write_started = Instant::now();
                    match process.write_frame(frame.data()) {
                        Ok(()) => {
                            self.stats.timing(&self.keys.write, write_started.elapsed());
                            self.frames.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.stats.incr(&self.keys.write_failed, 1);
                            if !encoder_broken {
                                warn!(recorder = %name, %target, "encoder unavailable: {e}");
                                encoder_broken = true;
                            }
                            break;
                        }
                    }
                }
            }
            self.stats.timing(&self.keys.looped, loop_started.elapsed());
        }

        let frames = self.frames.load(Ordering::Relaxed);
        info!(recorder = %name, %target, frames, "store loop terminated");
        if let Some(process) = encoder.take() {
            if let Err(e) = process.finish() {
                warn!(recorder = %name, %target, "failed to close encoder: {e}");
            }
        }
    }

    fn spawn_encoder(&self, frame: &Frame) -> std::io::Result<ChildProcess> {
        let command = self
            .program
            .command(frame.shape(), self.config.fps, &self.config.target);
        let process = ChildProcess::spawn(command, PipeMode::Write, format!("store-{}", self.config.name))?;
        info!(
            recorder = %self.config.name,
            target = %self.config.target.display(),
            shape = %frame.shape(),
            fps = self.config.fps,
            pid = process.id(),
            "encoder started"
        );
        Ok(process)
    }
}
