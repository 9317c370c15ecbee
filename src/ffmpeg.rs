//! External capture/encode programs and subprocess supervision.
//!
//! The pipeline only speaks raw interleaved frames over pipes; which program
//! sits on the other end is decided by a [`CaptureProgram`] or
//! [`EncodeProgram`]. The ffmpeg implementations are the production ones.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::capture::Shape;

/// Stderr lines kept for post-mortem logging.
const STDERR_HINTS: usize = 32;

/// Builds the command for a capture subprocess emitting raw frames on stdout.
pub trait CaptureProgram: Send + Sync {
    fn command(&self, shape: Shape) -> Command;
}

/// Builds the command for an encode subprocess reading raw frames on stdin.
pub trait EncodeProgram: Send + Sync {
    fn command(&self, shape: Shape, fps: u32, target: &Path) -> Command;
}

/// `ffmpeg [options] -i <source> -f image2pipe -pix_fmt <fmt> -vcodec rawvideo -`
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    pub binary: String,
    pub source: String,
    pub options: Vec<String>,
}

impl CaptureProgram for FfmpegCapture {
    fn command(&self, shape: Shape) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-nostdin"])
            .args(&self.options)
            .arg("-i")
            .arg(&self.source)
            .args(["-f", "image2pipe"])
            .args(["-pix_fmt", shape.format.ffmpeg_name()])
            .args(["-s", &format!("{}x{}", shape.width, shape.height)])
            .args(["-vcodec", "rawvideo", "-"]);
        cmd
    }
}

/// `ffmpeg -y -f rawvideo -vcodec rawvideo -s WxH -pix_fmt <fmt> -r <fps> -i - [options] -vcodec <codec> <target>`
#[derive(Debug, Clone)]
pub struct FfmpegEncode {
    pub binary: String,
    pub codec: String,
    pub options: Vec<String>,
}

impl EncodeProgram for FfmpegEncode {
    fn command(&self, shape: Shape, fps: u32, target: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-y"])
            .args(["-f", "rawvideo", "-vcodec", "rawvideo"])
            .args(["-s", &format!("{}x{}", shape.width, shape.height)])
            .args(["-pix_fmt", shape.format.ffmpeg_name()])
            .args(["-r", &fps.to_string()])
            .args(["-i", "-"])
            .args(&self.options)
            .args(["-vcodec", &self.codec])
            .arg(target);
        cmd
    }
}

/// Which pipe the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    /// Read frames from stdout
    Read,
    /// Write frames to stdin
    Write,
}

/// A supervised subprocess with its stderr drained on a helper thread.
pub struct ChildProcess {
    label: String,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
    hints: Arc<Mutex<VecDeque<String>>>,
}

impl ChildProcess {
    pub fn spawn(mut command: Command, mode: PipeMode, label: impl Into<String>) -> io::Result<Self> {
        let label = label.into();
        let (stdin, stdout) = match mode {
            PipeMode::Read => (Stdio::null(), Stdio::piped()),
            PipeMode::Write => (Stdio::piped(), Stdio::null()),
        };
        command.stdin(stdin).stdout(stdout).stderr(Stdio::piped());
        debug!(process = %label, ?command, "spawning subprocess");

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let hints = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_HINTS)));
        let stderr_thread = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(stderr, label.clone(), Arc::clone(&hints)))
            .transpose()?;

        Ok(Self {
            stdin,
            stdout,
            label,
            child: Arc::new(Mutex::new(child)),
            stderr_thread,
            hints,
        })
    }

    pub fn id(&self) -> u32 {
        self.lock_child().id()
    }

    /// Handle that kills the process from another thread, e.g. to unblock a read.
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(Arc::clone(&self.child))
    }

    /// Fill `buf` completely from the process's stdout.
    pub fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read_exact(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout is not piped")),
        }
    }

    /// Write one frame to the process's stdin.
    pub fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed")),
        }
    }

    /// Exit status if the process has already terminated.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.lock_child().try_wait()
    }

    /// Close stdin so the program can flush, then wait for it to exit.
    pub fn finish(mut self) -> io::Result<ExitStatus> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                debug!(process = %self.label, "flush before close failed: {e}");
            }
        }
        self.stdout.take();
        let status = self.lock_child().wait()?;
        self.report(status);
        Ok(status)
    }

    /// Kill the process (if still alive) and reap it.
    pub fn terminate(mut self) -> io::Result<ExitStatus> {
        self.stdin.take();
        self.stdout.take();
        let status = {
            let mut child = self.lock_child();
            if child.try_wait()?.is_none() {
                if let Err(e) = child.kill() {
                    debug!(process = %self.label, "kill failed: {e}");
                }
            }
            child.wait()?
        };
        self.report(status);
        Ok(status)
    }

    /// Last lines the program wrote to stderr.
    pub fn stderr_hints(&self) -> Vec<String> {
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&mut self, status: ExitStatus) {
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        let hints = self.stderr_hints();
        if status.success() {
            debug!(process = %self.label, %status, "subprocess exited");
        } else {
            warn!(process = %self.label, %status, "subprocess exited abnormally");
        }
        for line in hints {
            debug!(process = %self.label, "stderr: {line}");
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Never leave a zombie behind, whatever path dropped us
        let mut child = self.lock_child();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Kills a [`ChildProcess`] without owning it.
#[derive(Clone)]
pub struct KillSwitch(Arc<Mutex<Child>>);

impl KillSwitch {
    /// Kill the process if it is still running. Reaping stays with the owner.
    pub fn kill(&self) {
        let mut child = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill() {
                debug!("kill failed: {e}");
            }
        }
    }
}

fn spawn_stderr_reader(
    stderr: impl Read + Send + 'static,
    label: String,
    hints: Arc<Mutex<VecDeque<String>>>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{label}-stderr"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(process = %label, "stderr closed: {e}");
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                // ffmpeg progress lines are noise for post-mortems
                if is_progress_line(trimmed) {
                    tracing::trace!(process = %label, "{trimmed}");
                    continue;
                }
                debug!(process = %label, "{trimmed}");
                let mut hints = hints.lock().unwrap_or_else(PoisonError::into_inner);
                if hints.len() == STDERR_HINTS {
                    hints.pop_front();
                }
                hints.push_back(trimmed.to_owned());
            }
        })
}

fn is_progress_line(line: &str) -> bool {
    line.starts_with("frame=") || (line.contains("time=") && line.contains("bitrate="))
}
