//! vigil: continuous capture, segmented recording and live snapshots.
//!
//! Frames flow `Reader -> QueueFan -> {recorder queue, viewer queue}`; each
//! recorder queue feeds a `PeriodicWriter` that rotates `Writer`s, and the
//! viewer peeks its queues to serve still images over HTTP.

pub mod app;
pub mod capture;
pub mod error;
pub mod ffmpeg;
pub mod pipeline;
pub mod record;
pub mod stats;
pub mod viewer;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat, Shape, SharedFrame};
pub use error::{Error, Result};
pub use pipeline::{Completion, Service};

use capture::Backoff;
use record::TargetPattern;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub sources: Vec<SourceConfig>,
    pub recorders: Vec<RecorderConfig>,
    pub viewer: Option<ViewerConfig>,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// ffmpeg executable used for capture and encoding
    pub ffmpeg: String,
    pub pop_timeout_ms: u64,
    pub restart_backoff_ms: u64,
    pub restart_backoff_max_ms: u64,
    pub first_frame_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

/// One capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Anything ffmpeg accepts after `-i`
    pub input: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default)]
    pub capture_options: Vec<String>,
}

/// One rotating recorder fed by a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub name: String,
    pub source: String,
    pub target_pattern: String,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub codec_options: Vec<String>,
    #[serde(default = "default_recorder_queue")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Sources to expose; empty means all
    pub sources: Vec<String>,
    pub queue_capacity: usize,
    pub peek_timeout_ms: u64,
    /// `user:password` for HTTP Basic auth; unset means open access
    pub auth: Option<String>,
}

/// Metrics export. Without `statsd_host` metrics are not exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub max_udp_size: usize,
    pub queue_size: usize,
    pub prefix: String,
}

fn default_channels() -> u8 {
    3
}

fn default_period_secs() -> u64 {
    300
}

fn default_fps() -> u32 {
    24
}

fn default_codec() -> String {
    "mpeg2video".into()
}

fn default_recorder_queue() -> usize {
    64
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            pop_timeout_ms: 1000,
            restart_backoff_ms: 250,
            restart_backoff_max_ms: 10_000,
            first_frame_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            name: "vigil".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            sources: Vec::new(),
            queue_capacity: 1,
            peek_timeout_ms: 2000,
            auth: None,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            statsd_host: None,
            statsd_port: 8125,
            max_udp_size: 512,
            queue_size: 5000,
            prefix: "vigil".into(),
        }
    }
}

impl PipelineConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.restart_backoff_ms),
            max: Duration::from_millis(self.restart_backoff_max_ms),
        }
    }

    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_secs(self.first_frame_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl SourceConfig {
    pub fn shape(&self) -> Result<Shape> {
        Shape::new(self.width, self.height, self.channels)
    }
}

impl RecorderConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn pattern(&self) -> Result<TargetPattern> {
        TargetPattern::parse(&self.target_pattern)
    }
}

impl ViewerConfig {
    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    /// Whether the viewer exposes `source`.
    pub fn shows(&self, source: &str) -> bool {
        self.sources.is_empty() || self.sources.iter().any(|s| s == source)
    }
}

impl Config {
    /// Load from a TOML file (optional) with `VIGIL__SECTION__KEY` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything that would only fail later, inside a running service.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(msg));

        if self.pipeline.ffmpeg.trim().is_empty() {
            return invalid("pipeline.ffmpeg must not be empty".into());
        }
        if self.pipeline.pop_timeout_ms == 0 {
            return invalid("pipeline.pop_timeout_ms must be positive".into());
        }
        if self.pipeline.restart_backoff_ms == 0 {
            return invalid("pipeline.restart_backoff_ms must be positive".into());
        }
        if self.pipeline.restart_backoff_max_ms < self.pipeline.restart_backoff_ms {
            return invalid("pipeline.restart_backoff_max_ms must not be below restart_backoff_ms".into());
        }
        if self.stats.statsd_host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return invalid("stats.statsd_host must not be empty".into());
        }
        if self.stats.statsd_port == 0 || self.stats.max_udp_size == 0 || self.stats.queue_size == 0 {
            return invalid("stats.statsd_port, max_udp_size and queue_size must be positive".into());
        }

        let mut sources = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return invalid("source name must not be empty".into());
            }
            if !sources.insert(source.name.as_str()) {
                return invalid(format!("duplicate source '{}'", source.name));
            }
            if source.input.is_empty() {
                return invalid(format!("source '{}' has no input", source.name));
            }
            source.shape()?;
        }

        let mut recorders = HashSet::new();
        for recorder in &self.recorders {
            if !recorders.insert(recorder.name.as_str()) {
                return invalid(format!("duplicate recorder '{}'", recorder.name));
            }
            if !sources.contains(recorder.source.as_str()) {
                return invalid(format!(
                    "recorder '{}' reads unknown source '{}'",
                    recorder.name, recorder.source
                ));
            }
            if recorder.period_secs == 0 || recorder.fps == 0 || recorder.queue_capacity == 0 {
                return invalid(format!(
                    "recorder '{}' needs positive period_secs, fps and queue_capacity",
                    recorder.name
                ));
            }
            recorder.pattern()?;
        }

        if let Some(viewer) = &self.viewer {
            if viewer.queue_capacity == 0 {
                return invalid("viewer.queue_capacity must be positive".into());
            }
            if viewer.auth.as_deref().is_some_and(|auth| !auth.contains(':')) {
                return invalid("viewer.auth must look like 'user:password'".into());
            }
            if let Some(unknown) = viewer.sources.iter().find(|s| !sources.contains(s.as_str())) {
                return invalid(format!("viewer shows unknown source '{unknown}'"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [pipeline]
        ffmpeg = "/usr/bin/ffmpeg"
        pop_timeout_ms = 500

        [[sources]]
        name = "front"
        input = "rtsp://camera/stream"
        width = 640
        height = 480
        capture_options = ["-rtsp_transport", "tcp"]

        [[recorders]]
        name = "front-rec"
        source = "front"
        target_pattern = "/srv/rec/{now:%Y-%m-%d}/front-{sequence:04}.mkv"
        period_secs = 60

        [viewer]
        port = 9000
        auth = "admin:secret"

        [stats]
        statsd_host = "metrics.local"
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.pipeline.ffmpeg, "/usr/bin/ffmpeg");
        assert_eq!(config.pipeline.pop_timeout(), Duration::from_millis(500));
        assert_eq!(config.pipeline.shutdown_timeout_secs, 5);

        let source = &config.sources[0];
        assert_eq!(source.channels, 3);
        assert_eq!(source.shape().unwrap().frame_size(), 640 * 480 * 3);

        let recorder = &config.recorders[0];
        assert_eq!(recorder.fps, 24);
        assert_eq!(recorder.codec, "mpeg2video");
        assert_eq!(recorder.queue_capacity, 64);
        assert_eq!(recorder.period(), Duration::from_secs(60));

        let viewer = config.viewer.unwrap();
        assert_eq!(viewer.port, 9000);
        assert_eq!(viewer.host, "127.0.0.1");
        assert_eq!(viewer.queue_capacity, 1);
        assert_eq!(viewer.auth.as_deref(), Some("admin:secret"));
        assert!(viewer.shows("front"));

        assert_eq!(config.stats.statsd_host.as_deref(), Some("metrics.local"));
        assert_eq!(config.stats.statsd_port, 8125);
        assert_eq!(config.stats.prefix, "vigil");
    }

    #[test]
    fn empty_config_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert!(config.sources.is_empty());
        assert!(config.viewer.is_none());
        assert!(config.stats.statsd_host.is_none());
    }

    fn rejects(edit: impl FnOnce(&mut Config)) {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        edit(&mut config);
        assert!(config.validate().is_err(), "accepted {config:?}");
    }

    #[test]
    fn rejects_invalid_configurations() {
        rejects(|c| c.sources[0].channels = 2);
        rejects(|c| c.sources[0].width = 0);
        rejects(|c| c.sources.push(c.sources[0].clone()));
        rejects(|c| c.recorders[0].source = "back".into());
        rejects(|c| c.recorders[0].target_pattern = "/srv/{camera}.mkv".into());
        rejects(|c| c.recorders[0].fps = 0);
        rejects(|c| c.recorders[0].period_secs = 0);
        rejects(|c| c.pipeline.pop_timeout_ms = 0);
        rejects(|c| c.stats.statsd_port = 0);
        rejects(|c| c.stats.statsd_host = Some(" ".into()));
        rejects(|c| {
            if let Some(viewer) = c.viewer.as_mut() {
                viewer.auth = Some("admin".into());
            }
        });
        rejects(|c| {
            if let Some(viewer) = c.viewer.as_mut() {
                viewer.sources = vec!["back".into()];
            }
        });
    }

    #[test]
    fn rejects_restart_backoff_that_allows_hot_respawn() {
        let zero = Config::from_toml("[pipeline]\nrestart_backoff_ms = 0\nrestart_backoff_max_ms = 0");
        assert!(matches!(zero, Err(Error::Config(_))));

        rejects(|c| c.pipeline.restart_backoff_ms = 0);
        rejects(|c| {
            c.pipeline.restart_backoff_ms = 500;
            c.pipeline.restart_backoff_max_ms = 100;
        });
    }

    #[test]
    fn loads_missing_file_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.recorders.is_empty());
    }

    #[test]
    fn loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sources[0].name, "front");
        assert_eq!(config.recorders[0].name, "front-rec");
    }
}
