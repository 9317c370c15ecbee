//! Assembly of the whole capture/record/view graph from a [`Config`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::capture::{Reader, ReaderConfig};
use crate::error::{Error, Result};
use crate::ffmpeg::{FfmpegCapture, FfmpegEncode};
use crate::pipeline::{FrameQueue, FrameSink, FrameSource, QueueFan, Service};
use crate::record::{PeriodicWriter, PeriodicWriterConfig};
use crate::stats::SharedStats;
use crate::viewer::{Viewer, ViewerSettings};
use crate::Config;

/// Every service of a running system, in start order.
pub struct Pipeline {
    readers: Vec<Reader>,
    recorders: Vec<PeriodicWriter>,
    viewer: Option<Viewer>,
    first_frame_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Pipeline {
    pub fn build(config: &Config, stats: SharedStats) -> Result<Self> {
        config.validate()?;
        let pipeline = &config.pipeline;
        let mut readers = Vec::new();
        let mut recorders = Vec::new();
        let mut viewer_queues = BTreeMap::new();

        for source in &config.sources {
            let shape = source.shape()?;
            let mut targets: Vec<Arc<FrameQueue>> = Vec::new();

            for recorder in config.recorders.iter().filter(|r| r.source == source.name) {
                let queue = Arc::new(FrameQueue::new(
                    recorder.name.clone(),
                    recorder.queue_capacity,
                    Arc::clone(&stats),
                )?);
                let program = Arc::new(FfmpegEncode {
                    binary: pipeline.ffmpeg.clone(),
                    codec: recorder.codec.clone(),
                    options: recorder.codec_options.clone(),
                });
                recorders.push(PeriodicWriter::new(
                    PeriodicWriterConfig {
                        name: recorder.name.clone(),
                        period: recorder.period(),
                        pattern: recorder.pattern()?,
                        fps: recorder.fps,
                        pop_timeout: pipeline.pop_timeout(),
                    },
                    Arc::clone(&queue) as Arc<dyn FrameSource>,
                    program,
                    Arc::clone(&stats),
                )?);
                targets.push(queue);
            }

            if let Some(viewer) = config.viewer.as_ref().filter(|v| v.shows(&source.name)) {
                let queue = Arc::new(FrameQueue::new(
                    format!("{}-viewer", source.name),
                    viewer.queue_capacity,
                    Arc::clone(&stats),
                )?);
                viewer_queues.insert(source.name.clone(), Arc::clone(&queue));
                targets.push(queue);
            }

            if targets.is_empty() {
                warn!(source = %source.name, "source has no recorder or viewer, not capturing");
                continue;
            }
            let sink: Arc<dyn FrameSink> = if targets.len() == 1 {
                targets.remove(0)
            } else {
                Arc::new(QueueFan::new(targets))
            };

            readers.push(Reader::new(
                ReaderConfig {
                    name: source.name.clone(),
                    shape,
                    backoff: pipeline.backoff(),
                },
                Arc::new(FfmpegCapture {
                    binary: pipeline.ffmpeg.clone(),
                    source: source.input.clone(),
                    options: source.capture_options.clone(),
                }),
                sink,
                Arc::clone(&stats),
            ));
        }

        let viewer = match &config.viewer {
            Some(settings) => {
                let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid viewer address: {e}")))?;
                Some(Viewer::new(
                    ViewerSettings {
                        name: settings.name.clone(),
                        addr,
                        peek_timeout: settings.peek_timeout(),
                        auth: settings.auth.clone(),
                    },
                    viewer_queues,
                    Arc::clone(&stats),
                ))
            }
            None => None,
        };

        Ok(Self {
            readers,
            recorders,
            viewer,
            first_frame_timeout: pipeline.first_frame_timeout(),
            shutdown_timeout: pipeline.shutdown_timeout(),
        })
    }

    /// Start readers, give them a chance to deliver, then start consumers.
    pub fn start(&mut self) -> Result<()> {
        for reader in &mut self.readers {
            reader.start()?;
        }
        for reader in &self.readers {
            match reader.wait_first_frame(Some(self.first_frame_timeout)) {
                Ok(()) => info!(source = reader.name(), "first frame received"),
                Err(_) => warn!(
                    source = reader.name(),
                    timeout = ?self.first_frame_timeout,
                    "no frame yet, starting consumers anyway"
                ),
            }
        }
        for recorder in &mut self.recorders {
            recorder.start()?;
        }
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.start()?;
        }
        info!(
            readers = self.readers.len(),
            recorders = self.recorders.len(),
            viewer = self.viewer.is_some(),
            "pipeline started"
        );
        Ok(())
    }

    pub fn viewer_addr(&self) -> Option<SocketAddr> {
        self.viewer.as_ref().and_then(Viewer::local_addr)
    }

    pub fn readers(&self) -> &[Reader] {
        &self.readers
    }

    pub fn recorders(&self) -> &[PeriodicWriter] {
        &self.recorders
    }

    /// Stop every service and wait for each in turn.
    ///
    /// Returns the names of services still running after the timeout.
    pub fn shutdown(&mut self) -> Vec<String> {
        let timeout = self.shutdown_timeout;
        let mut services = self.services();
        for service in services.iter() {
            service.stop();
        }

        let mut stuck = Vec::new();
        for service in services.iter_mut() {
            if let Err(e) = service.wait_finish(Some(timeout)) {
                error!(service = service.name(), "did not stop: {e}");
                stuck.push(service.name().to_owned());
            }
        }
        if stuck.is_empty() {
            info!("pipeline stopped");
        }
        stuck
    }

    /// Consumers first, so they stop taking frames before their producers go.
    fn services(&mut self) -> Vec<&mut dyn Service> {
        let mut services: Vec<&mut dyn Service> = Vec::new();
        if let Some(viewer) = self.viewer.as_mut() {
            services.push(viewer);
        }
        services.extend(self.recorders.iter_mut().map(|r| r as &mut dyn Service));
        services.extend(self.readers.iter_mut().map(|r| r as &mut dyn Service));
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats;

    fn config(text: &str) -> Config {
        Config::from_toml(text).unwrap()
    }

    #[test]
    fn builds_one_reader_per_consumed_source() {
        let config = config(
            r#"
            [[sources]]
            name = "front"
            input = "/dev/video0"
            width = 4
            height = 4

            [[sources]]
            name = "idle"
            input = "/dev/video1"
            width = 4
            height = 4

            [[recorders]]
            name = "front-a"
            source = "front"
            target_pattern = "/tmp/a-{sequence}.mkv"

            [[recorders]]
            name = "front-b"
            source = "front"
            target_pattern = "/tmp/b-{sequence}.mkv"
            "#,
        );
        let pipeline = Pipeline::build(&config, stats::noop()).unwrap();
        assert_eq!(pipeline.readers().len(), 1);
        assert_eq!(pipeline.readers()[0].name(), "front");
        assert_eq!(pipeline.recorders().len(), 2);
        assert!(pipeline.viewer_addr().is_none());
    }

    #[test]
    fn rejects_unparseable_viewer_address() {
        let config = config(
            r#"
            [viewer]
            host = "not an address"
            "#,
        );
        assert!(matches!(
            Pipeline::build(&config, stats::noop()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn shutdown_of_unstarted_pipeline_is_clean() {
        let mut pipeline = Pipeline::build(&Config::default(), stats::noop()).unwrap();
        assert!(pipeline.shutdown().is_empty());
    }
}
