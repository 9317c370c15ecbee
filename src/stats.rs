//! Observability port.
//!
//! Every component receives a [`SharedStats`] at construction and reports
//! counters, timings and gauges through it. The core never depends on a
//! concrete backend; [`NoopStats`] is a valid choice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics_exporter_statsd::{StatsdBuilder, StatsdRecorder};

use crate::error::{Error, Result};
use crate::StatsConfig;

pub trait Stats: Send + Sync {
    fn incr(&self, name: &str, count: u64);
    fn timing(&self, name: &str, elapsed: Duration);
    fn gauge(&self, name: &str, value: f64);
}

pub type SharedStats = Arc<dyn Stats>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl Stats for NoopStats {
    fn incr(&self, _name: &str, _count: u64) {}
    fn timing(&self, _name: &str, _elapsed: Duration) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

pub fn noop() -> SharedStats {
    Arc::new(NoopStats)
}

/// Forwards to the `metrics` facade. Without an installed recorder this is a no-op.
#[derive(Debug, Clone)]
pub struct MetricsStats {
    prefix: String,
}

impl MetricsStats {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

impl Default for MetricsStats {
    fn default() -> Self {
        Self::new("vigil")
    }
}

impl Stats for MetricsStats {
    fn incr(&self, name: &str, count: u64) {
        metrics::counter!(self.key(name)).increment(count);
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        metrics::histogram!(self.key(name)).record(elapsed.as_secs_f64());
    }

    fn gauge(&self, name: &str, value: f64) {
        metrics::gauge!(self.key(name)).set(value);
    }
}

/// Build a statsd recorder sending to `host`.
pub fn statsd_recorder(host: &str, config: &StatsConfig) -> Result<StatsdRecorder> {
    StatsdBuilder::from(host, config.statsd_port)
        .with_queue_size(config.queue_size)
        .with_buffer_size(config.max_udp_size)
        .build(None)
        .map_err(|e| Error::Metrics(e.to_string()))
}

/// Install the configured exporter as the global `metrics` recorder.
///
/// Returns `false` when no statsd host is configured and metrics stay local.
pub fn install(config: &StatsConfig) -> Result<bool> {
    let Some(host) = config.statsd_host.as_deref() else {
        return Ok(false);
    };
    let recorder = statsd_recorder(host, config)?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| Error::Metrics("a metrics recorder is already installed".into()))?;
    Ok(true)
}

/// In-process aggregation, handy for tests and ad-hoc diagnostics.
#[derive(Debug, Default)]
pub struct MemoryStats {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    counters: HashMap<String, u64>,
    timings: HashMap<String, Vec<Duration>>,
    gauges: HashMap<String, f64>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn timings(&self, name: &str) -> usize {
        self.lock().timings.get(name).map_or(0, Vec::len)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.lock().gauges.get(name).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Stats for MemoryStats {
    fn incr(&self, name: &str, count: u64) {
        *self.lock().counters.entry(name.to_owned()).or_default() += count;
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.lock()
            .timings
            .entry(name.to_owned())
            .or_default()
            .push(elapsed);
    }

    fn gauge(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stats_aggregates() {
        let stats = MemoryStats::new();
        stats.incr("a", 2);
        stats.incr("a", 3);
        stats.timing("t", Duration::from_millis(5));
        stats.gauge("g", 1.5);
        stats.gauge("g", 2.5);

        assert_eq!(stats.counter("a"), 5);
        assert_eq!(stats.counter("missing"), 0);
        assert_eq!(stats.timings("t"), 1);
        assert_eq!(stats.gauge_value("g"), Some(2.5));
    }

    #[test]
    fn statsd_recorder_for_local_host() {
        let config = StatsConfig {
            statsd_host: Some("127.0.0.1".into()),
            ..StatsConfig::default()
        };
        assert!(statsd_recorder("127.0.0.1", &config).is_ok());
    }

    #[test]
    fn install_without_host_keeps_metrics_local() {
        assert!(!install(&StatsConfig::default()).unwrap());
    }

    #[test]
    fn metrics_key_prefix() {
        assert_eq!(MetricsStats::new("vigil").key("queue.a.push"), "vigil.queue.a.push");
        assert_eq!(MetricsStats::new("").key("x"), "x");
    }
}
