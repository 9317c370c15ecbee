//! vigil: capture, record and view camera streams.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

use vigil::app::Pipeline;
use vigil::stats::{MetricsStats, SharedStats};
use vigil::Config;

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Continuous capture, segmented recording and live snapshots")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "VIGIL_CONFIG", default_value = "/etc/vigil.toml")]
    config: PathBuf,

    /// Log file, or `-` for stdout
    #[arg(short, long, default_value = "-")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    info!("vigil launching...");
    let config = Config::load(&cli.config)
        .wrap_err_with(|| format!("failed to load {}", cli.config.display()))?;
    if vigil::stats::install(&config.stats)? {
        info!(
            "exporting metrics to statsd at {}:{}",
            config.stats.statsd_host.as_deref().unwrap_or_default(),
            config.stats.statsd_port
        );
    }
    let stats: SharedStats = Arc::new(MetricsStats::new(config.stats.prefix.clone()));

    // Starting blocks on first frames, keep it off the async workers
    let mut pipeline = tokio::task::spawn_blocking(move || -> vigil::Result<Pipeline> {
        let mut pipeline = Pipeline::build(&config, stats)?;
        pipeline.start()?;
        Ok(pipeline)
    })
    .await??;
    if let Some(addr) = pipeline.viewer_addr() {
        info!("viewer at http://{addr}/");
    }

    shutdown_signal().await?;
    info!("shutting down");

    let stuck = tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    if !stuck.is_empty() {
        return Err(eyre!("services did not stop in time: {}", stuck.join(", ")));
    }
    info!("vigil stopped");
    Ok(())
}

fn init_logging(target: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_timer(uptime());
    if target == "-" {
        builder.init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(target)
            .wrap_err_with(|| format!("cannot open log file {target}"))?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    }
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
