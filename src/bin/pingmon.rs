use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use latency_monitoring::{
    config::{Config, read_config_file},
    monitor::{Monitor, Target},
    probe::IcmpProber,
    sink::{MetricSink, influx_v1::InfluxV1Sink, influx_v2::InfluxV2Sink},
    supervisor::{Outcome, run_supervision},
};
use tokio::sync::watch;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("latency_monitoring", LevelFilter::TRACE),
        ("pingmon", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let sink = build_sink(&config).await?;
    let monitors = build_monitors(&config, sink.clone());
    if monitors.is_empty() {
        anyhow::bail!("no usable targets configured");
    }

    // Kept alive for the whole run; dropping it would read as a shutdown
    // request to the supervision loop.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = run_supervision(shutdown_rx, monitors).await?;

    if let Err(e) = sink.exit().await {
        error!("failed to close metric sink: {e}");
    }

    match outcome {
        Outcome::Interrupted => info!("interrupted, bye~"),
        Outcome::Cancelled => info!("bye~"),
    }
    Ok(())
}

async fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn MetricSink>> {
    if let Some(v2) = &config.influxdb_v2 {
        let sink = InfluxV2Sink::connect(&v2.addr, &v2.org, &v2.bucket, &v2.token).await?;
        return Ok(Arc::new(sink));
    }

    if let Some(v1) = &config.influxdb_v1 {
        let sink = InfluxV1Sink::connect(
            &v1.addr,
            &v1.database,
            v1.username.as_deref(),
            v1.password.as_deref(),
        )
        .await?;
        return Ok(Arc::new(sink));
    }

    anyhow::bail!("no metric backend configured")
}

fn build_monitors(config: &Config, sink: Arc<dyn MetricSink>) -> Vec<Monitor> {
    let prober = Arc::new(IcmpProber);

    let mut monitors = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        if target.host.is_empty() {
            error!(name = ?target.name, "target without host, skipped");
            continue;
        }

        let timeout = match target.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        monitors.push(Monitor::new(
            Target::new(
                target.host.clone(),
                config.hostname.clone(),
                target.name.clone(),
            ),
            Duration::from_secs(target.interval_secs),
            timeout,
            sink.clone(),
            prober.clone(),
        ));
    }
    monitors
}
