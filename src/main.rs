use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use futures::join;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rtk_base_caster::caster::{self, Caster};
use rtk_base_caster::config::TelemetrySource;
use rtk_base_caster::helpers::format_uptime;
use rtk_base_caster::ingest::{self, Backoff, ReceiverDevice, SerialDevice, SerialIngest};
use rtk_base_caster::telemetry::{self, TelemetryTracker};
use rtk_base_caster::{api, nmea, stats, Config, Station};

/// Frames buffered between ingest and the relay.
const FRAME_QUEUE: usize = 1024;
const REPORT_QUEUE: usize = 64;

#[derive(Parser, Debug)]
#[command(version, about = "RTK base station NTRIP caster")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Check that the configured serial port opens, then exit
    #[arg(long)]
    check_serial: bool,

    /// Do not start the status API
    #[arg(long)]
    no_web: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config.logging.level);

    if cli.check_serial {
        return check_serial(&config).await;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting");
    let web_enabled = config.web.enabled && !cli.no_web;
    let (station, feeds) = Station::new(config);
    let config = station.config.clone();
    let shutdown = CancellationToken::new();

    let setup = if config.serial.configure_receiver {
        nmea::base_station_commands(&config.base_station, &config.rtcm.messages)
    } else {
        Vec::new()
    };
    let device = SerialDevice::new(config.serial.port.clone(), config.serial.baudrate, setup);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
    let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);

    let mut serial = SerialIngest::new(device, frame_tx, station.statistics.clone(), feeds.link);
    let gpsd_reports = match config.telemetry.source {
        TelemetrySource::Nmea => {
            serial = serial.with_reports(report_tx);
            None
        }
        TelemetrySource::Gpsd => Some(report_tx),
    };

    let caster = Caster::bind(station.clone()).await.with_context(|| {
        format!("binding caster to {}:{}", config.ntrip.host, config.ntrip.port)
    })?;

    let _ = join!(
        wait_for_signal(shutdown.clone()),
        supervise("ingest", serial.run(shutdown.clone()), &shutdown),
        supervise(
            "telemetry",
            telemetry::run_telemetry(
                TelemetryTracker::new(config.telemetry.freshness()),
                report_rx,
                feeds.telemetry,
                shutdown.clone(),
            ),
            &shutdown,
        ),
        supervise(
            "gpsd",
            async {
                match gpsd_reports {
                    Some(reports) => {
                        ingest::run_gpsd_feed(
                            config.telemetry.gpsd_address.clone(),
                            reports,
                            Backoff::default(),
                            shutdown.clone(),
                        )
                        .await
                    }
                    None => Ok(()),
                }
            },
            &shutdown,
        ),
        supervise(
            "relay",
            caster::relay_frames(frame_rx, station.clone(), feeds.reference, shutdown.clone()),
            &shutdown,
        ),
        supervise("caster", caster.run(shutdown.clone()), &shutdown),
        supervise(
            "web",
            async {
                if web_enabled {
                    api::handle_web(station.clone(), shutdown.clone()).await
                } else {
                    Ok(())
                }
            },
            &shutdown,
        ),
        stats::run_rate_meter(station.statistics.clone(), shutdown.clone()),
    );

    let snapshot = station.statistics.snapshot();
    info!(
        uptime = %format_uptime(station.started.elapsed()),
        messages = snapshot.totals.messages,
        bytes = snapshot.totals.bytes,
        evictions = snapshot.evictions,
        reconnects = snapshot.reconnects,
        checksum_errors = snapshot.checksum_errors,
        "stopped"
    );
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A failing task takes the whole station down.
async fn supervise<F>(name: &'static str, task: F, shutdown: &CancellationToken)
where
    F: Future<Output = anyhow::Result<()>>,
{
    if let Err(error) = task.await {
        error!(task = name, error = format!("{error:#}"), "task failed");
        shutdown.cancel();
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

async fn check_serial(config: &Config) -> anyhow::Result<()> {
    let device = SerialDevice::new(config.serial.port.clone(), config.serial.baudrate, Vec::new());
    match device.open().await {
        Ok(_) => {
            println!("{} opened successfully", device.describe());
            Ok(())
        }
        Err(error) => {
            println!("cannot open {}: {error}", device.describe());
            match serialport::available_ports() {
                Ok(ports) if !ports.is_empty() => {
                    println!("available ports:");
                    for port in ports {
                        println!("  {}", port.port_name);
                    }
                }
                Ok(_) => println!("no serial ports found"),
                Err(error) => println!("cannot enumerate ports: {error}"),
            }
            anyhow::bail!("serial check failed")
        }
    }
}
