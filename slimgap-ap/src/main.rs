//! slimgap-ap - SlimProto gapless player
//!
//! Connects to a music server, announces itself and plays whatever the
//! server streams to it until interrupted or disconnected.

use anyhow::{Context, Result};
use clap::Parser;
use slimgap_ap::audio::{OutputDevice, OutputFormat, PacedOutput};
use slimgap_ap::config::{CliOverrides, OutputBackend, PlayerConfig};
use slimgap_ap::playback::{
    event_channel, CoordinatorConfig, EventSender, HttpFetcher, PlaybackBuffer,
    PlaybackCoordinator, RenderControl, RenderCursor, TrackBoundaryTracker,
};
use slimgap_ap::session::{self, ProtocolSession};
use slimgap_common::events::PlayerEvent;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "slimgap-ap")]
#[command(about = "SlimProto gapless audio player", long_about = None)]
#[command(version)]
struct Args {
    /// Music server host or host:port
    #[arg(short, long, env = "SLIMGAP_SERVER")]
    server: Option<String>,

    /// Path to configuration file
    #[arg(short, long, env = "SLIMGAP_CONFIG")]
    config: Option<PathBuf>,

    /// Player MAC address (aa:bb:cc:dd:ee:ff)
    #[arg(short, long, env = "SLIMGAP_MAC")]
    mac: Option<String>,

    /// Output backend
    #[arg(short, long, value_enum, env = "SLIMGAP_OUTPUT")]
    output: Option<OutputBackend>,

    /// Audio device name for the cpal backend
    #[arg(short, long, env = "SLIMGAP_DEVICE")]
    device: Option<String>,

    /// Output sample rate in Hz
    #[arg(long, env = "SLIMGAP_OUTPUT_RATE")]
    output_rate: Option<u32>,

    /// Playback buffer size in bytes
    #[arg(long, env = "SLIMGAP_BUFFER_BYTES")]
    buffer_bytes: Option<usize>,

    /// Print audio output devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config: self.config.clone(),
            server: self.server.clone(),
            mac: self.mac.clone(),
            output: self.output,
            device: self.device.clone(),
            output_rate: self.output_rate,
            buffer_bytes: self.buffer_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_devices {
        return list_devices();
    }

    let config = PlayerConfig::resolve(args.overrides()).context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "slimgap_ap={0},slimgap_common={0}",
                    config.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting slimgap-ap {} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        slimgap_ap::GIT_HASH,
        slimgap_ap::BUILD_TIMESTAMP,
        slimgap_ap::BUILD_PROFILE
    );
    info!(
        "Output {:?} at {}Hz, buffer {} bytes",
        config.output, config.output_rate, config.buffer_bytes
    );

    let format = OutputFormat::new(config.output_rate);
    let (events_tx, events_rx) = event_channel();
    let buffer = Arc::new(PlaybackBuffer::new(config.buffer_bytes, None));
    let tracker = Arc::new(TrackBoundaryTracker::new());
    let control = Arc::new(RenderControl::new());

    let addr = session::resolve_server(&config.server).await?;
    let helo = session::helo(config.mac, config.output_rate, &slimgap_ap::build_id());
    let session = ProtocolSession::connect(addr, helo, events_tx.clone())
        .await
        .context("Could not reach music server")?;
    let fetcher = Arc::new(HttpFetcher::new(
        tokio::runtime::Handle::current(),
        session.peer_ip(),
    ));

    let mut output = open_output(&config, events_tx.clone())?;
    output
        .start(RenderCursor::new(
            Arc::clone(&buffer),
            Arc::clone(&tracker),
            Arc::clone(&control),
            events_tx.clone(),
        ))
        .context("Failed to start audio output")?;
    info!("Audio output: {}", output.name());

    let coordinator = PlaybackCoordinator::new(
        session,
        (events_tx, events_rx),
        buffer,
        tracker,
        control,
        fetcher,
        CoordinatorConfig {
            format,
            position_interval: config.position_interval,
            ..CoordinatorConfig::default()
        },
    );
    let handle = coordinator.handle();
    tokio::spawn(log_player_events(handle.subscribe()));

    let mut run = tokio::spawn(coordinator.run());
    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut run => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            handle.shutdown();
            run.await
        }
    };

    output.stop();
    result.context("Coordinator task panicked")??;
    info!("slimgap-ap stopped");
    Ok(())
}

fn open_output(config: &PlayerConfig, events: EventSender) -> Result<Box<dyn OutputDevice>> {
    match config.output {
        OutputBackend::Paced => Ok(Box::new(PacedOutput::new(config.output_rate))),
        #[cfg(feature = "cpal-output")]
        OutputBackend::Cpal => Ok(Box::new(slimgap_ap::audio::CpalOutput::new(
            config.device.clone(),
            config.output_rate,
            events,
        ))),
        #[cfg(not(feature = "cpal-output"))]
        OutputBackend::Cpal => {
            drop(events);
            anyhow::bail!("cpal output requested but slimgap-ap was built without the cpal-output feature")
        }
    }
}

#[cfg(feature = "cpal-output")]
fn list_devices() -> Result<()> {
    for name in slimgap_ap::audio::CpalOutput::list_devices()? {
        println!("{}", name);
    }
    Ok(())
}

#[cfg(not(feature = "cpal-output"))]
fn list_devices() -> Result<()> {
    println!("paced (built without cpal-output; no audio devices available)");
    Ok(())
}

/// Debug log of everything published to observers
async fn log_player_events(mut events: broadcast::Receiver<PlayerEvent>) {
    loop {
        match events.recv().await {
            Ok(PlayerEvent::PositionUpdated { .. }) => {}
            Ok(event) => debug!("Player event: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Event log lagged, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
