//! Tentacle Capture - stream timecode from a BLE sync device
//!
//! This binary:
//! - Scans for a peripheral (optionally filtered by name, service, address)
//! - Connects, discovers services and subscribes to the timecode characteristic
//! - Prints every decoded timecode, or forwards it as JSON lines

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tentacle_ble::{
    callback_channel, BleEngine, BtleplugRadio, ChannelSink, EngineConfig, EngineHandle, ScanMode,
};
use tentacle_capture::{CaptureAction, CaptureConfig, CaptureFlow};

#[derive(Parser)]
#[command(name = "tentacle-capture")]
#[command(about = "Capture timecode from a Tentacle sync device over BLE")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Only report devices advertising exactly this name
    #[arg(long, short)]
    name: Option<String>,

    /// Only report devices advertising this service UUID
    #[arg(long)]
    service: Option<String>,

    /// Connect to this address only
    #[arg(long, short)]
    address: Option<String>,

    /// Timecode characteristic UUID (default: every notifiable characteristic)
    #[arg(long)]
    characteristic: Option<String>,

    /// Scan mode: low-power, balanced or low-latency
    #[arg(long, short)]
    mode: Option<ScanMode>,

    /// Forward decoded timecode as JSON lines on stdout
    #[arg(long)]
    forward: bool,

    /// Time allowed for connecting and for service discovery (e.g. "10s")
    #[arg(long, value_parser = humantime::parse_duration)]
    connect_timeout: Option<Duration>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    /// Build the capture configuration, flags taking precedence over the file
    fn capture_config(&self) -> anyhow::Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::load(path)?,
            None => CaptureConfig::default(),
        };

        if let Some(name) = &self.name {
            config.scan.name_filter = Some(name.clone());
        }
        if let Some(service) = &self.service {
            config.scan.service_uuid_filter = Some(service.clone());
        }
        if let Some(address) = &self.address {
            config.target_address = Some(address.clone());
        }
        if let Some(characteristic) = &self.characteristic {
            config.timecode_characteristic = Some(characteristic.clone());
        }
        if let Some(mode) = self.mode {
            config.scan.mode = mode;
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
            config.discover_timeout = timeout;
        }
        config.forward |= self.forward;

        config.validate()?;
        Ok(config)
    }
}

/// How the capture loop ended
enum Outcome {
    Finished,
    TimedOut,
    Interrupted,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.capture_config()?;
    info!(
        mode = %config.scan.mode,
        name = ?config.scan.name(),
        address = ?config.target_address,
        "Starting Tentacle capture"
    );

    // Radio and engine
    let (callbacks, callback_rx) = callback_channel();
    let radio = BtleplugRadio::new(callbacks).await?;
    let engine_config = EngineConfig {
        forwarding_enabled: config.forward,
        ..EngineConfig::default()
    };
    let (engine, handle) = BleEngine::new(radio.clone(), radio, callback_rx, engine_config)?;
    let engine_task = tokio::spawn(engine.run());

    if config.forward {
        spawn_forward_printer(&handle);
    }

    let (sink, mut events) = ChannelSink::channel();
    let sink = Arc::new(sink);
    handle.attach_scan_sink(sink.clone()).await?;
    handle.attach_gatt_sink(sink).await?;
    handle.start_scan(config.scan.clone()).await?;

    let mut flow = CaptureFlow::new(&config)?;
    let mut deadline: Option<Instant> = None;

    let outcome = loop {
        let timeout = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Outcome::Interrupted;
            }

            _ = timeout => {
                warn!(phase = %flow.phase(), "Timed out");
                handle.disconnect().await?;
                break Outcome::TimedOut;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    error!("Engine event stream closed");
                    break Outcome::Finished;
                };
                debug!(kind = event.kind(), "Event");

                let mut finished = false;
                for action in flow.on_event(&event) {
                    match action {
                        CaptureAction::StopScan => handle.stop_scan().await?,
                        CaptureAction::Connect(address) => {
                            handle.connect(address).await?;
                            deadline = Some(Instant::now() + config.connect_timeout);
                        }
                        CaptureAction::DiscoverServices => {
                            handle.discover_services().await?;
                            deadline = Some(Instant::now() + config.discover_timeout);
                        }
                        CaptureAction::Subscribe(key) => {
                            deadline = None;
                            if !handle.subscribe(key).await? {
                                warn!(%key, "Subscription request rejected");
                            }
                        }
                        CaptureAction::Emit(update) => {
                            if config.forward {
                                handle.forward_timecode(update).await?;
                            } else {
                                println!("{}", update.timecode);
                            }
                        }
                        CaptureAction::Finish => finished = true,
                    }
                }
                if finished {
                    break Outcome::Finished;
                }
            }
        }
    };

    handle.shutdown().await?;
    engine_task.await??;

    match outcome {
        Outcome::Finished | Outcome::Interrupted => Ok(()),
        Outcome::TimedOut => anyhow::bail!("capture timed out while {}", flow.phase()),
    }
}

/// Print forwarded timecode updates as JSON lines
fn spawn_forward_printer(handle: &EngineHandle) {
    let mut updates = handle.timecode_updates();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => match serde_json::to_string(&update) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!("Failed to serialize timecode update: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Forward consumer lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
