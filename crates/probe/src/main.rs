//! usb-probe
//!
//! Lists USB devices, dumps descriptor trees and prints reports from a
//! device's IN endpoints.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{ReportEvent, ReportReceiver, create_report_bridge, setup_logging};
use device::{DeviceSession, RawDevice, RusbContext};
use probe::class::{HexDumpClass, IdleClass, format_hex};
use probe::config::{self, ProbeConfig};
use probe::devices::{self, Candidate, DeviceSelector, DeviceSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-probe")]
#[command(author, version, about = "USB probe - inspect and watch USB devices")]
#[command(long_about = "
Inspect USB devices through libusb: list them, dump their descriptors and
print the reports arriving on their IN endpoints.

EXAMPLES:
    # List devices passing the configured filters
    usb-probe --list

    # Dump the descriptor tree of a device
    usb-probe --device 046d:c077 --dump

    # Print reports from every interface for 10 seconds
    usb-probe --device 046d:c077 --watch --duration 10

    # Run with debug logging
    usb-probe --list --log-level debug

CONFIGURATION:
    The probe looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rust-usb-session/probe.toml
    3. /etc/rust-usb-session/probe.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list: bool,

    /// Device to open, as VID:PID in hex (`*` matches any)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// Print the device's descriptor tree
    #[arg(long)]
    dump: bool,

    /// Claim interfaces and print incoming reports until Ctrl+C
    #[arg(short, long)]
    watch: bool,

    /// Stop watching after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ProbeConfig::load(Some(config::expand_path(path))).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.probe.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-probe v{}", env!("CARGO_PKG_VERSION"));

    let context = RusbContext::new().context("Failed to initialize libusb")?;
    let raw: Vec<Arc<dyn RawDevice>> = context
        .devices()
        .context("Failed to enumerate USB devices")?
        .into_iter()
        .map(|d| Arc::new(d) as Arc<dyn RawDevice>)
        .collect();
    let candidates = devices::filter_devices(raw, &config.usb.filters);

    let device_arg = match args.device.as_deref() {
        Some(d) if !args.list => d,
        _ => {
            list_devices(&candidates, &config);
            return Ok(());
        }
    };

    let selector = DeviceSelector::parse(device_arg)?;
    let candidate = devices::find_device(&candidates, &selector)
        .ok_or_else(|| anyhow!("No device matching {} found", device_arg))?;

    if args.watch {
        watch_device(&context, candidate, &config, &args).await
    } else {
        dump_device(&context, candidate, &config)
    }
}

fn list_devices(candidates: &[Candidate], config: &ProbeConfig) {
    if candidates.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Found {} USB device(s):\n", candidates.len());
    for candidate in candidates {
        println!("{}", DeviceSummary::probe(candidate, &config.session));
    }
}

fn open_session(
    context: &RusbContext,
    candidate: Candidate,
    config: &ProbeConfig,
    class: Arc<dyn device::DeviceClass>,
) -> Result<DeviceSession> {
    let session = DeviceSession::new(class, config.session.clone());
    session.set_context(Arc::new(context.clone()));
    session
        .set_device(candidate.device, Some(candidate.descriptor))
        .context("Failed to read device descriptors")?;
    session.open_handle().context("Failed to open device")?;
    Ok(session)
}

fn dump_device(context: &RusbContext, candidate: Candidate, config: &ProbeConfig) -> Result<()> {
    let session = open_session(context, candidate, config, Arc::new(IdleClass))?;
    let mut stdout = std::io::stdout();
    session.dump_info(&mut stdout).context("Failed to write device info")?;
    session.shutdown().context("Failed to close device")?;
    Ok(())
}

async fn watch_device(
    context: &RusbContext,
    candidate: Candidate,
    config: &ProbeConfig,
    args: &Args,
) -> Result<()> {
    let (sender, receiver) = create_report_bridge(config.probe.report_capacity);
    let class = Arc::new(HexDumpClass::new(config.usb.interfaces.clone(), sender));
    let session = open_session(context, candidate, config, class.clone())?;

    if args.dump {
        session.dump_info(&mut std::io::stdout())?;
    }

    session.claim_interfaces().context("Failed to claim interfaces")?;
    session
        .start_event_handling()
        .context("Failed to start event handling")?;
    info!(
        "Watching {} transfer(s) on interfaces {:?}",
        session.active_transfers(),
        session.claimed_interfaces()
    );

    let result = print_reports(&receiver, args.duration.map(Duration::from_secs)).await;

    receiver.close();
    // Print what was already queued when the watch ended
    while let Some(event) = receiver.try_recv() {
        print_event(event);
    }
    info!(
        "Received {} report(s), dropped {}",
        class.reports(),
        receiver.dropped()
    );

    let shutdown = tokio::task::spawn_blocking(move || session.shutdown())
        .await
        .context("Shutdown task failed")?;
    if let Err(e) = shutdown {
        error!("Error shutting down session: {}", e);
    }

    result
}

async fn print_reports(receiver: &ReportReceiver, duration: Option<Duration>) -> Result<()> {
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = receiver.recv() => {
                if !print_event(event?) {
                    return Ok(());
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C");
                return Ok(());
            }
            _ = &mut deadline => {
                info!("Watch duration elapsed");
                return Ok(());
            }
        }
    }
}

/// Print one bridge event; false once the session reported it stopped
fn print_event(event: ReportEvent) -> bool {
    match event {
        ReportEvent::Report { endpoint, data } => {
            println!("[{:#04x}] {} bytes", endpoint, data.len());
            println!("{}", format_hex(&data));
            true
        }
        ReportEvent::TransferError { endpoint, status } => {
            warn!("Endpoint {:#04x} stopped: {}", endpoint, status);
            true
        }
        ReportEvent::Stopped { reason } => {
            info!("Session stopped: {}", reason);
            false
        }
    }
}
