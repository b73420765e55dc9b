//! usb-host
//!
//! Runs the USB host core against a simulated controller: enumerates the
//! configured topology, reports devices and bandwidth, and logs hot-plug
//! events until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceInfo, UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, setup_logging};
use host::config::{HostConfig, load_config};
use host::{SimController, UsbRegistry, spawn_usb_worker};
use protocol::ControllerId;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-host")]
#[command(author, version, about = "USB host subsystem demo")]
#[command(long_about = "
Enumerates a simulated USB topology with the host core: port reset,
addressing, descriptor reads, configuration, periodic bandwidth admission
and class driver binding, including devices behind external hubs.

EXAMPLES:
    # Enumerate the default topology and watch for events
    usb-host

    # Print the device table and schedule usage, then exit
    usb-host --list-devices

    # Use a custom topology
    usb-host --config ~/my-bus.toml

    # Trace every transaction
    usb-host --log-level trace

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-host/host.toml
    3. /etc/usb-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Enumerate, print devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => load_config(path).context("Failed to load configuration")?,
        None => HostConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-host v{}", env!("CARGO_PKG_VERSION"));

    let (usb_bridge, worker) = create_usb_bridge();
    let registry = Arc::new(
        UsbRegistry::new(config.scheduler.clone(), config.enumeration.clone())
            .with_events(worker.event_tx.clone()),
    );
    let sim = SimController::from_settings(&config.simulation)
        .context("Failed to build simulated topology")?;
    let controller = registry
        .add_controller(Arc::new(sim))
        .context("Failed to start controller")?;

    let usb_worker_handle = spawn_usb_worker(
        registry.clone(),
        worker,
        config.enumeration.poll_interval(),
    );

    let result = if args.list_devices {
        list_devices_mode(&usb_bridge, &registry, controller).await
    } else {
        run(&usb_bridge, controller).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.send_command(UsbCommand::Shutdown).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    if let Err(e) = usb_worker_handle.join() {
        error!("USB worker thread panicked: {:?}", e);
    }

    result
}

async fn scan(usb_bridge: &UsbBridge, controller: ControllerId) -> Result<Vec<DeviceInfo>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    usb_bridge
        .send_command(UsbCommand::ScanController {
            controller,
            response: tx,
        })
        .await
        .context("Failed to send ScanController command")?;
    let devices = rx
        .await
        .context("Failed to receive scan result")?
        .context("Scan failed")?;
    Ok(devices)
}

/// Enumerate, print the device table and schedule usage, exit
async fn list_devices_mode(
    usb_bridge: &UsbBridge,
    registry: &UsbRegistry,
    controller: ControllerId,
) -> Result<()> {
    let devices = scan(usb_bridge, controller).await?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in &devices {
            print_device(device);
        }
    }

    let stats = registry.controller(controller)?.scheduler().stats();
    println!(
        "Periodic schedule: {} reservation(s), peak slot {} of {} byte-times",
        stats.reservations, stats.peak_slot, stats.slot_ceiling
    );
    Ok(())
}

fn print_device(device: &DeviceInfo) {
    let upstream = match device.parent {
        Some(hub) => format!("hub {} port {}", hub, device.port),
        None => format!("root port {}", device.port),
    };
    println!(
        "  [{}] {:04x}:{:04x} - {} {}",
        device.id,
        device.vendor_id,
        device.product_id,
        device.manufacturer.as_deref().unwrap_or("Unknown Manufacturer"),
        device.product.as_deref().unwrap_or("Unknown Product")
    );
    println!(
        "      Address {:03} Speed: {} on {} ({}, class {})",
        device.address,
        device.speed,
        upstream,
        device.state,
        protocol::class::name(device.class)
    );
    if let Some(driver) = &device.driver {
        println!("      Driver: {}", driver);
    }
    if device.reservations > 0 {
        println!("      Periodic reservations: {}", device.reservations);
    }
    println!();
}

/// Enumerate, then log events until Ctrl+C
async fn run(usb_bridge: &UsbBridge, controller: ControllerId) -> Result<()> {
    let devices = scan(usb_bridge, controller).await?;
    info!("{} device(s) active on controller {}", devices.len(), controller);
    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            event = usb_bridge.recv_event() => match event {
                Ok(event) => log_event(&event),
                Err(e) => {
                    warn!("Event channel closed: {}", e);
                    break;
                }
            },
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
        }
    }
    Ok(())
}

fn log_event(event: &UsbEvent) {
    match event {
        UsbEvent::DeviceActivated { device } => info!(
            "{} {:04x}:{:04x} active at address {} ({})",
            device.id,
            device.vendor_id,
            device.product_id,
            device.address,
            device.driver.as_deref().unwrap_or("no driver")
        ),
        UsbEvent::DeviceRemoved {
            device,
            released_reservations,
            ..
        } => info!(
            "{} removed, {} reservation(s) released",
            device, released_reservations
        ),
        UsbEvent::EnumerationFailed {
            hub,
            port,
            errno,
            reason,
            ..
        } => warn!(
            "Enumeration on {:?} port {} failed ({}): {}",
            hub, port, errno, reason
        ),
        UsbEvent::PortOverCurrent { hub, port, .. } => {
            warn!("Over-current on {:?} port {}", hub, port)
        }
        UsbEvent::ControllerRemoved {
            controller,
            devices,
        } => info!("Controller {} removed with {} device(s)", controller, devices),
    }
}
