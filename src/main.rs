//! CLI entry point for the MFC bank control application.
//!
//! Subcommands:
//! - `validate` — load a registry file, report devices, bundles and warnings.
//! - `run` — run a polling session against a simulated bank built from the
//!   registry (no hardware required).
//! - `ports` — list serial ports present on this machine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mfc_daq::bundle::DEFAULT_CUTOFF_FRACTION;
use mfc_daq::bus::mock::MockBank;
use mfc_daq::{calibration, DeviceManager, Registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mfc_daq", version, about = "Mass-flow-controller bank control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a device registry and report its contents.
    Validate {
        /// Path to the registry YAML file.
        registry: PathBuf,
    },
    /// Poll a simulated bank built from the registry.
    Run {
        /// Path to the registry YAML file.
        registry: PathBuf,
        /// How long to poll before disconnecting.
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
    /// List serial ports present on this machine.
    #[cfg(feature = "instrument_serial")]
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Validate { registry } => validate(&registry),
        Command::Run { registry, seconds } => run(&registry, seconds).await,
        #[cfg(feature = "instrument_serial")]
        Command::Ports => ports(),
    }
}

fn validate(path: &Path) -> Result<()> {
    let registry = Registry::load(path).context("failed to load registry")?;

    println!(
        "Configuration: {} ({}, {})",
        registry.info.name, registry.info.owner, registry.info.date
    );
    println!(
        "Connection: {} @ {} baud",
        registry.connection.port, registry.connection.baudrate
    );
    println!(
        "Polling: every {:?}, I/O timeout {:?}",
        registry.polling.interval, registry.polling.io_timeout
    );

    println!("\nBundles:");
    for bundle in &registry.bundles {
        println!("  {} ({} devices)", bundle.name, bundle.serials.len());
        for serial in &bundle.serials {
            let device = registry.device(serial)?;
            println!(
                "    {:<12} {:<6} {:.3} m3n/h",
                serial, device.user_fluid, device.m3n_h_capacity
            );
        }
    }

    println!("\nDevices:");
    for (serial, device) in &registry.devices {
        let converted_50 = calibration::calibrate(device, 50.0);
        println!(
            "  {:<12} tag={:<14} fluid={:<6} capacity={:.3} m3n/h  50% -> {:.2}%  cal {}",
            serial,
            device.bundle,
            device.user_fluid,
            device.m3n_h_capacity,
            converted_50,
            device.last_calibration
        );
    }
    println!("\n{} devices OK", registry.devices.len());
    Ok(())
}

async fn run(path: &Path, seconds: u64) -> Result<()> {
    let registry = Arc::new(Registry::load(path).context("failed to load registry")?);

    let bank = mock_bank_for(registry.devices.keys().map(String::as_str))?;

    let manager = DeviceManager::new(Arc::clone(&registry), Box::new(bank.opener()));
    let result = manager.connect().await?;
    println!(
        "connected: {} matched, {} missing, {} unexpected",
        result.matched.len(),
        result.missing.len(),
        result.unexpected.len()
    );

    // Give every bundle something to do so the readings move.
    for bundle in &registry.bundles {
        let Some(first) = bundle.serials.first().and_then(|s| registry.devices.get(s)) else {
            continue;
        };
        let flow = first.m3n_h_capacity * 0.5;
        match manager
            .write_setpoint_bundle(&bundle.name, flow, DEFAULT_CUTOFF_FRACTION, false)
            .await?
        {
            Some(serial) => println!("bundle {}: {flow:.3} m3n/h -> {serial}", bundle.name),
            None => println!(
                "bundle {}: no qualifying device for {flow:.3} m3n/h",
                bundle.name
            ),
        }
    }

    manager.start_polling()?;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..seconds {
        ticker.tick().await;
        let snapshot = manager.snapshot();
        println!("cycle {}:", snapshot.cycle);
        for (serial, reading) in &snapshot.readings {
            println!(
                "  {:<12} flow={:.4} m3n/h sp={:.1}% T={:.2}C valve={:.1}% ping={:.1}ms",
                serial,
                reading.flow,
                reading.setpoint_fraction * 100.0,
                reading.temperature_c,
                reading.valve_fraction * 100.0,
                reading.latency_ms
            );
        }
    }

    manager.abort_all().await?;
    manager.disconnect().await;
    Ok(())
}

/// Builds a simulated bank with one mock node per serial, addresses from 3
/// up. Node addresses are a single byte, which caps the bank size.
fn mock_bank_for<'a>(serials: impl IntoIterator<Item = &'a str>) -> Result<MockBank> {
    let mut bank = MockBank::new().with_jitter();
    for (i, serial) in serials.into_iter().enumerate() {
        let address = u8::try_from(3 + i)
            .map_err(|_| anyhow::anyhow!("registry has too many devices for a mock bank (max 253)"))?;
        bank = bank.with_device(address, serial);
    }
    Ok(bank)
}

#[cfg(feature = "instrument_serial")]
fn ports() -> Result<()> {
    let ports = mfc_daq::bus::available_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
    } else {
        for port in ports {
            println!("{port}");
        }
    }
    Ok(())
}
