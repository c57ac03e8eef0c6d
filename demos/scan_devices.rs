//! Basic example: list nearby BLE devices, dispensers first
//!
//! Run with: cargo run --example scan_devices
//!
//! To scan for longer than the default 10 seconds:
//!   cargo run --example scan_devices -- --seconds 30

use dispenser_ble::{DeviceManager, ManagerConfig, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,dispenser_ble=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let seconds = args
        .iter()
        .position(|arg| arg == "--seconds")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);

    println!("Scanning for {} seconds...\n", seconds);

    let config = ManagerConfig::default().with_scan_timeout(Duration::from_secs(seconds));
    let manager = DeviceManager::with_config(config).await?;
    let mut devices = manager.watch_devices();

    manager.start_scan().await?;

    let mut scanning = manager.watch_scanning();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = scanning.changed() => {
                if changed.is_err() || !*scanning.borrow_and_update() {
                    break;
                }
            }
            changed = devices.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = devices.borrow_and_update().clone();
                print!("\x1B[2J\x1B[1;1H");
                println!("=== Discovered Devices ({}) ===", list.len());
                for device in &list {
                    let marker = if device.is_dispenser { "*" } else { " " };
                    println!(" {} {:<32} {}", marker, device.display_name(), device.address);
                }
            }
        }
    }

    let dispensers: Vec<_> = manager
        .discovered_devices()
        .into_iter()
        .filter(|d| d.is_dispenser)
        .collect();

    println!("\nScan finished, {} dispenser(s) found.", dispensers.len());
    for device in dispensers {
        println!("  {}", device);
    }

    manager.shutdown().await?;
    Ok(())
}
