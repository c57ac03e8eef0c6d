//! Interactive dispenser console
//!
//! Connects to the first dispenser found (or a specific address) and accepts
//! commands on stdin:
//!
//! - `dispense`: trigger a manual dispense
//! - `sync`: set the device clock to this machine's local time
//! - `schedule <text>`: replace the dispense schedule
//! - `read`: request every readable value
//! - `show`: print the latest telemetry
//! - `quit`
//!
//! Run with: cargo run --example dispenser_console
//!
//! To connect to a specific device:
//!   cargo run --example dispenser_console -- --address 24:0A:C4:12:34:56

use dispenser_ble::{
    ConnectionState, DeviceManager, Dispenser, DispenserTelemetry, Error, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,dispenser_ble=info")
        .init();

    println!("Pill Dispenser Console");
    println!("======================\n");

    let args: Vec<String> = std::env::args().collect();
    let target_address = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let manager = Arc::new(DeviceManager::new().await?);

    let address = match target_address {
        Some(address) => address,
        None => {
            println!("Looking for a dispenser...\n");
            manager.start_scan().await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            manager.stop_scan().await?;

            let device = manager
                .discovered_devices()
                .into_iter()
                .find(|d| d.is_dispenser)
                .ok_or_else(|| Error::DeviceNotFound {
                    address: "any dispenser".to_string(),
                })?;
            println!("Found {}", device);
            device.address
        }
    };

    let _state_handle = manager.on_connection_event(|event| {
        println!("[connection] {} -> {}", event.previous, event.state);
    });
    let _error_handle = manager.on_operation_error(|error| {
        println!("[error] {}", error);
    });

    manager.connect_to_device(&address).await?;
    let state = manager
        .wait_for_state(|s| s.is_ready() || s.error().is_some())
        .await?;
    if let ConnectionState::Error(e) = state {
        manager.shutdown().await?;
        return Err(e);
    }

    let dispenser = Dispenser::new(manager.clone());
    let _telemetry_handle = dispenser.on_telemetry_updated(print_telemetry);

    println!("\nReady. Commands: dispense, sync, schedule <text>, read, show, quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else {
            break;
        };

        let (command, argument) = match line.trim().split_once(' ') {
            Some((command, argument)) => (command, argument.trim()),
            None => (line.trim(), ""),
        };

        let result = match command {
            "dispense" => dispenser.trigger_manual_dispense().await,
            "sync" => dispenser.sync_device_time().await,
            "schedule" if !argument.is_empty() => dispenser.set_dispense_schedule(argument).await,
            "read" => request_all(&dispenser).await,
            "show" => {
                print_telemetry(&dispenser.telemetry());
                Ok(())
            }
            "quit" | "exit" => break,
            "" => continue,
            other => {
                println!("Unknown command: {}", other);
                continue;
            }
        };

        if let Err(e) = result {
            println!("Command failed: {}", e);
        }
    }

    println!("\nExiting...");
    manager.disconnect().await?;
    manager.shutdown().await?;

    Ok(())
}

async fn request_all(dispenser: &Dispenser) -> Result<()> {
    dispenser.request_device_time().await?;
    dispenser.request_dispense_schedule().await?;
    dispenser.request_last_dispense_info().await?;
    dispenser.request_time_until_next_dispense().await?;
    dispenser.request_dispense_log().await
}

fn print_telemetry(telemetry: &DispenserTelemetry) {
    let show = |value: &Option<String>| value.clone().unwrap_or_else(|| "N/A".to_string());

    println!("--- Telemetry ---");
    println!("  Device time:      {}", show(&telemetry.device_time));
    println!("  Schedule:         {}", show(&telemetry.dispense_schedule));
    println!("  Last dispense:    {}", show(&telemetry.last_dispense_info));
    println!("  Next dispense in: {}", show(&telemetry.time_until_next_dispense));
    println!("  Log:              {}", show(&telemetry.dispense_log));
}
