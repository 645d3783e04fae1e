//! Passive monitoring example
//!
//! Prints the readings ViPen devices broadcast in their advertisements,
//! without ever connecting to them.
//!
//! Run with: cargo run --example passive_monitor
//!
//! To stop after a number of seconds:
//!   cargo run --example passive_monitor -- --seconds 30

use std::sync::Arc;
use std::time::Duration;
use vipen_ble::{BtleplugAdapter, PollingOrchestrator, Result, ViPenConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,vipen_ble=debug")
        .init();

    println!("ViPen Passive Monitor");
    println!("=====================\n");

    let args: Vec<String> = std::env::args().collect();
    let seconds = args
        .iter()
        .position(|arg| arg == "--seconds")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60);

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let orchestrator = PollingOrchestrator::new(adapter, ViPenConfig::default());

    let _samples = orchestrator.on_sample(|sample| {
        println!(
            "[{}] {}  V {:>6.2} mm/s  A {:>6.2} g  K {:>5.2}  T {:>6.2} °C",
            sample.timestamp.format("%H:%M:%S"),
            sample.device,
            sample.velocity,
            sample.acceleration,
            sample.kurtosis,
            sample.temperature
        );
    });
    let _status = orchestrator.on_status(|message| println!("* {}", message));

    orchestrator.initialize().await?;
    println!("Listening for {} seconds...\n", seconds);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => println!("\nInterrupted"),
    }

    orchestrator.shutdown().await;
    Ok(())
}
