//! Live polling example
//!
//! Waits for a ViPen to advertise, then connects and polls its live values
//! until the pen drops out or the time runs out.
//!
//! Run with: cargo run --example live_polling
//!
//! To poll faster than the default 800 ms:
//!   cargo run --example live_polling -- --interval-ms 300

use std::sync::Arc;
use std::time::Duration;
use vipen_ble::{BtleplugAdapter, MonitorEvent, PollingOrchestrator, Result, SampleOrigin, ViPenConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,vipen_ble=debug")
        .init();

    println!("ViPen Live Polling");
    println!("==================\n");

    let args: Vec<String> = std::env::args().collect();
    let interval = args
        .iter()
        .position(|arg| arg == "--interval-ms")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis);

    let mut config = ViPenConfig::default();
    if let Some(interval) = interval {
        config.polling = config.polling.with_poll_interval(interval);
    }

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let orchestrator = PollingOrchestrator::new(adapter, config);
    let mut events = orchestrator.subscribe();

    orchestrator.initialize().await?;
    println!("Waiting for a ViPen to advertise...");

    let address = loop {
        if let Some(address) = orchestrator.last_seen_device() {
            break address;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    println!("Found {}, starting to poll\n", address);

    if !orchestrator.start_polling().await {
        println!("Could not start polling");
        orchestrator.shutdown().await;
        return Ok(());
    }

    let deadline = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MonitorEvent::Sample(sample)) if sample.origin == SampleOrigin::Polling => {
                    println!(
                        "V {:>6.2} mm/s  A {:>6.2} g  K {:>5.2}  T {:>6.2} °C",
                        sample.velocity, sample.acceleration, sample.kurtosis, sample.temperature
                    );
                }
                Ok(MonitorEvent::PollingStateChanged(false)) => {
                    println!("\nPolling ended");
                    break;
                }
                Ok(MonitorEvent::Status(message)) => println!("* {}", message),
                Ok(_) => {}
                Err(_) => break,
            },
            _ = &mut deadline => {
                orchestrator.stop_polling().await;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted");
                orchestrator.stop_polling().await;
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
