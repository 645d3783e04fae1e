//! Waveform download example
//!
//! Connects to the first ViPen found, downloads one velocity waveform and
//! prints a summary of it. Press Ctrl+C during the transfer to cancel.
//!
//! Run with: cargo run --example waveform_download

use std::sync::Arc;
use std::time::Duration;
use vipen_ble::{BtleplugAdapter, PollingOrchestrator, ProgressToken, Result, ViPenConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,vipen_ble=debug")
        .init();

    println!("ViPen Waveform Download");
    println!("=======================\n");

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let orchestrator = PollingOrchestrator::new(adapter, ViPenConfig::default());
    orchestrator.initialize().await?;

    println!("Waiting for a ViPen to advertise...");
    while orchestrator.last_seen_device().is_none() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let token = ProgressToken::new();

    let progress = {
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                if token.target_bytes() > 0 {
                    println!(
                        "  {:>5} / {} bytes ({:.0}%)",
                        token.bytes_received(),
                        token.target_bytes(),
                        token.fraction() * 100.0
                    );
                }
            }
        })
    };

    let cancel = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nCancelling...");
                token.cancel();
            }
        })
    };

    let result = orchestrator.download_waveform(&token).await;
    progress.abort();
    cancel.abort();

    match result {
        Ok(Some(waveform)) => {
            let amplitudes = waveform.amplitudes();
            let peak = amplitudes.iter().fold(0.0f64, |peak, a| peak.max(a.abs()));
            println!("\nWaveform {} captured at {}", waveform.wave_id(), waveform.timestamp());
            println!("  Coefficient: {}", waveform.coefficient());
            println!("  Samples:     {}", amplitudes.len());
            println!("  Peak:        {:.3}", peak);
        }
        Ok(None) => println!("\nDownload cancelled"),
        Err(e) => println!("\nDownload failed: {}", e),
    }

    orchestrator.shutdown().await;
    Ok(())
}
