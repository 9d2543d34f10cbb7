use ergolink::{CsafeDevice, DeviceEvent, LinkConfig, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // A serial device path, or "host:port" for a ser2net bridge.
    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    info!("🚴 Ergolink Telemetry Stream Example");
    info!("Polling CSAFE equipment at {endpoint}");

    let device = match CsafeDevice::connect(&endpoint, LinkConfig::default()) {
        Ok(device) => device,
        Err(e) => {
            error!("❌ Bad endpoint: {}", e);
            return Err(e);
        }
    };

    info!("Press Ctrl+C to stop streaming");
    let mut events = device.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("⏹  Stopping...");
                break;
            }
            event = events.recv() => match event {
                Ok(DeviceEvent::Telemetry(sample)) => {
                    println!("📊 {}: {:.2}", sample.metric, sample.value);
                }
                Ok(DeviceEvent::Status { status, .. }) => {
                    println!("🏋️  Machine status: {status}");
                }
                Ok(DeviceEvent::Connectivity { available: true }) => {
                    info!("✅ Link up");
                }
                Ok(DeviceEvent::Connectivity { available: false }) => {
                    warn!("❌ Link down, reconnecting...");
                }
                Ok(DeviceEvent::Frame(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("⚠️  Fell behind, {missed} events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    device.shutdown().await;
    info!("🎉 Done");
    Ok(())
}
