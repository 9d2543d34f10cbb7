use ergolink::{
    Command, CommandBatch, CsafeDevice, DeviceEvent, ErgolinkError, LinkConfig, Metric, Result,
};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    info!("⚡ Ergolink Ad-hoc Command Example");
    info!("Polling CSAFE equipment at {endpoint}");

    let device = CsafeDevice::connect(&endpoint, LinkConfig::default())?;

    // Slim down the background refresh cycle so the ad-hoc batches below
    // get answered promptly.
    device.set_refresh_commands(CommandBatch::new(vec![Command::GetStatus]));

    let mut events = device.subscribe();

    // Ask for an immediate power reading; the batch jumps ahead of the
    // refresh cycle.
    info!("🔍 Requesting current power output...");
    match device.submit(CommandBatch::new(vec![Command::GetPower])) {
        Ok(()) => {}
        Err(ErgolinkError::QueueFull { capacity }) => {
            warn!("⚠️  Queue full ({capacity} batches pending), try again later");
        }
        Err(e) => {
            error!("❌ Submit failed: {}", e);
            return Err(e);
        }
    }

    // Wait for the answer to come back through the event stream.
    let deadline = Duration::from_secs(10);
    let answer = timeout(deadline, async {
        loop {
            if let Ok(DeviceEvent::Telemetry(sample)) = events.recv().await {
                if sample.metric == Metric::PowerWatts {
                    return sample.value;
                }
            }
        }
    })
    .await;

    match answer {
        Ok(watts) => info!("✅ Current power: {watts:.0} W"),
        Err(_) => warn!("⏱  No power reading within {deadline:?} (machine idle?)"),
    }

    // Fire a burst of heart-rate requests to show the queue absorbing it.
    info!("💓 Submitting a burst of heart-rate requests...");
    let mut accepted = 0;
    for _ in 0..5 {
        match device.submit(CommandBatch::new(vec![Command::GetHeartRate])) {
            Ok(()) => accepted += 1,
            Err(ErgolinkError::QueueFull { .. }) => break,
            Err(e) => {
                error!("❌ Submit failed: {}", e);
                return Err(e);
            }
        }
    }
    info!("✅ {accepted} batches queued");

    sleep(Duration::from_secs(3)).await;

    info!("🔌 Shutting down...");
    device.shutdown().await;
    info!("🎉 Done");
    Ok(())
}
