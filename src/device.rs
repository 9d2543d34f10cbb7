use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::Result,
    net::NetTransport,
    protocol::CommandBatch,
    runner::PollRunner,
    scheduler::CommandScheduler,
    serial::SerialTransport,
    transport::Transport,
    types::{DeviceEvent, LinkConfig},
};

/// High-level handle to a CSAFE machine
///
/// `CsafeDevice` owns the background poll loop and exposes the three things
/// a consumer needs: an event stream of derived telemetry, a non-blocking
/// way to submit ad-hoc command batches, and a clean shutdown. The loop
/// keeps itself alive through unplugged cables, powered-down consoles and
/// flaky bridges; the consumer only ever sees connectivity events and the
/// presence or absence of fresh telemetry.
///
/// # Examples
///
/// ```no_run
/// use ergolink::{CsafeDevice, DeviceEvent, LinkConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     // A serial device path, or "host:port" for a ser2net bridge.
///     let device = CsafeDevice::connect("/dev/ttyUSB0", LinkConfig::default())?;
///
///     let mut events = device.subscribe();
///     while let Ok(event) = events.recv().await {
///         match event {
///             DeviceEvent::Telemetry(sample) => {
///                 println!("{}: {:.1}", sample.metric, sample.value);
///             }
///             DeviceEvent::Connectivity { available } => {
///                 println!("link available: {available}");
///             }
///             _ => {}
///         }
///     }
///
///     device.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct CsafeDevice {
    scheduler: Arc<CommandScheduler>,
    events: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CsafeDevice {
    /// Start polling the machine behind `endpoint`
    ///
    /// An endpoint containing a colon is treated as a `host:port`
    /// serial-to-network bridge (split on the last colon); anything else is
    /// a local serial device path opened at `config.serial_baud`. The
    /// transport itself is opened by the poll loop, so this succeeds even
    /// while the machine is still unreachable — polling begins once it
    /// appears.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::InvalidEndpoint`](crate::ErgolinkError::InvalidEndpoint)
    /// when a `host:port` endpoint cannot be parsed.
    pub fn connect(endpoint: &str, config: LinkConfig) -> Result<Self> {
        let transport = transport_for_endpoint(endpoint, &config)?;
        info!(endpoint = %endpoint, "starting CSAFE link");
        Ok(Self::start(transport, config))
    }

    /// Start polling over an already-constructed transport
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        let scheduler = Arc::new(CommandScheduler::new(config.queue_capacity));
        let (events, _) = broadcast::channel(config.event_capacity);
        let cancel = CancellationToken::new();

        let runner = PollRunner::new(
            transport,
            Arc::clone(&scheduler),
            events.clone(),
            cancel.clone(),
            config,
        );
        let task = tokio::spawn(runner.run());

        Self {
            scheduler,
            events,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Subscribe to telemetry, status, connectivity and raw-frame events
    ///
    /// Each call returns an independent receiver. Delivery is best-effort:
    /// a receiver that falls behind the channel capacity misses events
    /// rather than stalling the poll loop.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Submit an ad-hoc command batch for the next poll cycles
    ///
    /// Pending batches take priority over the background refresh set, one
    /// batch per cycle. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::QueueFull`](crate::ErgolinkError::QueueFull)
    /// when the pending queue is at capacity; drop the batch and retry
    /// later.
    pub fn submit(&self, batch: CommandBatch) -> Result<()> {
        self.scheduler.enqueue(batch)
    }

    /// Replace the background refresh batch
    ///
    /// Takes effect on the next poll cycle.
    pub fn set_refresh_commands(&self, batch: CommandBatch) {
        self.scheduler.set_refresh_batch(batch);
    }

    /// Whether the poll loop task is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("device lock poisoned")
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop polling and wait for the loop to finish
    ///
    /// The loop closes the transport as its last step. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("device lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "poll task did not shut down cleanly");
            }
        }
    }
}

impl Drop for CsafeDevice {
    fn drop(&mut self) {
        // The task cannot be awaited here; cancelling is enough for it to
        // wind down and close the transport on its own.
        self.cancel.cancel();
    }
}

/// Pick a transport implementation from an endpoint string
fn transport_for_endpoint(endpoint: &str, config: &LinkConfig) -> Result<Box<dyn Transport>> {
    if endpoint.contains(':') {
        Ok(Box::new(NetTransport::parse_endpoint(endpoint)?))
    } else {
        Ok(Box::new(SerialTransport::new(
            endpoint,
            config.serial_baud,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErgolinkError;
    use crate::protocol::Command;
    use crate::test_util::{power_response, ReadStep, ScriptedTransport};
    use crate::types::Metric;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> LinkConfig {
        LinkConfig {
            poll_interval: Duration::from_millis(1),
            read_timeout: Duration::from_millis(100),
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_endpoint_routing() {
        let config = LinkConfig::default();

        assert!(transport_for_endpoint("/dev/ttyUSB0", &config).is_ok());
        assert!(transport_for_endpoint("COM3", &config).is_ok());
        assert!(transport_for_endpoint("192.168.1.50:4001", &config).is_ok());
        assert!(matches!(
            transport_for_endpoint("bridge:notaport", &config),
            Err(ErgolinkError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_device_streams_telemetry_and_shuts_down() {
        let transport = ScriptedTransport::new();
        transport.push_read(ReadStep::Frame(power_response(185)));

        let device = CsafeDevice::start(Box::new(transport.clone()), test_config());
        assert!(device.is_running());

        let mut events = device.subscribe();
        let mut power = None;
        while power.is_none() {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for telemetry")
                .expect("event channel closed");
            if let DeviceEvent::Telemetry(sample) = event {
                if sample.metric == Metric::PowerWatts {
                    power = Some(sample.value);
                }
            }
        }
        assert_eq!(power, Some(185.0));

        device.shutdown().await;
        assert!(!device.is_running());
        assert!(!transport.is_open_now());
        assert!(transport.closes() >= 1);
    }

    #[tokio::test]
    async fn test_submit_surfaces_queue_full() {
        let transport = ScriptedTransport::new();
        let config = LinkConfig {
            queue_capacity: 0,
            ..test_config()
        };
        let device = CsafeDevice::start(Box::new(transport), config);

        let result = device.submit(CommandBatch::new(vec![Command::GetStatus]));
        assert!(matches!(
            result,
            Err(ErgolinkError::QueueFull { capacity: 0 })
        ));

        device.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_refresh_commands_changes_polled_set() {
        let transport = ScriptedTransport::new();
        let device = CsafeDevice::start(Box::new(transport.clone()), test_config());
        device.set_refresh_commands(CommandBatch::new(vec![Command::GetHeartRate]));

        // Wait until a request written after the refresh change shows up.
        let expected = crate::protocol::encode(&CommandBatch::new(vec![Command::GetHeartRate]));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if transport
                .writes()
                .iter()
                .any(|w| w.as_slice() == expected.as_ref())
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "refresh batch never sent"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        device.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let transport = ScriptedTransport::new();
        let device = CsafeDevice::start(Box::new(transport), test_config());

        device.shutdown().await;
        device.shutdown().await;
        assert!(!device.is_running());
    }
}
