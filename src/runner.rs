use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    metrics::MetricDeriver,
    protocol::{self, FLAG_STOP},
    scheduler::CommandScheduler,
    transport::Transport,
    types::{BackoffPolicy, DeviceEvent, LinkConfig},
};

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable link; the next cycle will attempt an open
    Disconnected,
    /// An open attempt is in flight
    Connecting,
    /// The link is open and polling
    Connected,
}

/// Tracks consecutive failures and decides when the link must be reopened
///
/// The failure counter is reset only by a successful read of at least one
/// byte — a successful open proves nothing about the device behind a USB
/// adapter or a ser2net bridge, so it leaves the counter alone and lets the
/// backoff keep growing until real data arrives.
#[derive(Debug)]
struct ConnectionManager {
    state: ConnectionState,
    failures: u32,
    threshold: u32,
    backoff: BackoffPolicy,
}

impl ConnectionManager {
    fn new(config: &LinkConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failures: 0,
            threshold: config.reconnect_threshold,
            backoff: config.backoff,
        }
    }

    const fn state(&self) -> ConnectionState {
        self.state
    }

    const fn failures(&self) -> u32 {
        self.failures
    }

    fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    fn opened(&mut self) {
        self.state = ConnectionState::Connected;
    }

    fn open_failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.state = ConnectionState::Disconnected;
    }

    /// Record a write/read failure; returns `true` when the threshold was
    /// crossed and the link has been marked for reopening
    fn io_failed(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.threshold && self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            return true;
        }
        false
    }

    fn read_succeeded(&mut self) {
        self.failures = 0;
    }

    fn backoff_delay(&self) -> Duration {
        self.backoff.delay(self.failures)
    }
}

/// The single driving loop behind a [`CsafeDevice`](crate::device::CsafeDevice)
///
/// Each cycle ensures the transport is open, sends the scheduler's next
/// batch, reassembles one delimited response, decodes it, and publishes the
/// derived telemetry. All transport faults are absorbed into the
/// failure-counter/backoff machinery and surfaced as connectivity events;
/// the loop itself runs until cancelled and has no failure mode.
pub struct PollRunner {
    transport: Box<dyn Transport>,
    scheduler: Arc<CommandScheduler>,
    config: LinkConfig,
    events: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
    deriver: MetricDeriver,
    connection: ConnectionManager,
    /// Last availability announced to subscribers, for edge-triggering
    announced: Option<bool>,
}

impl PollRunner {
    /// Create a runner over the given transport and scheduler
    #[must_use]
    pub fn new(
        transport: Box<dyn Transport>,
        scheduler: Arc<CommandScheduler>,
        events: broadcast::Sender<DeviceEvent>,
        cancel: CancellationToken,
        config: LinkConfig,
    ) -> Self {
        let deriver = MetricDeriver::new(&config);
        let connection = ConnectionManager::new(&config);
        Self {
            transport,
            scheduler,
            config,
            events,
            cancel,
            deriver,
            connection,
            announced: None,
        }
    }

    /// Drive the poll loop until the cancellation token fires
    ///
    /// Closing the transport is the loop's final act, after the last cycle
    /// has finished.
    pub async fn run(mut self) {
        info!("poll loop started");

        while !self.cancel.is_cancelled() {
            self.cycle().await;
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "transport close failed during shutdown");
        }
        info!("poll loop stopped");
    }

    /// One poll cycle: ensure connection, send, receive, dispatch, sleep
    async fn cycle(&mut self) {
        if !self.ensure_open().await {
            // ensure_open already slept for the backoff delay.
            return;
        }

        let batch = self.scheduler.next_batch();
        if batch.is_empty() {
            self.sleep(self.config.poll_interval).await;
            return;
        }

        let request = protocol::encode(&batch);
        trace!(bytes = request.len(), commands = batch.len(), "sending request frame");
        if let Err(e) = self.transport.write(&request).await {
            warn!(error = %e, "request write failed");
            self.record_failure();
            return;
        }

        let mut buf = vec![0u8; self.config.max_frame_bytes];
        let n = match self
            .transport
            .read_frame(&mut buf, FLAG_STOP, self.config.read_timeout)
            .await
        {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                debug!("empty read");
                self.record_failure();
                return;
            }
            Err(e) => {
                debug!(error = %e, "response read failed");
                self.record_failure();
                return;
            }
        };

        self.connection.read_succeeded();
        self.dispatch(&buf[..n]);
        self.sleep(self.config.poll_interval).await;
    }

    /// Open (or reopen) the transport when the link is marked down
    ///
    /// On failure the backoff delay is slept here, so the caller simply
    /// restarts the cycle; cancellation interrupts the sleep.
    async fn ensure_open(&mut self) -> bool {
        if self.transport.is_open() && self.connection.state() == ConnectionState::Connected {
            return true;
        }

        self.connection.connecting();
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "close before reopen failed");
        }

        match self.transport.open().await {
            Ok(()) => {
                self.connection.opened();
                self.announce(true);
                true
            }
            Err(e) => {
                self.connection.open_failed();
                self.announce(false);
                let delay = self.connection.backoff_delay();
                warn!(
                    error = %e,
                    failures = self.connection.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "open failed, backing off"
                );
                self.sleep(delay).await;
                false
            }
        }
    }

    fn record_failure(&mut self) {
        if self.connection.io_failed() {
            warn!(
                failures = self.connection.failures(),
                "failure threshold exceeded, link marked for reopen"
            );
            self.announce(false);
        }
    }

    /// Decode a raw response and publish the resulting events
    ///
    /// Delivery is fire-and-forget over the broadcast channel: a slow or
    /// absent subscriber never stalls the loop.
    fn dispatch(&mut self, raw: &[u8]) {
        trace!(bytes = raw.len(), "response frame received");
        let decoded = protocol::decode(raw);
        let _ = self.events.send(DeviceEvent::Frame(decoded.clone()));
        for event in self
            .deriver
            .apply(&decoded, Instant::now(), SystemTime::now())
        {
            let _ = self.events.send(event);
        }
    }

    fn announce(&mut self, available: bool) {
        if self.announced != Some(available) {
            self.announced = Some(available);
            info!(available, "connectivity changed");
            let _ = self.events.send(DeviceEvent::Connectivity { available });
        }
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }
}
