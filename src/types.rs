use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::SystemTime};

use crate::protocol::DecodedFrame;

/// A derived telemetry metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    /// Instantaneous mechanical power in watts
    PowerWatts,
    /// Speed in kilometres per hour
    SpeedKmh,
    /// Cadence in revolutions per minute
    CadenceRpm,
    /// Heart rate in beats per minute
    HeartRateBpm,
    /// Accumulated energy in kilocalories
    CaloriesKcal,
    /// Accumulated distance in kilometres
    DistanceKm,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerWatts => write!(f, "power (W)"),
            Self::SpeedKmh => write!(f, "speed (km/h)"),
            Self::CadenceRpm => write!(f, "cadence (rpm)"),
            Self::HeartRateBpm => write!(f, "heart rate (bpm)"),
            Self::CaloriesKcal => write!(f, "calories (kcal)"),
            Self::DistanceKm => write!(f, "distance (km)"),
        }
    }
}

/// CSAFE state-machine status reported by the equipment
///
/// Decoded from the low nibble of the response status byte; the high bit
/// is the frame-toggle bit and is masked off before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    /// Equipment fault
    Error,
    /// Powered and ready for a workout
    Ready,
    /// Idle screen
    Idle,
    /// User identified, workout not started
    HaveId,
    /// Workout in progress
    InUse,
    /// Workout paused
    Paused,
    /// Workout finished
    Finished,
    /// Manual (offline programming) mode
    Manual,
    /// Equipment offline
    Offline,
    /// Status byte outside the documented state set
    Unknown,
}

impl MachineStatus {
    /// Decode a raw CSAFE status byte
    #[must_use]
    pub const fn from_status_byte(byte: u8) -> Self {
        match byte & 0x0F {
            0x00 => Self::Error,
            0x01 => Self::Ready,
            0x02 => Self::Idle,
            0x03 => Self::HaveId,
            0x05 => Self::InUse,
            0x06 => Self::Paused,
            0x07 => Self::Finished,
            0x08 => Self::Manual,
            0x09 => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "Error"),
            Self::Ready => write!(f, "Ready"),
            Self::Idle => write!(f, "Idle"),
            Self::HaveId => write!(f, "HaveId"),
            Self::InUse => write!(f, "InUse"),
            Self::Paused => write!(f, "Paused"),
            Self::Finished => write!(f, "Finished"),
            Self::Manual => write!(f, "Manual"),
            Self::Offline => write!(f, "Offline"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One derived telemetry value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Which metric this sample carries
    pub metric: Metric,
    /// Value in the metric's unit
    pub value: f64,
    /// Wall-clock time the source frame was decoded
    pub timestamp: SystemTime,
}

impl TelemetrySample {
    /// Create a new sample
    #[must_use]
    pub const fn new(metric: Metric, value: f64, timestamp: SystemTime) -> Self {
        Self {
            metric,
            value,
            timestamp,
        }
    }
}

/// Event published by the poll loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// A derived metric was updated
    Telemetry(TelemetrySample),
    /// The machine status changed (debounced; repeats are suppressed)
    Status {
        /// New machine status
        status: MachineStatus,
        /// Wall-clock time the source frame was decoded
        timestamp: SystemTime,
    },
    /// The device link became available or unavailable
    Connectivity {
        /// `true` once the transport is open and responding
        available: bool,
    },
    /// A response frame was decoded (diagnostics)
    Frame(DecodedFrame),
}

/// Where the speed metric comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedSource {
    /// Derive speed from consecutive distance readings
    ///
    /// Used for models that report distance but no usable speed field.
    DistanceDelta,
    /// Use the speed/pace fields reported by the equipment
    Reported,
}

/// Where the heart-rate metric comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartRateSource {
    /// Use the equipment's own heart-rate reading
    ///
    /// A zero reading still defers to the external source, since most
    /// machines report 0 when no grip/belt contact is present.
    Device,
    /// Ignore device heart rate entirely (a paired belt supplies it)
    External,
}

/// Reconnect backoff policy
///
/// Both variants are bounded and non-decreasing in the failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Delay grows linearly with consecutive failures, up to a cap
    Linear {
        /// Delay added per consecutive failure
        step: Duration,
        /// Upper bound on the delay
        cap: Duration,
    },
    /// Fixed delay between reconnect attempts
    Flat(Duration),
}

impl BackoffPolicy {
    /// Delay to wait before the next open attempt
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Linear { step, cap } => step.saturating_mul(failures).min(cap),
            Self::Flat(delay) => delay,
        }
    }
}

/// Tunables for the protocol runner
///
/// Injected once at construction; the runner never consults global state.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Sleep between poll cycles
    pub poll_interval: Duration,
    /// Deadline for assembling one response frame
    ///
    /// The CSAFE spec nominal timeout is 1 s; 1.2 s leaves headroom for
    /// slow USB-serial adapters.
    pub read_timeout: Duration,
    /// Byte budget for one response frame
    pub max_frame_bytes: usize,
    /// Capacity of the pending command queue
    pub queue_capacity: usize,
    /// Consecutive failures before the link is closed and reopened
    pub reconnect_threshold: u32,
    /// Delay policy between reconnect attempts
    pub backoff: BackoffPolicy,
    /// How long distance may stay unchanged before dependent metrics zero
    pub staleness_window: Duration,
    /// Speed derivation policy
    pub speed_source: SpeedSource,
    /// Heart-rate source selection
    pub heart_rate_source: HeartRateSource,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Baud rate used when opening a serial endpoint
    pub serial_baud: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            read_timeout: Duration::from_millis(1200),
            max_frame_bytes: 100,
            queue_capacity: 8,
            reconnect_threshold: 10,
            backoff: BackoffPolicy::Linear {
                step: Duration::from_secs(1),
                cap: Duration::from_secs(30),
            },
            staleness_window: Duration::from_secs(20),
            speed_source: SpeedSource::DistanceDelta,
            heart_rate_source: HeartRateSource::Device,
            event_capacity: 64,
            serial_baud: 9600,
        }
    }
}
