use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

use crate::{
    protocol::{unit, DecodedFrame, RawReading},
    types::{
        DeviceEvent, HeartRateSource, LinkConfig, MachineStatus, Metric, SpeedSource,
        TelemetrySample,
    },
};

/// Stateful transform from decoded frames to telemetry events
///
/// One deriver instance lives inside the poll loop and sees every decoded
/// frame in arrival order. It normalises units, suppresses values from an
/// idle or disconnected machine, derives speed from distance deltas when
/// the model reports no usable speed field, and debounces status changes.
///
/// The distance field doubles as a liveness signal: a machine that is
/// actually being used keeps advancing its distance counter, while an
/// abandoned or powered-down console keeps reporting its last (or zeroed)
/// power and cadence values forever. Once distance has been flat for the
/// staleness window, the dependent metrics are forced to zero and further
/// updates are suppressed until distance moves again.
#[derive(Debug)]
pub struct MetricDeriver {
    staleness_window: Duration,
    speed_source: SpeedSource,
    heart_rate_source: HeartRateSource,
    /// Last distance reading, in metres
    distance_m: Option<f64>,
    /// When the distance reading last changed
    distance_changed_at: Option<Instant>,
    /// Whether the machine currently counts as live
    ///
    /// Starts `true` so that a session attached mid-workout reports real
    /// values immediately; the staleness window is what clears it.
    changing: bool,
    last_status: Option<MachineStatus>,
}

impl MetricDeriver {
    /// Create a deriver with the policy fields of `config`
    #[must_use]
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            staleness_window: config.staleness_window,
            speed_source: config.speed_source,
            heart_rate_source: config.heart_rate_source,
            distance_m: None,
            distance_changed_at: None,
            changing: true,
            last_status: None,
        }
    }

    /// Whether distance is currently advancing
    #[must_use]
    pub const fn is_changing(&self) -> bool {
        self.changing
    }

    /// Fold one decoded frame into the state, producing telemetry events
    ///
    /// `now` orders frames and drives the staleness window; `timestamp` is
    /// stamped onto the emitted events. Fields absent from the frame mean
    /// "no update this cycle" and produce nothing.
    pub fn apply(
        &mut self,
        frame: &DecodedFrame,
        now: Instant,
        timestamp: SystemTime,
    ) -> Vec<DeviceEvent> {
        let mut events = Vec::new();

        // The staleness invariant must hold no matter which fields the
        // frame carries, so it is evaluated before any of them.
        if self.changing {
            if let Some(changed_at) = self.distance_changed_at {
                if now.duration_since(changed_at) > self.staleness_window {
                    debug!(
                        stale_for_ms = now.duration_since(changed_at).as_millis() as u64,
                        "distance stale, zeroing dependent metrics"
                    );
                    self.changing = false;
                    for metric in [Metric::PowerWatts, Metric::CadenceRpm, Metric::SpeedKmh] {
                        events.push(telemetry(metric, 0.0, timestamp));
                    }
                }
            }
        }

        if let Some(reading) = frame.distance {
            self.apply_distance(reading, now, timestamp, &mut events);
        }

        if let Some(reading) = frame.power {
            if self.changing {
                events.push(telemetry(Metric::PowerWatts, reading.value, timestamp));
            }
        }

        if let Some(reading) = frame.speed {
            if is_rpm_unit(reading.unit) {
                // Some consoles report cadence on the speed field, tagged
                // with an rpm unit code.
                if self.changing {
                    events.push(telemetry(Metric::CadenceRpm, reading.value, timestamp));
                }
            } else if self.speed_source == SpeedSource::Reported && self.changing {
                events.push(telemetry(Metric::SpeedKmh, speed_to_kmh(reading), timestamp));
            }
        }

        if let Some(reading) = frame.pace {
            if self.speed_source == SpeedSource::Reported && self.changing && reading.value > 0.0 {
                events.push(telemetry(Metric::SpeedKmh, pace_to_kmh(reading), timestamp));
            }
        }

        if let Some(reading) = frame.cadence {
            if self.changing {
                events.push(telemetry(Metric::CadenceRpm, reading.value, timestamp));
            }
        }

        if let Some(reading) = frame.heart_rate {
            // A zero reading means no grip/belt contact; the external
            // heart-rate source keeps precedence in that case whatever the
            // configuration says.
            if reading.value > 0.0 && self.heart_rate_source == HeartRateSource::Device {
                events.push(telemetry(Metric::HeartRateBpm, reading.value, timestamp));
            }
        }

        if let Some(reading) = frame.calories {
            events.push(telemetry(Metric::CaloriesKcal, reading.value, timestamp));
        }

        if let Some(status) = frame.status {
            if self.last_status != Some(status) {
                self.last_status = Some(status);
                events.push(DeviceEvent::Status { status, timestamp });
            }
        }

        events
    }

    fn apply_distance(
        &mut self,
        reading: RawReading,
        now: Instant,
        timestamp: SystemTime,
        events: &mut Vec<DeviceEvent>,
    ) {
        let meters = distance_to_meters(reading);
        let changed = self
            .distance_m
            .is_none_or(|prev| (meters - prev).abs() > f64::EPSILON);
        if !changed {
            return;
        }

        if self.speed_source == SpeedSource::DistanceDelta {
            if let (Some(prev), Some(changed_at)) = (self.distance_m, self.distance_changed_at) {
                let elapsed_ms = now.duration_since(changed_at).as_millis() as f64;
                if prev > 0.0 && elapsed_ms > 0.0 {
                    let kmh = 3600.0 * (meters - prev) / elapsed_ms;
                    events.push(telemetry(Metric::SpeedKmh, kmh, timestamp));
                }
            }
        }

        self.changing = true;
        self.distance_m = Some(meters);
        self.distance_changed_at = Some(now);
        events.push(telemetry(Metric::DistanceKm, meters / 1000.0, timestamp));
    }
}

fn telemetry(metric: Metric, value: f64, timestamp: SystemTime) -> DeviceEvent {
    DeviceEvent::Telemetry(TelemetrySample::new(metric, value, timestamp))
}

fn is_rpm_unit(code: Option<u8>) -> bool {
    matches!(
        code,
        Some(unit::REVS_PER_MINUTE | unit::STRIDES_PER_MINUTE | unit::STROKES_PER_MINUTE)
    )
}

fn distance_to_meters(reading: RawReading) -> f64 {
    let v = reading.value;
    match reading.unit {
        Some(unit::MILE) => v * 1609.344,
        Some(unit::TENTH_MILE) => v * 160.9344,
        Some(unit::HUNDREDTH_MILE) => v * 16.09344,
        Some(unit::FEET) => v * 0.3048,
        Some(unit::KILOMETER) => v * 1000.0,
        Some(unit::TENTH_KILOMETER) => v * 100.0,
        Some(unit::HUNDREDTH_KILOMETER) => v * 10.0,
        Some(unit::TENTH_METER) => v * 0.1,
        Some(unit::CENTIMETER) => v * 0.01,
        // Metres, and unitless readings which the C2-style consoles send
        // as metres.
        _ => v,
    }
}

fn speed_to_kmh(reading: RawReading) -> f64 {
    let v = reading.value;
    match reading.unit {
        Some(unit::MILE_PER_HOUR) => v * 1.609_344,
        Some(unit::TENTH_MILE_PER_HOUR) => v * 0.160_934_4,
        Some(unit::HUNDREDTH_MILE_PER_HOUR) => v * 0.016_093_44,
        Some(unit::FEET_PER_MINUTE) => v * 0.018_288,
        Some(unit::TENTH_KM_PER_HOUR) => v * 0.1,
        Some(unit::HUNDREDTH_KM_PER_HOUR) => v * 0.01,
        Some(unit::METER_PER_MINUTE) => v * 0.06,
        _ => v,
    }
}

/// Convert a pace reading to km/h; the caller guards against zero pace
fn pace_to_kmh(reading: RawReading) -> f64 {
    let v = reading.value;
    match reading.unit {
        Some(unit::MINUTES_PER_KM) => 60.0 / v,
        Some(unit::MINUTES_PER_MILE) => 60.0 / v * 1.609_344,
        Some(unit::SECONDS_PER_MILE) => 3600.0 / v * 1.609_344,
        _ => 3600.0 / v,
    }
}
