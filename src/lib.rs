#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergolink 🚴
//!
//! A Rust library for streaming live telemetry from CSAFE fitness
//! equipment over serial or network links.
//!
//! CSAFE is the command/response protocol spoken by a large family of
//! gym ellipticals, rowers and bikes over a 9600-baud serial console port.
//! This library continuously polls such a machine — directly through a
//! USB-serial adapter, or through a ser2net-style serial-to-Ethernet
//! bridge — and turns the raw framed responses into a typed event stream
//! of power, speed, cadence, heart rate, calories, distance and machine
//! status.
//!
//! ## Design
//!
//! The hard part of talking to this class of equipment is not the protocol
//! but the link: consoles power down mid-session, USB adapters disappear,
//! bridges drop TCP connections, and half-written frames arrive with bad
//! checksums. The poll loop here is built to run unattended for weeks:
//!
//! - **Self-healing link**: consecutive transport failures are counted and,
//!   past a threshold, the link is closed and reopened with a bounded,
//!   growing backoff. Consumers only ever see connectivity events.
//! - **Tolerant decoding**: garbled or truncated frames decode to "no new
//!   data", never an error.
//! - **Stable telemetry**: an idle machine keeps reporting its last values;
//!   the metric deriver watches the distance counter and zeroes dependent
//!   metrics once it goes stale, debounces status changes, and derives
//!   speed from distance deltas for models with no usable speed field.
//! - **Responsive polling**: ad-hoc command batches jump ahead of the
//!   background refresh cycle without disturbing its rhythm.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergolink::{CsafeDevice, DeviceEvent, LinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Serial path or "host:port" bridge endpoint.
//!     let device = CsafeDevice::connect("/dev/ttyUSB0", LinkConfig::default())?;
//!
//!     let mut events = device.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let DeviceEvent::Telemetry(sample) = event {
//!             println!("{}: {:.1}", sample.metric, sample.value);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Derived-metric state machine
pub mod metrics;
/// Serial-to-network bridge transport
pub mod net;
/// CSAFE frame encoding and decoding
pub mod protocol;
/// The background poll loop and connection management
pub mod runner;
/// Command batch scheduling
pub mod scheduler;
/// Local serial port transport
pub mod serial;
/// Byte-level transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export the main types for convenient usage
pub use device::CsafeDevice;
pub use error::{ErgolinkError, Result};
pub use metrics::MetricDeriver;
pub use net::NetTransport;
pub use protocol::{decode, decode_strict, encode, Command, CommandBatch, DecodedFrame, RawReading};
pub use runner::{ConnectionState, PollRunner};
pub use scheduler::CommandScheduler;
pub use serial::{SerialConfig, SerialTransport};
pub use transport::Transport;
pub use types::{
    BackoffPolicy, DeviceEvent, HeartRateSource, LinkConfig, MachineStatus, Metric, SpeedSource,
    TelemetrySample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
