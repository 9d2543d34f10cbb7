use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{ErgolinkError, Result},
    transport::Transport,
};

/// Serial port configuration
///
/// CSAFE consoles speak 9600 baud, 8 data bits, 1 stop bit, no parity, no
/// flow control; the defaults match.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: tokio_serial::DataBits,
    /// Stop bits per character
    pub stop_bits: tokio_serial::StopBits,
    /// Parity checking
    pub parity: tokio_serial::Parity,
    /// Flow control
    pub flow_control: tokio_serial::FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
            flow_control: tokio_serial::FlowControl::None,
        }
    }
}

/// [`Transport`] over a local serial device
///
/// Covers USB-serial adapters and built-in UARTs
/// (`/dev/ttyUSB0`-style paths on Unix, `COM3`-style names on Windows).
/// The port is opened lazily by the poll loop so that a machine plugged in
/// after startup is picked up by the normal reconnect path.
pub struct SerialTransport {
    path: String,
    config: SerialConfig,
    port: Option<SerialStream>,
}

impl SerialTransport {
    /// Create a transport for `path` at the given baud rate
    #[must_use]
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::with_config(
            path,
            SerialConfig {
                baud_rate,
                ..SerialConfig::default()
            },
        )
    }

    /// Create a transport with full serial settings
    #[must_use]
    pub fn with_config(path: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            path: path.into(),
            config,
            port: None,
        }
    }

    /// The device path this transport opens
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        self.port = None;

        debug!(path = %self.path, baud = self.config.baud_rate, "opening serial port");

        let port = tokio_serial::new(&self.path, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity)
            .flow_control(self.config.flow_control)
            .open_native_async()
            .map_err(|e| {
                ErgolinkError::TransportOpen(format!("serial port {}: {e}", self.path))
            })?;

        info!(path = %self.path, baud = self.config.baud_rate, "serial port open");
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                warn!(path = %self.path, error = %e, "flush before close failed");
            }
            info!(path = %self.path, "serial port closed");
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(ErgolinkError::NotOpen)?;

        trace!(path = %self.path, bytes = data.len(), "serial write");
        port.write_all(data).await.map_err(map_io_error)?;
        port.flush().await.map_err(map_io_error)?;
        Ok(data.len())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(ErgolinkError::NotOpen)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                trace!(path = %self.path, bytes = n, "serial read");
                Ok(n)
            }
            Ok(Err(e)) => Err(map_io_error(e)),
            Err(_) => Err(ErgolinkError::Timeout),
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

fn map_io_error(e: std::io::Error) -> ErgolinkError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset => ErgolinkError::ConnectionLost,
        _ => ErgolinkError::Io(e),
    }
}
