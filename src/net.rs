use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{ErgolinkError, Result},
    transport::Transport,
};

/// Time allowed for the TCP connect handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Transport`] over a serial-to-network bridge
///
/// Speaks raw bytes to a `host:port` endpoint, e.g. a ser2net instance or a
/// hardware serial-to-Ethernet converter sitting next to the machine. The
/// bridge is expected to forward bytes verbatim in both directions.
#[derive(Debug)]
pub struct NetTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl NetTransport {
    /// Create a transport for the given bridge host and port
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    /// Parse a `host:port` endpoint string
    ///
    /// The split is on the last colon so that IPv6-style hosts with
    /// embedded colons keep working.
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::InvalidEndpoint`] when there is no colon or
    /// the final segment is not a port number.
    pub fn parse_endpoint(endpoint: &str) -> Result<Self> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| ErgolinkError::InvalidEndpoint(endpoint.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ErgolinkError::InvalidEndpoint(endpoint.to_string()))?;
        if host.is_empty() {
            return Err(ErgolinkError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self::new(host, port))
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn open(&mut self) -> Result<()> {
        self.stream = None;
        let addr = self.addr();

        debug!(addr = %addr, "connecting to serial bridge");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ErgolinkError::TransportOpen(format!("{addr}: connect timed out")))?
            .map_err(|e| ErgolinkError::TransportOpen(format!("{addr}: {e}")))?;

        // Polling frames are tiny and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
        }

        info!(addr = %addr, "serial bridge connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!(addr = %self.addr(), error = %e, "TCP shutdown failed");
            }
            info!(addr = %self.addr(), "serial bridge disconnected");
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(ErgolinkError::NotOpen)?;

        trace!(addr = %format!("{}:{}", self.host, self.port), bytes = data.len(), "bridge write");
        stream.write_all(data).await.map_err(map_io_error)?;
        stream.flush().await.map_err(map_io_error)?;
        Ok(data.len())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(ErgolinkError::NotOpen)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            // A zero-byte TCP read means the bridge closed its end.
            Ok(Ok(0)) => Err(ErgolinkError::ConnectionLost),
            Ok(Ok(n)) => {
                trace!(addr = %format!("{}:{}", self.host, self.port), bytes = n, "bridge read");
                Ok(n)
            }
            Ok(Err(e)) => Err(map_io_error(e)),
            Err(_) => Err(ErgolinkError::Timeout),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
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
