use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ErgolinkError, Result};

/// Byte-level link to a piece of CSAFE equipment
///
/// Implementations cover a local serial device ([`crate::serial::SerialTransport`])
/// and a serial-to-network bridge ([`crate::net::NetTransport`]). The poll
/// loop drives whichever implementation it is given; protocol framing and
/// reconnect policy live above this trait.
///
/// All operations take bounded time: writes block until the bytes are
/// handed to the OS, reads block no longer than the supplied timeout.
#[async_trait]
pub trait Transport: Send {
    /// Open the underlying device or socket
    ///
    /// Reopening an already-open transport is allowed and re-establishes
    /// the link from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::TransportOpen`] when the device or peer is
    /// unreachable.
    async fn open(&mut self) -> Result<()>;

    /// Close the link; subsequent IO fails with [`ErgolinkError::NotOpen`]
    ///
    /// # Errors
    ///
    /// Returns an IO error if the close handshake fails; the transport is
    /// considered closed regardless.
    async fn close(&mut self) -> Result<()>;

    /// Write all bytes, returning how many were written
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::NotOpen`], [`ErgolinkError::ConnectionLost`]
    /// or an IO error.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read available bytes into `buf`, waiting up to `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::Timeout`] when nothing arrives in time,
    /// [`ErgolinkError::ConnectionLost`] when the link drops, or
    /// [`ErgolinkError::NotOpen`].
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Whether the transport currently holds an open link
    fn is_open(&self) -> bool;

    /// Read until `delimiter` is seen, `buf` is full, or `timeout` elapses
    ///
    /// Returns the number of bytes read, including the delimiter when one
    /// was found. Bytes already read are kept across the internal read
    /// calls, so a frame split across several chunks is reassembled here.
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::Timeout`] when the deadline passes with no
    /// bytes at all; a partial read (some bytes but no delimiter) is
    /// returned as-is for the codec to reject.
    async fn read_frame(
        &mut self,
        buf: &mut [u8],
        delimiter: u8,
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let n = match self.read(&mut buf[filled..], remaining).await {
                Ok(n) => n,
                Err(ErgolinkError::Timeout) => break,
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }

            if let Some(pos) = buf[filled..filled + n].iter().position(|&b| b == delimiter) {
                return Ok(filled + pos + 1);
            }
            filled += n;
        }

        if filled == 0 {
            Err(ErgolinkError::Timeout)
        } else {
            Ok(filled)
        }
    }
}
