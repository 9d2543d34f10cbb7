use thiserror::Error;

/// Errors that can occur when talking to CSAFE fitness equipment
#[derive(Error, Debug)]
pub enum ErgolinkError {
    /// The transport could not be opened
    #[error("failed to open transport: {0}")]
    TransportOpen(String),

    /// Operation attempted on a transport that is not open
    #[error("transport not open")]
    NotOpen,

    /// The link dropped mid-operation (peer closed, device unplugged)
    #[error("connection lost")]
    ConnectionLost,

    /// No data arrived within the read deadline
    #[error("read timed out")]
    Timeout,

    /// The pending command queue is at capacity
    #[error("command queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// A response frame could not be parsed at all
    ///
    /// Only surfaced by [`decode_strict`](crate::protocol::decode_strict);
    /// the poll loop treats malformed frames as "no new data".
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An endpoint string was neither a device path nor `host:port`
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ergolink operations
pub type Result<T> = std::result::Result<T, ErgolinkError>;

impl ErgolinkError {
    /// Check if this error indicates a broken or absent device link
    ///
    /// Connection errors feed the poll loop's failure counter and are
    /// never propagated to the consumer; they surface only as
    /// connectivity events.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::TransportOpen(_)
                | Self::NotOpen
                | Self::ConnectionLost
                | Self::Timeout
                | Self::Io(_)
        )
    }

    /// Check if this error is recoverable by retrying later
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::QueueFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let open_error = ErgolinkError::TransportOpen("no such device".to_string());
        assert!(open_error.is_connection_error());
        assert!(!open_error.is_recoverable());

        let timeout_error = ErgolinkError::Timeout;
        assert!(timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let queue_error = ErgolinkError::QueueFull { capacity: 8 };
        assert!(!queue_error.is_connection_error());
        assert!(queue_error.is_recoverable());

        let frame_error = ErgolinkError::MalformedFrame("bad checksum".to_string());
        assert!(!frame_error.is_connection_error());
        assert!(!frame_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = ErgolinkError::QueueFull { capacity: 5 };
        let error_string = format!("{error}");
        assert!(error_string.contains("command queue full"));
        assert!(error_string.contains('5'));
    }
}
