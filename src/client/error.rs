use std::fmt;
use std::time::Duration;

use crate::link::LinkError;
use crate::protocol::FragmentError;

/// Why the device refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Control NACK.
    Nack,
    /// Control BUFFER_FULL.
    BufferFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nack => write!(f, "NACK"),
            Self::BufferFull => write!(f, "buffer full"),
        }
    }
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Device selection, GATT connection or discovery failed.
    Connection(LinkError),
    /// Operation requires an open connection.
    NotConnected,
    /// No response arrived in time.
    Timeout { message_id: u8, timeout: Duration },
    /// The device refused the request.
    Rejected { message_id: u8, reason: RejectReason },
    /// Outbound message could not be fragmented.
    Protocol(FragmentError),
    /// A newer request took over this request's message id.
    Superseded { message_id: u8 },
    /// A characteristic write failed.
    Link(LinkError),
    /// The connection closed while the request was pending.
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection failed: {}", e),
            Self::NotConnected => write!(f, "not connected"),
            Self::Timeout {
                message_id,
                timeout,
            } => write!(
                f,
                "request {} timed out after {} ms",
                message_id,
                timeout.as_millis()
            ),
            Self::Rejected { message_id, reason } => {
                write!(f, "request {} rejected: {}", message_id, reason)
            }
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Superseded { message_id } => {
                write!(f, "request {} superseded by a newer request", message_id)
            }
            Self::Link(e) => write!(f, "link error: {}", e),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) | Self::Link(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FragmentError> for ClientError {
    fn from(e: FragmentError) -> Self {
        Self::Protocol(e)
    }
}

impl From<LinkError> for ClientError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::NotConnected => Self::NotConnected,
            other => Self::Link(other),
        }
    }
}
