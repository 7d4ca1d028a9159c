//! Protocol message types and the logical channels they travel on.

use std::fmt;

/// Protocol-level message type carried in byte 0 of every fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolMessageType {
    /// Client to device request.
    Request = 0x01,
    /// Device reply to a request.
    Response = 0x02,
    /// Unsolicited device notification.
    Event = 0x03,
    /// Flow-control and negotiation traffic.
    Control = 0x04,
}

impl ProtocolMessageType {
    /// Decode a wire byte, returning `None` for unassigned values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Event),
            0x04 => Some(Self::Control),
            _ => None,
        }
    }

    /// Wire representation.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ProtocolMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Event => write!(f, "event"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// One of the four GATT characteristics exposed by the hub service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Write-only, carries fragmented requests.
    Request,
    /// Notify, carries fragmented responses.
    Response,
    /// Notify, carries fragmented events.
    Event,
    /// Write and notify, carries unfragmented control messages.
    Control,
}

impl Channel {
    /// The protocol message type normally carried on this channel.
    pub fn message_type(self) -> ProtocolMessageType {
        match self {
            Self::Request => ProtocolMessageType::Request,
            Self::Response => ProtocolMessageType::Response,
            Self::Event => ProtocolMessageType::Event,
            Self::Control => ProtocolMessageType::Control,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} channel", self.message_type())
    }
}
