//! Control channel messages.
//!
//! Control messages are never fragmented. Byte 0 is the control type, byte 1
//! the message id the signal refers to. `MTU_INFO` appends the MTU as a
//! big-endian u16:
//!
//! ```text
//! ACK / NACK / RETRY / BUFFER_FULL   [type][message id]
//! RESET / REQUEST_MTU_INFO           [type][0x00]
//! MTU_INFO                           [0x06][0x00][mtu hi][mtu lo]
//! ```

use std::fmt;

/// Control type byte values.
pub mod control_type {
    pub const ACK: u8 = 0x01;
    pub const NACK: u8 = 0x02;
    pub const RETRY: u8 = 0x03;
    pub const BUFFER_FULL: u8 = 0x04;
    pub const RESET: u8 = 0x05;
    pub const MTU_INFO: u8 = 0x06;
    pub const REQUEST_MTU_INFO: u8 = 0x07;
}

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Peer accepted a message.
    Ack { message_id: u8 },
    /// Peer rejected a request.
    Nack { message_id: u8 },
    /// Peer asks for a message to be resent.
    Retry { message_id: u8 },
    /// Peer could not buffer a request.
    BufferFull { message_id: u8 },
    /// Discard all partial messages.
    Reset,
    /// Peer-announced ATT MTU.
    MtuInfo { mtu: u16 },
    /// Ask the peer to announce its MTU.
    RequestMtuInfo,
}

impl ControlMessage {
    /// Parse a raw control notification.
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlError> {
        let (&ty, rest) = bytes.split_first().ok_or(ControlError::Empty)?;

        let need = |min: usize| {
            if bytes.len() < min {
                Err(ControlError::TooShort {
                    control_type: ty,
                    len: bytes.len(),
                    min,
                })
            } else {
                Ok(())
            }
        };

        match ty {
            control_type::RESET => Ok(Self::Reset),
            control_type::REQUEST_MTU_INFO => Ok(Self::RequestMtuInfo),
            control_type::MTU_INFO => {
                need(4)?;
                Ok(Self::MtuInfo {
                    mtu: u16::from_be_bytes([rest[1], rest[2]]),
                })
            }
            control_type::ACK
            | control_type::NACK
            | control_type::RETRY
            | control_type::BUFFER_FULL => {
                need(2)?;
                let message_id = rest[0];
                Ok(match ty {
                    control_type::ACK => Self::Ack { message_id },
                    control_type::NACK => Self::Nack { message_id },
                    control_type::RETRY => Self::Retry { message_id },
                    _ => Self::BufferFull { message_id },
                })
            }
            other => Err(ControlError::UnknownType(other)),
        }
    }

    /// Control type byte.
    pub fn control_type(&self) -> u8 {
        match self {
            Self::Ack { .. } => control_type::ACK,
            Self::Nack { .. } => control_type::NACK,
            Self::Retry { .. } => control_type::RETRY,
            Self::BufferFull { .. } => control_type::BUFFER_FULL,
            Self::Reset => control_type::RESET,
            Self::MtuInfo { .. } => control_type::MTU_INFO,
            Self::RequestMtuInfo => control_type::REQUEST_MTU_INFO,
        }
    }

    /// Encode for the control characteristic.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Self::Ack { message_id }
            | Self::Nack { message_id }
            | Self::Retry { message_id }
            | Self::BufferFull { message_id } => vec![self.control_type(), message_id],
            Self::Reset | Self::RequestMtuInfo => vec![self.control_type(), 0],
            Self::MtuInfo { mtu } => {
                let [hi, lo] = mtu.to_be_bytes();
                vec![control_type::MTU_INFO, 0, hi, lo]
            }
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack { message_id } => write!(f, "ACK({})", message_id),
            Self::Nack { message_id } => write!(f, "NACK({})", message_id),
            Self::Retry { message_id } => write!(f, "RETRY({})", message_id),
            Self::BufferFull { message_id } => write!(f, "BUFFER_FULL({})", message_id),
            Self::Reset => write!(f, "RESET"),
            Self::MtuInfo { mtu } => write!(f, "MTU_INFO({})", mtu),
            Self::RequestMtuInfo => write!(f, "REQUEST_MTU_INFO"),
        }
    }
}

/// Errors from parsing a control notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Zero-length notification.
    Empty,
    /// Message shorter than its type requires.
    TooShort { control_type: u8, len: usize, min: usize },
    /// Control type byte not assigned.
    UnknownType(u8),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty control message"),
            Self::TooShort {
                control_type,
                len,
                min,
            } => write!(
                f,
                "control message 0x{:02X} too short: {} bytes (need {})",
                control_type, len, min
            ),
            Self::UnknownType(ty) => write!(f, "unknown control type 0x{:02X}", ty),
        }
    }
}

impl std::error::Error for ControlError {}
