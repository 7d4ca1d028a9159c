//! Message fragmentation and reassembly.
//!
//! BLE writes and notifications are limited by the negotiated ATT MTU
//! (23-517 bytes), while hub messages such as project files can be tens of
//! kilobytes. Every message on the request, response and event channels is
//! split into fragments that each fit in a single write.
//!
//! # Fragment Format
//!
//! Each fragment has a 5-byte header, multi-byte fields big-endian:
//! ```text
//! [type: 1][message id: 1][fragment index: 2][flags: 1][payload: N]
//! ```
//!
//! Flags:
//! - Bit 0: LAST_FRAGMENT - no more fragments follow for this message
//! - Bit 1: ERROR - reserved, carried but never interpreted
//!
//! # Reassembly
//!
//! Inbound fragments are grouped by `(channel, message id)`. Chunks are
//! concatenated in arrival order; the fragment index is only checked for
//! diagnostics. BLE notifications on one characteristic are delivered in
//! order, so the index never needs to be used for sorting.
//!
//! # Example
//!
//! ```
//! use megahub_ble::protocol::{Channel, Fragmenter, ProtocolMessageType, Reassembler};
//! use std::time::Duration;
//!
//! let fragmenter = Fragmenter::try_new(23).unwrap();
//! let message = vec![0xAB; 100];
//! let fragments = fragmenter
//!     .fragment(ProtocolMessageType::Response, 7, &message)
//!     .unwrap();
//! assert_eq!(fragments.len(), 6);
//!
//! let mut reassembler = Reassembler::new(Duration::from_secs(50));
//! let mut completed = None;
//! for fragment in fragments {
//!     completed = reassembler.accept(Channel::Response, &fragment.to_bytes()).unwrap();
//! }
//! assert_eq!(completed.unwrap().payload, message);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use super::types::{Channel, ProtocolMessageType};

/// Header size in bytes (type + message id + index + flags).
pub const HEADER_SIZE: usize = 5;

/// Flag marking the final fragment of a message.
pub const FLAG_LAST_FRAGMENT: u8 = 0x01;

/// Reserved error flag. Preserved on the wire, ignored by reassembly.
pub const FLAG_ERROR: u8 = 0x02;

/// Smallest MTU that leaves room for one payload byte.
pub const MIN_FRAGMENT_MTU: usize = HEADER_SIZE + 1;

/// Fragment indices are 16 bits, so a message has at most this many fragments.
pub const MAX_FRAGMENTS: usize = u16::MAX as usize + 1;

/// Default maximum number of concurrent partial messages.
const DEFAULT_MAX_PENDING: usize = 16;

/// A single fragment of a larger message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Protocol message type from the header.
    pub message_type: ProtocolMessageType,
    /// Message id shared by all fragments of one message.
    pub message_id: u8,
    /// Position of this fragment within the message.
    pub index: u16,
    /// Fragment flags.
    pub flags: u8,
    /// Payload data (without header).
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Create a new fragment.
    pub fn new(
        message_type: ProtocolMessageType,
        message_id: u8,
        index: u16,
        flags: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            message_id,
            index,
            flags,
            payload,
        }
    }

    /// Check if this is the final fragment of its message.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST_FRAGMENT != 0
    }

    /// Check if the reserved error flag is set.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    /// Size on the wire, header included.
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize fragment to bytes (header + payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.wire_len()];
        // Buffer is sized exactly, write_to cannot fail here.
        let _ = self.write_to(&mut bytes);
        bytes
    }

    /// Serialize fragment into provided buffer.
    ///
    /// Returns the number of bytes written, or error if buffer too small.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, FragmentError> {
        let total_len = self.wire_len();
        if buf.len() < total_len {
            return Err(FragmentError::BufferTooSmall);
        }
        let [index_hi, index_lo] = self.index.to_be_bytes();
        buf[0] = self.message_type.as_u8();
        buf[1] = self.message_id;
        buf[2] = index_hi;
        buf[3] = index_lo;
        buf[4] = self.flags;
        buf[HEADER_SIZE..total_len].copy_from_slice(&self.payload);
        Ok(total_len)
    }

    /// Deserialize fragment from a raw notification buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FragmentError::HeaderTooSmall { len: bytes.len() });
        }
        let message_type = ProtocolMessageType::from_u8(bytes[0])
            .ok_or(FragmentError::UnknownMessageType(bytes[0]))?;
        Ok(Self {
            message_type,
            message_id: bytes[1],
            index: u16::from_be_bytes([bytes[2], bytes[3]]),
            flags: bytes[4],
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Errors that can occur during fragmentation/reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Raw buffer is shorter than the fragment header.
    HeaderTooSmall {
        /// Length of the rejected buffer.
        len: usize,
    },
    /// Header carries a protocol message type outside 0x01-0x04.
    UnknownMessageType(u8),
    /// MTU leaves no room for payload after the header.
    MtuTooSmall(usize),
    /// Payload would need more fragments than the 16-bit index allows.
    TooManyFragments {
        /// Fragments the payload would have needed.
        needed: usize,
    },
    /// Buffer too small for serialization.
    BufferTooSmall,
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeaderTooSmall { len } => write!(
                f,
                "fragment too short: {} bytes (header is {})",
                len, HEADER_SIZE
            ),
            Self::UnknownMessageType(ty) => write!(f, "unknown protocol message type 0x{:02X}", ty),
            Self::MtuTooSmall(mtu) => write!(
                f,
                "MTU {} too small (minimum: {})",
                mtu, MIN_FRAGMENT_MTU
            ),
            Self::TooManyFragments { needed } => write!(
                f,
                "message needs {} fragments (maximum: {})",
                needed, MAX_FRAGMENTS
            ),
            Self::BufferTooSmall => write!(f, "buffer too small for fragment"),
        }
    }
}

impl std::error::Error for FragmentError {}

/// Splits outbound messages into MTU-sized fragments.
///
/// Stateless apart from the MTU: message ids are owned by the request
/// correlator, so the same fragmenter can serve every channel.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    /// Maximum fragment size (including header).
    mtu: usize,
}

impl Fragmenter {
    /// Try to create a fragmenter for the given MTU.
    ///
    /// Returns `Err(FragmentError::MtuTooSmall)` if the MTU is below
    /// [`MIN_FRAGMENT_MTU`].
    pub fn try_new(mtu: usize) -> Result<Self, FragmentError> {
        if mtu < MIN_FRAGMENT_MTU {
            return Err(FragmentError::MtuTooSmall(mtu));
        }
        Ok(Self { mtu })
    }

    /// Get the maximum payload size per fragment.
    pub fn max_payload(&self) -> usize {
        self.mtu - HEADER_SIZE
    }

    /// Number of fragments needed for a payload of `len` bytes.
    ///
    /// Always at least one: an empty message still travels as a single
    /// last-flagged fragment.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_payload()).max(1)
    }

    /// Fragment a message.
    ///
    /// Indices start at zero and only the final fragment carries
    /// [`FLAG_LAST_FRAGMENT`].
    pub fn fragment(
        &self,
        message_type: ProtocolMessageType,
        message_id: u8,
        payload: &[u8],
    ) -> Result<Vec<Fragment>, FragmentError> {
        let count = self.fragment_count(payload.len());
        if count > MAX_FRAGMENTS {
            return Err(FragmentError::TooManyFragments { needed: count });
        }

        if payload.is_empty() {
            return Ok(vec![Fragment::new(
                message_type,
                message_id,
                0,
                FLAG_LAST_FRAGMENT,
                Vec::new(),
            )]);
        }

        let fragments = payload
            .chunks(self.max_payload())
            .enumerate()
            .map(|(index, chunk)| {
                let flags = if index + 1 == count {
                    FLAG_LAST_FRAGMENT
                } else {
                    0
                };
                // count <= MAX_FRAGMENTS keeps every index within u16
                Fragment::new(message_type, message_id, index as u16, flags, chunk.to_vec())
            })
            .collect();

        Ok(fragments)
    }
}

/// Key for identifying a partial message.
///
/// Responses and events use independent id spaces, so the channel is part
/// of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    /// Channel the fragments arrived on.
    pub channel: Channel,
    /// Message id from the fragment header.
    pub message_id: u8,
}

/// A fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// Channel the message arrived on.
    pub channel: Channel,
    /// Message type from the first fragment's header.
    pub message_type: ProtocolMessageType,
    /// Message id from the header.
    pub message_id: u8,
    /// Concatenated payload.
    pub payload: Vec<u8>,
}

/// State for a message being reassembled.
#[derive(Debug)]
struct PendingMessage {
    message_type: ProtocolMessageType,
    chunks: Vec<Vec<u8>>,
    started: Instant,
    updated: Instant,
}

impl PendingMessage {
    fn new(message_type: ProtocolMessageType, now: Instant) -> Self {
        Self {
            message_type,
            chunks: Vec::new(),
            started: now,
            updated: now,
        }
    }

    fn assemble(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Reassembles fragments back into complete messages.
///
/// # Memory Safety
///
/// Two limits keep a misbehaving peer from growing state without bound:
/// - `timeout`: partial messages not updated within this window are dropped
/// - `max_pending`: maximum concurrent partial messages (default: 16);
///   the oldest is evicted when a new one would exceed it
pub struct Reassembler {
    /// Partial messages.
    pending: HashMap<ReassemblyKey, PendingMessage>,
    /// Idle timeout for partial messages.
    timeout: Duration,
    /// Maximum number of concurrent partial messages.
    max_pending: usize,
}

impl Reassembler {
    /// Create a new reassembler with the given idle timeout.
    pub fn new(timeout: Duration) -> Self {
        Self::with_limits(timeout, DEFAULT_MAX_PENDING)
    }

    /// Create a new reassembler with a custom cap on partial messages.
    ///
    /// A `max_pending` of zero is treated as one.
    pub fn with_limits(timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            max_pending: max_pending.max(1),
        }
    }

    /// Parse a raw notification and add it.
    ///
    /// The buffer is fully parsed before any state is touched, so malformed
    /// input never disturbs a partial message.
    pub fn accept(
        &mut self,
        channel: Channel,
        raw: &[u8],
    ) -> Result<Option<CompletedMessage>, FragmentError> {
        let fragment = Fragment::from_bytes(raw)?;
        Ok(self.add_fragment(channel, fragment))
    }

    /// Add a fragment and return the complete message if reassembly is done.
    pub fn add_fragment(&mut self, channel: Channel, fragment: Fragment) -> Option<CompletedMessage> {
        self.cleanup_expired();

        let key = ReassemblyKey {
            channel,
            message_id: fragment.message_id,
        };

        // Single-fragment message, nothing to buffer
        if fragment.is_last() && !self.pending.contains_key(&key) {
            if fragment.index != 0 {
                debug!(
                    "{} message {} completed by lone fragment {}",
                    channel, fragment.message_id, fragment.index
                );
            }
            return Some(CompletedMessage {
                channel,
                message_type: fragment.message_type,
                message_id: fragment.message_id,
                payload: fragment.payload,
            });
        }

        let now = Instant::now();
        if !self.pending.contains_key(&key) {
            if self.pending.len() >= self.max_pending {
                if let Some(oldest) = self.find_oldest_pending() {
                    warn!(
                        "Reassembly limit {} reached, evicting {} message {}",
                        self.max_pending, oldest.channel, oldest.message_id
                    );
                    self.pending.remove(&oldest);
                }
            }
            if fragment.index != 0 {
                debug!(
                    "{} message {} starts at fragment {}",
                    channel, fragment.message_id, fragment.index
                );
            }
            self.pending
                .insert(key, PendingMessage::new(fragment.message_type, now));
        }

        let pending = self.pending.get_mut(&key)?;
        if usize::from(fragment.index) != pending.chunks.len() {
            debug!(
                "{} message {}: fragment {} arrived as chunk {}",
                channel,
                fragment.message_id,
                fragment.index,
                pending.chunks.len()
            );
        }
        let is_last = fragment.is_last();
        pending.chunks.push(fragment.payload);
        pending.updated = now;

        if !is_last {
            return None;
        }

        let pending = self.pending.remove(&key)?;
        let message_type = pending.message_type;
        Some(CompletedMessage {
            channel,
            message_type,
            message_id: key.message_id,
            payload: pending.assemble(),
        })
    }

    /// Find the oldest partial message for eviction.
    fn find_oldest_pending(&self) -> Option<ReassemblyKey> {
        self.pending
            .iter()
            .min_by_key(|(_, p)| p.started)
            .map(|(k, _)| *k)
    }

    /// Remove partial messages idle for longer than the timeout.
    ///
    /// Returns the number of messages dropped.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        let timeout = self.timeout;
        self.pending.retain(|key, pending| {
            let alive = now.saturating_duration_since(pending.updated) < timeout;
            if !alive {
                warn!(
                    "Dropping stale {} message {} ({} chunks)",
                    key.channel,
                    key.message_id,
                    pending.chunks.len()
                );
            }
            alive
        });
        before - self.pending.len()
    }

    /// Check whether a partial message exists for the key.
    pub fn contains(&self, channel: Channel, message_id: u8) -> bool {
        self.pending.contains_key(&ReassemblyKey {
            channel,
            message_id,
        })
    }

    /// Get the number of partial messages.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Clear all partial messages.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
