//! Wire protocol for the hub's GATT service.
//!
//! Request, response and event messages are fragmented with a 5-byte header
//! (see [`fragment`]); control messages are sent whole (see [`control`]).

pub mod control;
pub mod fragment;
mod types;

pub use control::{ControlError, ControlMessage};
pub use fragment::{
    CompletedMessage, Fragment, FragmentError, Fragmenter, ReassemblyKey, Reassembler,
    FLAG_ERROR, FLAG_LAST_FRAGMENT, HEADER_SIZE, MAX_FRAGMENTS, MIN_FRAGMENT_MTU,
};
pub use types::{Channel, ProtocolMessageType};
