//! Host-side BLE client for the MegaHub controller.
//!
//! Layers, bottom up:
//! - [`protocol`]: fragment header, reassembly and control messages
//! - [`link`]: GATT transport trait plus the btleplug adapter (`ble-host`)
//! - [`client`]: request/response correlation, events, MTU negotiation
//! - [`hub`]: typed MegaHub requests and events
//!
//! Everything except the btleplug adapter is platform independent and is
//! tested against an in-memory link.

pub mod client;
pub mod config;
pub mod hub;
pub mod link;
pub mod protocol;

// Re-export commonly used items
pub use client::{
    AppEvent, BleClient, ClientError, EventFilter, ListenerId, ListenerResult, RejectReason,
};
pub use config::{ClientConfig, ConfigError, ScanConfig};
pub use hub::{HubClient, HubError, HubEvent};
pub use link::{GattConnector, GattLink, LinkError};
pub use protocol::{Channel, ControlMessage, ProtocolMessageType};

#[cfg(feature = "ble-host")]
pub use link::BtleplugConnector;
