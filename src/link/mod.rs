//! GATT transport abstraction.
//!
//! The hub exposes one primary service with four characteristics, one per
//! logical [`Channel`]. A [`GattConnector`] finds the hub and opens a
//! [`GattLink`] to it; everything above this layer is independent of the BLE
//! stack in use:
//! - **Host** (`ble-host` feature): [`BtleplugConnector`] over BlueZ,
//!   CoreBluetooth or WinRT
//! - **Tests**: an in-memory peer in `link::mock`
//!
//! # Example
//!
//! ```ignore
//! use megahub_ble::link::{BtleplugConnector, GattConnector};
//!
//! let connector = BtleplugConnector::new(ScanConfig::default());
//! let (link, mut events) = connector.connect().await?;
//! link.write(Channel::Control, &[0x07, 0x00]).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Channel;

#[cfg(feature = "ble-host")]
mod host;
#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "ble-host")]
pub use host::BtleplugConnector;

/// Primary service advertised by the hub.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Request characteristic (write).
pub const REQUEST_CHAR_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Response characteristic (notify).
pub const RESPONSE_CHAR_UUID: Uuid = Uuid::from_u128(0x1c95d5e3_d8f7_413a_bf3d_7a2e5d7be87e);

/// Event characteristic (notify).
pub const EVENT_CHAR_UUID: Uuid = Uuid::from_u128(0xd8de624e_140f_4a22_8594_e2216b84a5f2);

/// Control characteristic (write + notify).
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0xf78ebbff_c8b7_4107_93de_889a6a06d408);

/// Characteristic UUID backing a channel.
pub fn characteristic_uuid(channel: Channel) -> Uuid {
    match channel {
        Channel::Request => REQUEST_CHAR_UUID,
        Channel::Response => RESPONSE_CHAR_UUID,
        Channel::Event => EVENT_CHAR_UUID,
        Channel::Control => CONTROL_CHAR_UUID,
    }
}

/// Channel backed by a characteristic UUID.
pub fn channel_for(uuid: Uuid) -> Option<Channel> {
    ALL_CHANNELS
        .into_iter()
        .find(|channel| characteristic_uuid(*channel) == uuid)
}

pub(crate) const ALL_CHANNELS: [Channel; 4] = [
    Channel::Request,
    Channel::Response,
    Channel::Event,
    Channel::Control,
];

/// Inbound traffic from an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw notification value from one of the notify characteristics.
    Notification { channel: Channel, data: Vec<u8> },
    /// The peer or the adapter dropped the connection.
    Disconnected,
}

/// Receiving end of a link's inbound traffic.
///
/// The stream ends (returns `None`) once the link is gone.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// An open connection to the hub's GATT service.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Write one value to a channel's characteristic, waiting for the
    /// write response.
    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), LinkError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Live connection state as reported by the BLE stack.
    fn is_connected(&self) -> bool;
}

/// Finds the hub and opens a link to it.
///
/// Implementations must enable notifications on the response, event and
/// control characteristics before returning, and must not leave a partial
/// connection open on failure.
#[async_trait]
pub trait GattConnector: Send + Sync {
    /// Link type produced by this connector.
    type Link: GattLink + 'static;

    /// Select a device, connect, discover the service and subscribe.
    async fn connect(&self) -> Result<(Self::Link, LinkEvents), LinkError>;
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No usable Bluetooth adapter.
    AdapterUnavailable(String),
    /// Scan finished without finding a hub.
    DeviceNotFound,
    /// The hub does not expose the expected service.
    ServiceNotFound(Uuid),
    /// The service lacks one of the expected characteristics.
    CharacteristicNotFound(Uuid),
    /// A characteristic write failed.
    WriteFailed(String),
    /// Other GATT or adapter failure.
    Gatt(String),
    /// Operation on a closed link.
    NotConnected,
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable(msg) => write!(f, "Bluetooth adapter unavailable: {}", msg),
            Self::DeviceNotFound => write!(f, "no hub found"),
            Self::ServiceNotFound(uuid) => write!(f, "service {} not found", uuid),
            Self::CharacteristicNotFound(uuid) => write!(f, "characteristic {} not found", uuid),
            Self::WriteFailed(msg) => write!(f, "write failed: {}", msg),
            Self::Gatt(msg) => write!(f, "GATT error: {}", msg),
            Self::NotConnected => write!(f, "link not connected"),
        }
    }
}

impl std::error::Error for LinkError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_uuid_mapping() {
        for channel in ALL_CHANNELS {
            assert_eq!(channel_for(characteristic_uuid(channel)), Some(channel));
        }
        assert_eq!(channel_for(SERVICE_UUID), None);
    }

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            CONTROL_CHAR_UUID.to_string(),
            "f78ebbff-c8b7-4107-93de-889a6a06d408"
        );
    }
}
