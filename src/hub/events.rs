//! Typed decoding of hub events.

use serde::Deserialize;
use serde_json::Value;

use super::types::AppEventType;
use crate::client::AppEvent;

/// A Bluetooth Classic device seen by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassicDevice {
    pub mac: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: u8,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub rssi: i32,
    #[serde(default)]
    pub cod: u32,
}

/// Device list published periodically while discovery data is available.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<ClassicDevice>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub discovery_active: bool,
}

/// An event from the hub, decoded by application type.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// A log line.
    Log(String),
    PortStatus(Value),
    Command(Value),
    BtClassicDevices(DeviceList),
    /// Unknown type, or a body that did not decode.
    Unknown { app_type: u8, data: Vec<u8> },
}

#[derive(Deserialize)]
struct LogLine {
    message: String,
}

impl HubEvent {
    pub fn decode(event: &AppEvent) -> Self {
        let unknown = || Self::Unknown {
            app_type: event.app_type,
            data: event.data.clone(),
        };
        match AppEventType::from_u8(event.app_type) {
            Some(AppEventType::Log) => Self::Log(decode_log(&event.data)),
            Some(AppEventType::PortStatus) => serde_json::from_slice(&event.data)
                .map(Self::PortStatus)
                .unwrap_or_else(|_| unknown()),
            Some(AppEventType::Command) => serde_json::from_slice(&event.data)
                .map(Self::Command)
                .unwrap_or_else(|_| unknown()),
            Some(AppEventType::BtClassicDevices) => serde_json::from_slice(&event.data)
                .map(Self::BtClassicDevices)
                .unwrap_or_else(|_| unknown()),
            None => unknown(),
        }
    }
}

/// Log events are plain text; some firmware builds wrap them as
/// `{"message": ...}`.
fn decode_log(data: &[u8]) -> String {
    if data.first() == Some(&b'{') {
        if let Ok(line) = serde_json::from_slice::<LogLine>(data) {
            return line.message;
        }
    }
    String::from_utf8_lossy(data).into_owned()
}
