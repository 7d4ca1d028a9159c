//! Device discovery settings for the host adapter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the host adapter looks for a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Give up scanning after this long.
    pub scan_timeout_ms: u64,
    /// Only accept devices whose advertised name contains this string.
    /// When unset, any device advertising the hub service is accepted.
    pub name_filter: Option<String>,
    /// Which Bluetooth adapter to use when several are present.
    pub adapter_index: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            name_filter: None,
            adapter_index: 0,
        }
    }
}

impl ScanConfig {
    /// Scan for devices advertising the given name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name_filter: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}
