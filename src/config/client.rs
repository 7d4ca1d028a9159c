//! Client tuning parameters.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time to wait for a response (matches the device's fragment timeout).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 50_000;

/// Default attempts for [`BleClient::send_request_with_retry`](crate::BleClient::send_request_with_retry).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential retry backoff.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default time to wait for a device-pushed MTU after connecting.
pub const DEFAULT_MTU_WAIT_MS: u64 = 2_000;

/// Candidate MTUs tried by active probing, largest first.
pub const DEFAULT_MTU_PROBE_SIZES: [u16; 9] = [517, 251, 185, 158, 131, 104, 77, 50, 23];

/// BLE 4.0 minimum ATT MTU, used when nothing better is known.
pub const DEFAULT_MTU: u16 = 23;

/// Largest ATT MTU allowed by the Bluetooth Core specification.
pub const MAX_ATT_MTU: u16 = 517;

/// Client behavior configuration.
///
/// All durations are stored as milliseconds so the struct maps directly onto
/// a JSON settings file.
///
/// # Example
///
/// ```
/// use megahub_ble::ClientConfig;
///
/// let config = ClientConfig::from_json_str(r#"{ "request_timeout_ms": 5000 }"#).unwrap();
/// assert_eq!(config.request_timeout().as_secs(), 5);
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Time to wait for a response before rejecting a request.
    pub request_timeout_ms: u64,
    /// Attempts made by `BleClient::request_with_retry`.
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_base_delay_ms * 2^n`.
    pub retry_base_delay_ms: u64,
    /// Time to wait for MTU_INFO after connecting.
    pub mtu_wait_ms: u64,
    /// Probe sizes, tried in order when no MTU_INFO arrives.
    pub mtu_probe_sizes: Vec<u16>,
    /// Whether to probe at all. When false the MTU stays at 23 until the
    /// device announces one.
    pub probe_mtu: bool,
    /// Partial inbound messages idle for longer than this are dropped.
    pub reassembly_timeout_ms: u64,
    /// Maximum concurrent partial inbound messages.
    pub max_pending_reassemblies: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            mtu_wait_ms: DEFAULT_MTU_WAIT_MS,
            mtu_probe_sizes: DEFAULT_MTU_PROBE_SIZES.to_vec(),
            probe_mtu: true,
            reassembly_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_pending_reassemblies: 16,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON settings document. Missing fields take their defaults.
    ///
    /// The result is validated before it is returned.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("request_timeout_ms must be > 0"));
        }
        if self.reassembly_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "reassembly_timeout_ms must be > 0",
            ));
        }
        if self.max_pending_reassemblies == 0 {
            return Err(ConfigError::InvalidValue(
                "max_pending_reassemblies must be > 0",
            ));
        }
        if self.max_retries > 16 {
            return Err(ConfigError::InvalidValue("max_retries must be <= 16"));
        }
        if self
            .mtu_probe_sizes
            .iter()
            .any(|&size| !(DEFAULT_MTU..=MAX_ATT_MTU).contains(&size))
        {
            return Err(ConfigError::InvalidValue(
                "mtu_probe_sizes must be within 23..=517",
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn mtu_wait(&self) -> Duration {
        Duration::from_millis(self.mtu_wait_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    /// Backoff before retry attempt `attempt` (zero-based), saturating.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field is out of range.
    InvalidValue(&'static str),
    /// The settings document is not valid JSON for this struct.
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue(msg) => write!(f, "invalid client config: {}", msg),
            Self::Parse(msg) => write!(f, "failed to parse client config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
