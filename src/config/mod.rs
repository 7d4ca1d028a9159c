//! Client configuration.
//!
//! # Components
//!
//! - [`ClientConfig`] - timeouts, retry policy, MTU negotiation and
//!   reassembly limits
//! - [`ScanConfig`] - device discovery for the host BLE adapter
//!
//! Both load from JSON with every field optional.

mod client;
mod scan;

pub use client::{
    ClientConfig, ConfigError, DEFAULT_MAX_RETRIES, DEFAULT_MTU, DEFAULT_MTU_PROBE_SIZES,
    DEFAULT_MTU_WAIT_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_BASE_DELAY_MS, MAX_ATT_MTU,
};
pub use scan::ScanConfig;
