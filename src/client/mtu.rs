//! MTU negotiation.
//!
//! The device normally announces its ATT MTU with a MTU_INFO control message
//! right after notifications are enabled. When that does not arrive in time
//! the client probes: it writes `size - 3` bytes (ATT write header overhead)
//! to the request characteristic for each candidate size, largest first, and
//! keeps the first size the stack accepts.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::config::{DEFAULT_MTU, MAX_ATT_MTU};
use crate::link::GattLink;
use crate::protocol::Channel;

/// ATT write request overhead (opcode + handle).
const ATT_WRITE_OVERHEAD: usize = 3;

/// Filler byte for probe writes. 0xFF is not a valid message type, so the
/// device discards probes instead of starting a reassembly.
const PROBE_FILL: u8 = 0xFF;

/// Current MTU of a session plus the device-announced value, if any.
pub(crate) struct MtuTracker {
    current: AtomicU16,
    announced: watch::Sender<Option<u16>>,
}

impl MtuTracker {
    pub fn new() -> Self {
        Self {
            current: AtomicU16::new(DEFAULT_MTU),
            announced: watch::Sender::new(None),
        }
    }

    pub fn get(&self) -> u16 {
        self.current.load(Ordering::SeqCst)
    }

    /// Adopt a device-announced MTU. Values below 23 are ignored.
    pub fn apply_announced(&self, mtu: u16) -> bool {
        if mtu < DEFAULT_MTU {
            warn!("Ignoring announced MTU {} (minimum {})", mtu, DEFAULT_MTU);
            return false;
        }
        let mtu = if mtu > MAX_ATT_MTU {
            warn!("Announced MTU {} capped to {}", mtu, MAX_ATT_MTU);
            MAX_ATT_MTU
        } else {
            mtu
        };
        let previous = self.current.swap(mtu, Ordering::SeqCst);
        self.announced.send_replace(Some(mtu));
        if previous != mtu {
            info!("MTU set to {} by device (was {})", mtu, previous);
        }
        true
    }

    /// Adopt a probed MTU unless the device has announced one meanwhile.
    pub fn apply_probed(&self, mtu: u16) -> bool {
        if let Some(announced) = *self.announced.borrow() {
            debug!(
                "Keeping announced MTU {} over probed {}",
                announced, mtu
            );
            return false;
        }
        self.current.store(mtu, Ordering::SeqCst);
        true
    }

    /// Wait up to `limit` for the device to announce its MTU.
    pub async fn wait_for_announced(&self, limit: Duration) -> Option<u16> {
        let mut rx = self.announced.subscribe();
        let announced = match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => *value,
            _ => None,
        };
        announced
    }
}

/// Find the largest candidate MTU the link accepts.
///
/// Falls back to 23 when every probe fails.
pub(crate) async fn probe_mtu<L: GattLink + ?Sized>(link: &L, sizes: &[u16]) -> u16 {
    for &size in sizes {
        let Some(len) = usize::from(size).checked_sub(ATT_WRITE_OVERHEAD) else {
            continue;
        };
        let probe = vec![PROBE_FILL; len];
        match link.write(Channel::Request, &probe).await {
            Ok(()) => {
                info!("MTU probe succeeded at {}", size);
                return size;
            }
            Err(e) => debug!("MTU probe {} failed: {}", size, e),
        }
    }
    warn!("All MTU probes failed, using {}", DEFAULT_MTU);
    DEFAULT_MTU
}
