//! Host BLE link over btleplug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    channel_for, characteristic_uuid, GattConnector, GattLink, LinkError, LinkEvent, LinkEvents,
    ALL_CHANNELS, SERVICE_UUID,
};
use crate::config::ScanConfig;
use crate::protocol::Channel;

fn gatt(err: btleplug::Error) -> LinkError {
    LinkError::Gatt(err.to_string())
}

/// Scans for a hub advertising [`SERVICE_UUID`] and connects to it.
pub struct BtleplugConnector {
    config: ScanConfig,
}

impl BtleplugConnector {
    /// Create a connector with the given scan settings.
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    async fn adapter(&self) -> Result<Adapter, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        let mut adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        let count = adapters.len();
        if self.config.adapter_index >= count {
            return Err(LinkError::AdapterUnavailable(format!(
                "adapter index {} out of range ({} found)",
                self.config.adapter_index, count
            )));
        }
        Ok(adapters.swap_remove(self.config.adapter_index))
    }

    async fn is_hub(&self, peripheral: &Peripheral) -> bool {
        let Ok(Some(props)) = peripheral.properties().await else {
            return false;
        };
        match &self.config.name_filter {
            Some(filter) => props
                .local_name
                .as_deref()
                .is_some_and(|name| name.contains(filter.as_str())),
            None => props.services.contains(&SERVICE_UUID),
        }
    }

    async fn find_hub(&self, adapter: &Adapter) -> Result<Peripheral, LinkError> {
        let mut events = adapter.events().await.map_err(gatt)?;
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(gatt)?;
        info!(
            "Scanning for hub (service {}, {} ms)",
            SERVICE_UUID, self.config.scan_timeout_ms
        );

        let search = async {
            // Devices the adapter already knows about
            if let Ok(known) = adapter.peripherals().await {
                for peripheral in known {
                    if self.is_hub(&peripheral).await {
                        return Some(peripheral);
                    }
                }
            }
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    if self.is_hub(&peripheral).await {
                        return Some(peripheral);
                    }
                }
            }
            None
        };
        let found = tokio::time::timeout(self.config.scan_timeout(), search).await;

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        match found {
            Ok(Some(peripheral)) => Ok(peripheral),
            _ => Err(LinkError::DeviceNotFound),
        }
    }

    async fn open(
        &self,
        adapter: &Adapter,
        peripheral: Peripheral,
    ) -> Result<(BtleplugLink, LinkEvents), LinkError> {
        peripheral.discover_services().await.map_err(gatt)?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .ok_or(LinkError::ServiceNotFound(SERVICE_UUID))?;

        let mut characteristics = HashMap::new();
        for channel in ALL_CHANNELS {
            let uuid = characteristic_uuid(channel);
            let characteristic = service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(LinkError::CharacteristicNotFound(uuid))?;
            characteristics.insert(channel, characteristic);
        }

        // Open the streams first so nothing sent right after subscribing
        // (MTU_INFO in particular) is missed
        let mut notifications = peripheral.notifications().await.map_err(gatt)?;
        let mut central = adapter.events().await.map_err(gatt)?;

        for channel in [Channel::Response, Channel::Event, Channel::Control] {
            if let Some(characteristic) = characteristics.get(&channel) {
                peripheral.subscribe(characteristic).await.map_err(gatt)?;
                debug!("Subscribed to {}", channel);
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let peripheral_id = peripheral.id();
        let forward_connected = connected.clone();
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_cancel.cancelled() => break,
                    notification = notifications.next() => match notification {
                        Some(n) => match channel_for(n.uuid) {
                            Some(channel) => {
                                let event = LinkEvent::Notification { channel, data: n.value };
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            None => debug!("Notification from unexpected characteristic {}", n.uuid),
                        },
                        None => {
                            info!("Notification stream ended");
                            forward_connected.store(false, Ordering::SeqCst);
                            let _ = tx.send(LinkEvent::Disconnected);
                            break;
                        }
                    },
                    event = central.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("Hub disconnected");
                            forward_connected.store(false, Ordering::SeqCst);
                            let _ = tx.send(LinkEvent::Disconnected);
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter event stream ended");
                            forward_connected.store(false, Ordering::SeqCst);
                            let _ = tx.send(LinkEvent::Disconnected);
                            break;
                        }
                    },
                }
            }
            debug!("Notification forwarder stopped");
        });

        Ok((
            BtleplugLink {
                peripheral,
                characteristics,
                connected,
                cancel,
            },
            rx,
        ))
    }
}

#[async_trait]
impl GattConnector for BtleplugConnector {
    type Link = BtleplugLink;

    async fn connect(&self) -> Result<(BtleplugLink, LinkEvents), LinkError> {
        let adapter = self.adapter().await?;
        let peripheral = self.find_hub(&adapter).await?;
        info!("Connecting to hub {}", peripheral.address());
        peripheral.connect().await.map_err(gatt)?;

        match self.open(&adapter, peripheral.clone()).await {
            Ok(opened) => Ok(opened),
            Err(e) => {
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    warn!("Failed to drop partial connection: {}", disconnect_err);
                }
                Err(e)
            }
        }
    }
}

/// An open btleplug connection to the hub.
pub struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: HashMap<Channel, Characteristic>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let characteristic = self
            .characteristics
            .get(&channel)
            .ok_or(LinkError::CharacteristicNotFound(characteristic_uuid(channel)))?;
        self.peripheral
            .write(characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.peripheral.disconnect().await.map_err(gatt)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
