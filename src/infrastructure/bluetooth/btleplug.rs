//! Local-radio transport over `btleplug`.
//!
//! The bed exposes one characteristic (ffe1) that carries both the command
//! writes (handle 0x0011) and the notifications (handle 0x0012). Handles are
//! mapped onto that characteristic here.

use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    format_address, is_bed_name, COMMAND_CHAR_UUID, COMMAND_HANDLE, NOTIFY_HANDLE, SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use ::btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL: Duration = Duration::from_millis(500);

/// A bed seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredBed {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

#[derive(Clone)]
struct Link {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[derive(Default)]
pub struct BtleplugTransport {
    link: Mutex<Option<Link>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed("no Bluetooth adapter found".into()))
}

fn command_uuid() -> Result<Uuid, TransportError> {
    Uuid::parse_str(COMMAND_CHAR_UUID)
        .map_err(|_| TransportError::CharacteristicNotFound(COMMAND_HANDLE))
}

/// Scan for `duration` and list everything that advertises as a bed, by
/// name or by the bed's primary service.
pub async fn discover_beds(duration: Duration) -> Result<Vec<DiscoveredBed>, TransportError> {
    let adapter = first_adapter().await?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let service = Uuid::parse_str(SERVICE_UUID).ok();
    let mut beds = Vec::new();
    for peripheral in peripherals {
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        let advertises_service = service.is_some_and(|s| props.services.contains(&s));
        let name = props.local_name.unwrap_or_default();
        if is_bed_name(&name) || advertises_service {
            beds.push(DiscoveredBed {
                name,
                address: peripheral.address().to_string(),
                rssi: props.rssi,
            });
        }
    }

    adapter.stop_scan().await.ok();
    Ok(beds)
}

impl BtleplugTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Result<Link, TransportError> {
        self.link
            .lock()
            .ok()
            .and_then(|link| link.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Scan until a peripheral with `address` shows up. The caller's connect
    /// deadline bounds this.
    async fn find(adapter: &Adapter, address: &str) -> Result<Peripheral, TransportError> {
        let wanted = format_address(address);
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        loop {
            let peripherals = adapter
                .peripherals()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            if let Some(peripheral) = peripherals
                .into_iter()
                .find(|p| format_address(&p.address().to_string()) == wanted)
            {
                adapter.stop_scan().await.ok();
                return Ok(peripheral);
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }
}

impl BleTransport for BtleplugTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let adapter = first_adapter().await?;
        let peripheral = Self::find(&adapter, address).await?;
        debug!("Found {}, connecting", address);

        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let uuid = command_uuid()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(COMMAND_HANDLE))?;

        info!("Connected to {}", address);
        if let Ok(mut link) = self.link.lock() {
            *link = Some(Link {
                adapter,
                peripheral,
                characteristic,
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: u16,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        if handle != NOTIFY_HANDLE {
            return Err(TransportError::CharacteristicNotFound(handle));
        }
        let link = self.current()?;

        link.peripheral
            .subscribe(&link.characteristic)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let mut notifications = link
            .peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let mut central = link
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let peripheral_id = link.peripheral.id();
        let uuid = link.characteristic.uuid;
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == uuid => {
                            let event = TransportEvent::Notification { handle: NOTIFY_HANDLE, data: n.value };
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => {
                            let _ = tx.send(TransportEvent::Disconnected);
                            break;
                        }
                    },
                    event = central.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            let _ = tx.send(TransportEvent::Disconnected);
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        if let Ok(mut slot) = self.watcher.lock() {
            if let Some(previous) = slot.replace(watcher) {
                previous.abort();
            }
        }
        Ok(rx)
    }

    async fn write(&self, handle: u16, data: &[u8]) -> Result<(), TransportError> {
        if handle != COMMAND_HANDLE {
            return Err(TransportError::CharacteristicNotFound(handle));
        }
        let link = self.current()?;
        link.peripheral
            .write(&link.characteristic, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut w| w.take()) {
            watcher.abort();
        }
        let Some(link) = self.link.lock().ok().and_then(|mut l| l.take()) else {
            return;
        };
        if let Err(e) = link.peripheral.disconnect().await {
            debug!("Disconnect: {}", e);
        }
    }
}
