//! Real hardware backend on top of `btleplug`

use crate::domain::models::PeripheralAddress;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::CharacteristicId;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Connection, NotificationSink, Subscription, WriteMode,
};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct LinkEntry {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
}

struct Pump {
    link_id: u64,
    peripheral: Peripheral,
    characteristic: Characteristic,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    links: HashMap<u64, LinkEntry>,
    pumps: HashMap<u64, Pump>,
}

pub struct BtleplugTransport {
    manager: Manager,
    scan_timeout: Duration,
    /// Written as a regular characteristic when the camera exposes it,
    /// otherwise left to `subscribe`, which configures the descriptor itself
    status_cccd: CharacteristicId,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl BtleplugTransport {
    pub async fn new(
        scan_timeout: Duration,
        status_cccd: CharacteristicId,
    ) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        Ok(Self {
            manager,
            scan_timeout,
            status_cccd,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn adapter(&self) -> Result<Adapter, TransportError> {
        let adapters = self.manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;
        debug!("Using adapter {}", adapter.adapter_info().await?);
        Ok(adapter)
    }

    /// Peripheral with `address` among those the adapter already knows about
    async fn known_peripheral(
        adapter: &Adapter,
        address: &PeripheralAddress,
    ) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if address.matches(&properties.address.to_string()) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn scan_for(
        &self,
        adapter: &Adapter,
        address: &PeripheralAddress,
    ) -> Result<Peripheral, TransportError> {
        adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for {} ({:?})", address, self.scan_timeout);

        let found = tokio::time::timeout(self.scan_timeout, async {
            loop {
                if let Some(peripheral) = Self::known_peripheral(adapter, address).await? {
                    return Ok::<_, TransportError>(peripheral);
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;

        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan cleanly: {}", e);
        }

        match found {
            Ok(result) => result,
            Err(_) => Err(TransportError::DeviceNotFound(address.to_string())),
        }
    }

    fn lookup(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let registry = self.registry();
        let entry = conn
            .link_id()
            .and_then(|id| registry.links.get(&id))
            .ok_or(TransportError::NotConnected)?;
        let found = entry
            .characteristics
            .get(&characteristic.uuid())
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;
        Ok((entry.peripheral.clone(), found.clone()))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&self, address: &PeripheralAddress) -> Result<Connection, TransportError> {
        let adapter = self.adapter().await?;
        let peripheral = self.scan_for(&adapter, address).await?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!(
            "Discovered {} characteristics on {}",
            characteristics.len(),
            address
        );

        let link_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry().links.insert(
            link_id,
            LinkEntry {
                peripheral,
                characteristics,
            },
        );
        Ok(Connection::established(address.clone(), link_id))
    }

    async fn read(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, TransportError> {
        let (peripheral, target) = self.lookup(conn, characteristic)?;
        Ok(peripheral.read(&target).await?)
    }

    async fn write(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (peripheral, target) = match self.lookup(conn, characteristic) {
            Err(TransportError::CharacteristicNotFound(id)) if id == self.status_cccd => {
                debug!("{} not exposed, indications are enabled on subscribe", id);
                return Ok(());
            }
            other => other?,
        };
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        trace!("write {} <- {:02X?} ({:?})", characteristic, payload, write_type);
        Ok(peripheral.write(&target, payload, write_type).await?)
    }

    async fn subscribe(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
        sink: NotificationSink,
    ) -> Result<Subscription, TransportError> {
        let (peripheral, target) = self.lookup(conn, characteristic)?;
        let link_id = conn.link_id().ok_or(TransportError::NotConnected)?;

        // Open the stream first so nothing sent right after subscribing is lost
        let mut stream = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;

        let uuid = target.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if !sink.deliver(characteristic, notification.value) {
                    break;
                }
            }
            trace!("Notification pump for {} stopped", characteristic);
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry().pumps.insert(
            id,
            Pump {
                link_id,
                peripheral,
                characteristic: target,
                task,
            },
        );
        Ok(Subscription {
            id,
            link_id,
            characteristic,
        })
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), TransportError> {
        let pump = self.registry().pumps.remove(&subscription.id);
        let Some(pump) = pump else {
            debug!("Subscription {} already gone", subscription.id);
            return Ok(());
        };
        pump.task.abort();
        Ok(pump.peripheral.unsubscribe(&pump.characteristic).await?)
    }

    async fn disconnect(&self, conn: &Connection) -> Result<(), TransportError> {
        let peripheral = match conn.link_id() {
            Some(link_id) => {
                let mut registry = self.registry();
                registry.pumps.retain(|_, pump| {
                    if pump.link_id == link_id {
                        pump.task.abort();
                        false
                    } else {
                        true
                    }
                });
                let entry = registry.links.remove(&link_id);
                entry.map(|entry| entry.peripheral)
            }
            None => {
                // The connect attempt may have got as far as a half-open link
                let adapter = self.adapter().await?;
                Self::known_peripheral(&adapter, conn.address()).await?
            }
        };

        let Some(peripheral) = peripheral else {
            return Ok(());
        };
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        } else {
            warn!("{} was already disconnected", conn.address());
        }
        Ok(())
    }
}
