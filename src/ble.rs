//! btleplug-backed [`Transport`] plus a one-shot scanner.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::{NotificationCallback, Transport};

/// How often the adapter's peripheral list is polled while looking for a device.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long `connect` scans for the address before giving up. Shorter than the
/// session's default connect bound so the scan is always stopped by us.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Name prefix the panels advertise under.
pub const DEVICE_NAME_PREFIX: &str = "LED_BLE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
}

async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Connection("no bluetooth adapter found".into()))
}

/// Address used to identify a peripheral. Platforms that hide the MAC
/// (macOS) report a zero address; fall back to the platform id there.
fn peripheral_key(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::from([0u8; 6]) {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

/// Scan for `duration` and list devices, optionally keeping only names
/// starting with `name_prefix`.
pub async fn scan(duration: Duration, name_prefix: Option<&str>) -> Result<Vec<DeviceInfo>> {
    let adapter = default_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;
    let peripherals = adapter.peripherals().await?;
    if let Err(e) = adapter.stop_scan().await {
        warn!("stop_scan failed: {e}");
    }

    let mut devices = Vec::new();
    for peripheral in peripherals {
        let name = match peripheral.properties().await {
            Ok(props) => props.and_then(|props| props.local_name),
            Err(e) => {
                warn!("skipping {}: {e}", peripheral_key(&peripheral));
                continue;
            }
        };
        let keep = match (name_prefix, &name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix),
            (Some(_), None) => false,
        };
        if keep {
            devices.push(DeviceInfo {
                id: peripheral_key(&peripheral),
                name,
            });
        }
    }
    Ok(devices)
}

/// BLE link to a single panel.
///
/// - `adapter`: adapter used for discovery; the first one found when `None`
/// - `peripheral`: set once connected
/// - `listeners`: notification pump per subscribed characteristic
/// - `scanning`: a discovery scan was started and not yet stopped
pub struct BleTransport {
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    listeners: HashMap<Uuid, JoinHandle<()>>,
    discovery_timeout: Duration,
    scanning: bool,
}

impl Default for BleTransport {
    fn default() -> Self {
        Self {
            adapter: None,
            peripheral: None,
            listeners: HashMap::new(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            scanning: false,
        }
    }
}

impl BleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter: Some(adapter),
            peripheral: None,
            listeners: HashMap::new(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            scanning: false,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    fn peripheral(&self) -> Result<&Peripheral> {
        self.peripheral
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".into()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::Transport(format!("characteristic {uuid} not found")))
    }

    async fn poll_for(adapter: &Adapter, address: &str) -> Result<Peripheral> {
        loop {
            let hit = adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| peripheral_key(p).eq_ignore_ascii_case(address));
            if let Some(p) = hit {
                return Ok(p);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn stop_scanning(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.stop_scan().await {
                warn!("stop_scan failed: {e}");
            }
        }
    }

    async fn find_peripheral(&mut self, address: &str) -> Result<Peripheral> {
        let adapter = match &self.adapter {
            Some(a) => a.clone(),
            None => {
                let a = default_adapter().await?;
                self.adapter = Some(a.clone());
                a
            }
        };
        adapter.start_scan(ScanFilter::default()).await?;
        self.scanning = true;
        let limit = self.discovery_timeout;
        let found = tokio::time::timeout(limit, Self::poll_for(&adapter, address)).await;
        self.stop_scanning().await;
        match found {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "{address} not found within {limit:?}"
            ))),
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    /// Scans until `address` shows up, then connects and discovers services.
    /// The caller bounds the whole thing with a timeout.
    async fn connect(&mut self, address: &str) -> Result<bool> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| Error::Connection(format!("connect to {address}: {e}")))?;
        // kept before discovery so a failure below can still be torn down
        self.peripheral = Some(peripheral.clone());
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::Connection(format!("service discovery on {address}: {e}")))?;
        let connected = peripheral.is_connected().await?;
        info!("connected to {address}: {connected}");
        Ok(connected)
    }

    async fn is_connected(&self) -> Result<bool> {
        match &self.peripheral {
            Some(p) => Ok(p.is_connected().await?),
            None => Ok(false),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_scanning().await;
        for (_, listener) in self.listeners.drain() {
            listener.abort();
        }
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        channel: Uuid,
        data: &[u8],
        expect_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(channel)?;
        let write_type = if expect_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("write {} bytes to {channel} ({write_type:?})", data.len());
        self.peripheral()?
            .write(&characteristic, data, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe_notifications(
        &mut self,
        channel: Uuid,
        callback: NotificationCallback,
    ) -> Result<()> {
        let characteristic = self.characteristic(channel)?;
        let peripheral = self.peripheral()?;
        peripheral.subscribe(&characteristic).await?;
        let mut stream = peripheral.notifications().await?;
        let listener = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == channel {
                    callback(&notification.value);
                }
            }
        });
        if let Some(previous) = self.listeners.insert(channel, listener) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe_notifications(&mut self, channel: Uuid) -> Result<()> {
        if let Some(listener) = self.listeners.remove(&channel) {
            listener.abort();
        }
        let characteristic = self.characteristic(channel)?;
        self.peripheral()?.unsubscribe(&characteristic).await?;
        Ok(())
    }
}

impl Drop for BleTransport {
    // A session future dropped mid-transaction never reaches `close`.
    fn drop(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.scanning {
            if let Some(adapter) = self.adapter.clone() {
                runtime.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("stop_scan on drop failed: {e}");
                    }
                });
            }
        }
        if let Some(peripheral) = self.peripheral.take() {
            runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("disconnect on drop failed: {e}");
                }
            });
        }
    }
}
