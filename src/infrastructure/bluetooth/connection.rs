//! BLE connection to the desk.
//!
//! [`BtleConnection`] owns the one physical link per desk: it resolves
//! the peripheral by address, connects (with a single retry), resolves
//! the fixed characteristic table, re-subscribes every notification
//! registration recorded at construction time and dispatches incoming
//! notifications to the registered handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::LinkError;
use crate::infrastructure::bluetooth::protocol::{self, DeskCharacteristic};

/// Pause after a DPG query so its reply notification can arrive before
/// the caller's next action. A serialization point, not a correctness
/// guarantee; correctness comes from the state cells' bounded waits.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// How long to scan for the peripheral if the adapter has not seen it.
const RESOLVE_SCAN_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVE_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with the raw bytes of a notification.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle-to-callback table, built once at desk construction and
/// re-applied on every (re)connect in registration order.
#[derive(Default)]
pub struct NotificationRegistry {
    entries: Vec<(DeskCharacteristic, NotificationHandler)>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, characteristic: DeskCharacteristic, handler: NotificationHandler) {
        self.entries.push((characteristic, handler));
    }

    fn handler_for(&self, uuid: uuid::Uuid) -> Option<&NotificationHandler> {
        self.entries
            .iter()
            .find(|(characteristic, _)| characteristic.uuid() == uuid)
            .map(|(_, handler)| handler)
    }
}

/// Transport operations the desk is driven through. The one seam
/// between the control core and the radio.
#[async_trait]
pub trait DeskLink: Send + Sync {
    /// Idempotent connect; retries exactly once on a first failure.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Idempotent disconnect; safe to call when not connected.
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Write a value to one of the fixed characteristics.
    async fn write(
        &self,
        target: DeskCharacteristic,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError>;

    /// Synchronous characteristic read.
    async fn read(&self, target: DeskCharacteristic) -> Result<Vec<u8>, LinkError>;

    /// Write a DPG property query, then pause for the settle delay so
    /// the reply notification can land.
    async fn dpg_command(&self, command_type: u8) -> Result<(), LinkError> {
        self.write(
            DeskCharacteristic::DpgCommand,
            &protocol::encode_query(command_type),
            true,
        )
        .await?;
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }
}

struct Connected {
    peripheral: Peripheral,
    characteristics: HashMap<DeskCharacteristic, Characteristic>,
    dispatcher: JoinHandle<()>,
}

/// btleplug-backed [`DeskLink`].
pub struct BtleConnection {
    adapter: Adapter,
    address: BDAddr,
    registry: Arc<NotificationRegistry>,
    inner: tokio::sync::Mutex<Option<Connected>>,
}

impl BtleConnection {
    pub fn new(adapter: Adapter, address: BDAddr, registry: NotificationRegistry) -> Self {
        Self {
            adapter,
            address,
            registry: Arc::new(registry),
            inner: tokio::sync::Mutex::new(None),
        }
    }

    pub fn address(&self) -> BDAddr {
        self.address
    }

    /// Look the peripheral up in the adapter cache, falling back to a
    /// short scan if it has not been seen yet.
    async fn resolve_peripheral(&self) -> Result<Peripheral, LinkError> {
        if let Some(peripheral) = self.find_cached().await? {
            return Ok(peripheral);
        }

        debug!(address = %self.address, "peripheral not cached, scanning");
        self.adapter.start_scan(ScanFilter::default()).await?;

        let deadline = tokio::time::Instant::now() + RESOLVE_SCAN_TIMEOUT;
        let found = loop {
            tokio::time::sleep(RESOLVE_SCAN_INTERVAL).await;
            if let Some(peripheral) = self.find_cached().await? {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
        };

        if let Err(error) = self.adapter.stop_scan().await {
            warn!(%error, "failed to stop scan");
        }

        found.ok_or_else(|| LinkError::DeviceNotFound(self.address.to_string()))
    }

    async fn find_cached(&self) -> Result<Option<Peripheral>, LinkError> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| peripheral.address() == self.address))
    }

    fn with_connected<'a>(
        &self,
        inner: &'a tokio::sync::MutexGuard<'_, Option<Connected>>,
        target: DeskCharacteristic,
    ) -> Result<(&'a Peripheral, &'a Characteristic), LinkError> {
        let connected = inner.as_ref().ok_or(LinkError::NotConnected)?;
        let characteristic = connected
            .characteristics
            .get(&target)
            .ok_or(LinkError::CharacteristicNotFound(target.name()))?;
        Ok((&connected.peripheral, characteristic))
    }
}

#[async_trait]
impl DeskLink for BtleConnection {
    async fn connect(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().await;

        if let Some(connected) = inner.as_ref() {
            if connected.peripheral.is_connected().await.unwrap_or(false) {
                return Ok(());
            }
            // Stale session, tear it down and reconnect.
            if let Some(stale) = inner.take() {
                stale.dispatcher.abort();
            }
        }

        let peripheral = self.resolve_peripheral().await?;

        debug!(address = %self.address, "connecting");
        if let Err(error) = peripheral.connect().await {
            debug!(%error, "connect failed, retrying once");
            if let Err(retry_error) = peripheral.connect().await {
                error!(address = %self.address, error = %retry_error, "second connection attempt failed");
                return Err(LinkError::ConnectFailed(retry_error));
            }
        }
        debug!(address = %self.address, "connected");

        peripheral.discover_services().await?;

        let mut characteristics = HashMap::new();
        for characteristic in peripheral.characteristics() {
            if let Some(target) = DeskCharacteristic::from_uuid(characteristic.uuid) {
                characteristics.insert(target, characteristic);
            }
        }
        for target in DeskCharacteristic::ALL {
            if !characteristics.contains_key(&target) {
                return Err(LinkError::CharacteristicNotFound(target.name()));
            }
        }

        for (target, _) in &self.registry.entries {
            let characteristic = characteristics
                .get(target)
                .ok_or(LinkError::CharacteristicNotFound(target.name()))?;
            peripheral.subscribe(characteristic).await?;
            debug!(characteristic = target.name(), "subscribed");
        }

        let mut notifications = peripheral.notifications().await?;
        let registry = self.registry.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                match registry.handler_for(notification.uuid) {
                    Some(handler) => handler(&notification.value),
                    None => debug!(
                        uuid = %notification.uuid,
                        "notification on unregistered characteristic, dropping"
                    ),
                }
            }
        });

        *inner = Some(Connected {
            peripheral,
            characteristics,
            dispatcher,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().await;
        if let Some(connected) = inner.take() {
            connected.dispatcher.abort();
            if let Err(error) = connected.peripheral.disconnect().await {
                warn!(%error, "disconnect failed");
            }
            debug!(address = %self.address, "disconnected");
        }
        Ok(())
    }

    async fn write(
        &self,
        target: DeskCharacteristic,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError> {
        let inner = self.inner.lock().await;
        let (peripheral, characteristic) = self.with_connected(&inner, target)?;

        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!(
            characteristic = target.name(),
            payload = ?payload,
            "writing"
        );
        peripheral.write(characteristic, payload, write_type).await?;
        Ok(())
    }

    async fn read(&self, target: DeskCharacteristic) -> Result<Vec<u8>, LinkError> {
        let inner = self.inner.lock().await;
        let (peripheral, characteristic) = self.with_connected(&inner, target)?;

        debug!(characteristic = target.name(), "reading");
        Ok(peripheral.read(characteristic).await?)
    }
}

impl Drop for BtleConnection {
    fn drop(&mut self) {
        // Best-effort release if the caller never disconnected.
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(connected) = inner.take() {
                let Connected {
                    peripheral,
                    dispatcher,
                    ..
                } = connected;
                dispatcher.abort();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = peripheral.disconnect().await;
                    });
                }
            }
        }
    }
}

/// First available adapter on the system.
pub async fn default_adapter() -> Result<Adapter, LinkError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or(LinkError::AdapterUnavailable)
}
