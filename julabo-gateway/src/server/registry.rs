//! Devices served by a gateway, keyed by device id.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::{self, Chiller, DeviceHandle};
use crate::error::{Error, Result};

/// Device id used when a request names none.
pub const DEFAULT_DEVICE_ID: &str = "default";

/// One registered device: its lock plus the watchdog's online flag.
///
/// Every worker that touches the device (client requests, the watchdog,
/// schedule tickers) goes through `chiller`'s mutex, so at most one command
/// is in flight per device.
#[derive(Clone)]
pub struct SharedDevice {
    id: Arc<str>,
    chiller: DeviceHandle,
    online: Arc<AtomicBool>,
}

impl SharedDevice {
    pub fn new(id: &str, chiller: impl Chiller + 'static) -> Self {
        Self {
            id: Arc::from(id),
            chiller: device::handle(chiller),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chiller(&self) -> &DeviceHandle {
        &self.chiller
    }

    /// False while the watchdog is recovering the device.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fail fast with [`Error::Reconnecting`] when the device is down.
    pub fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Reconnecting)
        }
    }
}

/// Device id to device map. Entries are never removed.
#[derive(Clone, Default)]
pub struct Registry {
    devices: Arc<RwLock<HashMap<String, SharedDevice>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, replacing any existing entry with the same id.
    pub fn insert(&self, device: SharedDevice) {
        self.devices.write().insert(device.id().to_string(), device);
    }

    /// Look up a device; `None` means the default device.
    pub fn resolve(&self, id: Option<&str>) -> Result<SharedDevice> {
        let id = id.unwrap_or(DEFAULT_DEVICE_ID);
        self.devices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    pub fn devices(&self) -> Vec<SharedDevice> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
