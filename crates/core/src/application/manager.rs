// Fleet manager
// Coordinator handed to every fleet function; owns the devices it opens
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::readiness::make_ready;
use crate::application::registry::FleetRegistry;
use crate::domain::error::Result;
use crate::domain::{DeviceError, DeviceHandle, DeviceRequest, ReadinessMode};

/// Builds device handles through the registry and closes them all on `close`.
///
/// Each worker call gets its own manager, so devices never outlive the call
/// that opened them.
pub struct FleetManager {
    registry: Arc<FleetRegistry>,
    devices: BTreeMap<String, DeviceHandle>,
    closed: bool,
}

impl FleetManager {
    pub fn new(registry: Arc<FleetRegistry>) -> Self {
        Self {
            registry,
            devices: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    /// Build and track a device. A name can be open only once at a time.
    pub fn create_device(&mut self, request: DeviceRequest) -> Result<&mut DeviceHandle> {
        if self.closed {
            return Err(DeviceError::Closed("fleet manager".to_string()));
        }
        let name = request.identity.name.clone();
        if self.devices.contains_key(&name) {
            return Err(DeviceError::DeviceCreation {
                device: name,
                reason: "device is already open".to_string(),
            });
        }

        let handle =
            self.registry
                .build_device(request.identity, request.config, request.comm_args)?;
        info!(device = %name, device_type = %handle.device_type(), "Device created");
        Ok(self.devices.entry(name).or_insert(handle))
    }

    /// Create a device and bring it to a known-good state.
    ///
    /// A device that cannot be made ready is closed and forgotten before the
    /// error is returned.
    pub fn create_ready_device(
        &mut self,
        request: DeviceRequest,
        mode: ReadinessMode,
    ) -> Result<&mut DeviceHandle> {
        let name = request.identity.name.clone();
        let ready = {
            let handle = self.create_device(request)?;
            make_ready(handle, mode)
        };
        if let Err(e) = ready {
            self.close_device(&name);
            return Err(e);
        }
        self.device(&name)
            .ok_or_else(|| DeviceError::Closed(name.clone()))
    }

    pub fn device(&mut self, name: &str) -> Option<&mut DeviceHandle> {
        self.devices.get_mut(name)
    }

    pub fn open_device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Close and forget one device. Returns whether it was open.
    pub fn close_device(&mut self, name: &str) -> bool {
        match self.devices.remove(name) {
            Some(mut handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Close every open device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let devices = std::mem::take(&mut self.devices);
        let count = devices.len();
        for (name, mut handle) in devices {
            handle.close();
            if !handle.is_closed() {
                warn!(device = %name, "Device did not close cleanly");
            }
        }
        self.closed = true;
        if count > 0 {
            info!(devices = count, "Fleet manager closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        self.close();
    }
}
