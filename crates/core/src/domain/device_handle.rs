// Device Handle - the unit of work for one physical device

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::capability::{Capability, CapabilityContext};
use super::capability_cache::CapabilityCache;
use super::communication::Communication;
use super::device::{CommunicationArgs, DeviceConfig, DeviceIdentity};
use super::error::{DeviceError, Result};
use super::readiness::ReadinessState;
use super::readiness_profile::ReadinessProfile;

/// Owns identity, configuration, the capability cache and the communication
/// channel of one device.
///
/// Not shareable across threads concurrently: every mutating operation takes
/// `&mut self`. `close` is idempotent and also runs on drop.
pub struct DeviceHandle {
    identity: DeviceIdentity,
    config: DeviceConfig,
    comm_args: CommunicationArgs,
    capabilities: CapabilityCache,
    communication: Box<dyn Communication>,
    readiness: Arc<ReadinessProfile>,
    readiness_state: ReadinessState,
    closed: bool,
}

impl DeviceHandle {
    pub fn new(
        identity: DeviceIdentity,
        config: DeviceConfig,
        comm_args: CommunicationArgs,
        capabilities: CapabilityCache,
        communication: Box<dyn Communication>,
        readiness: ReadinessProfile,
    ) -> Self {
        Self {
            identity,
            config,
            comm_args,
            capabilities,
            communication,
            readiness: Arc::new(readiness),
            readiness_state: ReadinessState::Unknown,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn device_type(&self) -> &str {
        &self.identity.device_type
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn comm_args(&self) -> &CommunicationArgs {
        &self.comm_args
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DeviceError::Closed(self.identity.name.clone()));
        }
        Ok(())
    }

    /// Get a capability by capability, interface or flavor name, creating it on first access
    pub fn capability(&mut self, name: &str) -> Result<&mut dyn Capability> {
        self.ensure_open()?;
        let ctx = CapabilityContext {
            identity: &self.identity,
            config: &self.config,
            comm_args: &self.comm_args,
        };
        self.capabilities.get_or_create(&ctx, name)
    }

    /// Typed access to a capability's concrete flavor
    pub fn capability_as<T: Capability + 'static>(&mut self, name: &str) -> Result<&mut T> {
        let device = self.identity.name.clone();
        self.capability(name)?
            .downcast_mut::<T>()
            .ok_or_else(|| DeviceError::UnsupportedCapability {
                device,
                capability: format!("{} as {}", name, std::any::type_name::<T>()),
            })
    }

    pub fn has_cached_capability(&self, name: &str) -> bool {
        self.capabilities.is_cached(name)
    }

    pub fn reset_capability(&mut self, name: &str) -> Result<bool> {
        self.capabilities.reset(&self.identity.name, name)
    }

    pub fn reset_all_capabilities(&mut self) -> usize {
        self.capabilities.reset_all(&self.identity.name)
    }

    pub fn supports<S: AsRef<str>>(&self, names: &[S]) -> Result<bool> {
        self.capabilities.supports(names)
    }

    pub fn supported_capabilities(&self) -> Vec<String> {
        self.capabilities.supported_capabilities().into_iter().collect()
    }

    pub fn open_communication(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.communication.open()
    }

    pub fn close_communication(&mut self) -> Result<()> {
        self.communication.close()
    }

    /// Close and reopen the channel, the usual recovery for an unresponsive device
    pub fn reopen_communication(&mut self) -> Result<()> {
        self.ensure_open()?;
        debug!(device = %self.identity.name, "Reopening communication");
        self.communication.close()?;
        self.communication.open()
    }

    pub fn is_communication_open(&self) -> bool {
        self.communication.is_open()
    }

    pub fn readiness_profile(&self) -> Arc<ReadinessProfile> {
        Arc::clone(&self.readiness)
    }

    pub fn readiness_state(&self) -> &ReadinessState {
        &self.readiness_state
    }

    pub fn set_readiness_state(&mut self, state: ReadinessState) {
        self.readiness_state = state;
    }

    /// Tear down every cached capability, then close communication.
    /// Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let released = self.capabilities.reset_all(&self.identity.name);
        if let Err(e) = self.communication.close() {
            warn!(device = %self.identity.name, error = %e, "Failed to close communication");
        }
        self.closed = true;
        info!(device = %self.identity.name, capabilities = released, "Device closed");
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("identity", &self.identity)
            .field("readiness_state", &self.readiness_state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
