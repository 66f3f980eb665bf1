// Capability Domain Model

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::device::{CommunicationArgs, DeviceConfig, DeviceIdentity};
use super::error::Result;

/// Dynamic downcast support for capability instances
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A lazily-created device sub-resource (file transfer, power control, ...).
///
/// Instances are exclusively owned by one device handle. `shutdown` is the
/// teardown hook: it runs exactly once, when the instance is evicted by a reset
/// or when the owning device is closed.
pub trait Capability: AsAny + Send {
    fn shutdown(&mut self) {}
}

impl<'a> dyn Capability + 'a {
    pub fn downcast_ref<T: Capability + 'static>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Capability + 'static>(&mut self) -> Option<&mut T> {
        AsAny::as_any_mut(self).downcast_mut::<T>()
    }
}

/// Device-supplied arguments handed to a capability constructor
#[derive(Debug, Clone, Copy)]
pub struct CapabilityContext<'a> {
    pub identity: &'a DeviceIdentity,
    pub config: &'a DeviceConfig,
    pub comm_args: &'a CommunicationArgs,
}

pub type CapabilityConstructor =
    Arc<dyn Fn(&CapabilityContext<'_>) -> Result<Box<dyn Capability>> + Send + Sync>;

/// Registration record for one capability flavor. Immutable once registered.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    /// Capability name, e.g. `file_transfer`
    pub name: String,
    /// Interface implemented by the flavor, e.g. `file_transfer_base`
    pub interface_name: String,
    /// Concrete implementation, e.g. `file_transfer_scp` (globally unique)
    pub flavor_name: String,
    pub constructor: CapabilityConstructor,
}

impl CapabilityDescriptor {
    pub fn new<F>(
        name: impl Into<String>,
        interface_name: impl Into<String>,
        flavor_name: impl Into<String>,
        constructor: F,
    ) -> Self
    where
        F: Fn(&CapabilityContext<'_>) -> Result<Box<dyn Capability>> + Send + Sync + 'static,
    {
        Self {
            name: name.into().to_lowercase(),
            interface_name: interface_name.into().to_lowercase(),
            flavor_name: flavor_name.into().to_lowercase(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn construct(&self, ctx: &CapabilityContext<'_>) -> Result<Box<dyn Capability>> {
        (self.constructor)(ctx)
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("interface_name", &self.interface_name)
            .field("flavor_name", &self.flavor_name)
            .finish_non_exhaustive()
    }
}
