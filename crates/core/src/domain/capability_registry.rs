// Capability Registry
// Name table for capability flavors; filled once at registration, read-only afterwards

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::capability::CapabilityDescriptor;
use super::error::{DeviceError, Result};

/// Maps capability, interface and flavor names to registered descriptors.
///
/// Invariants:
/// - flavor names are unique
/// - each interface belongs to exactly one capability name (and vice versa)
/// - all names are stored lowercase; lookups are case-insensitive
#[derive(Debug, Default, Clone)]
pub struct CapabilityRegistry {
    flavors: BTreeMap<String, Arc<CapabilityDescriptor>>,
    interfaces: BTreeMap<String, String>,   // interface -> capability
    capabilities: BTreeMap<String, String>, // capability -> interface
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CapabilityDescriptor) -> Result<()> {
        if self.flavors.contains_key(&descriptor.flavor_name) {
            return Err(DeviceError::Registration(format!(
                "capability flavor {} is already registered",
                descriptor.flavor_name
            )));
        }
        if let Some(owner) = self.interfaces.get(&descriptor.interface_name) {
            if owner != &descriptor.name {
                return Err(DeviceError::Registration(format!(
                    "interface {} already belongs to capability {}",
                    descriptor.interface_name, owner
                )));
            }
        }
        if let Some(interface) = self.capabilities.get(&descriptor.name) {
            if interface != &descriptor.interface_name {
                return Err(DeviceError::Registration(format!(
                    "capability {} is already bound to interface {}",
                    descriptor.name, interface
                )));
            }
        }

        self.interfaces
            .insert(descriptor.interface_name.clone(), descriptor.name.clone());
        self.capabilities
            .insert(descriptor.name.clone(), descriptor.interface_name.clone());
        self.flavors
            .insert(descriptor.flavor_name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Resolve a capability, interface or flavor name (checked in that order).
    ///
    /// Capability and interface names yield every flavor implementing the
    /// interface, in flavor-name order; a flavor name yields that flavor only.
    pub fn resolve(&self, name: &str) -> Result<Vec<Arc<CapabilityDescriptor>>> {
        let name = name.to_lowercase();

        let interface = if let Some(interface) = self.capabilities.get(&name) {
            Some(interface.as_str())
        } else if self.interfaces.contains_key(&name) {
            Some(name.as_str())
        } else {
            None
        };

        if let Some(interface) = interface {
            return Ok(self
                .flavors
                .values()
                .filter(|d| d.interface_name == interface)
                .cloned()
                .collect());
        }

        self.flavors
            .get(&name)
            .map(|d| vec![Arc::clone(d)])
            .ok_or(DeviceError::UnknownCapability(name))
    }

    /// True if every name resolves to at least one of `flavors`
    pub fn supported_by<S: AsRef<str>>(&self, flavors: &BTreeSet<String>, names: &[S]) -> Result<bool> {
        for name in names {
            let found = self.resolve(name.as_ref())?;
            if !found.iter().any(|d| flavors.contains(&d.flavor_name)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Capability names backed by any of `flavors`
    pub fn capabilities_of(&self, flavors: &BTreeSet<String>) -> BTreeSet<String> {
        flavors
            .iter()
            .filter_map(|f| self.flavors.get(f))
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn flavor(&self, flavor_name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.flavors.get(&flavor_name.to_lowercase()).cloned()
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    pub fn flavor_names(&self) -> Vec<String> {
        self.flavors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.flavors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flavors.is_empty()
    }
}
