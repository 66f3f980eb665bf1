// Capability Cache - lazily created, memoized capability instances of one device

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::capability::{Capability, CapabilityContext, CapabilityDescriptor};
use super::capability_registry::CapabilityRegistry;
use super::error::{DeviceError, Result};

/// Per-device cache of capability instances, keyed by capability name.
///
/// Holds at most one instance per capability. Access goes through `&mut self`,
/// so callers sharing a device must serialize themselves.
pub struct CapabilityCache {
    registry: Arc<CapabilityRegistry>,
    flavors: BTreeSet<String>,
    instances: BTreeMap<String, Box<dyn Capability>>,
}

impl CapabilityCache {
    /// `flavors` are the flavor names bound to the device's type
    pub fn new(registry: Arc<CapabilityRegistry>, flavors: impl IntoIterator<Item = String>) -> Self {
        Self {
            registry,
            flavors: flavors.into_iter().map(|f| f.to_lowercase()).collect(),
            instances: BTreeMap::new(),
        }
    }

    pub fn supported_flavors(&self) -> &BTreeSet<String> {
        &self.flavors
    }

    /// Capability names this device can create
    pub fn supported_capabilities(&self) -> BTreeSet<String> {
        self.registry.capabilities_of(&self.flavors)
    }

    /// True if every name (capability, interface or flavor) is backed by a bound flavor
    pub fn supports<S: AsRef<str>>(&self, names: &[S]) -> Result<bool> {
        self.registry.supported_by(&self.flavors, names)
    }

    /// Pick the single bound flavor behind `name`
    fn select(&self, device: &str, name: &str) -> Result<Arc<CapabilityDescriptor>> {
        let mut bound: Vec<_> = self
            .registry
            .resolve(name)?
            .into_iter()
            .filter(|d| self.flavors.contains(&d.flavor_name))
            .collect();

        match bound.len() {
            0 => Err(DeviceError::UnsupportedCapability {
                device: device.to_string(),
                capability: name.to_string(),
            }),
            1 => Ok(bound.remove(0)),
            n => Err(DeviceError::Registration(format!(
                "{} flavors of {} are bound to {}, expected one",
                n, name, device
            ))),
        }
    }

    pub fn get_or_create(
        &mut self,
        ctx: &CapabilityContext<'_>,
        name: &str,
    ) -> Result<&mut dyn Capability> {
        let key = name.to_lowercase();
        let key = if self.instances.contains_key(&key) {
            key
        } else {
            let descriptor = self.select(&ctx.identity.name, name)?;
            if !self.instances.contains_key(&descriptor.name) {
                let instance = descriptor.construct(ctx)?;
                debug!(
                    device = %ctx.identity.name,
                    capability = %descriptor.name,
                    flavor = %descriptor.flavor_name,
                    "Capability created"
                );
                self.instances.insert(descriptor.name.clone(), instance);
            }
            descriptor.name.clone()
        };

        match self.instances.get_mut(&key) {
            Some(instance) => Ok(&mut **instance),
            None => Err(DeviceError::UnknownCapability(key)),
        }
    }

    pub fn is_cached(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        if self.instances.contains_key(&key) {
            return true;
        }
        self.registry
            .resolve(&key)
            .map(|found| found.iter().any(|d| self.instances.contains_key(&d.name)))
            .unwrap_or(false)
    }

    /// Shut down and evict a cached capability. Returns whether one was cached.
    pub fn reset(&mut self, device: &str, name: &str) -> Result<bool> {
        let key = name.to_lowercase();
        let key = if self.instances.contains_key(&key) {
            key
        } else {
            self.select(device, name)?.name.clone()
        };

        match self.instances.remove(&key) {
            Some(mut instance) => {
                instance.shutdown();
                debug!(device = %device, capability = %key, "Capability reset");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shut down and evict every cached capability (order unspecified)
    pub fn reset_all(&mut self, device: &str) -> usize {
        let instances = std::mem::take(&mut self.instances);
        let count = instances.len();
        for (name, mut instance) in instances {
            instance.shutdown();
            debug!(device = %device, capability = %name, "Capability reset");
        }
        count
    }

    pub fn cached_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{CommunicationArgs, DeviceConfig, DeviceIdentity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        built: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct Probe {
        serial: usize,
        counters: Arc<Counters>,
    }

    impl Capability for Probe {
        fn shutdown(&mut self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (CapabilityCache, Arc<Counters>, DeviceIdentity) {
        let counters = Arc::new(Counters::default());
        let mut registry = CapabilityRegistry::new();
        for flavor in ["event_parser_default", "event_parser_fast"] {
            let c = Arc::clone(&counters);
            registry
                .register(CapabilityDescriptor::new(
                    "event_parser",
                    "event_parser_base",
                    flavor,
                    move |_ctx| {
                        let serial = c.built.fetch_add(1, Ordering::SeqCst);
                        Ok(Box::new(Probe {
                            serial,
                            counters: Arc::clone(&c),
                        }) as Box<dyn Capability>)
                    },
                ))
                .unwrap();
        }
        let cache = CapabilityCache::new(
            Arc::new(registry),
            vec!["event_parser_default".to_string()],
        );
        (cache, counters, DeviceIdentity::new("board-1", "sim_board"))
    }

    fn serial_of(cap: &mut dyn Capability) -> usize {
        cap.downcast_mut::<Probe>().unwrap().serial
    }

    #[test]
    fn test_get_or_create_memoizes() {
        let (mut cache, counters, identity) = setup();
        let config = DeviceConfig::new();
        let comm = CommunicationArgs::new();
        let ctx = CapabilityContext {
            identity: &identity,
            config: &config,
            comm_args: &comm,
        };

        let first = serial_of(cache.get_or_create(&ctx, "event_parser").unwrap());
        let second = serial_of(cache.get_or_create(&ctx, "EVENT_PARSER_BASE").unwrap());
        assert_eq!(first, second);
        assert_eq!(counters.built.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached("event_parser_default"));
    }

    #[test]
    fn test_reset_shuts_down_once_and_recreates() {
        let (mut cache, counters, identity) = setup();
        let config = DeviceConfig::new();
        let comm = CommunicationArgs::new();
        let ctx = CapabilityContext {
            identity: &identity,
            config: &config,
            comm_args: &comm,
        };

        let first = serial_of(cache.get_or_create(&ctx, "event_parser").unwrap());
        assert!(cache.reset("board-1", "event_parser").unwrap());
        assert!(!cache.reset("board-1", "event_parser").unwrap());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);

        let second = serial_of(cache.get_or_create(&ctx, "event_parser").unwrap());
        assert_ne!(first, second);
        assert_eq!(counters.built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unbound_flavor_is_unsupported() {
        let (mut cache, _counters, identity) = setup();
        let config = DeviceConfig::new();
        let comm = CommunicationArgs::new();
        let ctx = CapabilityContext {
            identity: &identity,
            config: &config,
            comm_args: &comm,
        };

        let err = cache.get_or_create(&ctx, "event_parser_fast").err().unwrap();
        assert!(matches!(err, DeviceError::UnsupportedCapability { .. }));
        let err = cache.get_or_create(&ctx, "flux_capacitor").err().unwrap();
        assert_eq!(err.kind(), "UnknownCapabilityError");
    }

    #[test]
    fn test_supports_by_membership() {
        let (cache, _counters, _identity) = setup();
        assert!(cache.supports(&["event_parser", "event_parser_default"]).unwrap());
        assert!(!cache.supports(&["event_parser_fast"]).unwrap());
        assert!(cache.supports(&["warp_drive"]).is_err());
        assert_eq!(
            cache.supported_capabilities().into_iter().collect::<Vec<_>>(),
            vec!["event_parser".to_string()]
        );
    }

    #[test]
    fn test_reset_all_shuts_down_every_instance() {
        let (mut cache, counters, identity) = setup();
        let config = DeviceConfig::new();
        let comm = CommunicationArgs::new();
        let ctx = CapabilityContext {
            identity: &identity,
            config: &config,
            comm_args: &comm,
        };

        cache.get_or_create(&ctx, "event_parser").unwrap();
        assert_eq!(cache.reset_all("board-1"), 1);
        assert_eq!(cache.reset_all("board-1"), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_count(), 0);
    }
}
