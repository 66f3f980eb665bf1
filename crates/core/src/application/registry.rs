// Fleet registry
// Capabilities, device types and fleet functions, assembled from extension packages
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::manager::FleetManager;
use crate::application::panic_guard::execute_guarded;
use crate::constants::UNKNOWN_FUNCTION_KIND;
use crate::domain::error::Result as DeviceResult;
use crate::domain::{
    CallFailure, CallOutcome, CallSpec, CapabilityCache, CapabilityDescriptor, CapabilityRegistry,
    CommunicationArgs, DeviceConfig, DeviceError, DeviceHandle, DeviceIdentity,
};
use crate::error::{FleetError, Result};
use crate::port::{CallExecutor, DeviceBuilder};

/// Positional and keyword arguments of one call
#[derive(Debug, Clone, Copy)]
pub struct CallArgs<'a> {
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
}

impl<'a> CallArgs<'a> {
    pub fn new(args: &'a [Value], kwargs: &'a Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn from_spec(spec: &'a CallSpec) -> Self {
        Self::new(&spec.args, &spec.kwargs)
    }

    /// Parameter passed either at `position` or as keyword `name`
    pub fn get(&self, position: usize, name: &str) -> Option<&'a Value> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }

    /// Like `get`, but a missing parameter is a call failure
    pub fn require(&self, position: usize, name: &str) -> std::result::Result<&'a Value, CallFailure> {
        self.get(position, name).ok_or_else(|| {
            CallFailure::new("TypeError", format!("missing required argument '{}'", name))
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&'a Value> {
        self.kwargs.get(name)
    }
}

/// A unit of fleet work, invoked with a fresh manager as its implicit first argument
pub type FleetFunction = Arc<
    dyn Fn(&mut FleetManager, CallArgs<'_>) -> std::result::Result<Value, CallFailure>
        + Send
        + Sync,
>;

/// Registration record for one device type
#[derive(Clone)]
pub struct DeviceTypeSpec {
    pub name: String,
    /// Capability flavors selected for this type, one per capability
    pub flavors: BTreeSet<String>,
    pub builder: Arc<dyn DeviceBuilder>,
}

/// A named bundle of capabilities, device types and functions.
///
/// Workers re-register packages by name, so `register` must be deterministic.
pub trait ExtensionPackage: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, builder: &mut RegistryBuilder) -> DeviceResult<()>;
}

/// Mutable registration phase; `build` freezes it into a [`FleetRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    capabilities: CapabilityRegistry,
    device_types: BTreeMap<String, DeviceTypeSpec>,
    functions: BTreeMap<String, FleetFunction>,
    packages: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_capability(&mut self, descriptor: CapabilityDescriptor) -> DeviceResult<&mut Self> {
        self.capabilities.register(descriptor)?;
        Ok(self)
    }

    /// Bind a device type to its capability flavors.
    ///
    /// Every flavor must already be registered, and a type may bind at most one
    /// flavor per capability.
    pub fn register_device_type<B>(
        &mut self,
        name: impl Into<String>,
        flavors: &[&str],
        builder: B,
    ) -> DeviceResult<&mut Self>
    where
        B: DeviceBuilder + 'static,
    {
        let name = name.into().to_lowercase();
        if self.device_types.contains_key(&name) {
            return Err(DeviceError::Registration(format!(
                "device type {} is already registered",
                name
            )));
        }

        let mut bound = BTreeSet::new();
        let mut capabilities = BTreeSet::new();
        for flavor in flavors {
            let descriptor = self.capabilities.flavor(flavor).ok_or_else(|| {
                DeviceError::Registration(format!(
                    "device type {} binds unknown flavor {}",
                    name, flavor
                ))
            })?;
            if !capabilities.insert(descriptor.name.clone()) {
                return Err(DeviceError::Registration(format!(
                    "device type {} binds more than one flavor of {}",
                    name, descriptor.name
                )));
            }
            bound.insert(descriptor.flavor_name.clone());
        }

        self.device_types.insert(
            name.clone(),
            DeviceTypeSpec {
                name,
                flavors: bound,
                builder: Arc::new(builder),
            },
        );
        Ok(self)
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F) -> DeviceResult<&mut Self>
    where
        F: Fn(&mut FleetManager, CallArgs<'_>) -> std::result::Result<Value, CallFailure>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(DeviceError::Registration(format!(
                "fleet function {} is already registered",
                name
            )));
        }
        self.functions.insert(name, Arc::new(function));
        Ok(self)
    }

    pub fn install(&mut self, package: &dyn ExtensionPackage) -> DeviceResult<()> {
        if self.packages.iter().any(|p| p == package.name()) {
            debug!(package = %package.name(), "Package already installed");
            return Ok(());
        }
        package.register(self)?;
        self.packages.push(package.name().to_string());
        info!(package = %package.name(), "Extension package registered");
        Ok(())
    }

    pub fn build(self) -> FleetRegistry {
        FleetRegistry {
            capabilities: Arc::new(self.capabilities),
            device_types: self.device_types,
            functions: self.functions,
            packages: self.packages,
        }
    }
}

/// Read-only registration state, shared by `Arc` after the build phase
pub struct FleetRegistry {
    capabilities: Arc<CapabilityRegistry>,
    device_types: BTreeMap<String, DeviceTypeSpec>,
    functions: BTreeMap<String, FleetFunction>,
    packages: Vec<String>,
}

impl FleetRegistry {
    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Names of the packages this registry was built from, in install order
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn device_type_names(&self) -> Vec<String> {
        self.device_types.keys().cloned().collect()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn function(&self, name: &str) -> Option<FleetFunction> {
        self.functions.get(name).cloned()
    }

    fn device_type(&self, device_type: &str) -> DeviceResult<&DeviceTypeSpec> {
        self.device_types
            .get(&device_type.to_lowercase())
            .ok_or_else(|| DeviceError::DeviceCreation {
                device: device_type.to_string(),
                reason: "unknown device type".to_string(),
            })
    }

    /// Does `device_type` support all of `names` (capability, interface or flavor names)?
    pub fn supports<S: AsRef<str>>(&self, device_type: &str, names: &[S]) -> DeviceResult<bool> {
        let spec = self.device_type(device_type)?;
        self.capabilities.supported_by(&spec.flavors, names)
    }

    pub fn supported_capabilities(&self, device_type: &str) -> DeviceResult<Vec<String>> {
        let spec = self.device_type(device_type)?;
        Ok(self.capabilities.capabilities_of(&spec.flavors).into_iter().collect())
    }

    /// Build a device handle through the device-type table.
    ///
    /// Any failure is a `DeviceCreation` error and is never retried.
    pub fn build_device(
        &self,
        identity: DeviceIdentity,
        config: DeviceConfig,
        comm_args: CommunicationArgs,
    ) -> DeviceResult<DeviceHandle> {
        let spec = self.device_type(&identity.device_type).map_err(|_| {
            DeviceError::DeviceCreation {
                device: identity.name.clone(),
                reason: format!("unknown device type {}", identity.device_type),
            }
        })?;

        let parts = spec
            .builder
            .build(&identity, &config, &comm_args)
            .map_err(|e| match e {
                err @ DeviceError::DeviceCreation { .. } => err,
                other => DeviceError::DeviceCreation {
                    device: identity.name.clone(),
                    reason: other.to_string(),
                },
            })?;

        debug!(device = %identity.name, device_type = %spec.name, "Device built");
        Ok(DeviceHandle::new(
            identity,
            config,
            comm_args,
            CapabilityCache::new(Arc::clone(&self.capabilities), spec.flavors.iter().cloned()),
            parts.communication,
            parts.readiness,
        ))
    }

    /// Run one call in this process with a fresh manager, closed afterwards.
    ///
    /// Panics are reported as `Panic` failures.
    pub fn invoke(self: &Arc<Self>, spec: &CallSpec) -> CallOutcome {
        let function = self.function(&spec.function).ok_or_else(|| {
            CallFailure::new(
                UNKNOWN_FUNCTION_KIND,
                format!("no fleet function named {}", spec.function),
            )
        })?;

        let mut manager = FleetManager::new(Arc::clone(self));
        let outcome = execute_guarded(AssertUnwindSafe(|| {
            function(&mut manager, CallArgs::from_spec(spec))
        }));
        manager.close();
        outcome
    }

    /// Executor for worker pools that run calls against this registry
    pub fn executor(self: &Arc<Self>) -> CallExecutor {
        let registry = Arc::clone(self);
        Arc::new(move |spec: &CallSpec| registry.invoke(spec))
    }
}

/// Extension packages known to this binary, looked up by name
#[derive(Default, Clone)]
pub struct PackageCatalog {
    packages: BTreeMap<String, Arc<dyn ExtensionPackage>>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P: ExtensionPackage + 'static>(mut self, package: P) -> Self {
        self.packages
            .insert(package.name().to_string(), Arc::new(package));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// Register the named packages, in order, into a fresh registry
    pub fn build_registry<S: AsRef<str>>(&self, names: &[S]) -> Result<Arc<FleetRegistry>> {
        let mut builder = RegistryBuilder::new();
        for name in names {
            let package = self
                .packages
                .get(name.as_ref())
                .ok_or_else(|| FleetError::UnknownPackage(name.as_ref().to_string()))?;
            builder.install(package.as_ref())?;
        }
        Ok(Arc::new(builder.build()))
    }
}
