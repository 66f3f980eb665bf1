// Domain Layer - Plain entities and value types

pub mod call;
pub mod capability;
pub mod capability_cache;
pub mod capability_registry;
pub mod communication;
pub mod device;
pub mod device_handle;
pub mod error;
pub mod log_record;
pub mod readiness;
pub mod readiness_profile;

// Re-exports
pub use call::{CallError, CallFailure, CallOutcome, CallResult, CallSpec};
pub use capability::{Capability, CapabilityConstructor, CapabilityContext, CapabilityDescriptor};
pub use capability_cache::CapabilityCache;
pub use capability_registry::CapabilityRegistry;
pub use communication::{Communication, NullCommunication};
pub use device::{CommunicationArgs, DeviceConfig, DeviceIdentity, DeviceRequest};
pub use device_handle::DeviceHandle;
pub use error::{CheckFailure, DeviceError, NotReadyContext};
pub use log_record::{LogLevel, LogRecord};
pub use readiness::{ReadinessMode, ReadinessOutcome, ReadinessState};
pub use readiness_profile::{HealthCheck, ReadinessProfile};
