// Application Layer - Use Cases and Business Logic

pub mod fanout;
pub mod log_aggregator;
pub mod manager;
pub mod panic_guard;
pub mod readiness;
pub mod registry;

// Re-exports
pub use fanout::{BatchOutcome, EngineConfig, FanOutEngine};
pub use log_aggregator::{AggregatorConfig, FleetLogger, LogAggregator, LogMessage, LogSender};
pub use manager::FleetManager;
pub use readiness::{check_ready, make_ready};
pub use registry::{
    CallArgs, DeviceTypeSpec, ExtensionPackage, FleetFunction, FleetRegistry, PackageCatalog,
    RegistryBuilder,
};
