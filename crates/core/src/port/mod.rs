// Port Layer - Interfaces for external dependencies

pub mod device_builder;
pub mod log_sink;
pub mod time_provider; // For deterministic deadline tests
pub mod worker_pool;

// Re-exports
pub use device_builder::{DeviceBuilder, DeviceParts};
pub use log_sink::{LogDestination, RecordSink};
pub use time_provider::{SystemTimeProvider, TimeProvider};
pub use worker_pool::{CallExecutor, PendingCall, PoolError, WorkerPool, WorkerPoolFactory};
