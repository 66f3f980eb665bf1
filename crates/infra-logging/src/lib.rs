// Devfleet Logging Adapters
// Destinations for the aggregator and the bridge from `tracing` events to log records

pub mod destination;
pub mod init;
pub mod layer;

pub use destination::{format_detailed, FileDestination, LineFormat, StreamDestination};
pub use init::{build_filter, init_logging, DEFAULT_FILTER};
pub use layer::AggregatorLayer;
