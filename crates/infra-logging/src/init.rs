// Global subscriber setup for controller and worker processes
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use devfleet_core::port::RecordSink;
use devfleet_core::{FleetError, Result};

use crate::layer::AggregatorLayer;

/// Default directive when neither DEVFLEET_LOG nor RUST_LOG is set
pub const DEFAULT_FILTER: &str = "devfleet=info";

/// Build the event filter. An explicit directive wins over RUST_LOG.
pub fn build_filter(directive: Option<&str>) -> Result<EnvFilter> {
    match directive {
        Some(d) => EnvFilter::try_new(d)
            .map_err(|e| FleetError::Config(format!("Invalid log filter '{}': {}", d, e))),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
            .map_err(|e| FleetError::Config(format!("Invalid log filter: {}", e))),
    }
}

/// Install the process-wide subscriber that routes every event into `sink`.
///
/// Used by the controller (sink = aggregator queue) and by workers (sink =
/// frame writer on stdout). Fails if a global subscriber is already set.
pub fn init_logging(directive: Option<&str>, sink: Arc<dyn RecordSink>) -> Result<()> {
    let filter = build_filter(directive)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(AggregatorLayer::new(sink))
        .try_init()
        .map_err(|e| FleetError::Logging(format!("Failed to install subscriber: {}", e)))
}
