// Devfleet Core - Domain Logic & Ports
// NO process or I/O adapters (hexagonal architecture)

pub mod application;
pub mod constants;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{FleetError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
