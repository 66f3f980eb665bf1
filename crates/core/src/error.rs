// Central Error Type for the Application

use thiserror::Error;

use crate::domain::{CallError, DeviceError};

/// Application-level error type
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Unknown fleet function: {0}")]
    UnknownFunction(String),

    #[error("Unknown extension package: {0}")]
    UnknownPackage(String),

    #[error("Parallel execution failed: {}", join_call_errors(.0))]
    ParallelExecution(Vec<CallError>),

    #[error("Worker pool error: {0}")]
    Pool(#[from] crate::port::PoolError),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

fn join_call_errors(errors: &[CallError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
