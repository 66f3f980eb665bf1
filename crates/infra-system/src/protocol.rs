// Worker Protocol
// JSON lines over the worker's stdin (requests) and stdout (responses)

use serde::{Deserialize, Serialize};

use devfleet_core::domain::{CallOutcome, CallSpec, LogRecord};
use devfleet_core::port::PoolError;

/// First message every worker receives: how to rebuild the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Extension packages to install, in order
    pub packages: Vec<String>,
    /// Filter directive for the worker's tracing subscriber
    #[serde(default)]
    pub log_filter: Option<String>,
}

/// Controller -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init(WorkerInit),
    Call { spec: CallSpec },
    Shutdown,
}

/// Worker -> controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready { pid: u32 },
    InitFailed { message: String },
    Log { record: LogRecord },
    Done { outcome: CallOutcome },
}

/// Serialize one message as a single line, newline included
pub fn encode<T: Serialize>(message: &T) -> Result<String, PoolError> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| PoolError::Protocol(format!("encode failed: {}", e)))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_request(line: &str) -> Result<WorkerRequest, PoolError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| PoolError::Protocol(format!("bad request line: {}", e)))
}

pub fn decode_response(line: &str) -> Result<WorkerResponse, PoolError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| PoolError::Protocol(format!("bad response line: {}", e)))
}
