// Fleet Call Model
// Everything here crosses the process isolation boundary, so it must stay plain data

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::error::DeviceError;

/// Serializable description of one unit of fleet work.
///
/// `function` names a fleet function registered by an extension package; the
/// worker resolves it after its own registration step. Never carries live
/// resources (connections, device handles).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Result slot for one submitted call. `value == None` is NO_RESULT, which
/// differs from a function that returned nothing (`Some(Value::Null)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub index: usize,
    pub value: Option<Value>,
}

impl CallResult {
    pub fn value(index: usize, value: Value) -> Self {
        Self {
            index,
            value: Some(value),
        }
    }

    pub fn no_result(index: usize) -> Self {
        Self { index, value: None }
    }

    pub fn is_no_result(&self) -> bool {
        self.value.is_none()
    }
}

/// Error captured for one submitted call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub index: usize,
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl CallError {
    pub fn from_failure(index: usize, failure: CallFailure) -> Self {
        Self {
            index,
            kind: failure.kind,
            message: failure.message,
            trace: failure.trace,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.index, self.kind, self.message)
    }
}

/// Failure raised by a fleet function inside a worker, reduced to
/// kind/message/trace so it can cross the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl CallFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<DeviceError> for CallFailure {
    fn from(err: DeviceError) -> Self {
        CallFailure::new(err.kind(), err.to_string())
    }
}

/// What a worker reports back for one call
pub type CallOutcome = std::result::Result<Value, CallFailure>;
