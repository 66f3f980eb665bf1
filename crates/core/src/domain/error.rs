// Domain Error Types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Failure reported by a single health check.
///
/// `kind` names the failure family (e.g. `DeviceNotResponsiveError`). Recovery
/// dispatch and repeated-failure detection look only at the kind, never at the
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub kind: String,
    pub message: String,
}

impl CheckFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Identifying context attached to every terminal readiness failure
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotReadyContext {
    pub device_name: String,
    /// Checks that passed before the failing one, as `<device_type>.<check>`
    pub checks_passed: Vec<String>,
    /// Persistent identifiers of the device (serial number, model, ...)
    pub properties: BTreeMap<String, String>,
}

impl fmt::Display for NotReadyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checks passed: [{}], properties: {:?}",
            self.checks_passed.join(", "),
            self.properties
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Device {device} does not support capability {capability}")]
    UnsupportedCapability { device: String, capability: String },

    #[error("Failed to create device {device}: {reason}")]
    DeviceCreation { device: String, reason: String },

    #[error("{} not ready: {failure} ({context})", .context.device_name)]
    CheckFailed {
        failure: CheckFailure,
        context: NotReadyContext,
    },

    #[error("{} recovery from {failure} failed: {reason} ({context})", .context.device_name)]
    RecoveryFailed {
        failure: CheckFailure,
        reason: String,
        context: NotReadyContext,
    },

    #[error("{} failed with {} twice in a row, giving up ({context})", .context.device_name, .failure.kind)]
    RepeatedFailure {
        failure: CheckFailure,
        context: NotReadyContext,
    },

    #[error("Communication error on {device}: {reason}")]
    Communication { device: String, reason: String },

    #[error("Device {0} is closed")]
    Closed(String),

    #[error("Registration error: {0}")]
    Registration(String),
}

impl DeviceError {
    /// Stable kind name reported across the isolation boundary
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::UnknownCapability(_) => "UnknownCapabilityError",
            DeviceError::UnsupportedCapability { .. } => "UnsupportedCapabilityError",
            DeviceError::DeviceCreation { .. } => "DeviceCreationError",
            DeviceError::CheckFailed { .. } => "CheckFailedError",
            DeviceError::RecoveryFailed { .. } => "RecoveryFailedError",
            DeviceError::RepeatedFailure { .. } => "RepeatedFailureError",
            DeviceError::Communication { .. } => "CommunicationError",
            DeviceError::Closed(_) => "DeviceClosedError",
            DeviceError::Registration(_) => "RegistrationError",
        }
    }

    /// True for the "device not ready" family of terminal readiness failures
    pub fn is_not_ready(&self) -> bool {
        self.not_ready_context().is_some()
    }

    pub fn not_ready_context(&self) -> Option<&NotReadyContext> {
        match self {
            DeviceError::CheckFailed { context, .. }
            | DeviceError::RecoveryFailed { context, .. }
            | DeviceError::RepeatedFailure { context, .. } => Some(context),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_message_reports_passed_checks_and_properties() {
        let mut properties = BTreeMap::new();
        properties.insert("serial_number".to_string(), "SN-42".to_string());
        let err = DeviceError::RepeatedFailure {
            failure: CheckFailure::new("DeviceNotResponsiveError", "no prompt"),
            context: NotReadyContext {
                device_name: "board-1".to_string(),
                checks_passed: vec!["board.check_connected".to_string()],
                properties,
            },
        };

        let msg = err.to_string();
        assert!(msg.contains("board-1"));
        assert!(msg.contains("DeviceNotResponsiveError"));
        assert!(msg.contains("board.check_connected"));
        assert!(msg.contains("SN-42"));
        assert_eq!(err.kind(), "RepeatedFailureError");
        assert!(err.is_not_ready());
    }

    #[test]
    fn test_creation_error_is_not_a_readiness_failure() {
        let err = DeviceError::DeviceCreation {
            device: "board-1".to_string(),
            reason: "unknown device type".to_string(),
        };
        assert!(!err.is_not_ready());
        assert_eq!(err.kind(), "DeviceCreationError");
    }
}
