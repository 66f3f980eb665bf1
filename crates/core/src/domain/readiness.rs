// Readiness Domain Model

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::CheckFailure;

/// How far `make_ready` may go to bring a device to a known-good state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Skip health checks entirely
    Off,
    /// Run health checks once, never recover
    CheckOnly,
    /// Run health checks with bounded recovery
    #[default]
    On,
    /// Like `On`, escalating to a full re-provision on terminal failure
    OnWithReprovision,
}

impl std::fmt::Display for ReadinessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessMode::Off => write!(f, "off"),
            ReadinessMode::CheckOnly => write!(f, "check_only"),
            ReadinessMode::On => write!(f, "on"),
            ReadinessMode::OnWithReprovision => write!(f, "on_with_reprovision"),
        }
    }
}

impl FromStr for ReadinessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(ReadinessMode::Off),
            "check_only" => Ok(ReadinessMode::CheckOnly),
            "on" => Ok(ReadinessMode::On),
            // "flash_build" is the historical spelling of the re-provisioning mode
            "on_with_reprovision" | "flash_build" => Ok(ReadinessMode::OnWithReprovision),
            other => Err(format!(
                "Invalid readiness mode '{}': expected off, check_only, on or on_with_reprovision",
                other
            )),
        }
    }
}

/// Result of one ordered health-check run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadinessOutcome {
    pub passed_checks: Vec<String>,
    pub failing_check: Option<String>,
    pub error: Option<CheckFailure>,
}

impl ReadinessOutcome {
    pub fn passed(passed_checks: Vec<String>) -> Self {
        Self {
            passed_checks,
            failing_check: None,
            error: None,
        }
    }

    pub fn failed(passed_checks: Vec<String>, failing_check: String, error: CheckFailure) -> Self {
        Self {
            passed_checks,
            failing_check: Some(failing_check),
            error: Some(error),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.error.is_none()
    }

    /// Kind of the failing check, if any
    pub fn failure_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}

/// Last known readiness of a device handle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadinessState {
    #[default]
    Unknown,
    Ready,
    NotReady(ReadinessOutcome),
}

impl ReadinessState {
    pub fn from_outcome(outcome: &ReadinessOutcome) -> Self {
        if outcome.is_ready() {
            ReadinessState::Ready
        } else {
            ReadinessState::NotReady(outcome.clone())
        }
    }
}
