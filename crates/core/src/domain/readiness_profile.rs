// Readiness Profile - per device type health checks and recovery table

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::device_handle::DeviceHandle;
use super::error::{CheckFailure, Result};
use crate::constants::DEFAULT_MAX_ATTEMPTS;

pub type HealthCheckFn =
    Arc<dyn Fn(&mut DeviceHandle) -> std::result::Result<(), CheckFailure> + Send + Sync>;

pub type RecoveryFn = Arc<dyn Fn(&mut DeviceHandle, &CheckFailure) -> Result<()> + Send + Sync>;

pub type ReprovisionFn = Arc<dyn Fn(&mut DeviceHandle) -> Result<()> + Send + Sync>;

/// One named entry of the ordered health-check list
#[derive(Clone)]
pub struct HealthCheck {
    pub name: String,
    pub run: HealthCheckFn,
}

impl HealthCheck {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut DeviceHandle) -> std::result::Result<(), CheckFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck").field("name", &self.name).finish()
    }
}

/// What a device type contributes to the readiness protocol.
///
/// Recoveries are dispatched by failure kind. A kind without an entry is not
/// recoverable.
#[derive(Clone)]
pub struct ReadinessProfile {
    checks: Vec<HealthCheck>,
    recoveries: HashMap<String, RecoveryFn>,
    reprovision: Option<ReprovisionFn>,
    max_attempts: u32,
}

impl Default for ReadinessProfile {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            recoveries: HashMap::new(),
            reprovision: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReadinessProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check<F>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut DeviceHandle) -> std::result::Result<(), CheckFailure> + Send + Sync + 'static,
    {
        self.checks.push(HealthCheck::new(name, run));
        self
    }

    pub fn with_recovery<F>(mut self, kind: impl Into<String>, recover: F) -> Self
    where
        F: Fn(&mut DeviceHandle, &CheckFailure) -> Result<()> + Send + Sync + 'static,
    {
        self.recoveries.insert(kind.into(), Arc::new(recover));
        self
    }

    pub fn with_reprovision<F>(mut self, reprovision: F) -> Self
    where
        F: Fn(&mut DeviceHandle) -> Result<()> + Send + Sync + 'static,
    {
        self.reprovision = Some(Arc::new(reprovision));
        self
    }

    /// Clamped to at least one attempt
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn checks(&self) -> &[HealthCheck] {
        &self.checks
    }

    pub fn recovery_for(&self, kind: &str) -> Option<RecoveryFn> {
        self.recoveries.get(kind).cloned()
    }

    pub fn reprovision(&self) -> Option<ReprovisionFn> {
        self.reprovision.clone()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl fmt::Debug for ReadinessProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.recoveries.keys().collect();
        kinds.sort();
        f.debug_struct("ReadinessProfile")
            .field("checks", &self.checks)
            .field("recoveries", &kinds)
            .field("reprovision", &self.reprovision.is_some())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
