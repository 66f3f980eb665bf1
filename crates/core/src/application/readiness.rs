// Readiness state machine
// Bounded health-check / recovery protocol for one device handle
use tracing::{debug, info, warn};

use crate::domain::error::Result;
use crate::domain::{
    CheckFailure, DeviceError, DeviceHandle, NotReadyContext, ReadinessMode, ReadinessOutcome,
    ReadinessState,
};

/// Run the device's health checks once, in order, stopping at the first failure.
///
/// Never recovers. Updates the handle's readiness state.
pub fn check_ready(handle: &mut DeviceHandle) -> ReadinessOutcome {
    let profile = handle.readiness_profile();
    let checks = profile.checks();
    let total = checks.len();
    let mut passed = Vec::with_capacity(total);

    let mut outcome = None;
    for (i, check) in checks.iter().enumerate() {
        let qualified = format!("{}.{}", handle.device_type(), check.name);
        match (check.run)(handle) {
            Ok(()) => {
                info!(
                    device = %handle.name(),
                    "health check {}/{} succeeded: {}",
                    i + 1,
                    total,
                    check.name
                );
                passed.push(qualified);
            }
            Err(failure) => {
                warn!(
                    device = %handle.name(),
                    kind = %failure.kind,
                    "health check {}/{} failed: {}",
                    i + 1,
                    total,
                    check.name
                );
                outcome = Some(ReadinessOutcome::failed(passed.clone(), qualified, failure));
                break;
            }
        }
    }

    let outcome = outcome.unwrap_or_else(|| ReadinessOutcome::passed(passed));
    handle.set_readiness_state(ReadinessState::from_outcome(&outcome));
    outcome
}

/// Bring a device to a known-good state.
///
/// - `Off`: no checks, success
/// - `CheckOnly`: one check run, failure is returned as-is
/// - `On`: recover by failure kind, at most `max_attempts` times, then one final run
/// - `OnWithReprovision`: like `On`, then a single re-provision on terminal failure
///
/// Every terminal failure is a "not ready" [`DeviceError`] carrying the passed
/// checks and the device's persistent identifiers.
pub fn make_ready(handle: &mut DeviceHandle, mode: ReadinessMode) -> Result<()> {
    if mode == ReadinessMode::Off {
        debug!(device = %handle.name(), "Readiness is off, skipping health checks");
        return Ok(());
    }

    match recover_until_ready(handle, mode) {
        Err(err) if mode == ReadinessMode::OnWithReprovision && err.is_not_ready() => {
            reprovision(handle, err)
        }
        result => result,
    }
}

fn recover_until_ready(handle: &mut DeviceHandle, mode: ReadinessMode) -> Result<()> {
    let profile = handle.readiness_profile();
    let max_attempts = profile.max_attempts();
    let mut previous_kind: Option<String> = None;

    for attempt in 1..=max_attempts {
        let outcome = check_ready(handle);
        let failure = match outcome.error.clone() {
            None => {
                info!(device = %handle.name(), attempt, "Device is ready");
                return Ok(());
            }
            Some(failure) => failure,
        };

        if mode == ReadinessMode::CheckOnly {
            return Err(check_failed(handle, &outcome, failure));
        }

        // Same kind right after a recovery: stop without recovering again
        if previous_kind.as_deref() == Some(failure.kind.as_str()) {
            return Err(DeviceError::RepeatedFailure {
                context: not_ready_context(handle, &outcome),
                failure,
            });
        }

        let recover = match profile.recovery_for(&failure.kind) {
            Some(recover) => recover,
            None => {
                warn!(device = %handle.name(), kind = %failure.kind, "No recovery for failure kind");
                return Err(check_failed(handle, &outcome, failure));
            }
        };

        info!(
            device = %handle.name(),
            attempt,
            max_attempts,
            kind = %failure.kind,
            "Recovering device"
        );
        if let Err(e) = recover(handle, &failure) {
            return Err(DeviceError::RecoveryFailed {
                context: not_ready_context(handle, &outcome),
                reason: e.to_string(),
                failure,
            });
        }

        previous_kind = Some(failure.kind);
    }

    // Attempts exhausted: one last look
    final_check(handle)
}

fn reprovision(handle: &mut DeviceHandle, terminal: DeviceError) -> Result<()> {
    let Some(reprovision) = handle.readiness_profile().reprovision() else {
        return Err(terminal);
    };

    warn!(device = %handle.name(), error = %terminal, "Re-provisioning device");
    if let Err(e) = reprovision(handle) {
        let (failure, context) = match terminal {
            DeviceError::CheckFailed { failure, context }
            | DeviceError::RecoveryFailed { failure, context, .. }
            | DeviceError::RepeatedFailure { failure, context } => (failure, context),
            other => return Err(other),
        };
        return Err(DeviceError::RecoveryFailed {
            failure,
            reason: format!("re-provision failed: {}", e),
            context,
        });
    }

    final_check(handle)
}

fn final_check(handle: &mut DeviceHandle) -> Result<()> {
    let outcome = check_ready(handle);
    match outcome.error.clone() {
        None => {
            info!(device = %handle.name(), "Device is ready");
            Ok(())
        }
        Some(failure) => Err(check_failed(handle, &outcome, failure)),
    }
}

fn check_failed(handle: &DeviceHandle, outcome: &ReadinessOutcome, failure: CheckFailure) -> DeviceError {
    DeviceError::CheckFailed {
        context: not_ready_context(handle, outcome),
        failure,
    }
}

fn not_ready_context(handle: &DeviceHandle, outcome: &ReadinessOutcome) -> NotReadyContext {
    NotReadyContext {
        device_name: handle.name().to_string(),
        checks_passed: outcome.passed_checks.clone(),
        properties: handle.identity().persistent_identifiers(),
    }
}
