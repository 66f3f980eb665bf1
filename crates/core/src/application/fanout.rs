// Fan-out execution engine
// Runs an ordered batch of calls on an isolated worker pool under one deadline
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{RESULT_NOT_RECEIVED_KIND, WORKER_CRASHED_KIND};
use crate::domain::{CallError, CallFailure, CallResult, CallSpec, DeviceRequest};
use crate::error::{FleetError, Result};
use crate::port::{PendingCall, PoolError, TimeProvider, WorkerPoolFactory};

/// Kind recorded for a call the pool refused to accept
const POOL_ERROR_KIND: &str = "PoolError";

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Upper bound on workers per batch; host parallelism when unset
    pub max_workers: Option<usize>,
    /// Kill workers still busy after the batch instead of detaching them
    pub kill_stragglers: bool,
}

impl EngineConfig {
    pub fn effective_max_workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Ordered results and their paired errors.
///
/// `errors[i]` is `Some` exactly when `results[i]` is NO_RESULT.
pub type BatchOutcome = (Vec<CallResult>, Vec<Option<CallError>>);

pub struct FanOutEngine {
    factory: Arc<dyn WorkerPoolFactory>,
    time_provider: Arc<dyn TimeProvider>,
    config: EngineConfig,
}

impl FanOutEngine {
    pub fn new(
        factory: Arc<dyn WorkerPoolFactory>,
        time_provider: Arc<dyn TimeProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            factory,
            time_provider,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every spec on a fresh pool and collect outcomes in submission order.
    ///
    /// Each wait is bounded by the time left until `deadline` (measured from
    /// this call), recomputed when that result is awaited. A call still
    /// running at the deadline yields `ResultNotReceivedError`; the worker is
    /// not interrupted.
    ///
    /// With `isolate_errors == false`, any failure turns the whole batch into
    /// one `ParallelExecution` error listing every failed call.
    pub async fn execute_concurrently(
        &self,
        specs: Vec<CallSpec>,
        deadline: Duration,
        isolate_errors: bool,
    ) -> Result<BatchOutcome> {
        if specs.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        // Durations past i64 milliseconds mean "no deadline"
        let budget_ms = i64::try_from(deadline.as_millis()).unwrap_or(i64::MAX);
        let deadline_ms = self.time_provider.now_millis().saturating_add(budget_ms);
        let pool_size = self.config.effective_max_workers().min(specs.len());
        let total = specs.len();
        info!(calls = total, workers = pool_size, deadline = ?deadline, "Executing calls concurrently");

        let pool = self.factory.create(pool_size).await?;

        let mut pending: Vec<std::result::Result<PendingCall, PoolError>> = Vec::with_capacity(total);
        for spec in specs {
            pending.push(pool.submit(spec).await);
        }

        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::with_capacity(total);
        for (index, call) in pending.into_iter().enumerate() {
            let outcome = match call {
                Ok(rx) => self.await_result(rx, deadline_ms, deadline).await,
                Err(e) => Err(CallFailure::new(POOL_ERROR_KIND, e.to_string())),
            };
            match outcome {
                Ok(value) => {
                    results.push(CallResult::value(index, value));
                    errors.push(None);
                }
                Err(failure) => {
                    warn!(index, kind = %failure.kind, message = %failure.message, "Call failed");
                    results.push(CallResult::no_result(index));
                    errors.push(Some(CallError::from_failure(index, failure)));
                }
            }
        }

        pool.shutdown(self.config.kill_stragglers).await;

        let failed = errors.iter().filter(|e| e.is_some()).count();
        debug!(calls = total, failed, "Batch collected");

        if !isolate_errors && failed > 0 {
            return Err(FleetError::ParallelExecution(
                errors.into_iter().flatten().collect(),
            ));
        }
        Ok((results, errors))
    }

    async fn await_result(
        &self,
        rx: PendingCall,
        deadline_ms: i64,
        deadline: Duration,
    ) -> std::result::Result<Value, CallFailure> {
        let remaining = self.time_provider.remaining_until(deadline_ms);
        match timeout(remaining, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallFailure::new(
                WORKER_CRASHED_KIND,
                "worker went away without reporting a result",
            )),
            Err(_) => Err(CallFailure::new(
                RESULT_NOT_RECEIVED_KIND,
                format!("no result within the {:?} deadline", deadline),
            )),
        }
    }

    /// Run a device-level function once per device.
    ///
    /// Each call gets the device request as its first positional argument plus
    /// the keyword arguments registered for that device's type.
    pub async fn issue_devices_parallel(
        &self,
        function: &str,
        devices: &[DeviceRequest],
        per_type_kwargs: &HashMap<String, Map<String, Value>>,
        deadline: Duration,
    ) -> Result<BatchOutcome> {
        let specs = device_call_specs(function, devices, per_type_kwargs)?;
        self.execute_concurrently(specs, deadline, true).await
    }
}

/// One CallSpec per device, in device order
pub fn device_call_specs(
    function: &str,
    devices: &[DeviceRequest],
    per_type_kwargs: &HashMap<String, Map<String, Value>>,
) -> Result<Vec<CallSpec>> {
    devices
        .iter()
        .map(|device| -> Result<CallSpec> {
            let mut spec = CallSpec::new(function).arg(serde_json::to_value(device)?);
            if let Some(kwargs) = per_type_kwargs.get(&device.identity.device_type) {
                spec.kwargs = kwargs.clone();
            }
            Ok(spec)
        })
        .collect()
}
