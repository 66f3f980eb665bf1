// Fleet constants (no magic values)
use std::time::Duration;

/// Default bound on readiness attempts before the final health-check run
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default overall deadline for one fan-out batch (10 minutes)
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

/// How long a SYNC round-trip through the log consumer may take
pub const LOG_SYNC_TIMEOUT: Duration = Duration::from_millis(250);

/// How long TERMINATE may wait for the log consumer to confirm
pub const LOG_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between SIGTERM and SIGKILL for straggling workers (5 seconds)
pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// How long an idle worker gets to exit after a shutdown request
pub const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Logger name used by records produced inside the fleet layer itself
pub const FLEET_LOGGER_NAME: &str = "devfleet";

/// CallError kind when the deadline elapses before a result arrives
pub const RESULT_NOT_RECEIVED_KIND: &str = "ResultNotReceivedError";

/// CallError kind when a worker dies while running a call
pub const WORKER_CRASHED_KIND: &str = "WorkerCrashed";

/// CallError kind for a function that panicked inside a worker
pub const PANIC_KIND: &str = "Panic";

/// CallError kind for a function name no package registered
pub const UNKNOWN_FUNCTION_KIND: &str = "UnknownFunctionError";
