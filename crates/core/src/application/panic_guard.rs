// Panic isolation for fleet calls
use std::any::Any;
use std::panic::{catch_unwind, UnwindSafe};
use tracing::error;

use crate::constants::PANIC_KIND;
use crate::domain::{CallFailure, CallOutcome};

/// Extract the message carried by a panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Run a fleet call, turning a panic into a `Panic` failure.
///
/// Keeps a misbehaving function from unwinding through the worker loop.
pub fn execute_guarded<F>(f: F) -> CallOutcome
where
    F: FnOnce() -> CallOutcome + UnwindSafe,
{
    match catch_unwind(f) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let panic_msg = panic_message(payload);
            error!(panic_msg = %panic_msg, "Fleet call panicked");
            Err(CallFailure::new(PANIC_KIND, panic_msg))
        }
    }
}
