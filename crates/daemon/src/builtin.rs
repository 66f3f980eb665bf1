// Built-in extension package
// A simulated device type plus general-purpose fleet functions, always available to workers
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use devfleet_core::application::{CallArgs, ExtensionPackage, FleetManager, RegistryBuilder};
use devfleet_core::domain::error::Result as DeviceResult;
use devfleet_core::domain::{
    CallFailure, Capability, CapabilityDescriptor, CheckFailure, CommunicationArgs, DeviceConfig,
    DeviceIdentity, DeviceRequest, NullCommunication, ReadinessMode, ReadinessProfile,
};
use devfleet_core::port::{DeviceBuilder, DeviceParts};

pub const PACKAGE_NAME: &str = "builtin";
pub const SIM_DEVICE_TYPE: &str = "sim";
const SIM_LOGGER: &str = "devfleet.sim";

const NOT_CONNECTED_KIND: &str = "DeviceNotConnectedError";
const NOT_RESPONDING_KIND: &str = "DeviceNotRespondingError";

/// Command runner of a simulated device
#[derive(Debug)]
pub struct SimShell {
    device: String,
    history: Vec<String>,
}

impl SimShell {
    pub fn run(&mut self, command: &str) -> String {
        self.history.push(command.to_string());
        format!("{}$ {}", self.device, command)
    }
}

impl Capability for SimShell {
    fn shutdown(&mut self) {
        debug!(device = %self.device, commands = self.history.len(), "Shell closed");
    }
}

/// In-memory event log of a simulated device
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Vec<String>,
}

impl MemoryEventLog {
    pub fn record(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }
}

impl Capability for MemoryEventLog {}

/// Builds `sim` devices.
///
/// Config keys: `fail_checks` makes the responsiveness check fail that many
/// times, `max_attempts` bounds readiness recovery.
struct SimBuilder;

impl DeviceBuilder for SimBuilder {
    fn build(
        &self,
        identity: &DeviceIdentity,
        config: &DeviceConfig,
        _comm_args: &CommunicationArgs,
    ) -> DeviceResult<DeviceParts> {
        let remaining_failures = Arc::new(AtomicU64::new(config.get_u64("fail_checks").unwrap_or(0)));
        let failing = Arc::clone(&remaining_failures);
        let cleared = Arc::clone(&remaining_failures);

        let mut readiness = ReadinessProfile::new()
            .with_check("check_connected", |device| {
                if device.is_communication_open() {
                    Ok(())
                } else {
                    Err(CheckFailure::new(NOT_CONNECTED_KIND, "communication is closed"))
                }
            })
            .with_check("check_responsive", move |_| {
                let left = failing.load(Ordering::SeqCst);
                if left == 0 {
                    return Ok(());
                }
                failing.store(left - 1, Ordering::SeqCst);
                Err(CheckFailure::new(NOT_RESPONDING_KIND, "no reply to ping"))
            })
            .with_recovery(NOT_CONNECTED_KIND, |device, _| device.open_communication())
            .with_recovery(NOT_RESPONDING_KIND, |device, _| device.reopen_communication())
            .with_reprovision(move |device| {
                info!(device = %device.name(), "Re-provisioning simulated device");
                cleared.store(0, Ordering::SeqCst);
                device.reset_all_capabilities();
                device.reopen_communication()
            });
        if let Some(max_attempts) = config.get_u64("max_attempts") {
            readiness = readiness.with_max_attempts(max_attempts as u32);
        }

        debug!(device = %identity.name, "Simulated device assembled");
        Ok(DeviceParts::new(Box::new(NullCommunication::default()), readiness))
    }
}

/// The package every worker installs unless told otherwise
pub struct BuiltinPackage;

impl ExtensionPackage for BuiltinPackage {
    fn name(&self) -> &str {
        PACKAGE_NAME
    }

    fn register(&self, builder: &mut RegistryBuilder) -> DeviceResult<()> {
        builder
            .register_capability(CapabilityDescriptor::new("shell", "shell_base", "shell_sim", |ctx| {
                Ok(Box::new(SimShell {
                    device: ctx.identity.name.clone(),
                    history: Vec::new(),
                }))
            }))?
            .register_capability(CapabilityDescriptor::new(
                "event_log",
                "event_log_base",
                "event_log_memory",
                |_| Ok(Box::new(MemoryEventLog::default())),
            ))?;
        builder.register_device_type(SIM_DEVICE_TYPE, &["shell_sim", "event_log_memory"], SimBuilder)?;

        builder
            .register_function("echo", echo)?
            .register_function("noop", |_, _| Ok(Value::Null))?
            .register_function("fail", fail)?
            .register_function("sleep", sleep)?
            .register_function("panic", |_, args| {
                let message = args.get(0, "message").and_then(Value::as_str).unwrap_or("panic requested");
                panic!("{}", message)
            })?
            .register_function("abort", |_, _| std::process::abort())?
            .register_function("log", log)?
            .register_function("make_ready", make_ready)?
            .register_function("run_shell", run_shell)?;
        Ok(())
    }
}

type Outcome = std::result::Result<Value, CallFailure>;

/// First argument (or `some_arg`) back, or null
fn echo(_: &mut FleetManager, args: CallArgs<'_>) -> Outcome {
    Ok(args.get(0, "some_arg").cloned().unwrap_or(Value::Null))
}

fn fail(_: &mut FleetManager, args: CallArgs<'_>) -> Outcome {
    let message = args.get(0, "message").and_then(Value::as_str).unwrap_or("boom");
    Err(CallFailure::runtime(message))
}

fn sleep(_: &mut FleetManager, args: CallArgs<'_>) -> Outcome {
    let seconds = args
        .require(0, "seconds")?
        .as_f64()
        .ok_or_else(|| CallFailure::new("TypeError", "seconds must be a number"))?;
    std::thread::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0)));
    Ok(json!(seconds))
}

/// Emit one record through the regular logging path
fn log(_: &mut FleetManager, args: CallArgs<'_>) -> Outcome {
    let message = args.require(0, "message")?.as_str().unwrap_or_default();
    let level = args.get(1, "level").and_then(Value::as_str).unwrap_or("info");
    match level.to_ascii_lowercase().as_str() {
        "debug" => debug!(target: SIM_LOGGER, "{}", message),
        "warn" | "warning" => warn!(target: SIM_LOGGER, "{}", message),
        "error" => error!(target: SIM_LOGGER, "{}", message),
        _ => info!(target: SIM_LOGGER, "{}", message),
    }
    Ok(Value::Null)
}

fn device_request(args: &CallArgs<'_>) -> std::result::Result<DeviceRequest, CallFailure> {
    let raw = args.require(0, "device")?;
    serde_json::from_value(raw.clone())
        .map_err(|e| CallFailure::new("TypeError", format!("invalid device request: {}", e)))
}

fn readiness_mode(args: &CallArgs<'_>) -> std::result::Result<ReadinessMode, CallFailure> {
    match args.kwarg("mode").and_then(Value::as_str) {
        Some(mode) => mode.parse().map_err(|e: String| CallFailure::new("ValueError", e)),
        None => Ok(ReadinessMode::default()),
    }
}

/// Device-level: create the device and bring it to a known-good state
fn make_ready(manager: &mut FleetManager, args: CallArgs<'_>) -> Outcome {
    let request = device_request(&args)?;
    let mode = readiness_mode(&args)?;
    let device = manager.create_ready_device(request, mode)?;
    Ok(json!({
        "device": device.name(),
        "device_type": device.device_type(),
        "mode": mode.to_string(),
        "communication_open": device.is_communication_open(),
        "capabilities": device.supported_capabilities(),
    }))
}

/// Device-level: run `command` on the device's shell capability
fn run_shell(manager: &mut FleetManager, args: CallArgs<'_>) -> Outcome {
    let request = device_request(&args)?;
    let command = args
        .kwarg("command")
        .and_then(Value::as_str)
        .ok_or_else(|| CallFailure::new("TypeError", "missing required argument 'command'"))?;
    let mode = readiness_mode(&args)?;

    let device = manager.create_ready_device(request, mode)?;
    let output = device.capability_as::<SimShell>("shell")?.run(command);
    let events = device.capability_as::<MemoryEventLog>("event_log")?;
    events.record(format!("ran {}", command));
    Ok(json!({"output": output, "events": events.events()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devfleet_core::application::PackageCatalog;
    use devfleet_core::domain::CallSpec;

    fn registry() -> Arc<devfleet_core::application::FleetRegistry> {
        PackageCatalog::new()
            .with(BuiltinPackage)
            .build_registry(&[PACKAGE_NAME])
            .unwrap()
    }

    fn sim(name: &str) -> Value {
        serde_json::to_value(DeviceRequest::new(DeviceIdentity::new(name, SIM_DEVICE_TYPE))).unwrap()
    }

    #[test]
    fn test_sim_supports_its_capabilities() {
        let registry = registry();
        assert!(registry.supports(SIM_DEVICE_TYPE, &["shell", "event_log"]).unwrap());
        assert!(!registry.supports(SIM_DEVICE_TYPE, &["file_transfer"]).unwrap());
    }

    #[test]
    fn test_echo_and_noop() {
        let registry = registry();
        assert_eq!(registry.invoke(&CallSpec::new("echo").arg(5)), Ok(json!(5)));
        assert_eq!(registry.invoke(&CallSpec::new("echo").kwarg("some_arg", 10)), Ok(json!(10)));
        assert_eq!(registry.invoke(&CallSpec::new("noop")), Ok(Value::Null));
    }

    #[test]
    fn test_fail_reports_runtime_error() {
        let failure = registry().invoke(&CallSpec::new("fail").arg("boom")).unwrap_err();
        assert_eq!(failure.kind, "RuntimeError");
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn test_make_ready_recovers_closed_communication() {
        let registry = registry();
        let ready = registry
            .invoke(&CallSpec::new("make_ready").arg(sim("sim-1")))
            .unwrap();
        assert_eq!(ready["device"], "sim-1");
        assert_eq!(ready["communication_open"], true);
    }

    #[test]
    fn test_make_ready_gives_up_on_repeated_failure() {
        let request = DeviceRequest::new(DeviceIdentity::new("sim-2", SIM_DEVICE_TYPE))
            .with_config(DeviceConfig::new().with("fail_checks", 5));
        let spec = CallSpec::new("make_ready").arg(serde_json::to_value(request).unwrap());

        let failure = registry().invoke(&spec).unwrap_err();
        assert_eq!(failure.kind, "RepeatedFailureError");
    }

    #[test]
    fn test_reprovision_clears_persistent_failures() {
        let request = DeviceRequest::new(DeviceIdentity::new("sim-3", SIM_DEVICE_TYPE))
            .with_config(DeviceConfig::new().with("fail_checks", 5));
        let spec = CallSpec::new("make_ready")
            .arg(serde_json::to_value(request).unwrap())
            .kwarg("mode", "on_with_reprovision");

        let ready = registry().invoke(&spec).unwrap();
        assert_eq!(ready["mode"], "on_with_reprovision");
    }

    #[test]
    fn test_run_shell_uses_cached_capabilities() {
        let spec = CallSpec::new("run_shell")
            .arg(sim("sim-4"))
            .kwarg("command", "uptime");
        let result = registry().invoke(&spec).unwrap();
        assert_eq!(result["output"], "sim-4$ uptime");
        assert_eq!(result["events"], json!(["ran uptime"]));
    }

    #[test]
    fn test_panic_is_reported() {
        let failure = registry()
            .invoke(&CallSpec::new("panic").arg("on purpose"))
            .unwrap_err();
        assert_eq!(failure.kind, "Panic");
        assert_eq!(failure.message, "on purpose");
    }
}
