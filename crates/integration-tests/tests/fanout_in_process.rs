//! Fan-out scenarios with fleet functions resolved through a real registry
//!
//! Uses the in-process pool so every call still gets its own manager, without
//! spawning processes.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use devfleet_core::application::{
    CallArgs, EngineConfig, ExtensionPackage, FanOutEngine, FleetManager, FleetRegistry,
    PackageCatalog, RegistryBuilder,
};
use devfleet_core::domain::error::Result as DeviceResult;
use devfleet_core::domain::{
    CallFailure, CallSpec, CommunicationArgs, DeviceConfig, DeviceIdentity, DeviceRequest,
    NullCommunication, ReadinessMode, ReadinessProfile,
};
use devfleet_core::port::worker_pool::mocks::InProcessPoolFactory;
use devfleet_core::port::{DeviceParts, SystemTimeProvider};
use devfleet_core::FleetError;

fn quiet_device(
    _identity: &DeviceIdentity,
    _config: &DeviceConfig,
    _comm_args: &CommunicationArgs,
) -> DeviceResult<DeviceParts> {
    let readiness = ReadinessProfile::new()
        .with_check("check_open", |device| {
            if device.is_communication_open() {
                Ok(())
            } else {
                Err(devfleet_core::domain::CheckFailure::new("ClosedError", "closed"))
            }
        })
        .with_recovery("ClosedError", |device, _| device.open_communication());
    Ok(DeviceParts::new(Box::new(NullCommunication::default()), readiness))
}

struct FleetPackage;

impl ExtensionPackage for FleetPackage {
    fn name(&self) -> &str {
        "fleet"
    }

    fn register(&self, builder: &mut RegistryBuilder) -> DeviceResult<()> {
        builder.register_device_type("phone", &[], quiet_device)?;
        builder.register_device_type("tablet", &[], quiet_device)?;
        builder
            .register_function("f", |_, args| {
                Ok(args.get(0, "some_arg").cloned().unwrap_or(Value::Null))
            })?
            .register_function("g", |_, _| Ok(Value::Null))?
            .register_function("boom", |_, _| Err(CallFailure::runtime("boom")))?
            .register_function("nap_then", |_, args| {
                let ms = args.require(0, "ms")?.as_u64().unwrap_or_default();
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            })?
            .register_function("open_device", open_device)?;
        Ok(())
    }
}

/// Device-level: make the device ready and report the per-type greeting
fn open_device(manager: &mut FleetManager, args: CallArgs<'_>) -> Result<Value, CallFailure> {
    let request: DeviceRequest = serde_json::from_value(args.require(0, "device")?.clone())
        .map_err(|e| CallFailure::new("TypeError", e.to_string()))?;
    let greeting = args.kwarg("greeting").cloned().unwrap_or(Value::Null);
    let device = manager.create_ready_device(request, ReadinessMode::On)?;
    Ok(json!({"device": device.name(), "greeting": greeting}))
}

fn registry() -> Arc<FleetRegistry> {
    PackageCatalog::new()
        .with(FleetPackage)
        .build_registry(&["fleet"])
        .unwrap()
}

fn engine(max_workers: usize) -> (FanOutEngine, InProcessPoolFactory) {
    let factory = InProcessPoolFactory::new(registry().executor());
    let engine = FanOutEngine::new(
        Arc::new(factory.clone()),
        Arc::new(SystemTimeProvider),
        EngineConfig {
            max_workers: Some(max_workers),
            kill_stragglers: false,
        },
    );
    (engine, factory)
}

#[tokio::test]
async fn test_reference_scenario() {
    let (engine, factory) = engine(8);
    let specs = vec![
        CallSpec::new("f").arg(5),
        CallSpec::new("f").kwarg("some_arg", 10),
        CallSpec::new("g"),
    ];

    let (results, errors) = engine
        .execute_concurrently(specs, Duration::from_secs(30), true)
        .await
        .unwrap();

    let values: Vec<_> = results.iter().map(|r| r.value.clone()).collect();
    assert_eq!(values, vec![Some(json!(5)), Some(json!(10)), Some(Value::Null)]);
    assert_eq!(errors, vec![None, None, None]);
    assert_eq!(factory.created_sizes(), vec![3]);
}

#[tokio::test]
async fn test_order_holds_under_reverse_completion() {
    let (engine, _) = engine(4);
    let specs = vec![
        CallSpec::new("nap_then").arg(300),
        CallSpec::new("nap_then").arg(200),
        CallSpec::new("nap_then").arg(100),
        CallSpec::new("nap_then").arg(0),
    ];

    let (results, _) = engine
        .execute_concurrently(specs, Duration::from_secs(30), true)
        .await
        .unwrap();

    let values: Vec<_> = results.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(values, vec![json!(300), json!(200), json!(100), json!(0)]);
}

#[tokio::test]
async fn test_failures_and_unknown_functions_are_isolated() {
    let (engine, _) = engine(4);
    let specs = vec![
        CallSpec::new("boom"),
        CallSpec::new("f").arg("ok"),
        CallSpec::new("missing"),
    ];

    let (results, errors) = engine
        .execute_concurrently(specs, Duration::from_secs(30), true)
        .await
        .unwrap();

    assert!(results[0].is_no_result());
    assert_eq!(errors[0].as_ref().unwrap().kind, "RuntimeError");
    assert_eq!(errors[0].as_ref().unwrap().message, "boom");
    assert_eq!(results[1].value, Some(json!("ok")));
    assert_eq!(errors[2].as_ref().unwrap().kind, "UnknownFunctionError");
}

#[tokio::test]
async fn test_aggregate_error_without_isolation() {
    let (engine, _) = engine(2);
    let err = engine
        .execute_concurrently(
            vec![CallSpec::new("boom"), CallSpec::new("g")],
            Duration::from_secs(30),
            false,
        )
        .await
        .unwrap_err();

    match err {
        FleetError::ParallelExecution(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].index, 0);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_issue_devices_parallel_with_per_type_kwargs() {
    let (engine, _) = engine(4);
    let devices = vec![
        DeviceRequest::new(DeviceIdentity::new("pixel", "phone")),
        DeviceRequest::new(DeviceIdentity::new("tab", "tablet")),
        DeviceRequest::new(DeviceIdentity::new("ghost", "toaster")),
    ];
    let mut per_type: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut phone_kwargs = Map::new();
    phone_kwargs.insert("greeting".to_string(), json!("hi phone"));
    per_type.insert("phone".to_string(), phone_kwargs);

    let (results, errors) = engine
        .issue_devices_parallel("open_device", &devices, &per_type, Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(
        results[0].value,
        Some(json!({"device": "pixel", "greeting": "hi phone"}))
    );
    assert_eq!(
        results[1].value,
        Some(json!({"device": "tab", "greeting": null}))
    );
    assert_eq!(errors[2].as_ref().unwrap().kind, "DeviceCreationError");
}
