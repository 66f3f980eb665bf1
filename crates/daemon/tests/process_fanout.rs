// Process-boundary scenarios against the real devfleet binary
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Duration;

use devfleet_core::application::{AggregatorConfig, EngineConfig, FanOutEngine, LogAggregator};
use devfleet_core::domain::{CallSpec, LogLevel};
use devfleet_core::port::log_sink::mocks::MemoryDestination;
use devfleet_core::port::SystemTimeProvider;
use devfleet_infra_system::{ProcessPoolConfig, ProcessPoolFactory, WorkerInit};

const DEVFLEET: &str = env!("CARGO_BIN_EXE_devfleet");

fn write_batch(name: &str, batch: Value) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("devfleet-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.json", name));
    std::fs::write(&path, batch.to_string()).unwrap();
    path
}

fn run(name: &str, batch: Value, extra: &[&str], env: &[(&str, &str)]) -> Output {
    let path = write_batch(name, batch);
    Command::new(DEVFLEET)
        .arg("run")
        .arg(&path)
        .args(extra)
        .env("DEVFLEET_LOG_FILE", "off")
        .envs(env.iter().copied())
        .output()
        .unwrap()
}

fn report(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "devfleet failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn engine(aggregator: &LogAggregator, max_workers: usize) -> FanOutEngine {
    let pool_config = ProcessPoolConfig {
        program: PathBuf::from(DEVFLEET),
        init: WorkerInit {
            packages: vec!["builtin".to_string()],
            log_filter: Some("devfleet=info".to_string()),
        },
        ..ProcessPoolConfig::default()
    };
    FanOutEngine::new(
        Arc::new(ProcessPoolFactory::new(pool_config, aggregator.sink())),
        Arc::new(SystemTimeProvider),
        EngineConfig {
            max_workers: Some(max_workers),
            kill_stragglers: true,
        },
    )
}

#[test]
fn test_ordered_results_across_processes() {
    let output = run(
        "ordered",
        json!([
            {"function": "echo", "args": [5]},
            {"function": "echo", "kwargs": {"some_arg": 10}},
            {"function": "noop"}
        ]),
        &[],
        &[("DEVFLEET_MAX_WORKERS", "2")],
    );

    let report = report(&output);
    assert_eq!(report["results"], json!([5, 10, null]));
    assert_eq!(report["errors"], json!([null, null, null]));
}

#[test]
fn test_aborting_worker_does_not_take_down_siblings() {
    let output = run(
        "abort",
        json!([
            {"function": "abort"},
            {"function": "echo", "args": [1]},
            {"function": "fail", "args": ["boom"]}
        ]),
        &[],
        &[("DEVFLEET_MAX_WORKERS", "3")],
    );

    let report = report(&output);
    assert_eq!(report["results"][0], Value::Null);
    assert_eq!(report["errors"][0]["kind"], "WorkerCrashed");
    assert_eq!(report["results"][1], 1);
    assert_eq!(report["errors"][2]["kind"], "RuntimeError");
    assert_eq!(report["errors"][2]["message"], "boom");
}

#[test]
fn test_fail_fast_exits_with_aggregate_error() {
    let output = run(
        "fail_fast",
        json!([{"function": "fail", "args": ["boom"]}, {"function": "noop"}]),
        &["--fail-fast"],
        &[],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[0] RuntimeError: boom"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_package_is_rejected_before_spawning() {
    let output = run(
        "unknown_package",
        json!([{"function": "noop"}]),
        &[],
        &[("DEVFLEET_PACKAGES", "builtin,nonexistent")],
    );

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nonexistent"));
}

#[tokio::test]
async fn test_worker_logs_reach_controller_destinations() {
    let aggregator = LogAggregator::start(AggregatorConfig::default()).unwrap();
    let memory = MemoryDestination::new(LogLevel::Info);
    aggregator
        .add_destination("memory", Arc::new(memory.clone()))
        .unwrap();

    let (results, errors) = engine(&aggregator, 1)
        .execute_concurrently(
            vec![CallSpec::new("log").arg("hello from a worker")],
            Duration::from_secs(30),
            true,
        )
        .await
        .unwrap();
    assert_eq!(errors, vec![None]);
    assert_eq!(results[0].value, Some(Value::Null));

    tokio_test::assert_ok!(aggregator.sync().await);
    let records = memory.records();
    let record = records
        .iter()
        .find(|r| r.message == "hello from a worker")
        .expect("worker record relayed");
    assert_eq!(record.logger_name, "devfleet.sim");
    assert_ne!(record.process_id, std::process::id());

    tokio_test::assert_ok!(aggregator.terminate().await);
}

#[tokio::test]
async fn test_deadline_yields_result_not_received() {
    let aggregator = LogAggregator::start(AggregatorConfig::default()).unwrap();
    let started = std::time::Instant::now();

    let (results, errors) = engine(&aggregator, 2)
        .execute_concurrently(
            vec![
                CallSpec::new("sleep").arg(20),
                CallSpec::new("echo").arg("fast"),
            ],
            Duration::from_secs(2),
            true,
        )
        .await
        .unwrap();

    assert!(results[0].is_no_result());
    assert_eq!(errors[0].as_ref().unwrap().kind, "ResultNotReceivedError");
    assert_eq!(results[1].value, Some(json!("fast")));
    // Straggler is killed, not waited for
    assert!(started.elapsed() < Duration::from_secs(15));

    tokio_test::assert_ok!(aggregator.terminate().await);
}
