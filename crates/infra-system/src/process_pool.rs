// OS-process worker pool
// One child process per worker; calls travel as JSON lines over stdin/stdout
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use devfleet_core::constants::{GRACEFUL_SHUTDOWN_TIMEOUT_MS, WORKER_CRASHED_KIND, WORKER_EXIT_TIMEOUT};
use devfleet_core::domain::{CallFailure, CallOutcome, CallSpec, LogLevel, LogRecord};
use devfleet_core::port::{PendingCall, PoolError, RecordSink, WorkerPool, WorkerPoolFactory};

use crate::protocol::{decode_response, encode, WorkerInit, WorkerRequest, WorkerResponse};

/// Logger name for worker stdout lines that are not protocol frames
pub const WORKER_OUTPUT_LOGGER: &str = "devfleet.worker";

/// How a worker process is launched and initialized
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub init: WorkerInit,
    /// Only these variables of the controller's environment reach workers
    pub env_allowlist: Vec<String>,
    pub init_timeout: Duration,
    /// How long an idle worker may take to exit after `shutdown`
    pub exit_timeout: Duration,
    /// SIGTERM to SIGKILL grace period for stragglers
    pub kill_grace: Duration,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("devfleet")),
            args: vec!["worker".to_string()],
            init: WorkerInit {
                packages: vec!["builtin".to_string()],
                log_filter: None,
            },
            env_allowlist: ["PATH", "HOME", "USER", "LANG", "RUST_BACKTRACE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            init_timeout: Duration::from_secs(10),
            exit_timeout: WORKER_EXIT_TIMEOUT,
            kill_grace: Duration::from_millis(GRACEFUL_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

impl ProcessPoolConfig {
    /// Filter environment variables to the allowlist only
    fn filter_env(&self, env: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
        env.filter(|(k, _)| self.env_allowlist.contains(k)).collect()
    }
}

/// Creates a [`ProcessWorkerPool`] per batch.
///
/// Log frames from every worker are relayed into `log_sink`, normally the
/// aggregator's sender.
pub struct ProcessPoolFactory {
    config: Arc<ProcessPoolConfig>,
    log_sink: Arc<dyn RecordSink>,
}

impl ProcessPoolFactory {
    pub fn new(config: ProcessPoolConfig, log_sink: Arc<dyn RecordSink>) -> Self {
        Self {
            config: Arc::new(config),
            log_sink,
        }
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.config
    }
}

#[async_trait]
impl WorkerPoolFactory for ProcessPoolFactory {
    async fn create(&self, size: usize) -> Result<Box<dyn WorkerPool>, PoolError> {
        let pool = ProcessWorkerPool::start(size, Arc::clone(&self.config), Arc::clone(&self.log_sink)).await?;
        Ok(Box::new(pool))
    }
}

struct Job {
    spec: CallSpec,
    reply: oneshot::Sender<CallOutcome>,
}

#[derive(Default)]
struct SlotState {
    busy: AtomicBool,
    pid: AtomicU32,
}

struct WorkerSlot {
    state: Arc<SlotState>,
    task: JoinHandle<()>,
}

/// Fixed-size pool of worker processes sharing one job queue
pub struct ProcessWorkerPool {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    slots: Mutex<Vec<WorkerSlot>>,
    config: Arc<ProcessPoolConfig>,
    size: usize,
}

impl ProcessWorkerPool {
    /// Spawn and initialize every worker before accepting calls
    pub async fn start(
        size: usize,
        config: Arc<ProcessPoolConfig>,
        log_sink: Arc<dyn RecordSink>,
    ) -> Result<Self, PoolError> {
        let size = size.max(1);
        let processes = futures::future::try_join_all(
            (0..size).map(|_| WorkerProcess::spawn(&config, &log_sink)),
        )
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(AsyncMutex::new(rx));
        let slots = processes
            .into_iter()
            .map(|process| {
                let state = Arc::new(SlotState::default());
                state.pid.store(process.pid, Ordering::SeqCst);
                let task = tokio::spawn(run_worker(
                    process,
                    Arc::clone(&queue),
                    Arc::clone(&state),
                    Arc::clone(&config),
                    Arc::clone(&log_sink),
                ));
                WorkerSlot { state, task }
            })
            .collect();

        info!(workers = size, program = %config.program.display(), "Worker pool started");
        Ok(Self {
            jobs: Mutex::new(Some(tx)),
            slots: Mutex::new(slots),
            config,
            size,
        })
    }
}

impl ProcessWorkerPool {
    fn close_queue(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
    }

    fn take_slots(&self) -> Vec<WorkerSlot> {
        self.slots
            .lock()
            .map(|mut slots| std::mem::take(&mut *slots))
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkerPool for ProcessWorkerPool {
    async fn submit(&self, spec: CallSpec) -> Result<PendingCall, PoolError> {
        let (reply, rx) = oneshot::channel();
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| PoolError::Io("job queue lock poisoned".to_string()))?;
        let sender = jobs.as_ref().ok_or(PoolError::ShutDown)?;
        sender
            .send(Job { spec, reply })
            .map_err(|_| PoolError::ShutDown)?;
        Ok(rx)
    }

    async fn shutdown(&self, kill_stragglers: bool) {
        // Closing the queue lets idle workers see the end of work
        self.close_queue();
        let slots = self.take_slots();

        let mut waiting = Vec::new();
        for slot in slots {
            let pid = slot.state.pid.load(Ordering::SeqCst);
            if slot.state.busy.load(Ordering::SeqCst) {
                if !kill_stragglers {
                    warn!(pid = pid, "Detaching busy worker");
                    continue;
                }
                if let Err(e) = kill_graceful(pid, self.config.kill_grace).await {
                    warn!(pid = pid, error = %e, "Failed to stop straggling worker");
                }
            }
            waiting.push(slot.task);
        }

        let count = waiting.len();
        if timeout(self.config.exit_timeout, futures::future::join_all(waiting))
            .await
            .is_err()
        {
            warn!(workers = count, "Workers did not exit within {:?}", self.config.exit_timeout);
        }
        debug!(workers = count, "Worker pool shut down");
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Serve jobs from the shared queue until it closes, replacing the process
/// whenever it dies mid-call.
async fn run_worker(
    process: WorkerProcess,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,
    state: Arc<SlotState>,
    config: Arc<ProcessPoolConfig>,
    sink: Arc<dyn RecordSink>,
) {
    let mut process = Some(process);
    loop {
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };
        if job.reply.is_closed() {
            // Caller stopped waiting (deadline) before the call started
            continue;
        }

        let idle = match process.take() {
            Some(mut p) => {
                if p.has_exited() {
                    warn!(pid = p.pid, "Worker exited while idle, replacing it");
                    None
                } else {
                    Some(p)
                }
            }
            None => None,
        };
        let mut current = match idle {
            Some(p) => p,
            None => match WorkerProcess::spawn(&config, &sink).await {
                Ok(p) => {
                    state.pid.store(p.pid, Ordering::SeqCst);
                    p
                }
                Err(e) => {
                    let _ = job.reply.send(Err(CallFailure::new(
                        WORKER_CRASHED_KIND,
                        format!("replacement worker failed to start: {}", e),
                    )));
                    continue;
                }
            },
        };

        state.busy.store(true, Ordering::SeqCst);
        let result = current.call(job.spec, &sink).await;
        state.busy.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                let _ = job.reply.send(outcome);
                process = Some(current);
            }
            Err(e) => {
                let status = current.reap().await;
                warn!(pid = current.pid, status = %status, error = %e, "Worker died during call");
                let _ = job.reply.send(Err(CallFailure::new(
                    WORKER_CRASHED_KIND,
                    format!("worker process {} exited during call: {}", current.pid, status),
                )));
            }
        }
    }

    if let Some(p) = process {
        p.shutdown(config.exit_timeout).await;
    }
}

/// A running worker child with its protocol pipes
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    pid: u32,
}

impl WorkerProcess {
    async fn spawn(config: &ProcessPoolConfig, sink: &Arc<dyn RecordSink>) -> Result<Self, PoolError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .env_clear()
            .envs(config.filter_env(std::env::vars()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::SpawnFailed(format!("{}: {}", config.program.display(), e)))?;

        let pid = child.id().unwrap_or_default();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::SpawnFailed("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::SpawnFailed("worker stdout not captured".to_string()))?;

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            pid,
        };
        process.send(&WorkerRequest::Init(config.init.clone())).await?;

        let ready = timeout(config.init_timeout, process.next_response(sink))
            .await
            .map_err(|_| {
                PoolError::InitFailed(format!("worker {} not ready within {:?}", pid, config.init_timeout))
            })??;
        match ready {
            Some(WorkerResponse::Ready { .. }) => {
                debug!(pid = pid, "Worker ready");
                Ok(process)
            }
            Some(WorkerResponse::InitFailed { message }) => Err(PoolError::InitFailed(message)),
            Some(other) => Err(PoolError::Protocol(format!(
                "expected ready from worker {}, got {:?}",
                pid, other
            ))),
            None => {
                let status = process.reap().await;
                Err(PoolError::InitFailed(format!(
                    "worker {} exited during initialization: {}",
                    pid, status
                )))
            }
        }
    }

    async fn send(&mut self, request: &WorkerRequest) -> Result<(), PoolError> {
        let line = encode(request)?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PoolError::Io(e.to_string()))?;
        self.stdin.flush().await.map_err(|e| PoolError::Io(e.to_string()))
    }

    /// Next non-log frame. Log frames and stray output go to `sink`.
    /// `None` means the worker closed stdout.
    async fn next_response(
        &mut self,
        sink: &Arc<dyn RecordSink>,
    ) -> Result<Option<WorkerResponse>, PoolError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| PoolError::Io(e.to_string()))?;
            let Some(line) = line else { return Ok(None) };
            if line.trim().is_empty() {
                continue;
            }
            match decode_response(&line) {
                Ok(WorkerResponse::Log { record }) => sink.enqueue(record),
                Ok(response) => return Ok(Some(response)),
                Err(_) => {
                    let mut record = LogRecord::new(LogLevel::Info, WORKER_OUTPUT_LOGGER, line);
                    record.process_id = self.pid;
                    sink.enqueue(record);
                }
            }
        }
    }

    async fn call(&mut self, spec: CallSpec, sink: &Arc<dyn RecordSink>) -> Result<CallOutcome, PoolError> {
        self.send(&WorkerRequest::Call { spec }).await?;
        match self.next_response(sink).await? {
            Some(WorkerResponse::Done { outcome }) => Ok(outcome),
            Some(other) => Err(PoolError::Protocol(format!("unexpected frame {:?}", other))),
            None => Err(PoolError::Protocol("worker closed its output".to_string())),
        }
    }

    /// Has the child already exited? Reaps it if so.
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for a child whose pipes are gone; describe how it ended
    async fn reap(&mut self) -> String {
        match timeout(WORKER_EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {}", e),
            Err(_) => {
                let _ = self.child.start_kill();
                "unresponsive, killed".to_string()
            }
        }
    }

    async fn shutdown(mut self, exit_timeout: Duration) {
        if let Err(e) = self.send(&WorkerRequest::Shutdown).await {
            debug!(pid = self.pid, error = %e, "Worker already gone");
        }
        match timeout(exit_timeout, self.child.wait()).await {
            Ok(_) => debug!(pid = self.pid, "Worker exited"),
            Err(_) => {
                warn!(pid = self.pid, "Worker ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Kill process with SIGTERM first, then SIGKILL after `grace`
pub async fn kill_graceful(pid: u32, grace: Duration) -> Result<(), PoolError> {
    if pid == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let target = Pid::from_raw(pid as i32);
        info!(pid = pid, "Sending SIGTERM to straggling worker");
        kill(target, Signal::SIGTERM)
            .map_err(|e| PoolError::Io(format!("SIGTERM failed: {}", e)))?;

        // Check every 100ms
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;

            if kill(target, None).is_err() {
                info!(pid = pid, "Worker exited after SIGTERM");
                return Ok(());
            }

            if started.elapsed() > grace {
                warn!(pid = pid, "Worker did not exit after SIGTERM, sending SIGKILL");
                kill(target, Signal::SIGKILL)
                    .map_err(|e| PoolError::Io(format!("SIGKILL failed: {}", e)))?;
                return Ok(());
            }
        }
    }

    #[cfg(windows)]
    {
        let _ = grace;
        info!(pid = pid, "Killing worker on Windows");
        let output = tokio::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .await
            .map_err(|e| PoolError::Io(e.to_string()))?;
        if !output.status.success() {
            return Err(PoolError::Io(format!(
                "taskkill failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use devfleet_core::port::log_sink::mocks::CollectingSink;

    // Speaks just enough of the protocol to exercise the pool
    const FAKE_WORKER: &str = r#"
read init
case "$init" in *broken*) echo '{"type":"init_failed","message":"no such package"}'; exit 1;; esac
echo '{"type":"ready","pid":'$$'}'
while read line; do
  case "$line" in
    *shutdown*) exit 0;;
    *crash*) exit 3;;
    *linger*) exec sleep 30;;
    *) echo 'plain output'
       echo '{"type":"log","record":{"level":"WARN","logger_name":"fake","message":"working","process_id":7,"timestamp_ms":0}}'
       echo '{"type":"done","outcome":{"Ok":5}}';;
  esac
done
"#;

    fn config(packages: &[&str]) -> ProcessPoolConfig {
        ProcessPoolConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), FAKE_WORKER.to_string()],
            init: WorkerInit {
                packages: packages.iter().map(|s| s.to_string()).collect(),
                log_filter: None,
            },
            kill_grace: Duration::from_secs(2),
            ..ProcessPoolConfig::default()
        }
    }

    async fn pool(size: usize) -> (ProcessWorkerPool, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let pool = ProcessWorkerPool::start(size, Arc::new(config(&["builtin"])), sink.clone())
            .await
            .unwrap();
        (pool, sink)
    }

    #[tokio::test]
    async fn test_call_round_trip_relays_logs() {
        let (pool, sink) = pool(2).await;
        assert_eq!(pool.size(), 2);

        let rx = pool.submit(CallSpec::new("echo").arg(5)).await.unwrap();
        assert_eq!(rx.await.unwrap(), Ok(serde_json::json!(5)));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].logger_name, WORKER_OUTPUT_LOGGER);
        assert_eq!(records[0].message, "plain output");
        assert_eq!(records[1].message, "working");
        assert_eq!(records[1].process_id, 7);

        pool.shutdown(false).await;
        assert!(matches!(
            pool.submit(CallSpec::new("late")).await,
            Err(PoolError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced() {
        let (pool, _) = pool(1).await;

        let crashed = pool.submit(CallSpec::new("crash")).await.unwrap();
        let failure = crashed.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, WORKER_CRASHED_KIND);

        let next = pool.submit(CallSpec::new("echo")).await.unwrap();
        assert_eq!(next.await.unwrap(), Ok(serde_json::json!(5)));
        pool.shutdown(false).await;
    }

    #[tokio::test]
    async fn test_worker_dead_while_idle_is_replaced_before_the_call() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let (pool, _) = pool(1).await;
        let first_pid = pool.slots.lock().unwrap()[0].state.pid.load(Ordering::SeqCst);
        kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let rx = pool.submit(CallSpec::new("echo")).await.unwrap();
        assert_eq!(rx.await.unwrap(), Ok(serde_json::json!(5)));

        let second_pid = pool.slots.lock().unwrap()[0].state.pid.load(Ordering::SeqCst);
        assert_ne!(second_pid, first_pid);
        pool.shutdown(false).await;
    }

    #[tokio::test]
    async fn test_init_failure_is_reported() {
        let sink = Arc::new(CollectingSink::new());
        let result = ProcessWorkerPool::start(1, Arc::new(config(&["broken"])), sink).await;
        match result {
            Err(PoolError::InitFailed(message)) => assert_eq!(message, "no such package"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("pool should not start"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let sink = Arc::new(CollectingSink::new());
        let config = ProcessPoolConfig {
            program: PathBuf::from("/nonexistent/devfleet-worker"),
            ..config(&[])
        };
        let result = ProcessWorkerPool::start(1, Arc::new(config), sink).await;
        assert!(matches!(result, Err(PoolError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_shutdown_kills_stragglers() {
        let (pool, _) = pool(1).await;
        let lingering = pool.submit(CallSpec::new("linger")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        pool.shutdown(true).await;
        assert!(started.elapsed() < Duration::from_secs(10));

        let failure = lingering.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, WORKER_CRASHED_KIND);
    }

    #[test]
    fn test_env_filtering() {
        let config = ProcessPoolConfig {
            env_allowlist: vec!["ALLOWED_VAR".to_string()],
            ..ProcessPoolConfig::default()
        };
        let env = vec![
            ("ALLOWED_VAR".to_string(), "value1".to_string()),
            ("BLOCKED_VAR".to_string(), "value2".to_string()),
        ];

        let filtered = config.filter_env(env.into_iter());

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("ALLOWED_VAR"));
        assert!(!filtered.contains_key("BLOCKED_VAR"));
    }
}
