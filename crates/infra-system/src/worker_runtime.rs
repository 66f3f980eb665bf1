// Worker Runtime
// The process side of the worker protocol: rebuild the registry, then run calls until told to stop
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use devfleet_core::application::panic_guard::panic_message;
use devfleet_core::application::{FleetRegistry, PackageCatalog};
use devfleet_core::constants::PANIC_KIND;
use devfleet_core::domain::{CallFailure, CallOutcome, CallSpec, LogRecord};
use devfleet_core::port::{PoolError, RecordSink};

use crate::protocol::{decode_request, encode, WorkerInit, WorkerRequest, WorkerResponse};

/// Serialized writer for response frames.
///
/// Also the worker's log sink: records become `log` frames interleaved with
/// call results on the same pipe.
#[derive(Clone)]
pub struct FrameWriter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl FrameWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn send(&self, response: &WorkerResponse) -> Result<(), PoolError> {
        let line = encode(response)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| PoolError::Io("frame writer lock poisoned".to_string()))?;
        out.write_all(line.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| PoolError::Io(e.to_string()))
    }
}

impl RecordSink for FrameWriter {
    fn enqueue(&self, record: LogRecord) {
        // A closed pipe means the controller is gone; nothing left to tell
        let _ = self.send(&WorkerResponse::Log { record });
    }
}

/// Run the worker on stdin/stdout with the logging bridge installed
pub async fn serve(catalog: &PackageCatalog) -> Result<(), PoolError> {
    let stdin = BufReader::new(tokio::io::stdin());
    serve_on(catalog, stdin, FrameWriter::stdout(), true).await
}

/// Run the worker protocol over any line reader.
///
/// Returns when the controller sends `shutdown` or closes the input.
pub async fn serve_on<R>(
    catalog: &PackageCatalog,
    reader: R,
    frames: FrameWriter,
    install_logging: bool,
) -> Result<(), PoolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let init = match read_request(&mut lines).await? {
        Some(WorkerRequest::Init(init)) => init,
        Some(other) => {
            return Err(PoolError::Protocol(format!(
                "expected init as first request, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    };

    let registry = initialize(catalog, &init, &frames, install_logging)?;
    frames.send(&WorkerResponse::Ready {
        pid: std::process::id(),
    })?;
    info!(pid = std::process::id(), packages = ?init.packages, "Worker ready");

    while let Some(request) = read_request(&mut lines).await? {
        match request {
            WorkerRequest::Call { spec } => {
                let outcome = run_call(&registry, spec).await;
                frames.send(&WorkerResponse::Done { outcome })?;
            }
            WorkerRequest::Shutdown => {
                debug!("Worker shutting down");
                break;
            }
            WorkerRequest::Init(_) => warn!("Ignoring repeated init request"),
        }
    }
    Ok(())
}

fn initialize(
    catalog: &PackageCatalog,
    init: &WorkerInit,
    frames: &FrameWriter,
    install_logging: bool,
) -> Result<Arc<FleetRegistry>, PoolError> {
    let registry = match catalog.build_registry(&init.packages) {
        Ok(registry) => registry,
        Err(e) => {
            let message = e.to_string();
            frames.send(&WorkerResponse::InitFailed {
                message: message.clone(),
            })?;
            return Err(PoolError::InitFailed(message));
        }
    };

    if install_logging {
        let sink: Arc<dyn RecordSink> = Arc::new(frames.clone());
        if let Err(e) = devfleet_infra_logging::init_logging(init.log_filter.as_deref(), sink) {
            eprintln!("devfleet worker: {}", e);
        }
    }
    Ok(registry)
}

async fn read_request<R>(
    lines: &mut tokio::io::Lines<R>,
) -> Result<Option<WorkerRequest>, PoolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| PoolError::Io(e.to_string()))?;
        match line {
            None => return Ok(None),
            Some(l) if l.trim().is_empty() => continue,
            Some(l) => return decode_request(&l).map(Some),
        }
    }
}

/// Fleet functions block (device I/O), so they run off the async thread
async fn run_call(registry: &Arc<FleetRegistry>, spec: CallSpec) -> CallOutcome {
    let registry = Arc::clone(registry);
    match tokio::task::spawn_blocking(move || registry.invoke(&spec)).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(CallFailure::new(PANIC_KIND, panic_message(e.into_panic()))),
        Err(e) => Err(CallFailure::runtime(e.to_string())),
    }
}
