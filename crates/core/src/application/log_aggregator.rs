// Cross-process log aggregator
// One FIFO channel, one consumer thread, many destinations
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{LOG_SYNC_TIMEOUT, LOG_TERMINATE_TIMEOUT};
use crate::domain::{LogLevel, LogRecord};
use crate::error::{FleetError, Result};
use crate::port::{LogDestination, RecordSink};

/// Everything that travels through the aggregator's channel.
///
/// Control messages share the queue with records, so they take effect exactly
/// between the records enqueued before and after them.
pub enum LogMessage {
    Record(LogRecord),
    AddDestination {
        id: String,
        destination: Arc<dyn LogDestination>,
    },
    RemoveDestination(String),
    /// Acknowledged once earlier records are dispatched and destinations flushed
    Sync(oneshot::Sender<()>),
    /// Like `Sync`, then the consumer stops
    Terminate(oneshot::Sender<()>),
}

impl fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMessage::Record(r) => f.debug_tuple("Record").field(r).finish(),
            LogMessage::AddDestination { id, .. } => {
                f.debug_struct("AddDestination").field("id", id).finish()
            }
            LogMessage::RemoveDestination(id) => f.debug_tuple("RemoveDestination").field(id).finish(),
            LogMessage::Sync(_) => write!(f, "Sync"),
            LogMessage::Terminate(_) => write!(f, "Terminate"),
        }
    }
}

/// Cloneable producer side of the channel
#[derive(Clone)]
pub struct LogSender {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl LogSender {
    fn send(&self, message: LogMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| FleetError::Logging("log consumer has stopped".to_string()))
    }
}

impl RecordSink for LogSender {
    fn enqueue(&self, record: LogRecord) {
        // Records sent after termination are dropped
        let _ = self.tx.send(LogMessage::Record(record));
    }
}

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub sync_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            sync_timeout: LOG_SYNC_TIMEOUT,
            terminate_timeout: LOG_TERMINATE_TIMEOUT,
        }
    }
}

/// Owns the consumer thread. Created by the main process before any worker starts.
pub struct LogAggregator {
    sender: LogSender,
    consumer: Mutex<Option<JoinHandle<()>>>,
    config: AggregatorConfig,
}

impl LogAggregator {
    pub fn start(config: AggregatorConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = std::thread::Builder::new()
            .name("log-aggregator".to_string())
            .spawn(move || consume(rx))?;

        Ok(Self {
            sender: LogSender { tx },
            consumer: Mutex::new(Some(consumer)),
            config,
        })
    }

    pub fn sender(&self) -> LogSender {
        self.sender.clone()
    }

    pub fn sink(&self) -> Arc<dyn RecordSink> {
        Arc::new(self.sender.clone())
    }

    pub fn logger(&self, name: impl Into<String>) -> FleetLogger {
        FleetLogger::new(self.sink(), name)
    }

    /// Register a destination; it sees only records enqueued after this call.
    /// Re-using an id replaces the previous destination.
    pub fn add_destination(&self, id: impl Into<String>, destination: Arc<dyn LogDestination>) -> Result<()> {
        self.sender.send(LogMessage::AddDestination {
            id: id.into(),
            destination,
        })
    }

    pub fn remove_destination(&self, id: impl Into<String>) -> Result<()> {
        self.sender.send(LogMessage::RemoveDestination(id.into()))
    }

    /// Wait until every record enqueued so far reached its destinations
    pub async fn sync(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.sender.send(LogMessage::Sync(ack_tx))?;
        match timeout(self.config.sync_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(FleetError::Logging(
                "log consumer stopped before acknowledging sync".to_string(),
            )),
            Err(_) => Err(FleetError::Logging(format!(
                "log sync not acknowledged within {:?}",
                self.config.sync_timeout
            ))),
        }
    }

    /// Flush everything and stop the consumer.
    ///
    /// A consumer that does not confirm within the bound is a fatal error.
    pub async fn terminate(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.sender.send(LogMessage::Terminate(ack_tx))?;
        match timeout(self.config.terminate_timeout, ack_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(FleetError::Logging(
                    "log consumer exited without confirming termination".to_string(),
                ))
            }
            Err(_) => {
                return Err(FleetError::Logging(format!(
                    "log consumer did not terminate within {:?}",
                    self.config.terminate_timeout
                )))
            }
        }

        let handle = self
            .consumer
            .lock()
            .map_err(|_| FleetError::Internal("log consumer handle poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| FleetError::Internal(e.to_string()))?
                .map_err(|_| FleetError::Internal("log consumer panicked".to_string()))?;
        }
        Ok(())
    }
}

fn consume(mut rx: mpsc::UnboundedReceiver<LogMessage>) {
    let mut destinations: Vec<(String, Arc<dyn LogDestination>)> = Vec::new();

    while let Some(message) = rx.blocking_recv() {
        match message {
            LogMessage::Record(record) => dispatch(&destinations, &record),
            LogMessage::AddDestination { id, destination } => {
                destinations.retain(|(existing, _)| existing != &id);
                destinations.push((id, destination));
            }
            LogMessage::RemoveDestination(id) => {
                if let Some(pos) = destinations.iter().position(|(existing, _)| existing == &id) {
                    let (id, destination) = destinations.remove(pos);
                    flush_one(&id, destination.as_ref());
                }
            }
            LogMessage::Sync(ack) => {
                flush_all(&destinations);
                let _ = ack.send(());
            }
            LogMessage::Terminate(ack) => {
                flush_all(&destinations);
                let _ = ack.send(());
                debug!("Log consumer terminated");
                return;
            }
        }
    }
    flush_all(&destinations);
}

// Destination failures go to stderr; logging them would feed this loop
fn dispatch(destinations: &[(String, Arc<dyn LogDestination>)], record: &LogRecord) {
    for (id, destination) in destinations {
        if !destination.accepts(record) {
            continue;
        }
        if let Err(e) = destination.write(record) {
            eprintln!("devfleet: log destination {} failed to write: {}", id, e);
        }
    }
}

fn flush_all(destinations: &[(String, Arc<dyn LogDestination>)]) {
    for (id, destination) in destinations {
        flush_one(id, destination.as_ref());
    }
}

fn flush_one(id: &str, destination: &dyn LogDestination) {
    if let Err(e) = destination.flush() {
        eprintln!("devfleet: log destination {} failed to flush: {}", id, e);
    }
}

/// Named front end over any sink; behaves the same inside and outside workers
#[derive(Clone)]
pub struct FleetLogger {
    sink: Arc<dyn RecordSink>,
    name: String,
}

impl FleetLogger {
    pub fn new(sink: Arc<dyn RecordSink>, name: impl Into<String>) -> Self {
        Self {
            sink,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logger for a sub-component, named `<parent>.<suffix>`
    pub fn child(&self, suffix: &str) -> Self {
        Self::new(Arc::clone(&self.sink), format!("{}.{}", self.name, suffix))
    }

    /// Format now, enqueue without blocking
    pub fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        self.sink
            .enqueue(LogRecord::new(level, self.name.clone(), message.to_string()));
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, format_args!("{}", message));
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, format_args!("{}", message));
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warn, format_args!("{}", message));
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, format_args!("{}", message));
    }
}
