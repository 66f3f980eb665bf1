// Log Sink Port
// Where log records go: a queue feeding the aggregator, and the destinations it fans out to

use std::io;

use crate::domain::{LogLevel, LogRecord};

/// Non-blocking entry point for pre-formatted records.
///
/// Implemented by the aggregator's sender in the main process and by the pipe
/// writer inside worker processes, so emitting code never knows which side it
/// runs on.
pub trait RecordSink: Send + Sync {
    fn enqueue(&self, record: LogRecord);
}

/// A place the aggregator's consumer writes records to (stream, file, memory).
///
/// Only the consumer thread calls `write` and `flush`.
pub trait LogDestination: Send + Sync {
    /// Records below this level are skipped
    fn min_level(&self) -> LogLevel;

    fn write(&self, record: &LogRecord) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn accepts(&self, record: &LogRecord) -> bool {
        record.level >= self.min_level()
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Destination that keeps every record it receives
    #[derive(Clone)]
    pub struct MemoryDestination {
        min_level: LogLevel,
        records: Arc<Mutex<Vec<LogRecord>>>,
        flushes: Arc<Mutex<usize>>,
    }

    impl MemoryDestination {
        pub fn new(min_level: LogLevel) -> Self {
            Self {
                min_level,
                records: Arc::new(Mutex::new(Vec::new())),
                flushes: Arc::new(Mutex::new(0)),
            }
        }

        pub fn records(&self) -> Vec<LogRecord> {
            self.records.lock().unwrap().clone()
        }

        pub fn messages(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.message.clone())
                .collect()
        }

        pub fn flush_count(&self) -> usize {
            *self.flushes.lock().unwrap()
        }
    }

    impl LogDestination for MemoryDestination {
        fn min_level(&self) -> LogLevel {
            self.min_level
        }

        fn write(&self, record: &LogRecord) -> io::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn flush(&self) -> io::Result<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Sink that collects records directly, without a consumer thread
    #[derive(Clone, Default)]
    pub struct CollectingSink {
        records: Arc<Mutex<Vec<LogRecord>>>,
    }

    impl CollectingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<LogRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    impl RecordSink for CollectingSink {
        fn enqueue(&self, record: LogRecord) {
            self.records.lock().unwrap().push(record);
        }
    }
}
