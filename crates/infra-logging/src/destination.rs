// Log destinations: console streams and rolling files
use chrono::{DateTime, Local};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use devfleet_core::domain::{LogLevel, LogRecord};
use devfleet_core::port::LogDestination;

/// How a record is rendered into one line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineFormat {
    /// Message text only
    #[default]
    Message,
    /// `YYYYMMDD HH:MM:SS.mmm L   PID logger<TAB>message`
    Detailed,
    /// The record as a JSON object
    Json,
}

impl FromStr for LineFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "message" => Ok(LineFormat::Message),
            "detailed" => Ok(LineFormat::Detailed),
            "json" => Ok(LineFormat::Json),
            other => Err(format!(
                "Invalid log format '{}': expected pretty, detailed or json",
                other
            )),
        }
    }
}

impl LineFormat {
    pub fn render(&self, record: &LogRecord) -> String {
        match self {
            LineFormat::Message => record.message.clone(),
            LineFormat::Detailed => format_detailed(record),
            LineFormat::Json => serde_json::to_string(record)
                .unwrap_or_else(|e| format!("{{\"unserializable_record\":\"{}\"}}", e)),
        }
    }
}

/// Render a record in the detailed line format, local time
pub fn format_detailed(record: &LogRecord) -> String {
    let timestamp = DateTime::from_timestamp_millis(record.timestamp_ms)
        .map(|t| t.with_timezone(&Local).format("%Y%m%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "00000000 00:00:00.000".to_string());
    format!(
        "{} {} {:5} {}\t{}",
        timestamp,
        record.level.letter(),
        record.process_id,
        record.logger_name,
        record.message
    )
}

/// Writes one line per record to any writer (stdout, stderr, buffers)
pub struct StreamDestination {
    writer: Mutex<Box<dyn Write + Send>>,
    format: LineFormat,
    min_level: LogLevel,
}

impl StreamDestination {
    pub fn new(writer: Box<dyn Write + Send>, format: LineFormat, min_level: LogLevel) -> Self {
        Self {
            writer: Mutex::new(writer),
            format,
            min_level,
        }
    }

    pub fn stdout(format: LineFormat, min_level: LogLevel) -> Self {
        Self::new(Box::new(io::stdout()), format, min_level)
    }

    pub fn stderr(format: LineFormat, min_level: LogLevel) -> Self {
        Self::new(Box::new(io::stderr()), format, min_level)
    }
}

fn lock_err<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "log writer lock poisoned")
}

impl LogDestination for StreamDestination {
    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn write(&self, record: &LogRecord) -> io::Result<()> {
        let line = self.format.render(record);
        let mut writer = self.writer.lock().map_err(lock_err)?;
        writeln!(writer, "{}", line)
    }

    fn flush(&self) -> io::Result<()> {
        self.writer.lock().map_err(lock_err)?.flush()
    }
}

/// Detailed-format log file, optionally rotated daily
pub struct FileDestination {
    appender: Mutex<RollingFileAppender>,
    min_level: LogLevel,
}

impl FileDestination {
    /// Log to `path`. The parent directory is created if missing.
    pub fn open(path: &Path, rotate_daily: bool, min_level: LogLevel) -> io::Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("log file path has no file name: {}", path.display()),
                )
            })?;
        std::fs::create_dir_all(dir)?;

        let rotation = if rotate_daily {
            Rotation::DAILY
        } else {
            Rotation::NEVER
        };
        let appender = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(file_name)
            .build(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        Ok(Self {
            appender: Mutex::new(appender),
            min_level,
        })
    }
}

impl LogDestination for FileDestination {
    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn write(&self, record: &LogRecord) -> io::Result<()> {
        let line = format_detailed(record);
        let mut appender = self.appender.lock().map_err(lock_err)?;
        writeln!(appender, "{}", line)
    }

    fn flush(&self) -> io::Result<()> {
        self.appender.lock().map_err(lock_err)?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Writer whose contents stay readable after being boxed
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn record(message: &str) -> LogRecord {
        LogRecord {
            level: LogLevel::Warn,
            logger_name: "devfleet.board".to_string(),
            message: message.to_string(),
            process_id: 42,
            timestamp_ms: 1_700_000_000_123,
        }
    }

    #[test]
    fn test_detailed_format_layout() {
        let line = format_detailed(&record("port reopened"));
        let (head, message) = line.split_once('\t').unwrap();
        assert_eq!(message, "port reopened");

        let parts: Vec<_> = head.split_whitespace().collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].len(), 8); // YYYYMMDD
        assert!(parts[1].ends_with(".123"));
        assert_eq!(parts[2], "W");
        assert_eq!(parts[3], "42");
        assert_eq!(parts[4], "devfleet.board");
        assert!(head.contains("W    42 "));
    }

    #[test]
    fn test_stream_destination_writes_lines() {
        let buffer = SharedBuffer::default();
        let dest = StreamDestination::new(
            Box::new(buffer.clone()),
            LineFormat::Message,
            LogLevel::Info,
        );

        dest.write(&record("one")).unwrap();
        dest.write(&record("two")).unwrap();
        dest.flush().unwrap();
        assert_eq!(buffer.text(), "one\ntwo\n");
    }

    #[test]
    fn test_json_format_round_trips() {
        let line = LineFormat::Json.render(&record("structured"));
        let parsed: LogRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, record("structured"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("pretty".parse::<LineFormat>(), Ok(LineFormat::Message));
        assert_eq!("DETAILED".parse::<LineFormat>(), Ok(LineFormat::Detailed));
        assert!("fancy".parse::<LineFormat>().is_err());
    }

    #[test]
    fn test_file_destination_appends_detailed_lines() {
        let dir = std::env::temp_dir().join(format!("devfleet-log-test-{}", std::process::id()));
        let path = dir.join("devfleet.txt");
        let dest = FileDestination::open(&path, false, LogLevel::Debug).unwrap();

        dest.write(&record("to disk")).unwrap();
        dest.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("devfleet.board\tto disk\n"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
