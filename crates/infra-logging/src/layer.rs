// Tracing layer that turns events into log records for a sink
use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use devfleet_core::domain::{LogLevel, LogRecord};
use devfleet_core::port::RecordSink;

/// Collects the `message` field and renders every other field as `key=value`.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
}

impl RecordVisitor {
    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }

    fn into_message(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}

/// Forwards every event it sees to a [`RecordSink`].
///
/// In the controller the sink is the aggregator queue; inside a worker it is
/// the frame writer on stdout. Formatting happens here, at emission time.
pub struct AggregatorLayer {
    sink: Arc<dyn RecordSink>,
}

impl AggregatorLayer {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for AggregatorLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord::new(
            LogLevel::from(metadata.level()),
            metadata.target(),
            visitor.into_message(),
        );
        self.sink.enqueue(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devfleet_core::port::log_sink::mocks::CollectingSink;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture<F: FnOnce()>(f: F) -> Vec<LogRecord> {
        let sink = Arc::new(CollectingSink::new());
        let subscriber =
            tracing_subscriber::registry().with(AggregatorLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink.records()
    }

    #[test]
    fn test_event_becomes_record() {
        let records = capture(|| {
            tracing::warn!(target: "devfleet.board", "port reopened");
        });

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].logger_name, "devfleet.board");
        assert_eq!(records[0].message, "port reopened");
        assert_eq!(records[0].process_id, std::process::id());
    }

    #[test]
    fn test_structured_fields_are_appended() {
        let records = capture(|| {
            let device = "board-1";
            tracing::info!(device = %device, attempt = 2, "recovery started");
        });

        assert_eq!(records[0].message, "recovery started device=board-1 attempt=2");
    }

    #[test]
    fn test_fields_without_message() {
        let records = capture(|| {
            tracing::error!(code = 7);
        });

        assert_eq!(records[0].message, "code=7");
        assert_eq!(records[0].level, LogLevel::Error);
    }
}
