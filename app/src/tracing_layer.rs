use chrono::Utc;
use events::{WsLogMessage, WsMessage};
use std::fmt::Write;
use tokio::sync::broadcast;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;

/// Forwards log lines onto the outbound event stream as `log` frames.
pub struct WsBroadcastLayer {
    tx: broadcast::Sender<WsMessage>,
    max_level: Level,
}

impl WsBroadcastLayer {
    pub fn new(tx: broadcast::Sender<WsMessage>, max_level: Level) -> Self {
        Self { tx, max_level }
    }
}

impl<S> Layer<S> for WsBroadcastLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = *event.metadata().level();
        // `Level` orders TRACE as the greatest.
        if level > self.max_level || self.tx.receiver_count() == 0 {
            return;
        }

        let mut visitor = LogMessageVisitor::default();
        event.record(&mut visitor);
        let log_message = WsLogMessage {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: visitor.finish(),
        };
        let _ = self.tx.send(WsMessage::Log(log_message));
    }
}

/// Renders the `message` field followed by the structured fields.
#[derive(Default)]
struct LogMessageVisitor {
    message: String,
    fields: String,
}

impl LogMessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl tracing::field::Visit for LogMessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
