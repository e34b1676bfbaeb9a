//! Log forwarding
//!
//! The library only emits `tracing` events. Hosts either forward them to
//! their own log facility through a `LogSink` or install the stderr
//! subscriber.

use std::fmt::Write;
use std::sync::{Arc, OnceLock};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Receives formatted log lines from the library
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, target: &str, message: String);
}

static GLOBAL_SINK: OnceLock<Arc<dyn LogSink>> = OnceLock::new();

/// `tracing` layer that formats each event and hands it to a sink
pub struct SinkLayer {
    sink: Arc<dyn LogSink>,
}

impl SinkLayer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        self.sink
            .log(*metadata.level(), metadata.target(), visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&self.fields);
        }
        self.message
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }
}

/// Install `sink` as the global log destination. Returns false if a logger
/// was already installed.
pub fn init_logger(sink: Box<dyn LogSink>, level: LevelFilter) -> bool {
    let sink: Arc<dyn LogSink> = Arc::from(sink);
    if GLOBAL_SINK.set(sink.clone()).is_err() {
        return false;
    }

    let subscriber = tracing_subscriber::registry()
        .with(SinkLayer::new(sink))
        .with(level);

    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Human-readable logs on stderr, filtered by `RUST_LOG`
/// (default `whisper_core=info`).
pub fn init_stderr_logger() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("whisper_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector(Mutex<Vec<(Level, String)>>);

    impl LogSink for Collector {
        fn log(&self, level: Level, _target: &str, message: String) {
            self.0.lock().unwrap().push((level, message));
        }
    }

    #[test]
    fn test_sink_layer_formats_fields() {
        let collector = Arc::new(Collector::default());
        let subscriber = tracing_subscriber::registry()
            .with(SinkLayer::new(collector.clone()))
            .with(LevelFilter::INFO);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("filtered out");
            tracing::warn!(counter = 7, "Rejected message");
        });

        let lines = collector.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, Level::WARN);
        assert_eq!(lines[0].1, "Rejected message counter=7");
    }
}
