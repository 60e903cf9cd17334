//! Structured diagnostics
//!
//! [`DiagnosticsLayer`] is a `tracing` layer that mirrors recent events into a
//! bounded in-memory buffer, each stamped with the process correlation id.
//! The buffer can be filtered and exported as JSON for bug reports.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tfmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Identifier attached to every diagnostic record of one process
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// `<unix millis>_<9 random hex chars>`
    pub fn new() -> Self {
        let random = crate::generate_id();
        Self(format!("{}_{}", crate::now_millis(), &random[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One captured event
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    /// Module path of the event (tracing target)
    pub module: String,
    pub message: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    fn severity(&self) -> Option<Level> {
        Level::from_str(&self.level).ok()
    }
}

/// Bounded ring buffer of recent records
#[derive(Clone, Debug)]
pub struct DiagnosticsBuffer {
    inner: Arc<Mutex<VecDeque<LogRecord>>>,
    capacity: usize,
}

impl DiagnosticsBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.inner.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Records whose module contains `module` and whose level is at least
    /// as severe as `min_level`
    pub fn filter(&self, module: Option<&str>, min_level: Option<Level>) -> Vec<LogRecord> {
        self.inner
            .lock()
            .iter()
            .filter(|r| module.map_or(true, |m| r.module.contains(m)))
            .filter(|r| match (min_level, r.severity()) {
                (Some(min), Some(level)) => level <= min,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect()
    }

    /// Export all records as a pretty-printed JSON document
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Export {
            exported_at: String,
            logs: Vec<LogRecord>,
        }

        serde_json::to_string_pretty(&Export {
            exported_at: chrono::Utc::now().to_rfc3339(),
            logs: self.records(),
        })
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Layer that copies events into a [`DiagnosticsBuffer`]
pub struct DiagnosticsLayer {
    buffer: DiagnosticsBuffer,
    correlation_id: CorrelationId,
}

impl DiagnosticsLayer {
    pub fn new(buffer: DiagnosticsBuffer, correlation_id: CorrelationId) -> Self {
        Self {
            buffer,
            correlation_id,
        }
    }
}

impl<S: Subscriber> Layer<S> for DiagnosticsLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: meta.level().to_string(),
            module: meta.module_path().unwrap_or_else(|| meta.target()).to_string(),
            message: visitor.message,
            correlation_id: self.correlation_id.to_string(),
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.insert(field, value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.insert(field, format!("{:?}", value).into());
        }
    }
}

/// Install the global subscriber: fmt output (plain or JSON), an `EnvFilter`
/// defaulting to the configured level, and the diagnostics layer
///
/// Returns the diagnostics buffer. If a global subscriber is already set the
/// buffer stays empty.
pub fn init_tracing(config: &LoggingConfig, correlation_id: CorrelationId) -> DiagnosticsBuffer {
    let buffer = DiagnosticsBuffer::new(config.buffer_size);
    let default_level = LevelFilter::from_str(&config.level).unwrap_or(LevelFilter::INFO);

    let result = tracing_subscriber::registry()
        .with(config.json.then(|| tfmt::layer().json()))
        .with((!config.json).then(tfmt::layer))
        .with(DiagnosticsLayer::new(buffer.clone(), correlation_id))
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .try_init();

    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::Registry;

    fn capture<F: FnOnce()>(capacity: usize, f: F) -> DiagnosticsBuffer {
        let buffer = DiagnosticsBuffer::new(capacity);
        let subscriber =
            Registry::default().with(DiagnosticsLayer::new(buffer.clone(), CorrelationId::new()));
        tracing::subscriber::with_default(subscriber, f);
        buffer
    }

    #[test]
    fn test_correlation_id_format() {
        let id = CorrelationId::new();
        let (millis, suffix) = id.as_str().split_once('_').unwrap();
        assert!(millis.parse::<u64>().is_ok());
        assert_eq!(suffix.len(), 9);
    }

    #[test]
    fn test_layer_captures_fields() {
        let buffer = capture(10, || {
            tracing::warn!(session_id = "room-1", attempt = 2u64, "Reconnecting");
        });

        let records = buffer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "Reconnecting");
        assert_eq!(records[0].level, "WARN");
        assert_eq!(records[0].fields["session_id"], "room-1");
        assert_eq!(records[0].fields["attempt"], 2);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let buffer = capture(3, || {
            for i in 0..5 {
                tracing::info!("event {}", i);
            }
        });

        let messages: Vec<_> = buffer.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
    }

    #[test]
    fn test_filter_by_level_and_module() {
        let buffer = capture(10, || {
            tracing::debug!("noise");
            tracing::info!("joined");
            tracing::error!("failed");
        });

        let warnings = buffer.filter(None, Some(Level::WARN));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "failed");

        assert_eq!(buffer.filter(Some("diagnostics"), None).len(), 3);
        assert!(buffer.filter(Some("peer"), None).is_empty());
    }

    #[test]
    fn test_export_json() {
        let buffer = capture(10, || tracing::info!("hello"));
        let json: serde_json::Value = serde_json::from_str(&buffer.export_json().unwrap()).unwrap();
        assert_eq!(json["logs"][0]["message"], "hello");
        assert!(json["logs"][0]["correlationId"].is_string());

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
