//! Telemetry & Observability
//!
//! Structured logging for the monitor and its recovery cycles.
//! Features:
//! - Configurable log levels via RUST_LOG
//! - Optional JSON output for log shippers
//! - Optional daily-rotated log file
//! - A pluggable [`LogSink`] the engine reports status changes and
//!   recovery outcomes through

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Once;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Sanitize a string for safe log output by escaping control characters.
/// Prevents log injection where a strategy error embeds newlines to forge log entries.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

/// Output shape of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

static INIT: Once = Once::new();

/// Initialize global tracing subscriber.
/// Only enables verbose tracing if RUST_LOG is set, keeping CLI output clean.
pub fn init_tracing() {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        init_tracing_with_filter(&filter, LogFormat::Compact);
    }
}

/// Initialize with a custom filter string. Later calls are no-ops.
pub fn init_tracing_with_filter(filter: &str, format: LogFormat) {
    INIT.call_once(|| {
        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(filter_layer);

        let _ = match format {
            LogFormat::Compact => registry.with(stderr_layer()).try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
    });
}

/// Initialize stderr logging plus a daily-rotated file under `dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init_file_logging(
    dir: &Path,
    filter: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let mut guard = None;
    INIT.call_once(|| {
        let appender = tracing_appender::rolling::daily(dir, "vigil.log");
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);

        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer);

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(stderr_layer())
            .with(file_layer)
            .try_init();
    });
    guard
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_level(true)
        .compact()
        .with_writer(std::io::stderr) // stderr, stdout carries command output
}

/// Severity of a [`LogSink`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Destination for the engine's own operational records.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, category: &str, message: &str, data: Option<&serde_json::Value>);
}

/// Forwards records to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, category: &str, message: &str, data: Option<&serde_json::Value>) {
        let message = sanitize_for_log(message);
        let data = data.map(|d| d.to_string()).unwrap_or_default();
        match level {
            LogLevel::Trace => trace!(category, data = %data, "{}", message),
            LogLevel::Debug => debug!(category, data = %data, "{}", message),
            LogLevel::Info => info!(category, data = %data, "{}", message),
            LogLevel::Warn => warn!(category, data = %data, "{}", message),
            LogLevel::Error => error!(category, data = %data, "{}", message),
        }
    }
}

/// One record captured by [`MemoryLogSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Keeps every record in memory. Useful for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, category: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.category == category)
            .count()
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, category: &str, message: &str, data: Option<&serde_json::Value>) {
        self.records.lock().push(LogRecord {
            level,
            category: category.to_string(),
            message: message.to_string(),
            data: data.cloned(),
        });
    }
}

/// Initialize tracing for tests with a simple subscriber
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
