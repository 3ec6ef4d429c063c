//! Observability
//!
//! Tracing setup and the log sink the engine writes its operational records to.

pub mod telemetry;

pub use telemetry::{
    init_file_logging, init_tracing, init_tracing_with_filter, sanitize_for_log, LogFormat,
    LogLevel, LogRecord, LogSink, MemoryLogSink, TracingLogSink,
};
