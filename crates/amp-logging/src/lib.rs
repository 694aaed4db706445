//! # amp-logging
//!
//! - [`init_subscriber`] installs the stderr `tracing` subscriber
//! - [`DiagnosticSink`] is the hook the client reports status changes and
//!   swallowed failures to, with [`TracingSink`] and [`HttpSink`]
//!   implementations
//! - [`test_utils`] captures tracing events and sink records for assertions

#![deny(unsafe_code)]

pub mod sink;
pub mod test_utils;

pub use sink::{DiagnosticSink, HttpSink, TracingSink};
pub use test_utils::{CapturedLogs, RecordingSink, capture_logs};

/// Initialize the global tracing subscriber with stderr output only.
///
/// `RUST_LOG` wins over `level` when set. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}
