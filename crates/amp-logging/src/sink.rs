//! Diagnostic sinks.
//!
//! The client never depends on a sink's outcome: calls return immediately
//! and failures inside a sink are logged at `debug` and dropped.

use serde_json::Value;
use tracing::{debug, error, info};

/// Receives status reports and swallowed errors from the client.
pub trait DiagnosticSink: Send + Sync {
    /// Informational record (e.g. the socket became healthy).
    fn info(&self, record: &Value);
    /// Error record (e.g. a handler panicked, a detached request failed).
    fn error(&self, record: &Value);
}

/// Writes records as `tracing` events under the `amp::diagnostics` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn info(&self, record: &Value) {
        info!(target: "amp::diagnostics", %record, "diagnostic");
    }

    fn error(&self, record: &Value) {
        error!(target: "amp::diagnostics", %record, "diagnostic");
    }
}

/// POSTs records as JSON to `<base>/info` and `<base>/error`.
///
/// Each record is sent on a spawned task; outside a Tokio runtime records
/// are dropped.
#[derive(Clone, Debug)]
pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSink {
    /// Sink posting under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Sink sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn post(&self, path: &str, record: &Value) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(path, "no runtime, dropping diagnostic record");
            return;
        };
        let url = format!("{}/{path}", self.base_url);
        let request = self.client.post(&url).json(record);
        let _ = handle.spawn(async move {
            match request.send().await {
                Ok(resp) if !resp.status().is_success() => {
                    debug!(%url, status = resp.status().as_u16(), "diagnostic post rejected");
                }
                Ok(_) => {}
                Err(e) => debug!(%url, error = %e, "diagnostic post failed"),
            }
        });
    }
}

impl DiagnosticSink for HttpSink {
    fn info(&self, record: &Value) {
        self.post("info", record);
    }

    fn error(&self, record: &Value) {
        self.post("error", record);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
