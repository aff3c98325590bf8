//! Line-oriented fallback transport.
//!
//! Each event is serialized as one sentinel-prefixed JSON line on the audit
//! process's stdout. The sentinel is long enough that no plausible log line
//! collides with it (and tracing output goes to stderr regardless). The
//! final result JSON is the only non-sentinel stdout content.

use std::io::Write;
use std::sync::Mutex;

use crate::error::AuditError;
use crate::events::ProgressEvent;

/// Fixed prefix marking a progress-event line.
pub const SENTINEL: &str = "@@AUDIT_EVT@@";

/// Sentinel-prefixed line writer.
pub struct StdoutSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    /// Sink writing to the real process stdout.
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Sink writing to an arbitrary writer (tests, captured child pipes).
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write one event as a sentinel line and flush.
    ///
    /// A serialization failure is logged and swallowed; an I/O failure is a
    /// transport error the caller decides about.
    pub fn write_event(&self, event: &ProgressEvent) -> Result<(), AuditError> {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize progress event, skipping");
                return Ok(());
            }
        };
        let mut w = self
            .writer
            .lock()
            .map_err(|_| AuditError::Transport("stdout sink poisoned".into()))?;
        writeln!(w, "{SENTINEL}{json}")
            .and_then(|_| w.flush())
            .map_err(|e| AuditError::Transport(format!("stdout write failed: {e}")))
    }
}

/// Parse a line back into an event if it carries the sentinel.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let json = line.strip_prefix(SENTINEL)?;
    match serde_json::from_str(json) {
        Ok(ev) => Some(ev),
        Err(e) => {
            tracing::warn!(error = %e, "unparsable sentinel line");
            None
        }
    }
}
