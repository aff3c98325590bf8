//! Progress-event wire types.
//!
//! A [`ProgressEvent`] is the unit of the audit→supervisor transport. The
//! same record is carried by both transport modes; only the wire framing
//! differs. The supervisor converts each event verbatim into a
//! [`SupervisorEvent`], preserving field names.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type tags carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    PhaseStart,
    PhaseComplete,
    PhaseError,
    Finding,
    Screenshot,
    StatsUpdate,
    ModeSwitch,
    AuditResult,
    AuditComplete,
    AuditError,
}

impl ProgressKind {
    /// The outbound user-facing event name for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhaseStart => "phase_start",
            Self::PhaseComplete => "phase_complete",
            Self::PhaseError => "phase_error",
            Self::Finding => "finding",
            Self::Screenshot => "screenshot",
            Self::StatsUpdate => "stats_update",
            Self::ModeSwitch => "mode_switch",
            Self::AuditResult => "audit_result",
            Self::AuditComplete => "audit_complete",
            Self::AuditError => "audit_error",
        }
    }

    /// Whether this kind terminates the event stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AuditComplete | Self::AuditError)
    }
}

/// A single typed progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub phase: String,
    pub step: String,
    /// Overall progress, 0–100, monotone within a phase.
    pub pct: u8,
    pub detail: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Base64 payload for screenshot events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ProgressEvent {
    fn base(kind: ProgressKind, phase: &str, step: &str, pct: u8, detail: String) -> Self {
        Self {
            kind,
            phase: phase.to_string(),
            step: step.to_string(),
            pct: pct.min(100),
            detail,
            summary: BTreeMap::new(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn phase_start(phase: &str, pct: u8, detail: &str) -> Self {
        Self::base(ProgressKind::PhaseStart, phase, "start", pct, detail.into())
    }

    pub fn phase_complete(phase: &str, pct: u8, summary: BTreeMap<String, String>) -> Self {
        let mut ev = Self::base(
            ProgressKind::PhaseComplete,
            phase,
            "complete",
            pct,
            format!("{phase} phase complete"),
        );
        ev.summary = summary;
        ev
    }

    pub fn phase_error(phase: &str, pct: u8, detail: &str) -> Self {
        Self::base(ProgressKind::PhaseError, phase, "error", pct, detail.into())
    }

    pub fn finding(phase: &str, pct: u8, summary: BTreeMap<String, String>) -> Self {
        let mut ev = Self::base(
            ProgressKind::Finding,
            phase,
            "finding",
            pct,
            "dark pattern detected".into(),
        );
        ev.summary = summary;
        ev
    }

    pub fn screenshot(phase: &str, pct: u8, url: &str, bytes: &[u8]) -> Self {
        let mut ev = Self::base(
            ProgressKind::Screenshot,
            phase,
            "screenshot",
            pct,
            format!("screenshot of {url}"),
        );
        ev.data = Some(BASE64.encode(bytes));
        ev
    }

    pub fn stats_update(phase: &str, pct: u8, summary: BTreeMap<String, String>) -> Self {
        let mut ev = Self::base(
            ProgressKind::StatsUpdate,
            phase,
            "stats",
            pct,
            "counters updated".into(),
        );
        ev.summary = summary;
        ev
    }

    /// Emitted exactly once when the transport falls back mid-audit.
    pub fn mode_switch(dropped_in_flight: u64, reason: &str) -> Self {
        let mut ev = Self::base(
            ProgressKind::ModeSwitch,
            "transport",
            "fallback",
            0,
            format!("switched to stdout transport: {reason}"),
        );
        ev.summary
            .insert("dropped_in_flight".into(), dropped_in_flight.to_string());
        ev
    }

    pub fn audit_result(payload: serde_json::Value) -> Self {
        let mut ev = Self::base(
            ProgressKind::AuditResult,
            "judge",
            "result",
            100,
            "final result ready".into(),
        );
        ev.summary.insert("result".into(), payload.to_string());
        ev
    }

    pub fn audit_complete() -> Self {
        Self::base(
            ProgressKind::AuditComplete,
            "done",
            "complete",
            100,
            "audit complete".into(),
        )
    }

    pub fn audit_error(reason: &str) -> Self {
        Self::base(ProgressKind::AuditError, "done", "error", 100, reason.into())
    }

    /// Decode the base64 payload, if present.
    pub fn decode_data(&self) -> Option<Vec<u8>> {
        self.data.as_ref().and_then(|d| BASE64.decode(d).ok())
    }

    /// Field-wise equality ignoring the timestamp. Used by the transport
    /// validation mode.
    pub fn eq_ignoring_timestamp(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.phase == other.phase
            && self.step == other.step
            && self.pct == other.pct
            && self.detail == other.detail
            && self.summary == other.summary
            && self.data == other.data
    }
}

/// User-facing event forwarded by the supervisor reader. Field names are
/// preserved verbatim from the progress event; only an `event` name is
/// prepended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorEvent {
    pub event: String,
    #[serde(flatten)]
    pub inner: ProgressEvent,
}

impl From<ProgressEvent> for SupervisorEvent {
    fn from(inner: ProgressEvent) -> Self {
        Self {
            event: inner.kind.as_str().to_string(),
            inner,
        }
    }
}
