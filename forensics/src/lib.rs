//! Forensic audit core library.
//!
//! Shared pieces of the autonomous web-audit pipeline:
//! - the typed audit data model and error taxonomy
//! - the dual-mode progress-event transport (bounded queue with
//!   sentinel-line stdout fallback) and the supervisor reader
//! - the OSINT/CTI fanout engine: source registry, per-source quota and
//!   circuit breaker, result cache, tiered parallel querying and weighted
//!   consensus with preserved conflicts
//! - the deterministic trust-score engine
//!
//! The audit binary wires these together; everything here is also usable
//! with injected test doubles at the trait seams.

pub mod error;
pub mod events;
pub mod osint;
pub mod scoring;
pub mod state;
pub mod transport;

pub use error::{AuditError, ErrorKind};
pub use events::{ProgressEvent, ProgressKind, SupervisorEvent};
pub use state::{
    AuditState, AuditStatus, AuditTier, Budget, Counters, FinalReport, Finding, GraphEvidence,
    RiskLevel, ScoutEvidence, SecurityModuleResult, Severity, SignalName, SiteType, SiteTypeGuess,
    SubSignal, TrustResult, VerdictMode,
};
pub use transport::{
    EmitOutcome, EventQueue, MemorySink, ProgressEmitter, ProgressSink, SupervisorReader,
    TransportMode,
};
