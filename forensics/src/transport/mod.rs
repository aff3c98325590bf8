//! Dual-mode progress-event transport.
//!
//! The audit process emits [`ProgressEvent`]s through a [`ProgressEmitter`]
//! in one of two modes carrying the same event sequence:
//!
//! - **Queue (primary):** a bounded thread-safe FIFO the supervisor drains.
//! - **Stdout (fallback):** sentinel-prefixed JSON lines scanned by the
//!   supervisor.
//!
//! Mode selection at startup: CLI flag > `QUEUE_IPC_MODE` env var >
//! percentage rollout draw. An unrecoverable queue send error mid-audit
//! switches the emitter to stdout as an explicit state transition: a
//! `mode_switch` event is written first, then the pending event.

pub mod queue;
pub mod reader;
pub mod stdout;

use std::sync::Mutex;

use crate::events::ProgressEvent;

pub use queue::{EventQueue, PushOutcome, DEFAULT_CAPACITY};
pub use reader::{ReaderStats, SupervisorReader};
pub use stdout::{parse_line, StdoutSink, SENTINEL};

/// Wire mode for progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Queue,
    Stdout,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Stdout => write!(f, "stdout"),
        }
    }
}

/// Explicit CLI override for the transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOverride {
    ForceQueue,
    ForceStdout,
    /// Run both modes and compare the streams.
    Validate,
}

/// The resolved transport decision and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedMode {
    pub mode: TransportMode,
    /// Whether validation (run both, compare) was requested.
    pub validate: bool,
    pub source: SelectionSource,
}

/// Which selection rule decided the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    CliFlag,
    EnvVar,
    Rollout,
}

impl std::fmt::Display for SelectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliFlag => write!(f, "cli_flag"),
            Self::EnvVar => write!(f, "env_var"),
            Self::Rollout => write!(f, "rollout"),
        }
    }
}

/// Resolve the transport mode. Pure: the rollout draw is passed in so the
/// decision is testable. Priority: CLI flag > env var > rollout fraction.
pub fn select_mode(
    cli: Option<ModeOverride>,
    env_mode: Option<&str>,
    rollout_fraction: f64,
    draw: f64,
) -> SelectedMode {
    if let Some(flag) = cli {
        let (mode, validate) = match flag {
            ModeOverride::ForceQueue => (TransportMode::Queue, false),
            ModeOverride::ForceStdout => (TransportMode::Stdout, false),
            ModeOverride::Validate => (TransportMode::Queue, true),
        };
        return SelectedMode {
            mode,
            validate,
            source: SelectionSource::CliFlag,
        };
    }
    if let Some(value) = env_mode {
        let mode = match value {
            "queue" => Some(TransportMode::Queue),
            "stdout" | "fallback" => Some(TransportMode::Stdout),
            other => {
                tracing::warn!(value = other, "unrecognized QUEUE_IPC_MODE, using rollout");
                None
            }
        };
        if let Some(mode) = mode {
            return SelectedMode {
                mode,
                validate: false,
                source: SelectionSource::EnvVar,
            };
        }
    }
    let mode = if draw < rollout_fraction.clamp(0.0, 1.0) {
        TransportMode::Queue
    } else {
        TransportMode::Stdout
    };
    SelectedMode {
        mode,
        validate: false,
        source: SelectionSource::Rollout,
    }
}

/// Resolve the mode from the live environment with a random rollout draw.
pub fn select_mode_from_env(cli: Option<ModeOverride>, default_rollout: f64) -> SelectedMode {
    let env_mode = std::env::var("QUEUE_IPC_MODE").ok();
    let rollout = std::env::var("QUEUE_IPC_ROLLOUT")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(default_rollout);
    let draw: f64 = rand::random();
    let selected = select_mode(cli, env_mode.as_deref(), rollout, draw);
    tracing::info!(
        mode = %selected.mode,
        source = %selected.source,
        validate = selected.validate,
        "transport mode selected"
    );
    selected
}

/// Outcome of one emit. Explicit result; the emitter never panics on
/// transport trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Delivered on the active mode.
    Delivered,
    /// Delivered, but the queue dropped its oldest event to make room.
    DeliveredAfterDrop,
    /// The queue became unusable; the emitter switched to stdout and the
    /// event (preceded by a mode-switch event) went out on the fallback.
    SwitchedToFallback,
    /// The event could not be delivered on any mode.
    Failed,
}

impl EmitOutcome {
    /// Whether the event reached the supervisor on some mode.
    pub fn delivered(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// The audit-side event sink seam. Phase handlers and the orchestrator see
/// only this trait; tests inject a [`MemorySink`].
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent) -> EmitOutcome;
}

/// Dual-mode emitter with automatic fallback.
pub struct ProgressEmitter {
    mode: Mutex<TransportMode>,
    queue: Option<std::sync::Arc<EventQueue>>,
    sink: StdoutSink,
}

impl ProgressEmitter {
    /// Queue-mode emitter. The supervisor holds the popping side of
    /// `queue`; `sink` is kept ready for fallback.
    pub fn queue_mode(queue: std::sync::Arc<EventQueue>, sink: StdoutSink) -> Self {
        Self {
            mode: Mutex::new(TransportMode::Queue),
            queue: Some(queue),
            sink,
        }
    }

    /// Stdout-mode emitter.
    pub fn stdout_mode(sink: StdoutSink) -> Self {
        Self {
            mode: Mutex::new(TransportMode::Stdout),
            queue: None,
            sink,
        }
    }

    /// The currently active mode.
    pub fn mode(&self) -> TransportMode {
        *self.mode.lock().expect("emitter mode poisoned")
    }

    fn switch_to_fallback(&self, reason: &str) {
        let mut mode = self.mode.lock().expect("emitter mode poisoned");
        if *mode == TransportMode::Stdout {
            return;
        }
        *mode = TransportMode::Stdout;
        let stranded = self.queue.as_ref().map(|q| q.len() as u64).unwrap_or(0);
        tracing::warn!(reason, stranded, "transport falling back to stdout");
        let _ = self
            .sink
            .write_event(&ProgressEvent::mode_switch(stranded, reason));
    }
}

impl ProgressSink for ProgressEmitter {
    fn emit(&self, event: ProgressEvent) -> EmitOutcome {
        let mode = self.mode();
        if mode == TransportMode::Queue {
            if let Some(queue) = &self.queue {
                match queue.push(event.clone()) {
                    PushOutcome::Queued => return EmitOutcome::Delivered,
                    PushOutcome::DroppedOldest => return EmitOutcome::DeliveredAfterDrop,
                    PushOutcome::Closed => {
                        self.switch_to_fallback("queue closed");
                    }
                }
            } else {
                self.switch_to_fallback("queue missing");
            }
            return match self.sink.write_event(&event) {
                Ok(()) => EmitOutcome::SwitchedToFallback,
                Err(e) => {
                    tracing::error!(error = %e, "fallback transport failed");
                    EmitOutcome::Failed
                }
            };
        }
        match self.sink.write_event(&event) {
            Ok(()) => EmitOutcome::Delivered,
            Err(e) => {
                tracing::error!(error = %e, "stdout transport failed");
                EmitOutcome::Failed
            }
        }
    }
}

/// In-memory sink capturing the emitted stream. Used by the validation mode
/// and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemorySink {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }
}

impl ProgressSink for MemorySink {
    fn emit(&self, event: ProgressEvent) -> EmitOutcome {
        self.events.lock().expect("memory sink poisoned").push(event);
        EmitOutcome::Delivered
    }
}

/// Compare two event streams field-by-field ignoring timestamps. Returns a
/// human-readable list of differences; empty means the streams match.
pub fn compare_streams(a: &[ProgressEvent], b: &[ProgressEvent]) -> Vec<String> {
    let mut diffs = Vec::new();
    if a.len() != b.len() {
        diffs.push(format!("stream length mismatch: {} vs {}", a.len(), b.len()));
    }
    for (i, (ea, eb)) in a.iter().zip(b.iter()).enumerate() {
        if !ea.eq_ignoring_timestamp(eb) {
            diffs.push(format!(
                "event {i} differs: {:?}/{} vs {:?}/{}",
                ea.kind, ea.step, eb.kind, eb.step
            ));
        }
    }
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flag_beats_env_and_rollout() {
        let sel = select_mode(Some(ModeOverride::ForceStdout), Some("queue"), 1.0, 0.0);
        assert_eq!(sel.mode, TransportMode::Stdout);
        assert_eq!(sel.source, SelectionSource::CliFlag);

        let sel = select_mode(Some(ModeOverride::Validate), Some("stdout"), 0.0, 0.9);
        assert_eq!(sel.mode, TransportMode::Queue);
        assert!(sel.validate);
    }

    #[test]
    fn test_env_beats_rollout() {
        let sel = select_mode(None, Some("queue"), 0.0, 0.9);
        assert_eq!(sel.mode, TransportMode::Queue);
        assert_eq!(sel.source, SelectionSource::EnvVar);

        let sel = select_mode(None, Some("fallback"), 1.0, 0.0);
        assert_eq!(sel.mode, TransportMode::Stdout);
    }

    #[test]
    fn test_rollout_fraction() {
        let sel = select_mode(None, None, 0.10, 0.05);
        assert_eq!(sel.mode, TransportMode::Queue);
        assert_eq!(sel.source, SelectionSource::Rollout);

        let sel = select_mode(None, None, 0.10, 0.50);
        assert_eq!(sel.mode, TransportMode::Stdout);
    }

    #[test]
    fn test_unknown_env_falls_through_to_rollout() {
        let sel = select_mode(None, Some("pipes"), 1.0, 0.5);
        assert_eq!(sel.mode, TransportMode::Queue);
        assert_eq!(sel.source, SelectionSource::Rollout);
    }

    #[test]
    fn test_emitter_queue_mode_delivers() {
        let queue = EventQueue::bounded(8);
        let emitter =
            ProgressEmitter::queue_mode(queue.clone(), StdoutSink::with_writer(Box::new(Vec::new())));
        let outcome = emitter.emit(ProgressEvent::phase_start("scout", 10, "x"));
        assert_eq!(outcome, EmitOutcome::Delivered);
        assert_eq!(queue.len(), 1);
        assert_eq!(emitter.mode(), TransportMode::Queue);
    }

    #[test]
    fn test_emitter_falls_back_on_closed_queue() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Buf(Arc<Mutex<Vec<u8>>>);
        impl Write for Buf {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(b);
                Ok(b.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let queue = EventQueue::bounded(8);
        let buf = Buf::default();
        let emitter =
            ProgressEmitter::queue_mode(queue.clone(), StdoutSink::with_writer(Box::new(buf.clone())));

        queue.close();
        let outcome = emitter.emit(ProgressEvent::phase_start("graph", 65, "osint"));
        assert_eq!(outcome, EmitOutcome::SwitchedToFallback);
        assert_eq!(emitter.mode(), TransportMode::Stdout);

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let events: Vec<_> = out.lines().filter_map(parse_line).collect();
        // Mode-switch event precedes the pending event
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, crate::events::ProgressKind::ModeSwitch);
        assert_eq!(events[1].phase, "graph");

        // Subsequent emits stay on stdout and report Delivered
        let outcome = emitter.emit(ProgressEvent::phase_complete("graph", 85, Default::default()));
        assert_eq!(outcome, EmitOutcome::Delivered);
    }

    #[test]
    fn test_compare_streams_ignores_timestamps() {
        let a = vec![
            ProgressEvent::phase_start("scout", 10, "x"),
            ProgressEvent::audit_complete(),
        ];
        let mut b = a.clone();
        b[0].timestamp = b[0].timestamp + chrono::Duration::seconds(30);
        assert!(compare_streams(&a, &b).is_empty());

        b[1] = ProgressEvent::audit_error("boom");
        assert_eq!(compare_streams(&a, &b).len(), 1);

        b.pop();
        assert!(!compare_streams(&a, &b).is_empty());
    }
}
