//! Supervisor-side event reader.
//!
//! A single cooperative task drains the queue (primary mode) or scans
//! stdout lines (fallback mode), converts each [`ProgressEvent`] into a
//! [`SupervisorEvent`] and forwards it. Queue-empty is a wait condition;
//! a cancellation request drains whatever is already buffered, then stops.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::events::{ProgressEvent, SupervisorEvent};
use crate::transport::queue::EventQueue;
use crate::transport::stdout::parse_line;

/// Counters for one reader run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub forwarded: u64,
    pub parse_failures: u64,
    /// Whether a terminal event (`audit_complete` / `audit_error`) was seen.
    pub terminal_seen: bool,
}

/// Converts and forwards progress events, keeping a bounded history tail.
pub struct SupervisorReader {
    history: VecDeque<SupervisorEvent>,
    history_cap: usize,
    stats: ReaderStats,
}

impl SupervisorReader {
    pub fn new(history_cap: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(history_cap.min(256)),
            history_cap: history_cap.max(1),
            stats: ReaderStats::default(),
        }
    }

    fn forward(&mut self, event: ProgressEvent, sink: &mut impl FnMut(SupervisorEvent)) {
        if event.kind.is_terminal() {
            self.stats.terminal_seen = true;
        }
        let converted = SupervisorEvent::from(event);
        if self.history.len() >= self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(converted.clone());
        self.stats.forwarded += 1;
        sink(converted);
    }

    /// Drain a queue until it is closed and empty, or until cancellation.
    /// On cancellation, events already buffered are still drained.
    pub async fn drain_queue(
        &mut self,
        queue: Arc<EventQueue>,
        cancel: &CancellationToken,
        mut sink: impl FnMut(SupervisorEvent),
    ) -> ReaderStats {
        loop {
            tokio::select! {
                event = queue.pop() => match event {
                    Some(event) => self.forward(event, &mut sink),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Some(event) = queue.try_pop() {
                        self.forward(event, &mut sink);
                    }
                    break;
                }
            }
        }
        self.stats
    }

    /// Scan buffered lines for sentinel-framed events (fallback mode).
    /// Non-sentinel lines are ignored; they belong to the final result.
    pub fn drain_lines<R: BufRead>(
        &mut self,
        reader: R,
        mut sink: impl FnMut(SupervisorEvent),
    ) -> ReaderStats {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "supervisor reader line error");
                    self.stats.parse_failures += 1;
                    continue;
                }
            };
            if !line.starts_with(crate::transport::SENTINEL) {
                continue;
            }
            match parse_line(&line) {
                Some(event) => self.forward(event, &mut sink),
                None => self.stats.parse_failures += 1,
            }
        }
        self.stats
    }

    /// The bounded tail of forwarded events, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &SupervisorEvent> {
        self.history.iter()
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SENTINEL;

    #[tokio::test]
    async fn test_drain_queue_until_closed() {
        let queue = EventQueue::bounded(16);
        queue.push(ProgressEvent::phase_start("scout", 10, "x"));
        queue.push(ProgressEvent::phase_complete("scout", 30, Default::default()));
        queue.push(ProgressEvent::audit_complete());
        queue.close();

        let mut reader = SupervisorReader::new(16);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let stats = reader
            .drain_queue(queue, &cancel, |ev| seen.push(ev.event.clone()))
            .await;

        assert_eq!(seen, vec!["phase_start", "phase_complete", "audit_complete"]);
        assert_eq!(stats.forwarded, 3);
        assert!(stats.terminal_seen);
    }

    #[tokio::test]
    async fn test_cancel_drains_buffered() {
        let queue = EventQueue::bounded(16);
        queue.push(ProgressEvent::phase_start("scout", 10, "x"));
        queue.push(ProgressEvent::phase_error("scout", 10, "boom"));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut reader = SupervisorReader::new(16);
        let mut seen = Vec::new();
        let stats = reader
            .drain_queue(queue, &cancel, |ev| seen.push(ev.event.clone()))
            .await;
        assert_eq!(seen.len(), 2);
        assert!(!stats.terminal_seen);
    }

    #[test]
    fn test_drain_lines_skips_noise() {
        let ev = ProgressEvent::phase_start("vision", 45, "batch 1");
        let body = format!(
            "random stdout noise\n{SENTINEL}{}\n{{\"final_result\":true}}\n{SENTINEL}broken\n",
            serde_json::to_string(&ev).unwrap()
        );
        let mut reader = SupervisorReader::new(8);
        let mut seen = Vec::new();
        let stats = reader.drain_lines(body.as_bytes(), |ev| seen.push(ev));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event, "phase_start");
        assert_eq!(stats.parse_failures, 1);
    }

    #[test]
    fn test_history_bounded() {
        let mut reader = SupervisorReader::new(2);
        let lines: String = (0..5)
            .map(|i| {
                let ev = ProgressEvent::phase_start(&format!("p{i}"), 10, "x");
                format!("{SENTINEL}{}\n", serde_json::to_string(&ev).unwrap())
            })
            .collect();
        reader.drain_lines(lines.as_bytes(), |_| {});
        let phases: Vec<_> = reader.history().map(|e| e.inner.phase.clone()).collect();
        assert_eq!(phases, vec!["p3", "p4"]);
    }
}
