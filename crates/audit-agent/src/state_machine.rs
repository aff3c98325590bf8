//! Audit phase state machine.
//!
//! Explicit states and legal transition guards for the audit loop, so
//! every transition is auditable and illegal ones are caught at the
//! `advance()` seam. The budget gate runs between every transition and can
//! force the next hop to the forced-verdict phase.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use forensics::state::AuditState;

/// The set of audit phases.
///
/// Every audit starts at `Init` and terminates at `Done` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    /// Validating input and building the initial state.
    Init,
    /// Fetching pages and capturing evidence.
    Scout,
    /// Running the enabled security modules.
    Security,
    /// Dark-pattern analysis over captured screenshots.
    Vision,
    /// OSINT/CTI fanout and consensus.
    Graph,
    /// Verdict synthesis and loop decision.
    Judge,
    /// Best-effort verdict from whatever evidence exists.
    ForceVerdict,
    /// Audit finished with a verdict (terminal).
    Done,
    /// Unrecoverable error (terminal).
    Aborted,
}

impl AuditPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Name used in progress events and error records.
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Scout => "scout",
            Self::Security => "security",
            Self::Vision => "vision",
            Self::Graph => "graph",
            Self::Judge => "judge",
            Self::ForceVerdict => "force_verdict",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for AuditPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Legal transitions:
/// ```text
/// Init → Scout
/// Scout → Security | ForceVerdict
/// Security → Vision
/// Vision → Graph
/// Graph → Judge
/// Judge → Done | Scout | ForceVerdict
/// ForceVerdict → Done
/// any non-terminal → Aborted
/// ```
fn is_legal_transition(from: AuditPhase, to: AuditPhase) -> bool {
    use AuditPhase::*;

    if to == Aborted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Init, Scout)
            | (Scout, Security)
            | (Scout, ForceVerdict)
            | (Security, Vision)
            | (Vision, Graph)
            | (Graph, Judge)
            | (Judge, Done)
            | (Judge, Scout)
            | (Judge, ForceVerdict)
            // The gate may force the verdict from any mid-pipeline phase.
            | (Security, ForceVerdict)
            | (Vision, ForceVerdict)
            | (Graph, ForceVerdict)
            | (ForceVerdict, Done)
    )
}

/// A single recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: AuditPhase,
    pub to: AuditPhase,
    pub iteration: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: AuditPhase,
    pub to: AuditPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal phase transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The audit phase machine: current phase, iteration counter and a full
/// transition log.
#[derive(Debug)]
pub struct PhaseMachine {
    current: AuditPhase,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<PhaseTransition>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: AuditPhase::Init,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> AuditPhase {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Attempt to advance to `to`, recording the transition.
    pub fn advance(&mut self, to: AuditPhase, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }
        tracing::debug!(from = %self.current, to = %to, iteration = self.iteration, "phase transition");
        self.transitions.push(PhaseTransition {
            from: self.current,
            to,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Transition to `Aborted` from any non-terminal phase.
    pub fn abort(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(AuditPhase::Aborted, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the gate forced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Within,
    IterationsExhausted,
    PagesExhausted,
    AiCallsExhausted,
}

/// The budget gate, evaluated between every transition.
///
/// Iterations and pages are hard; the AI-call cap is soft in the sense
/// that it routes to the forced verdict rather than aborting, exactly like
/// the hard caps, it just never fires mid-phase.
pub fn budget_gate(state: &AuditState) -> BudgetVerdict {
    if state.iteration >= state.budget.max_iterations {
        return BudgetVerdict::IterationsExhausted;
    }
    if state.counters.pages_scouted >= state.budget.max_pages {
        return BudgetVerdict::PagesExhausted;
    }
    if state.counters.ai_calls >= state.budget.max_ai_calls {
        return BudgetVerdict::AiCallsExhausted;
    }
    BudgetVerdict::Within
}

impl BudgetVerdict {
    pub fn exhausted(self) -> bool {
        self != Self::Within
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Within => "within budget",
            Self::IterationsExhausted => "iteration budget exhausted",
            Self::PagesExhausted => "page budget exhausted",
            Self::AiCallsExhausted => "ai call budget exhausted",
        }
    }
}
