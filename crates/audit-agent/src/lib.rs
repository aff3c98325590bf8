//! Autonomous forensic web-audit agent.
//!
//! One process per audit: the orchestrator walks scout → security →
//! vision → graph → judge, loops back when the judge asks for more pages,
//! enforces the tier budgets and streams typed progress events to the
//! supervisor over the dual-mode transport from the `forensics` crate.

pub mod config;
pub mod orchestrator;
pub mod phases;
pub mod state_machine;

pub use config::AuditConfig;
pub use orchestrator::{AuditOptions, AuditRun, Collaborators, Orchestrator};
pub use state_machine::{budget_gate, AuditPhase, BudgetVerdict, PhaseMachine};
