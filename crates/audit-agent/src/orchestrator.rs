//! The audit orchestrator.
//!
//! Drives the phase machine scout → security → vision → graph → judge,
//! loops back on judge request, enforces budgets at the loop boundary and
//! produces exactly one terminal result. Collaborators are constructed at
//! audit start and passed by reference; phase handlers receive the state,
//! an emitter and the cancellation token, nothing more.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use forensics::error::AuditError;
use forensics::events::ProgressEvent;
use forensics::osint::consensus::ReputationTracker;
use forensics::osint::feeds::{host_of, ThreatFeeds};
use forensics::osint::FanoutEngine;
use forensics::state::{
    AuditState, AuditStatus, AuditTier, AuditErrorRecord, FinalReport, VerdictMode,
};
use forensics::transport::ProgressSink;

use crate::config::AuditConfig;
use crate::phases::{self, pct, JudgeDecision, JudgePolicy, Scout, SecurityModule, VisionModel};
use crate::state_machine::{budget_gate, AuditPhase, PhaseMachine};

/// External collaborators, injected at construction. Test doubles plug in
/// at exactly this seam.
pub struct Collaborators {
    pub scout: Arc<dyn Scout>,
    pub vision: Arc<dyn VisionModel>,
    pub security_modules: Vec<Arc<dyn SecurityModule>>,
    pub judge: Arc<dyn JudgePolicy>,
    pub fanout: Arc<FanoutEngine>,
    pub feeds: Arc<ThreatFeeds>,
    pub reputation: Arc<Mutex<ReputationTracker>>,
}

/// Per-audit options.
#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    pub verdict_mode: Option<VerdictMode>,
    /// When set, only these security modules run.
    pub enabled_security_modules: Option<BTreeSet<String>>,
}

/// The outcome handed back to the caller.
#[derive(Debug)]
pub struct AuditRun {
    pub status: AuditStatus,
    /// Present on every non-aborted termination.
    pub report: Option<FinalReport>,
    pub errors: Vec<AuditErrorRecord>,
    pub iterations: u32,
    pub elapsed_seconds: f64,
}

pub struct Orchestrator {
    config: AuditConfig,
    collaborators: Collaborators,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: AuditConfig,
        collaborators: Collaborators,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            collaborators,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Token for cooperative cancellation. Tripping it lets the in-flight
    /// phase reach its next suspension point, then aborts the audit,
    /// unless the terminal judge path is already running, which still
    /// produces a forced verdict.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the audit to a terminal state.
    ///
    /// Returns `Err` only for invalid input; every other failure surfaces
    /// through the returned [`AuditRun`].
    pub async fn run(
        &self,
        url: &str,
        tier: AuditTier,
        options: AuditOptions,
    ) -> Result<AuditRun, AuditError> {
        validate_url(url)?;
        let started = Instant::now();
        let mode = options.verdict_mode.unwrap_or(VerdictMode::Simple);
        let mut state = AuditState::new(url, tier, self.config.budget_for(tier));
        let mut machine = PhaseMachine::new();

        tracing::info!(audit_id = %state.audit_id, url, %tier, "audit starting");
        if let Err(e) = machine.advance(AuditPhase::Scout, Some("init complete")) {
            return Ok(self.abort(&mut state, started, &e.to_string()));
        }

        loop {
            if self.cancel.is_cancelled()
                && !matches!(
                    machine.current(),
                    AuditPhase::Judge | AuditPhase::ForceVerdict
                )
            {
                state.push_error(machine.current().name(), &AuditError::Cancelled);
                return Ok(self.abort(&mut state, started, "cancelled"));
            }

            let step = match machine.current() {
                AuditPhase::Scout => self.scout_phase(&mut state, &mut machine).await,
                AuditPhase::Security => {
                    self.middle_phase(&mut state, &mut machine, AuditPhase::Security, &options)
                        .await
                }
                AuditPhase::Vision => {
                    self.middle_phase(&mut state, &mut machine, AuditPhase::Vision, &options)
                        .await
                }
                AuditPhase::Graph => {
                    self.middle_phase(&mut state, &mut machine, AuditPhase::Graph, &options)
                        .await
                }
                AuditPhase::Judge => self.judge_phase(&mut state, &mut machine, mode),
                AuditPhase::ForceVerdict => self.force_verdict_phase(&mut state, &mut machine, mode),
                AuditPhase::Done | AuditPhase::Aborted => break,
                AuditPhase::Init => Err(AuditError::Internal("loop entered at init".into())),
            };

            match step {
                Ok(()) => {}
                Err(AuditError::Cancelled) => {
                    state.push_error(machine.current().name(), &AuditError::Cancelled);
                    return Ok(self.abort(&mut state, started, "cancelled"));
                }
                Err(e) => {
                    // Internal errors and transition bugs abort; everything
                    // recoverable was already absorbed by the phase arms.
                    return Ok(self.abort(&mut state, started, &e.to_string()));
                }
            }
        }

        state.set_status(AuditStatus::Completed);
        let elapsed = started.elapsed().as_secs_f64();
        let report = FinalReport::from_state(&state, mode, elapsed)?;
        self.sink.emit(ProgressEvent::audit_result(serde_json::to_value(
            &report,
        )
        .unwrap_or_default()));
        self.sink.emit(ProgressEvent::audit_complete());
        tracing::info!(
            audit_id = %state.audit_id,
            score = report.trust_score,
            risk = %report.risk_level,
            "audit complete"
        );
        Ok(AuditRun {
            status: state.status,
            report: Some(report),
            errors: state.errors.clone(),
            iterations: state.iteration,
            elapsed_seconds: elapsed,
        })
    }

    async fn scout_phase(
        &self,
        state: &mut AuditState,
        machine: &mut PhaseMachine,
    ) -> Result<(), AuditError> {
        self.sink
            .emit(ProgressEvent::phase_start("scout", pct::SCOUT_START, "capturing pages"));

        let captured = match phases::scout::run(
            state,
            self.collaborators.scout.as_ref(),
            self.sink.as_ref(),
            &self.cancel,
            &self.config,
        )
        .await
        {
            Ok(captured) => {
                let mut summary = std::collections::BTreeMap::new();
                summary.insert("pages_this_iteration".into(), captured.to_string());
                summary.insert(
                    "pages_total".into(),
                    state.counters.pages_scouted.to_string(),
                );
                self.sink
                    .emit(ProgressEvent::phase_complete("scout", pct::SCOUT_END, summary));
                captured
            }
            Err(AuditError::Cancelled) => return Err(AuditError::Cancelled),
            Err(e) => {
                state.push_error("scout", &e);
                self.sink
                    .emit(ProgressEvent::phase_error("scout", pct::SCOUT_END, &e.to_string()));
                0
            }
        };
        self.emit_stats(state);

        if captured == 0 && state.scout_evidence.is_empty() && state.consecutive_scout_failures >= 3
        {
            machine
                .advance(
                    AuditPhase::ForceVerdict,
                    Some("repeated scout failure with no evidence"),
                )
                .map_err(internal)?;
        } else {
            machine
                .advance(AuditPhase::Security, None)
                .map_err(internal)?;
        }
        Ok(())
    }

    /// Security, vision and graph share the same contract shape: start
    /// event, bounded work, merge-on-failure, complete-or-error event,
    /// advance.
    async fn middle_phase(
        &self,
        state: &mut AuditState,
        machine: &mut PhaseMachine,
        phase: AuditPhase,
        options: &AuditOptions,
    ) -> Result<(), AuditError> {
        let (start_pct, end_pct, next) = match phase {
            AuditPhase::Security => (pct::SCOUT_END, pct::SECURITY_END, AuditPhase::Vision),
            AuditPhase::Vision => (pct::SECURITY_END, pct::VISION_END, AuditPhase::Graph),
            AuditPhase::Graph => (pct::VISION_END, pct::GRAPH_END, AuditPhase::Judge),
            other => return Err(AuditError::Internal(format!("{other} is not a middle phase"))),
        };
        let name = phase.name();
        self.sink
            .emit(ProgressEvent::phase_start(name, start_pct, "working"));

        let result = match phase {
            AuditPhase::Security => {
                tokio::time::timeout(
                    self.config.audit_timeout,
                    phases::security::run(
                        state,
                        &self.collaborators.security_modules,
                        options.enabled_security_modules.as_ref(),
                        self.sink.as_ref(),
                        &self.cancel,
                    ),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(AuditError::timeout("security phase", self.config.audit_timeout))
                })
            }
            AuditPhase::Vision => {
                phases::vision::run(
                    state,
                    self.collaborators.vision.as_ref(),
                    self.sink.as_ref(),
                    &self.cancel,
                    &self.config,
                )
                .await
            }
            AuditPhase::Graph => {
                phases::graph::run(
                    state,
                    &self.collaborators.fanout,
                    &self.collaborators.feeds,
                    &self.collaborators.reputation,
                    self.sink.as_ref(),
                    &self.cancel,
                    &self.config,
                )
                .await
            }
            other => return Err(AuditError::Internal(format!("{other} is not a middle phase"))),
        };

        match result {
            Ok(()) => {
                let mut summary = std::collections::BTreeMap::new();
                match phase {
                    AuditPhase::Security => {
                        summary.insert(
                            "modules_run".into(),
                            state.security_evidence.len().to_string(),
                        );
                    }
                    AuditPhase::Vision => {
                        summary.insert("findings".into(), state.vision_findings.len().to_string());
                        summary.insert("ai_calls".into(), state.counters.ai_calls.to_string());
                    }
                    AuditPhase::Graph => {
                        if let Some(graph) = &state.graph_evidence {
                            summary.insert("sources".into(), graph.reports.len().to_string());
                            summary.insert(
                                "entity_verified".into(),
                                graph.entity_verified.to_string(),
                            );
                        }
                    }
                    _ => {}
                }
                self.sink
                    .emit(ProgressEvent::phase_complete(name, end_pct, summary));
            }
            Err(AuditError::Cancelled) => return Err(AuditError::Cancelled),
            Err(e @ AuditError::Internal(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(phase = name, error = %e, "phase failed, continuing");
                state.push_error(name, &e);
                self.sink
                    .emit(ProgressEvent::phase_error(name, end_pct, &e.to_string()));
            }
        }
        machine.advance(next, None).map_err(internal)?;
        Ok(())
    }

    /// Judge is CPU-only; cancellation mid-judge still produces a verdict.
    fn judge_phase(
        &self,
        state: &mut AuditState,
        machine: &mut PhaseMachine,
        mode: VerdictMode,
    ) -> Result<(), AuditError> {
        self.sink
            .emit(ProgressEvent::phase_start("judge", pct::GRAPH_END, "weighing evidence"));

        match self.collaborators.judge.decide(state) {
            JudgeDecision::Verdict => {
                let verdict = phases::judge::synthesize(state, mode, false);
                let mut summary = std::collections::BTreeMap::new();
                summary.insert("score".into(), format!("{:.1}", verdict.final_score));
                summary.insert("risk_level".into(), verdict.risk_level.to_string());
                state.set_verdict(verdict)?;
                self.sink
                    .emit(ProgressEvent::phase_complete("judge", pct::JUDGE_END, summary));
                machine
                    .advance(AuditPhase::Done, Some("verdict final"))
                    .map_err(internal)?;
            }
            JudgeDecision::RequestPages(urls) => {
                let queued = urls.iter().filter(|u| state.enqueue_url(u)).count();
                let mut summary = std::collections::BTreeMap::new();
                summary.insert("pages_requested".into(), urls.len().to_string());
                summary.insert("pages_queued".into(), queued.to_string());
                self.sink
                    .emit(ProgressEvent::phase_complete("judge", pct::JUDGE_END, summary));

                state.iteration += 1;
                machine.set_iteration(state.iteration);

                let gate = budget_gate(state);
                if self.cancel.is_cancelled() {
                    machine
                        .advance(AuditPhase::ForceVerdict, Some("cancelled at loop boundary"))
                        .map_err(internal)?;
                } else if gate.exhausted() {
                    state.push_error("judge", &AuditError::Budget(gate.reason().into()));
                    machine
                        .advance(AuditPhase::ForceVerdict, Some(gate.reason()))
                        .map_err(internal)?;
                } else if queued == 0 && state.pending_urls.is_empty() {
                    machine
                        .advance(AuditPhase::ForceVerdict, Some("no new pages to scout"))
                        .map_err(internal)?;
                } else {
                    machine
                        .advance(AuditPhase::Scout, Some("judge requested more pages"))
                        .map_err(internal)?;
                }
            }
        }
        Ok(())
    }

    fn force_verdict_phase(
        &self,
        state: &mut AuditState,
        machine: &mut PhaseMachine,
        mode: VerdictMode,
    ) -> Result<(), AuditError> {
        self.sink.emit(ProgressEvent::phase_start(
            "force_verdict",
            pct::JUDGE_END,
            "producing best-effort verdict",
        ));
        let verdict = phases::judge::synthesize(state, mode, true);
        let mut summary = std::collections::BTreeMap::new();
        summary.insert("score".into(), format!("{:.1}", verdict.final_score));
        state.set_verdict(verdict)?;
        self.sink.emit(ProgressEvent::phase_complete(
            "force_verdict",
            pct::JUDGE_END,
            summary,
        ));
        machine
            .advance(AuditPhase::Done, Some("forced verdict"))
            .map_err(internal)?;
        Ok(())
    }

    fn emit_stats(&self, state: &AuditState) {
        let mut summary = std::collections::BTreeMap::new();
        summary.insert("iteration".into(), state.iteration.to_string());
        summary.insert("pages_scouted".into(), state.counters.pages_scouted.to_string());
        summary.insert("ai_calls".into(), state.counters.ai_calls.to_string());
        summary.insert("errors".into(), state.errors.len().to_string());
        self.sink
            .emit(ProgressEvent::stats_update("scout", pct::SCOUT_END, summary));
    }

    fn abort(&self, state: &mut AuditState, started: Instant, reason: &str) -> AuditRun {
        tracing::error!(reason, "audit aborted");
        state.set_status(AuditStatus::Aborted);
        self.sink.emit(ProgressEvent::audit_error(reason));
        AuditRun {
            status: AuditStatus::Aborted,
            report: None,
            errors: state.errors.clone(),
            iterations: state.iteration,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        }
    }
}

fn internal(e: crate::state_machine::IllegalTransition) -> AuditError {
    AuditError::Internal(e.to_string())
}

fn validate_url(url: &str) -> Result<(), AuditError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AuditError::Input(format!(
            "url must be http(s), got '{url}'"
        )));
    }
    if host_of(url).is_none() {
        return Err(AuditError::Input(format!("url '{url}' has no host")));
    }
    Ok(())
}
