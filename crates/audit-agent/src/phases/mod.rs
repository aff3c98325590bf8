//! Phase handler seams.
//!
//! Each pipeline phase is a function over a cancellation-aware context.
//! External collaborators (browser scout, vision model, security analyzers,
//! judge policy) sit behind traits so deterministic doubles inject at the
//! same seam the real clients use.

pub mod graph;
pub mod judge;
pub mod scout;
pub mod security;
pub mod vision;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forensics::error::AuditError;
use forensics::state::{AuditState, Finding, ScoutEvidence, SecurityModuleResult};

/// Progress percentages at each phase boundary. `pct` is monotone within a
/// phase because handlers only emit between these bounds.
pub mod pct {
    pub const SCOUT_START: u8 = 5;
    pub const SCOUT_END: u8 = 30;
    pub const SECURITY_END: u8 = 45;
    pub const VISION_END: u8 = 65;
    pub const GRAPH_END: u8 = 85;
    pub const JUDGE_END: u8 = 95;
    pub const DONE: u8 = 100;
}

/// Browser-automation seam: capture one page.
#[async_trait]
pub trait Scout: Send + Sync {
    async fn scout(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ScoutEvidence, AuditError>;
}

/// Context handed to the vision model alongside the screenshots.
#[derive(Debug, Clone)]
pub struct VisionContext {
    pub url: String,
    pub prompts: Vec<String>,
    /// Body excerpts for pages without screenshots.
    pub excerpts: Vec<String>,
}

/// Vision-model seam: screenshots + prompts in, findings out.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn analyze(
        &self,
        screenshots: &[Vec<u8>],
        context: &VisionContext,
    ) -> Result<Vec<Finding>, AuditError>;
}

/// Common interface of all security analyzers.
#[async_trait]
pub trait SecurityModule: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, evidence: &[ScoutEvidence]) -> Result<SecurityModuleResult, AuditError>;
}

/// The judge's loop decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeDecision {
    /// Evidence suffices; synthesize the verdict now.
    Verdict,
    /// Request additional pages before judging.
    RequestPages(Vec<String>),
}

/// Judgement seam: decides whether the collected evidence suffices.
pub trait JudgePolicy: Send + Sync {
    fn decide(&self, state: &AuditState) -> JudgeDecision;
}
