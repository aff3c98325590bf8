//! The audit state and evidence containers.
//!
//! [`AuditState`] is the single object flowing through the pipeline. It is
//! created by the orchestrator, mutated only through the typed setters here
//! (one per phase output), and destroyed when the audit process exits. Only
//! the serialized [`FinalReport`] and the progress-event stream cross the
//! process boundary.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, ErrorKind};
use crate::osint::consensus::ConsensusVerdict;
use crate::osint::feeds::DarknetExposure;
use crate::osint::source::SourceReport;

/// Audit depth tier. Controls the hard budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTier {
    /// Single iteration, single page.
    Quick,
    /// A couple of iterations over the most relevant pages.
    Standard,
    /// Full multi-iteration forensic crawl.
    Deep,
}

impl AuditTier {
    /// Default budget for this tier. Environment overrides are applied on
    /// top by the agent configuration.
    pub fn default_budget(self) -> Budget {
        match self {
            Self::Quick => Budget {
                max_iterations: 1,
                max_pages: 1,
                max_ai_calls: 4,
            },
            Self::Standard => Budget {
                max_iterations: 2,
                max_pages: 5,
                max_ai_calls: 12,
            },
            Self::Deep => Budget {
                max_iterations: 3,
                max_pages: 10,
                max_ai_calls: 30,
            },
        }
    }
}

impl std::fmt::Display for AuditTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quick => write!(f, "quick"),
            Self::Standard => write!(f, "standard"),
            Self::Deep => write!(f, "deep"),
        }
    }
}

impl std::str::FromStr for AuditTier {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(AuditError::Input(format!("unknown tier '{other}'"))),
        }
    }
}

/// Hard caps for one audit. Immutable once the audit starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum scout→judge loops.
    pub max_iterations: u32,
    /// Maximum pages scouted across all iterations.
    pub max_pages: u32,
    /// Soft cap on external AI calls. Exceeding it routes to the forced
    /// verdict, it never aborts.
    pub max_ai_calls: u32,
}

/// Running tallies against [`Budget`]. Monotonically non-decreasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub ai_calls: u32,
    pub pages_scouted: u32,
}

/// Audit lifecycle status. Terminal values are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Running,
    Completed,
    Error,
    Aborted,
}

impl AuditStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Summary of one `<form>` seen on a scouted page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSummary {
    pub action: Option<String>,
    pub method: String,
    pub has_password_field: bool,
    pub input_count: u32,
}

/// Evidence captured from a single scouted page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutEvidence {
    /// URL that was requested.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    /// Lowercased response header map.
    pub headers: BTreeMap<String, String>,
    /// Absolute link targets discovered on the page.
    pub links: Vec<String>,
    pub forms: Vec<FormSummary>,
    /// Whether the final URL was served over TLS.
    pub uses_tls: bool,
    /// Lowercased excerpt of the page body for deterministic classifiers.
    pub body_excerpt: String,
    /// Raw screenshot bytes when the scout captured one.
    #[serde(default, skip_serializing, skip_deserializing)]
    pub screenshot: Option<Vec<u8>>,
    pub fetched_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Top-level dark-pattern taxonomy buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DarkPatternCategory {
    InterfaceInterference,
    Sneaking,
    Urgency,
    SocialProof,
    Obstruction,
}

impl DarkPatternCategory {
    /// Stable numeric id, used for deterministic ordering of output.
    pub fn id(self) -> u8 {
        match self {
            Self::InterfaceInterference => 1,
            Self::Sneaking => 2,
            Self::Urgency => 3,
            Self::SocialProof => 4,
            Self::Obstruction => 5,
        }
    }
}

/// Dark-pattern sub-types, each belonging to exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DarkPatternKind {
    // Interface interference
    HiddenInformation,
    Preselection,
    TrickWording,
    DisguisedAd,
    FalseHierarchy,
    // Sneaking
    SneakIntoBasket,
    HiddenCosts,
    HiddenSubscription,
    BaitAndSwitch,
    // Urgency
    CountdownTimer,
    LimitedTimeMessage,
    LowStockMessage,
    HighDemandMessage,
    // Social proof
    FakeActivityNotification,
    FakeTestimonial,
    FakeEndorsement,
    // Obstruction
    HardToCancel,
    RoachMotel,
    PriceComparisonPrevention,
    ForcedAccount,
    NaggingPrompt,
}

impl DarkPatternKind {
    pub fn category(self) -> DarkPatternCategory {
        use DarkPatternCategory::*;
        match self {
            Self::HiddenInformation
            | Self::Preselection
            | Self::TrickWording
            | Self::DisguisedAd
            | Self::FalseHierarchy => InterfaceInterference,
            Self::SneakIntoBasket
            | Self::HiddenCosts
            | Self::HiddenSubscription
            | Self::BaitAndSwitch => Sneaking,
            Self::CountdownTimer
            | Self::LimitedTimeMessage
            | Self::LowStockMessage
            | Self::HighDemandMessage => Urgency,
            Self::FakeActivityNotification | Self::FakeTestimonial | Self::FakeEndorsement => {
                SocialProof
            }
            Self::HardToCancel
            | Self::RoachMotel
            | Self::PriceComparisonPrevention
            | Self::ForcedAccount
            | Self::NaggingPrompt => Obstruction,
        }
    }

    /// Stable numeric id within the taxonomy, used for deterministic output
    /// ordering.
    pub fn id(self) -> u8 {
        match self {
            Self::HiddenInformation => 1,
            Self::Preselection => 2,
            Self::TrickWording => 3,
            Self::DisguisedAd => 4,
            Self::FalseHierarchy => 5,
            Self::SneakIntoBasket => 6,
            Self::HiddenCosts => 7,
            Self::HiddenSubscription => 8,
            Self::BaitAndSwitch => 9,
            Self::CountdownTimer => 10,
            Self::LimitedTimeMessage => 11,
            Self::LowStockMessage => 12,
            Self::HighDemandMessage => 13,
            Self::FakeActivityNotification => 14,
            Self::FakeTestimonial => 15,
            Self::FakeEndorsement => 16,
            Self::HardToCancel => 17,
            Self::RoachMotel => 18,
            Self::PriceComparisonPrevention => 19,
            Self::ForcedAccount => 20,
            Self::NaggingPrompt => 21,
        }
    }
}

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single dark-pattern observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub category: DarkPatternCategory,
    pub pattern: DarkPatternKind,
    pub severity: Severity,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Technical description of what was observed.
    pub description: String,
    /// Plain-English paraphrase for the report reader.
    pub paraphrase: String,
    /// Index into the audit's screenshot sequence, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_index: Option<usize>,
}

/// The six named components of the trust score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalName {
    Visual,
    Structural,
    Temporal,
    Graph,
    Meta,
    Security,
}

impl SignalName {
    /// All signals in their canonical order.
    pub const ALL: [SignalName; 6] = [
        Self::Visual,
        Self::Structural,
        Self::Temporal,
        Self::Graph,
        Self::Meta,
        Self::Security,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Structural => "structural",
            Self::Temporal => "temporal",
            Self::Graph => "graph",
            Self::Meta => "meta",
            Self::Security => "security",
        }
    }
}

/// One component of the trust score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubSignal {
    pub name: SignalName,
    /// Raw goodness score in [0, 1]; 1 is fully trustworthy.
    pub raw_score: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub evidence_count: u32,
}

impl SubSignal {
    pub fn new(name: SignalName, raw_score: f64, confidence: f64, evidence_count: u32) -> Self {
        Self {
            name,
            raw_score: raw_score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            evidence_count,
        }
    }
}

/// Risk bucket for the final 0–100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Trusted,
    ProbablySafe,
    Suspicious,
    HighRisk,
    LikelyFraudulent,
}

impl RiskLevel {
    /// Bucket a 0–100 score by the fixed thresholds.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Trusted
        } else if score >= 70.0 {
            Self::ProbablySafe
        } else if score >= 40.0 {
            Self::Suspicious
        } else if score >= 20.0 {
            Self::HighRisk
        } else {
            Self::LikelyFraudulent
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trusted => "trusted",
            Self::ProbablySafe => "probably_safe",
            Self::Suspicious => "suspicious",
            Self::HighRisk => "high_risk",
            Self::LikelyFraudulent => "likely_fraudulent",
        };
        write!(f, "{s}")
    }
}

/// Site classification label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    Ecommerce,
    Banking,
    News,
    Social,
    Portfolio,
    Unknown,
}

/// A site-type guess with its confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteTypeGuess {
    pub site_type: SiteType,
    pub confidence: f64,
}

/// Result of a single security module run, keyed by module name on the
/// audit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityModuleResult {
    pub module: String,
    pub passed: bool,
    /// Module score in [0, 1]; 1 means no concerns.
    pub score: f64,
    pub details: BTreeMap<String, String>,
    /// Hard-override flags raised by this module, by name.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// OSINT/CTI entity profile produced by the graph phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvidence {
    pub domain: String,
    pub verdict: Option<ConsensusVerdict>,
    pub reports: Vec<SourceReport>,
    pub phishing_listed: bool,
    pub darknet: DarknetExposure,
    /// Whether any infrastructure source (DNS/WHOIS/SSL) resolved the
    /// entity.
    pub entity_verified: bool,
}

/// Final trust verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustResult {
    /// Final score in [0, 100].
    pub final_score: f64,
    pub risk_level: RiskLevel,
    /// Per-signal 0–100 contributions, keyed by signal name.
    pub signal_scores: BTreeMap<String, u8>,
    /// Hard overrides applied, by name, in application order.
    pub overrides: Vec<String>,
    pub narrative: String,
    pub recommendations: Vec<String>,
}

/// A recoverable error recorded on the audit state. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditErrorRecord {
    pub phase: String,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AuditErrorRecord {
    pub fn new(phase: &str, err: &AuditError) -> Self {
        Self {
            phase: phase.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// The single mutable object flowing through the audit pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditState {
    pub audit_id: String,
    pub target_url: String,
    pub tier: AuditTier,
    pub budget: Budget,
    pub iteration: u32,
    pub counters: Counters,
    pub pending_urls: VecDeque<String>,
    pub investigated_urls: HashSet<String>,
    pub scout_evidence: Vec<ScoutEvidence>,
    pub security_evidence: BTreeMap<String, SecurityModuleResult>,
    pub vision_findings: Vec<Finding>,
    pub graph_evidence: Option<GraphEvidence>,
    pub site_type: Option<SiteTypeGuess>,
    pub verdict: Option<TrustResult>,
    pub errors: Vec<AuditErrorRecord>,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    /// Consecutive scout failures with no page captured.
    pub consecutive_scout_failures: u32,
}

impl AuditState {
    /// Create the initial state. The target URL is seeded as the first
    /// pending page.
    pub fn new(target_url: &str, tier: AuditTier, budget: Budget) -> Self {
        let mut pending_urls = VecDeque::new();
        pending_urls.push_back(target_url.to_string());
        Self {
            audit_id: uuid::Uuid::new_v4().to_string(),
            target_url: target_url.to_string(),
            tier,
            budget,
            iteration: 0,
            counters: Counters::default(),
            pending_urls,
            investigated_urls: HashSet::new(),
            scout_evidence: Vec::new(),
            security_evidence: BTreeMap::new(),
            vision_findings: Vec::new(),
            graph_evidence: None,
            site_type: None,
            verdict: None,
            errors: Vec::new(),
            status: AuditStatus::Running,
            started_at: Utc::now(),
            consecutive_scout_failures: 0,
        }
    }

    /// Queue a URL for investigation unless it was already investigated or
    /// is already pending. Returns whether the URL was queued.
    pub fn enqueue_url(&mut self, url: &str) -> bool {
        if self.investigated_urls.contains(url) || self.pending_urls.iter().any(|u| u == url) {
            return false;
        }
        self.pending_urls.push_back(url.to_string());
        true
    }

    /// Record a successfully scouted page. Returns an error if the page
    /// budget would be exceeded; callers must check the budget first.
    pub fn record_scout(&mut self, evidence: ScoutEvidence) -> Result<(), AuditError> {
        if self.counters.pages_scouted >= self.budget.max_pages {
            return Err(AuditError::Budget(format!(
                "pages_scouted would exceed max_pages {}",
                self.budget.max_pages
            )));
        }
        self.investigated_urls.insert(evidence.url.clone());
        self.counters.pages_scouted += 1;
        self.consecutive_scout_failures = 0;
        self.scout_evidence.push(evidence);
        Ok(())
    }

    /// Record a failed scout attempt. The URL still counts as investigated
    /// so it is not retried endlessly.
    pub fn record_scout_failure(&mut self, url: &str) {
        self.investigated_urls.insert(url.to_string());
        self.consecutive_scout_failures += 1;
    }

    /// Record one external AI call.
    pub fn record_ai_call(&mut self) {
        self.counters.ai_calls += 1;
    }

    /// Merge a security module result under its module name.
    pub fn merge_security(&mut self, result: SecurityModuleResult) {
        self.security_evidence.insert(result.module.clone(), result);
    }

    /// Merge vision findings, dropping anything below the confidence
    /// threshold.
    pub fn merge_vision(&mut self, findings: Vec<Finding>, confidence_threshold: f64) {
        self.vision_findings
            .extend(findings.into_iter().filter(|f| {
                (0.0..=1.0).contains(&f.confidence) && f.confidence >= confidence_threshold
            }));
    }

    pub fn set_graph(&mut self, evidence: GraphEvidence) {
        self.graph_evidence = Some(evidence);
    }

    pub fn set_site_type(&mut self, guess: SiteTypeGuess) {
        self.site_type = Some(guess);
    }

    /// Set the final verdict. Set exactly once; a second call is an
    /// orchestrator bug.
    pub fn set_verdict(&mut self, verdict: TrustResult) -> Result<(), AuditError> {
        if self.verdict.is_some() {
            return Err(AuditError::Internal("verdict already set".into()));
        }
        self.verdict = Some(verdict);
        Ok(())
    }

    /// Append a recoverable error record.
    pub fn push_error(&mut self, phase: &str, err: &AuditError) {
        self.errors.push(AuditErrorRecord::new(phase, err));
    }

    /// Transition status. Terminal statuses are sticky.
    pub fn set_status(&mut self, status: AuditStatus) {
        if !self.status.is_terminal() {
            self.status = status;
        }
    }

    /// Number of screenshots captured so far.
    pub fn screenshots_count(&self) -> usize {
        self.scout_evidence
            .iter()
            .filter(|e| e.screenshot.is_some())
            .count()
    }

    /// All links discovered on scouted pages that were not yet
    /// investigated, in discovery order, deduplicated.
    pub fn undiscovered_links(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for ev in &self.scout_evidence {
            for link in &ev.links {
                if !self.investigated_urls.contains(link) && seen.insert(link.clone()) {
                    out.push(link.clone());
                }
            }
        }
        out
    }
}

/// Verdict rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictMode {
    Simple,
    Expert,
}

impl std::fmt::Display for VerdictMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Expert => write!(f, "expert"),
        }
    }
}

/// The final result document emitted on stdout after the audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub url: String,
    pub trust_score: f64,
    pub risk_level: RiskLevel,
    pub signal_scores: BTreeMap<String, u8>,
    pub overrides: Vec<String>,
    pub narrative: String,
    pub recommendations: Vec<String>,
    pub findings: Vec<Finding>,
    pub security_results: BTreeMap<String, SecurityModuleResult>,
    pub site_type: Option<SiteType>,
    pub site_type_confidence: Option<f64>,
    pub pages_scanned: u32,
    pub screenshots_count: usize,
    pub elapsed_seconds: f64,
    pub errors: Vec<AuditErrorRecord>,
    pub verdict_mode: VerdictMode,
}

impl FinalReport {
    /// Assemble the report from a terminal audit state. The verdict must be
    /// set.
    pub fn from_state(
        state: &AuditState,
        verdict_mode: VerdictMode,
        elapsed_seconds: f64,
    ) -> Result<Self, AuditError> {
        let verdict = state
            .verdict
            .as_ref()
            .ok_or_else(|| AuditError::Internal("report requested without verdict".into()))?;
        Ok(Self {
            url: state.target_url.clone(),
            trust_score: verdict.final_score,
            risk_level: verdict.risk_level,
            signal_scores: verdict.signal_scores.clone(),
            overrides: verdict.overrides.clone(),
            narrative: verdict.narrative.clone(),
            recommendations: verdict.recommendations.clone(),
            findings: state.vision_findings.clone(),
            security_results: state.security_evidence.clone(),
            site_type: state.site_type.map(|g| g.site_type),
            site_type_confidence: state.site_type.map(|g| g.confidence),
            pages_scanned: state.counters.pages_scouted,
            screenshots_count: state.screenshots_count(),
            elapsed_seconds,
            errors: state.errors.clone(),
            verdict_mode,
        })
    }
}
