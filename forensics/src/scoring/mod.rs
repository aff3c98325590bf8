//! Deterministic trust-score computation.
//!
//! Six weighted sub-signals produce a 0–100 score, with the weight vector
//! swapped for a site-type-specific one when the classification is
//! confident enough, then hard overrides applied in declared order. Given
//! identical inputs the output is byte-identical: no randomness, no clock
//! reads, and signal order cannot matter because signals are folded in
//! canonical order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::{
    Finding, RiskLevel, Severity, SignalName, SiteType, SiteTypeGuess, SubSignal, TrustResult,
    VerdictMode,
};

/// Hard-override flags raised by security modules and graph evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideFlag {
    PhishingListHit,
    DarknetMarketplaceMatch,
    SslAbsent,
}

/// What an override does to the score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverrideAction {
    /// Clamp the score to at most this value.
    Clamp(f64),
    /// Subtract a fixed penalty.
    Penalty(f64),
}

impl OverrideFlag {
    /// Application order. Overrides are always applied in this sequence
    /// regardless of the order they were collected in.
    pub const ORDER: [OverrideFlag; 3] = [
        Self::PhishingListHit,
        Self::DarknetMarketplaceMatch,
        Self::SslAbsent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PhishingListHit => "phishing_list_hit",
            Self::DarknetMarketplaceMatch => "darknet_marketplace_match",
            Self::SslAbsent => "ssl_absent",
        }
    }

    pub fn action(self) -> OverrideAction {
        match self {
            Self::PhishingListHit => OverrideAction::Clamp(15.0),
            Self::DarknetMarketplaceMatch => OverrideAction::Clamp(25.0),
            Self::SslAbsent => OverrideAction::Penalty(25.0),
        }
    }

    fn recommendation(self) -> &'static str {
        match self {
            Self::PhishingListHit => {
                "This address appears on a phishing blocklist. Do not enter credentials or payment details."
            }
            Self::DarknetMarketplaceMatch => {
                "The domain matches a known dark-market listing. Avoid any transaction."
            }
            Self::SslAbsent => {
                "The site is served without TLS. Never submit sensitive data over this connection."
            }
        }
    }
}

impl std::fmt::Display for OverrideFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Scoring tuning.
#[derive(Debug, Clone, Copy)]
pub struct ScoreConfig {
    /// Minimum site-type confidence before the type-specific weight vector
    /// replaces the default.
    pub site_type_confidence_threshold: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            site_type_confidence_threshold: 0.6,
        }
    }
}

/// Everything the score computation consumes.
#[derive(Debug, Clone)]
pub struct ScoreInput {
    pub signals: Vec<SubSignal>,
    pub site_type: Option<SiteTypeGuess>,
    pub overrides: Vec<OverrideFlag>,
    pub findings: Vec<Finding>,
    pub mode: VerdictMode,
}

/// Weight per signal in [`SignalName::ALL`] order.
type WeightVector = [f64; 6];

const DEFAULT_WEIGHTS: WeightVector = [0.25, 0.15, 0.10, 0.20, 0.10, 0.20];

fn weights_for(site_type: SiteType) -> WeightVector {
    match site_type {
        SiteType::Banking => [0.15, 0.10, 0.05, 0.25, 0.05, 0.40],
        SiteType::Ecommerce => [0.30, 0.20, 0.10, 0.15, 0.05, 0.20],
        SiteType::News => [0.20, 0.15, 0.10, 0.15, 0.25, 0.15],
        SiteType::Social => [0.25, 0.15, 0.15, 0.20, 0.10, 0.15],
        SiteType::Portfolio => [0.20, 0.25, 0.05, 0.15, 0.20, 0.15],
        SiteType::Unknown => DEFAULT_WEIGHTS,
    }
}

/// Compute the final trust verdict.
pub fn compute(input: &ScoreInput, config: &ScoreConfig) -> TrustResult {
    // Index signals by name; a missing signal contributes nothing.
    let mut by_name: BTreeMap<SignalName, SubSignal> = BTreeMap::new();
    for signal in &input.signals {
        by_name.insert(signal.name, *signal);
    }

    let mut weights = match input.site_type {
        Some(guess) if guess.confidence >= config.site_type_confidence_threshold => {
            weights_for(guess.site_type)
        }
        _ => DEFAULT_WEIGHTS,
    };
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        for w in &mut weights {
            *w /= total;
        }
    }

    let mut raw = 0.0;
    let mut signal_scores = BTreeMap::new();
    for (idx, name) in SignalName::ALL.iter().enumerate() {
        let (score, confidence) = by_name
            .get(name)
            .map(|s| (s.raw_score, s.confidence))
            .unwrap_or((0.0, 0.0));
        raw += weights[idx] * score * confidence;
        signal_scores.insert(
            name.as_str().to_string(),
            ((score * confidence * 100.0).round() as i64).clamp(0, 100) as u8,
        );
    }
    let mut score = (raw * 100.0).clamp(0.0, 100.0);

    // Overrides apply in declared order, each recorded by name.
    let mut applied = Vec::new();
    for flag in OverrideFlag::ORDER {
        if !input.overrides.contains(&flag) {
            continue;
        }
        match flag.action() {
            OverrideAction::Clamp(max) => score = score.min(max),
            OverrideAction::Penalty(points) => score = (score - points).max(0.0),
        }
        applied.push(flag.name().to_string());
    }

    let risk_level = RiskLevel::from_score(score);
    let recommendations = recommendations(&applied, &input.findings);
    let narrative = narrative(score, risk_level, &signal_scores, &applied, input);

    TrustResult {
        final_score: (score * 10.0).round() / 10.0,
        risk_level,
        signal_scores,
        overrides: applied,
        narrative,
        recommendations,
    }
}

/// Deterministic recommendation list: override-driven advice first (in
/// override order), then high-severity findings ordered by severity, then
/// category id, then pattern id.
fn recommendations(applied: &[String], findings: &[Finding]) -> Vec<String> {
    let mut out = Vec::new();
    for flag in OverrideFlag::ORDER {
        if applied.iter().any(|a| a == flag.name()) {
            out.push(flag.recommendation().to_string());
        }
    }

    let mut severe: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.severity >= Severity::High)
        .collect();
    severe.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.category.id().cmp(&b.category.id()))
            .then(a.pattern.id().cmp(&b.pattern.id()))
    });
    for finding in severe {
        let line = format!(
            "Watch out for {}: {}",
            finding.pattern.id_name(),
            finding.paraphrase
        );
        if !out.contains(&line) {
            out.push(line);
        }
    }
    out
}

fn narrative(
    score: f64,
    risk: RiskLevel,
    signal_scores: &BTreeMap<String, u8>,
    applied: &[String],
    input: &ScoreInput,
) -> String {
    let mut text = format!(
        "Trust score {score:.1}/100 ({risk}). {} dark-pattern finding(s) recorded.",
        input.findings.len()
    );
    if let Some(guess) = input.site_type {
        text.push_str(&format!(
            " Site classified as {:?} (confidence {:.2}).",
            guess.site_type, guess.confidence
        ));
    }
    if !applied.is_empty() {
        text.push_str(&format!(" Overrides applied: {}.", applied.join(", ")));
    }
    if input.mode == VerdictMode::Expert {
        let breakdown: Vec<String> = signal_scores
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        text.push_str(&format!(" Signal breakdown: {}.", breakdown.join(", ")));
    }
    text
}

impl crate::state::DarkPatternKind {
    /// Human-readable name for recommendations.
    pub fn id_name(self) -> &'static str {
        use crate::state::DarkPatternKind::*;
        match self {
            HiddenInformation => "hidden information",
            Preselection => "preselected options",
            TrickWording => "trick wording",
            DisguisedAd => "disguised advertising",
            FalseHierarchy => "false visual hierarchy",
            SneakIntoBasket => "items sneaked into the basket",
            HiddenCosts => "hidden costs",
            HiddenSubscription => "a hidden subscription",
            BaitAndSwitch => "bait and switch",
            CountdownTimer => "a pressure countdown",
            LimitedTimeMessage => "limited-time pressure",
            LowStockMessage => "low-stock pressure",
            HighDemandMessage => "high-demand pressure",
            FakeActivityNotification => "fake activity notifications",
            FakeTestimonial => "fake testimonials",
            FakeEndorsement => "fake endorsements",
            HardToCancel => "hard-to-cancel flows",
            RoachMotel => "easy-in hard-out signup",
            PriceComparisonPrevention => "price-comparison prevention",
            ForcedAccount => "forced account creation",
            NaggingPrompt => "nagging prompts",
        }
    }
}
