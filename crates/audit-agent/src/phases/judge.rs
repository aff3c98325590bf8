//! Judge phase: site typing, signal synthesis and the loop decision.
//!
//! Everything here is CPU-only and deterministic. The model-assisted parts
//! of judgement live behind [`JudgePolicy`]; the default policy requests
//! more pages for the deeper tiers while links and budgets allow.

use forensics::osint::source::SourceVerdict;
use forensics::scoring::{self, OverrideFlag, ScoreConfig, ScoreInput};
use forensics::state::{
    AuditState, DarkPatternCategory, SignalName, SiteType, SiteTypeGuess, SubSignal, TrustResult,
    VerdictMode,
};

use super::{JudgeDecision, JudgePolicy};

/// Keyword table driving the deterministic site classifier.
const SITE_TYPE_KEYWORDS: [(SiteType, &[&str]); 5] = [
    (
        SiteType::Banking,
        &["bank", "banking", "iban", "account", "transfer", "swift"],
    ),
    (
        SiteType::Ecommerce,
        &["cart", "checkout", "shop", "price", "buy", "shipping", "order"],
    ),
    (
        SiteType::News,
        &["news", "article", "breaking", "editorial", "reporter"],
    ),
    (
        SiteType::Social,
        &["follow", "friends", "share", "profile", "feed", "message"],
    ),
    (
        SiteType::Portfolio,
        &["portfolio", "resume", "projects", "about me", "freelance"],
    ),
];

/// Classify the site from URL, titles and body excerpts.
pub fn classify_site(state: &AuditState) -> SiteTypeGuess {
    let mut haystack = state.target_url.to_ascii_lowercase();
    for page in &state.scout_evidence {
        if let Some(title) = &page.title {
            haystack.push(' ');
            haystack.push_str(&title.to_ascii_lowercase());
        }
        haystack.push(' ');
        haystack.push_str(&page.body_excerpt);
    }

    let mut best = (SiteType::Unknown, 0usize);
    for (site_type, keywords) in SITE_TYPE_KEYWORDS {
        let hits = keywords.iter().filter(|k| haystack.contains(**k)).count();
        if hits > best.1 {
            best = (site_type, hits);
        }
    }
    let confidence = match best.1 {
        0 => 0.0,
        1 => 0.4,
        2 => 0.65,
        _ => 0.85,
    };
    SiteTypeGuess {
        site_type: if best.1 == 0 { SiteType::Unknown } else { best.0 },
        confidence,
    }
}

fn severity_weight(severity: forensics::state::Severity) -> f64 {
    use forensics::state::Severity::*;
    match severity {
        Low => 0.15,
        Medium => 0.3,
        High => 0.6,
        Critical => 1.0,
    }
}

/// Build the six sub-signals from the accumulated evidence.
pub fn build_signals(state: &AuditState) -> Vec<SubSignal> {
    let pages = state.counters.pages_scouted;
    let findings = &state.vision_findings;

    // Visual: dark-pattern pressure weighted by severity and confidence.
    let visual_pressure: f64 = findings
        .iter()
        .map(|f| severity_weight(f.severity) * f.confidence)
        .sum();
    let visual = SubSignal::new(
        SignalName::Visual,
        (1.0 - visual_pressure / 2.0).max(0.0),
        if pages == 0 { 0.2 } else { 0.95 },
        findings.len() as u32,
    );

    // Structural: page shape sanity over forms, status codes and links.
    let (mut structural_raw, structural_conf) = if pages == 0 {
        (0.5, 0.2)
    } else {
        let mut raw: f64 = 1.0;
        for page in &state.scout_evidence {
            if page.status_code.map(|s| s >= 400).unwrap_or(true) {
                raw -= 0.3;
            }
            if page.forms.iter().any(|f| f.has_password_field && !page.uses_tls) {
                raw -= 0.4;
            }
        }
        (raw, 0.9)
    };
    structural_raw = structural_raw.max(0.0);
    let structural = SubSignal::new(SignalName::Structural, structural_raw, structural_conf, pages);

    // Temporal: urgency-pattern pressure.
    let urgency_count = findings
        .iter()
        .filter(|f| f.category == DarkPatternCategory::Urgency)
        .count();
    let temporal = SubSignal::new(
        SignalName::Temporal,
        (1.0 - 0.25 * urgency_count as f64).max(0.0),
        if pages == 0 { 0.2 } else { 0.9 },
        urgency_count as u32,
    );

    // Graph: consensus verdict, entity verification and darknet exposure.
    let (mut graph_raw, mut graph_conf, graph_count): (f64, f64, u32) = match &state.graph_evidence {
        Some(graph) => {
            let count = graph.reports.len() as u32;
            match &graph.verdict {
                Some(v) => {
                    let towards = v.confidence_pct / 100.0;
                    let raw = match v.verdict {
                        SourceVerdict::Clean => 0.5 + 0.5 * towards,
                        SourceVerdict::Malicious => 0.5 - 0.5 * towards,
                    };
                    (raw, if v.confirmed { 0.95 } else { 0.7 }, count)
                }
                None => (0.5, 0.4, count),
            }
        }
        None => (0.5, 0.2, 0),
    };
    if let Some(graph) = &state.graph_evidence {
        if graph.entity_verified {
            graph_raw = (graph_raw + 0.05).min(1.0);
        }
        if graph.darknet.is_exposed() {
            graph_raw = (graph_raw - 0.3).max(0.0);
            graph_conf = graph_conf.max(0.8);
        }
    }
    let graph = SubSignal::new(SignalName::Graph, graph_raw, graph_conf, graph_count);

    // Meta: titles, headers and classification coherence.
    let (meta_raw, meta_conf) = if pages == 0 {
        (0.5, 0.2)
    } else {
        let titled = state
            .scout_evidence
            .iter()
            .filter(|e| e.title.is_some())
            .count() as f64;
        let share = titled / pages as f64;
        (0.6 + 0.4 * share, 0.9)
    };
    let meta = SubSignal::new(SignalName::Meta, meta_raw, meta_conf, pages);

    // Security: mean of the module scores.
    let security = if state.security_evidence.is_empty() {
        SubSignal::new(SignalName::Security, 0.5, 0.2, 0)
    } else {
        let sum: f64 = state.security_evidence.values().map(|r| r.score).sum();
        SubSignal::new(
            SignalName::Security,
            sum / state.security_evidence.len() as f64,
            0.95,
            state.security_evidence.len() as u32,
        )
    };

    vec![visual, structural, temporal, graph, meta, security]
}

/// Collect the hard-override flags raised across the evidence.
pub fn collect_overrides(state: &AuditState) -> Vec<OverrideFlag> {
    let mut flags = Vec::new();
    for result in state.security_evidence.values() {
        for name in &result.flags {
            match name.as_str() {
                "phishing_list_hit" => flags.push(OverrideFlag::PhishingListHit),
                "darknet_marketplace_match" => flags.push(OverrideFlag::DarknetMarketplaceMatch),
                "ssl_absent" => flags.push(OverrideFlag::SslAbsent),
                other => tracing::warn!(flag = other, "unknown override flag ignored"),
            }
        }
    }
    if let Some(graph) = &state.graph_evidence {
        if graph.phishing_listed {
            flags.push(OverrideFlag::PhishingListHit);
        }
        if graph.darknet.market_domain_match {
            flags.push(OverrideFlag::DarknetMarketplaceMatch);
        }
    }
    flags.sort();
    flags.dedup();
    flags
}

/// Synthesize the final verdict from the current state.
pub fn synthesize(state: &mut AuditState, mode: VerdictMode, forced: bool) -> TrustResult {
    if state.site_type.is_none() {
        let guess = classify_site(state);
        state.set_site_type(guess);
    }
    let input = ScoreInput {
        signals: build_signals(state),
        site_type: state.site_type,
        overrides: collect_overrides(state),
        findings: state.vision_findings.clone(),
        mode,
    };
    let mut result = scoring::compute(&input, &ScoreConfig::default());
    if forced {
        let prefix = if state.scout_evidence.is_empty() {
            "Verdict forced with no successfully captured pages; treat with caution. "
        } else {
            "Verdict forced before the investigation completed. "
        };
        result.narrative = format!("{prefix}{}", result.narrative);
    }
    result
}

/// Default judgement policy.
///
/// Quick audits always conclude. Deep audits keep requesting undiscovered
/// links while any budget headroom remains. Standard audits loop only when
/// the graph consensus is absent or unconfirmed.
pub struct DefaultJudgePolicy;

impl JudgePolicy for DefaultJudgePolicy {
    fn decide(&self, state: &AuditState) -> JudgeDecision {
        use forensics::state::AuditTier;

        if state.tier == AuditTier::Quick {
            return JudgeDecision::Verdict;
        }
        let links = state.undiscovered_links();
        if links.is_empty() {
            return JudgeDecision::Verdict;
        }
        let want = match state.tier {
            AuditTier::Quick => 0,
            AuditTier::Standard => {
                let confirmed = state
                    .graph_evidence
                    .as_ref()
                    .and_then(|g| g.verdict.as_ref())
                    .map(|v| v.confirmed)
                    .unwrap_or(false);
                if confirmed {
                    0
                } else {
                    3
                }
            }
            AuditTier::Deep => 5,
        };
        if want == 0 {
            return JudgeDecision::Verdict;
        }
        JudgeDecision::RequestPages(links.into_iter().take(want).collect())
    }
}
