//! Weighted multi-source consensus.
//!
//! Verdict-capable sources contribute `base_weight × confidence ×
//! (confidence_bias if malicious)` to their side. Disagreement is preserved
//! as an explicit conflict record naming the most trusted source on each
//! side; it is never collapsed away.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::osint::source::{SourceVerdict, TrustLevel};

/// One source's contribution to consensus, paired with its registry
/// weights.
#[derive(Debug, Clone)]
pub struct ConsensusInput {
    pub source: String,
    pub trust_level: TrustLevel,
    pub base_weight: f64,
    pub confidence_bias: f64,
    pub verdict: SourceVerdict,
    /// Source-reported confidence in [0, 1].
    pub confidence: f64,
}

/// A resolved weighted vote, kept for the evidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedVote {
    pub source: String,
    pub verdict: SourceVerdict,
    pub contribution: f64,
    pub confidence: f64,
}

/// Preserved disagreement between sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Most trusted source voting malicious.
    pub malicious_champion: String,
    /// Most trusted source voting clean.
    pub clean_champion: String,
    pub explanation: String,
}

/// Aggregated verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVerdict {
    pub verdict: SourceVerdict,
    /// Confidence scaled to 0–100.
    pub confidence_pct: f64,
    pub malicious_ratio: f64,
    /// Whether the confirmation rules were met.
    pub confirmed: bool,
    pub votes: Vec<WeightedVote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictRecord>,
}

/// Consensus tuning.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusConfig {
    /// Single high-trust source confidence needed for a confirmed verdict.
    pub high_confidence_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.85,
        }
    }
}

fn trust_rank(level: TrustLevel) -> u8 {
    match level {
        TrustLevel::Unknown => 0,
        TrustLevel::Low => 1,
        TrustLevel::Medium => 2,
        TrustLevel::High => 3,
    }
}

/// Resolve a set of verdict-capable reports into one consensus.
///
/// Returns `None` when no input carries a verdict. Order-independent:
/// inputs are canonicalized by source name before any accumulation, so
/// `resolve(permute(xs)) == resolve(xs)` byte for byte.
pub fn resolve(inputs: &[ConsensusInput], config: &ConsensusConfig) -> Option<ConsensusVerdict> {
    if inputs.is_empty() {
        return None;
    }
    let mut ordered: Vec<&ConsensusInput> = inputs.iter().collect();
    ordered.sort_by(|a, b| a.source.cmp(&b.source));

    let mut votes = Vec::with_capacity(ordered.len());
    let mut sum_malicious = 0.0;
    let mut sum_clean = 0.0;
    for input in &ordered {
        let confidence = input.confidence.clamp(0.0, 1.0);
        let contribution = match input.verdict {
            SourceVerdict::Malicious => {
                let c = input.base_weight * confidence * input.confidence_bias;
                sum_malicious += c;
                c
            }
            SourceVerdict::Clean => {
                let c = input.base_weight * confidence;
                sum_clean += c;
                c
            }
        };
        votes.push(WeightedVote {
            source: input.source.clone(),
            verdict: input.verdict,
            contribution,
            confidence,
        });
    }

    let total = sum_malicious + sum_clean;
    if total <= 0.0 {
        return None;
    }
    let malicious_ratio = sum_malicious / total;
    let verdict = if malicious_ratio >= 0.5 {
        SourceVerdict::Malicious
    } else {
        SourceVerdict::Clean
    };
    let confidence_pct = match verdict {
        SourceVerdict::Malicious => malicious_ratio * 100.0,
        SourceVerdict::Clean => (1.0 - malicious_ratio) * 100.0,
    };

    let conflict = if sum_malicious > 0.0 && sum_clean > 0.0 {
        let champion = |side: SourceVerdict| {
            ordered
                .iter()
                .filter(|i| i.verdict == side)
                .max_by(|a, b| {
                    trust_rank(a.trust_level)
                        .cmp(&trust_rank(b.trust_level))
                        .then(
                            (a.base_weight * a.confidence)
                                .partial_cmp(&(b.base_weight * b.confidence))
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                        .then(b.source.cmp(&a.source))
                })
                .map(|i| i.source.clone())
                .unwrap_or_default()
        };
        let malicious_champion = champion(SourceVerdict::Malicious);
        let clean_champion = champion(SourceVerdict::Clean);
        Some(ConflictRecord {
            explanation: format!(
                "{malicious_champion} reports malicious while {clean_champion} reports clean; \
                 weighted malicious ratio {malicious_ratio:.2} decides {verdict:?}",
            ),
            malicious_champion,
            clean_champion,
        })
    } else {
        None
    };

    let agreeing: Vec<&&ConsensusInput> =
        ordered.iter().filter(|i| i.verdict == verdict).collect();
    let high_trust_agreeing = agreeing
        .iter()
        .filter(|i| i.trust_level == TrustLevel::High)
        .count();
    let confirmed = agreeing.len() >= 3
        || high_trust_agreeing >= 2
        || (high_trust_agreeing == 1
            && agreeing
                .iter()
                .filter(|i| i.trust_level == TrustLevel::High)
                .all(|i| i.confidence >= config.high_confidence_threshold));

    Some(ConsensusVerdict {
        verdict,
        confidence_pct,
        malicious_ratio,
        confirmed,
        votes,
        conflict,
    })
}

/// Tracks per-source agreement with eventual consensus and adjusts base
/// weights inside a bounded band.
#[derive(Debug, Clone)]
pub struct ReputationTracker {
    weights: HashMap<String, f64>,
    min_weight: f64,
    max_weight: f64,
    step: f64,
}

impl ReputationTracker {
    pub fn new(min_weight: f64, max_weight: f64, step: f64) -> Self {
        Self {
            weights: HashMap::new(),
            min_weight,
            max_weight,
            step,
        }
    }

    /// Record whether `source` agreed with the resolved consensus.
    pub fn observe(&mut self, source: &str, default_weight: f64, agreed: bool) {
        let entry = self
            .weights
            .entry(source.to_string())
            .or_insert(default_weight);
        let delta = if agreed { self.step } else { -self.step };
        *entry = (*entry + delta).clamp(self.min_weight, self.max_weight);
    }

    /// Current effective weight for `source`.
    pub fn weight_for(&self, source: &str, default_weight: f64) -> f64 {
        self.weights.get(source).copied().unwrap_or(default_weight)
    }

    /// Fold a resolved consensus back into the tracker.
    pub fn absorb(&mut self, verdict: &ConsensusVerdict, default_weight: f64) {
        for vote in &verdict.votes {
            self.observe(&vote.source, default_weight, vote.verdict == verdict.verdict);
        }
    }
}

impl Default for ReputationTracker {
    fn default() -> Self {
        Self::new(0.25, 2.0, 0.05)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(
        source: &str,
        trust: TrustLevel,
        weight: f64,
        bias: f64,
        verdict: SourceVerdict,
        confidence: f64,
    ) -> ConsensusInput {
        ConsensusInput {
            source: source.into(),
            trust_level: trust,
            base_weight: weight,
            confidence_bias: bias,
            verdict,
            confidence,
        }
    }

    #[test]
    fn test_high_trust_malicious_dominates_conflict() {
        // alpha: high trust, malicious 0.7; beta: medium trust, clean 0.8
        let inputs = vec![
            input(
                "alpha",
                TrustLevel::High,
                1.5,
                1.2,
                SourceVerdict::Malicious,
                0.7,
            ),
            input("beta", TrustLevel::Medium, 1.0, 1.0, SourceVerdict::Clean, 0.8),
        ];
        let verdict = resolve(&inputs, &ConsensusConfig::default()).unwrap();
        assert!(verdict.malicious_ratio >= 0.5);
        assert_eq!(verdict.verdict, SourceVerdict::Malicious);

        let conflict = verdict.conflict.unwrap();
        assert_eq!(conflict.malicious_champion, "alpha");
        assert_eq!(conflict.clean_champion, "beta");
        assert!(conflict.explanation.contains("alpha"));
        assert!(conflict.explanation.contains("beta"));
    }

    #[test]
    fn test_unanimous_has_no_conflict() {
        let inputs = vec![
            input("a", TrustLevel::Medium, 1.0, 1.0, SourceVerdict::Clean, 0.9),
            input("b", TrustLevel::Low, 0.8, 1.0, SourceVerdict::Clean, 0.7),
        ];
        let verdict = resolve(&inputs, &ConsensusConfig::default()).unwrap();
        assert_eq!(verdict.verdict, SourceVerdict::Clean);
        assert!(verdict.conflict.is_none());
        assert_eq!(verdict.malicious_ratio, 0.0);
    }

    #[test]
    fn test_order_independence() {
        let a = input(
            "alpha",
            TrustLevel::High,
            1.5,
            1.2,
            SourceVerdict::Malicious,
            0.7,
        );
        let b = input("beta", TrustLevel::Medium, 1.0, 1.0, SourceVerdict::Clean, 0.8);
        let c = input("gamma", TrustLevel::Low, 0.5, 1.0, SourceVerdict::Clean, 0.4);

        let fwd = resolve(
            &[a.clone(), b.clone(), c.clone()],
            &ConsensusConfig::default(),
        )
        .unwrap();
        let rev = resolve(&[c, b, a], &ConsensusConfig::default()).unwrap();
        assert_eq!(fwd, rev);
        assert_eq!(
            serde_json::to_string(&fwd).unwrap(),
            serde_json::to_string(&rev).unwrap()
        );
    }

    #[test]
    fn test_confirmed_by_three_agreeing() {
        let inputs = vec![
            input("a", TrustLevel::Low, 1.0, 1.0, SourceVerdict::Malicious, 0.6),
            input("b", TrustLevel::Low, 1.0, 1.0, SourceVerdict::Malicious, 0.6),
            input("c", TrustLevel::Low, 1.0, 1.0, SourceVerdict::Malicious, 0.6),
        ];
        assert!(resolve(&inputs, &ConsensusConfig::default())
            .unwrap()
            .confirmed);
    }

    #[test]
    fn test_confirmed_by_two_high_trust() {
        let inputs = vec![
            input("a", TrustLevel::High, 1.5, 1.2, SourceVerdict::Malicious, 0.6),
            input("b", TrustLevel::High, 1.5, 1.2, SourceVerdict::Malicious, 0.6),
        ];
        assert!(resolve(&inputs, &ConsensusConfig::default())
            .unwrap()
            .confirmed);
    }

    #[test]
    fn test_confirmed_by_single_confident_high_trust() {
        let inputs = vec![input(
            "a",
            TrustLevel::High,
            1.5,
            1.2,
            SourceVerdict::Malicious,
            0.9,
        )];
        assert!(resolve(&inputs, &ConsensusConfig::default())
            .unwrap()
            .confirmed);

        let weak = vec![input(
            "a",
            TrustLevel::High,
            1.5,
            1.2,
            SourceVerdict::Malicious,
            0.6,
        )];
        assert!(!resolve(&weak, &ConsensusConfig::default())
            .unwrap()
            .confirmed);
    }

    #[test]
    fn test_two_medium_sources_not_confirmed() {
        let inputs = vec![
            input("a", TrustLevel::Medium, 1.0, 1.0, SourceVerdict::Clean, 0.9),
            input("b", TrustLevel::Medium, 1.0, 1.0, SourceVerdict::Clean, 0.9),
        ];
        assert!(!resolve(&inputs, &ConsensusConfig::default())
            .unwrap()
            .confirmed);
    }

    #[test]
    fn test_empty_and_no_verdicts() {
        assert!(resolve(&[], &ConsensusConfig::default()).is_none());
        let zero = vec![input(
            "a",
            TrustLevel::Low,
            0.0,
            1.0,
            SourceVerdict::Clean,
            0.0,
        )];
        assert!(resolve(&zero, &ConsensusConfig::default()).is_none());
    }

    #[test]
    fn test_reputation_bounded() {
        let mut tracker = ReputationTracker::new(0.5, 1.5, 0.2);
        for _ in 0..20 {
            tracker.observe("flaky", 1.0, false);
        }
        assert_eq!(tracker.weight_for("flaky", 1.0), 0.5);

        for _ in 0..40 {
            tracker.observe("solid", 1.0, true);
        }
        assert_eq!(tracker.weight_for("solid", 1.0), 1.5);
        assert_eq!(tracker.weight_for("unseen", 0.9), 0.9);
    }

    #[test]
    fn test_reputation_absorb() {
        let inputs = vec![
            input("agree", TrustLevel::Medium, 1.0, 1.0, SourceVerdict::Clean, 0.9),
            input(
                "dissent",
                TrustLevel::Medium,
                1.0,
                1.0,
                SourceVerdict::Malicious,
                0.1,
            ),
        ];
        let verdict = resolve(&inputs, &ConsensusConfig::default()).unwrap();
        assert_eq!(verdict.verdict, SourceVerdict::Clean);

        let mut tracker = ReputationTracker::default();
        tracker.absorb(&verdict, 1.0);
        assert!(tracker.weight_for("agree", 1.0) > 1.0);
        assert!(tracker.weight_for("dissent", 1.0) < 1.0);
    }
}
