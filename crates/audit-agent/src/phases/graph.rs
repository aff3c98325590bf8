//! Graph phase: OSINT/CTI fanout and entity verification.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use forensics::error::AuditError;
use forensics::osint::consensus::{self, ConsensusConfig, ReputationTracker};
use forensics::osint::feeds::{host_of, ThreatFeeds};
use forensics::osint::source::{IntelQuery, SourceCategory};
use forensics::osint::FanoutEngine;
use forensics::state::{AuditState, GraphEvidence};
use forensics::transport::ProgressSink;

use crate::config::AuditConfig;

/// Entity keywords from the first captured title: alphabetic tokens longer
/// than three characters, lowercased, first five.
fn entity_keywords(state: &AuditState) -> Vec<String> {
    state
        .scout_evidence
        .first()
        .and_then(|e| e.title.as_deref())
        .map(|title| {
            title
                .split(|c: char| !c.is_alphabetic())
                .filter(|t| t.len() > 3)
                .map(|t| t.to_ascii_lowercase())
                .take(5)
                .collect()
        })
        .unwrap_or_default()
}

/// Run the OSINT fanout against the target domain and merge the resulting
/// entity profile. Offline feed checks run even when the network fanout
/// fails, so the phase always leaves graph evidence behind.
pub async fn run(
    state: &mut AuditState,
    fanout: &FanoutEngine,
    feeds: &ThreatFeeds,
    reputation: &Arc<Mutex<ReputationTracker>>,
    _sink: &dyn ProgressSink,
    cancel: &CancellationToken,
    config: &AuditConfig,
) -> Result<(), AuditError> {
    let domain = host_of(&state.target_url)
        .ok_or_else(|| AuditError::Input(format!("no host in {}", state.target_url)))?;
    let query = IntelQuery {
        domain: domain.clone(),
        keywords: entity_keywords(state),
    };

    // Tier 4 is a luxury; skip it once the soft AI budget is nearly spent.
    let budget_tight = state.counters.ai_calls + 2 >= state.budget.max_ai_calls;

    let mut fanout_error = None;
    let report = match tokio::time::timeout(
        config.graph_timeout,
        fanout.query_all(&query, cancel, budget_tight),
    )
    .await
    {
        Ok(report) => report,
        Err(_) => {
            fanout_error = Some(AuditError::timeout("osint fanout", config.graph_timeout));
            Default::default()
        }
    };
    if cancel.is_cancelled() {
        return Err(AuditError::Cancelled);
    }

    let verdict = {
        let tracker = reputation.lock().expect("reputation tracker poisoned");
        let inputs = fanout.consensus_inputs(&report.reports, Some(&tracker));
        consensus::resolve(&inputs, &ConsensusConfig::default())
    };
    if let Some(v) = &verdict {
        let mut tracker = reputation.lock().expect("reputation tracker poisoned");
        tracker.absorb(v, 1.0);
    }

    let entity_verified = report.reports.iter().any(|r| {
        matches!(
            r.category,
            SourceCategory::Dns | SourceCategory::Whois | SourceCategory::Ssl
        )
    });
    let phishing_listed = feeds.is_phishing_url(&state.target_url)
        || feeds.is_phishing_host(&domain)
        || report
            .reports
            .iter()
            .any(|r| r.attributes.get("phishing_listed").map(String::as_str) == Some("true"));
    let darknet = feeds.darknet_exposure(&domain, &query.keywords);

    state.set_graph(GraphEvidence {
        domain,
        verdict,
        reports: report.reports,
        phishing_listed,
        darknet,
        entity_verified,
    });

    if let Some(e) = fanout_error {
        state.push_error("graph", &e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forensics::state::{AuditTier, ScoutEvidence};

    #[test]
    fn test_entity_keywords_from_title() {
        let budget = AuditTier::Quick.default_budget();
        let mut state = AuditState::new("https://acme-shop.example", AuditTier::Quick, budget);
        state
            .record_scout(ScoutEvidence {
                url: "https://acme-shop.example".into(),
                final_url: "https://acme-shop.example".into(),
                status_code: Some(200),
                title: Some("Acme Shop - Cheap Watches & More!".into()),
                headers: Default::default(),
                links: vec![],
                forms: vec![],
                uses_tls: true,
                body_excerpt: String::new(),
                screenshot: None,
                fetched_at: Utc::now(),
                elapsed_ms: 1,
            })
            .unwrap();
        assert_eq!(entity_keywords(&state), vec!["acme", "shop", "cheap", "watches", "more"]);
    }

    #[test]
    fn test_entity_keywords_without_title() {
        let budget = AuditTier::Quick.default_budget();
        let state = AuditState::new("https://example.com", AuditTier::Quick, budget);
        assert!(entity_keywords(&state).is_empty());
    }
}
