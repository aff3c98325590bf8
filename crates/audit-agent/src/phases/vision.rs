//! Vision phase: dark-pattern analysis of captured pages.
//!
//! The model client sits behind [`VisionModel`]. [`RemoteVision`] posts
//! screenshots to an inference endpoint; [`NoopVision`] is the fallback
//! when no endpoint is configured.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use forensics::error::AuditError;
use forensics::events::ProgressEvent;
use forensics::state::{AuditState, Finding};
use forensics::transport::ProgressSink;

use super::{pct, VisionContext, VisionModel};
use crate::config::AuditConfig;

/// Prompts sent with every batch, one per taxonomy bucket.
const PROMPTS: [&str; 5] = [
    "identify interface interference: hidden information, preselection, trick wording",
    "identify sneaking: hidden costs, hidden subscriptions, basket sneaking",
    "identify urgency pressure: countdowns, limited-time and low-stock messages",
    "identify fake social proof: fabricated activity, testimonials, endorsements",
    "identify obstruction: hard-to-cancel flows, forced accounts, nagging",
];

/// No-op model for unconfigured deployments: reports nothing.
pub struct NoopVision;

#[async_trait]
impl VisionModel for NoopVision {
    async fn analyze(
        &self,
        _screenshots: &[Vec<u8>],
        _context: &VisionContext,
    ) -> Result<Vec<Finding>, AuditError> {
        Ok(Vec::new())
    }
}

/// HTTP inference client. Request: `{url, prompts, images, excerpts}` with
/// base64 images; response: `{"findings": [Finding, …]}`.
pub struct RemoteVision {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RemoteVision {
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            api_key: api_key.map(String::from),
        }
    }
}

#[derive(serde::Deserialize)]
struct VisionResponse {
    findings: Vec<Finding>,
}

#[async_trait]
impl VisionModel for RemoteVision {
    async fn analyze(
        &self,
        screenshots: &[Vec<u8>],
        context: &VisionContext,
    ) -> Result<Vec<Finding>, AuditError> {
        let images: Vec<String> = screenshots.iter().map(|s| BASE64.encode(s)).collect();
        let payload = serde_json::json!({
            "url": context.url,
            "prompts": context.prompts,
            "images": images,
            "excerpts": context.excerpts,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AuditError::upstream("vision", e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::upstream("vision", format!("HTTP {status}")));
        }
        let parsed: VisionResponse = response
            .json()
            .await
            .map_err(|e| AuditError::upstream("vision", format!("bad response: {e}")))?;
        Ok(parsed.findings)
    }
}

/// Run the vision phase over all evidence gathered so far. Respects the
/// soft AI-call budget: when it is already spent the phase records a note
/// and skips the model call.
pub async fn run(
    state: &mut AuditState,
    vision: &dyn VisionModel,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
    config: &AuditConfig,
) -> Result<(), AuditError> {
    if state.scout_evidence.is_empty() {
        return Ok(());
    }
    if state.counters.ai_calls >= state.budget.max_ai_calls {
        tracing::warn!(
            ai_calls = state.counters.ai_calls,
            "ai call budget spent, skipping vision analysis"
        );
        return Ok(());
    }
    if cancel.is_cancelled() {
        return Err(AuditError::Cancelled);
    }

    let screenshots: Vec<Vec<u8>> = state
        .scout_evidence
        .iter()
        .filter_map(|e| e.screenshot.clone())
        .collect();
    let context = VisionContext {
        url: state.target_url.clone(),
        prompts: PROMPTS.iter().map(|p| p.to_string()).collect(),
        excerpts: state
            .scout_evidence
            .iter()
            .map(|e| e.body_excerpt.clone())
            .collect(),
    };

    state.record_ai_call();
    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(AuditError::Cancelled),
        result = tokio::time::timeout(
            config.audit_timeout,
            vision.analyze(&screenshots, &context),
        ) => result,
    };

    let findings = match result {
        Ok(Ok(findings)) => findings,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(AuditError::timeout("vision analysis", config.audit_timeout)),
    };

    let before = state.vision_findings.len();
    state.merge_vision(findings, config.confidence_threshold);
    for finding in &state.vision_findings[before..] {
        let mut summary = std::collections::BTreeMap::new();
        summary.insert(
            "pattern".to_string(),
            serde_json::to_string(&finding.pattern)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
        );
        summary.insert(
            "severity".to_string(),
            serde_json::to_string(&finding.severity)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
        );
        summary.insert("confidence".to_string(), format!("{:.2}", finding.confidence));
        sink.emit(ProgressEvent::finding("vision", pct::VISION_END, summary));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forensics::state::{DarkPatternCategory, DarkPatternKind, Severity};

    #[tokio::test]
    async fn test_noop_vision_reports_nothing() {
        let findings = NoopVision
            .analyze(
                &[],
                &VisionContext {
                    url: "https://example.com".into(),
                    prompts: vec![],
                    excerpts: vec![],
                },
            )
            .await
            .unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_vision_response_shape() {
        let json = serde_json::json!({
            "findings": [{
                "category": "urgency",
                "pattern": "countdown_timer",
                "severity": "medium",
                "confidence": 0.8,
                "description": "checkout shows 10:00 countdown",
                "paraphrase": "a timer pressures you to buy quickly"
            }]
        });
        let parsed: VisionResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.findings.len(), 1);
        assert_eq!(parsed.findings[0].category, DarkPatternCategory::Urgency);
        assert_eq!(parsed.findings[0].pattern, DarkPatternKind::CountdownTimer);
        assert_eq!(parsed.findings[0].severity, Severity::Medium);
    }
}
