//! Security phase: the enabled analyzer modules.
//!
//! Built-ins cover transport security, phishing blocklist lookup and
//! credential-capture heuristics. Anything implementing [`SecurityModule`]
//! slots into the same set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forensics::error::AuditError;
use forensics::osint::feeds::{host_of, ThreatFeeds};
use forensics::scoring::OverrideFlag;
use forensics::state::{AuditState, ScoutEvidence, SecurityModuleResult};
use forensics::transport::ProgressSink;

use super::SecurityModule;

/// TLS and security-header checks over the captured pages.
pub struct TransportSecurityModule;

const EXPECTED_HEADERS: [&str; 3] = [
    "strict-transport-security",
    "content-security-policy",
    "x-frame-options",
];

#[async_trait]
impl SecurityModule for TransportSecurityModule {
    fn name(&self) -> &str {
        "transport_security"
    }

    async fn run(&self, evidence: &[ScoutEvidence]) -> Result<SecurityModuleResult, AuditError> {
        let Some(main) = evidence.first() else {
            return Err(AuditError::upstream("transport_security", "no pages captured"));
        };
        let mut details = BTreeMap::new();
        let mut flags = Vec::new();

        let tls = main.uses_tls;
        details.insert("tls".to_string(), tls.to_string());
        if !tls {
            flags.push(OverrideFlag::SslAbsent.name().to_string());
        }

        let mut present = 0usize;
        for header in EXPECTED_HEADERS {
            let has = main.headers.contains_key(header);
            details.insert(header.to_string(), has.to_string());
            if has {
                present += 1;
            }
        }

        let header_share = present as f64 / EXPECTED_HEADERS.len() as f64;
        let score = if tls { 0.6 + 0.4 * header_share } else { 0.2 * header_share };
        Ok(SecurityModuleResult {
            module: self.name().to_string(),
            passed: tls,
            score,
            details,
            flags,
        })
    }
}

/// Offline phishing blocklist lookup over every captured URL.
pub struct PhishingBlocklistModule {
    feeds: Arc<ThreatFeeds>,
}

impl PhishingBlocklistModule {
    pub fn new(feeds: Arc<ThreatFeeds>) -> Self {
        Self { feeds }
    }
}

#[async_trait]
impl SecurityModule for PhishingBlocklistModule {
    fn name(&self) -> &str {
        "phishing_blocklist"
    }

    async fn run(&self, evidence: &[ScoutEvidence]) -> Result<SecurityModuleResult, AuditError> {
        let mut listed_urls = Vec::new();
        for page in evidence {
            if self.feeds.is_phishing_url(&page.url)
                || host_of(&page.url)
                    .map(|h| self.feeds.is_phishing_host(&h))
                    .unwrap_or(false)
            {
                listed_urls.push(page.url.clone());
            }
        }
        let hit = !listed_urls.is_empty();
        let mut details = BTreeMap::new();
        details.insert("listed".to_string(), hit.to_string());
        if hit {
            details.insert("listed_urls".to_string(), listed_urls.join(","));
        }
        Ok(SecurityModuleResult {
            module: self.name().to_string(),
            passed: !hit,
            score: if hit { 0.0 } else { 1.0 },
            details,
            flags: if hit {
                vec![OverrideFlag::PhishingListHit.name().to_string()]
            } else {
                Vec::new()
            },
        })
    }
}

/// Credential-capture heuristics: password forms over plaintext transport
/// or posting off-origin.
pub struct FormCaptureModule;

#[async_trait]
impl SecurityModule for FormCaptureModule {
    fn name(&self) -> &str {
        "form_capture"
    }

    async fn run(&self, evidence: &[ScoutEvidence]) -> Result<SecurityModuleResult, AuditError> {
        let mut plaintext_password_pages = 0u32;
        let mut offsite_posts = 0u32;
        let mut form_count = 0u32;

        for page in evidence {
            let page_host = host_of(&page.final_url);
            for form in &page.forms {
                form_count += 1;
                if form.has_password_field && !page.uses_tls {
                    plaintext_password_pages += 1;
                }
                if let Some(action) = &form.action {
                    if action.starts_with("http") {
                        let action_host = host_of(action);
                        if action_host.is_some() && action_host != page_host {
                            offsite_posts += 1;
                        }
                    }
                }
            }
        }

        let mut details = BTreeMap::new();
        details.insert("forms".to_string(), form_count.to_string());
        details.insert(
            "plaintext_password_forms".to_string(),
            plaintext_password_pages.to_string(),
        );
        details.insert("offsite_posts".to_string(), offsite_posts.to_string());

        let penalties = plaintext_password_pages as f64 * 0.5 + offsite_posts as f64 * 0.25;
        Ok(SecurityModuleResult {
            module: self.name().to_string(),
            passed: plaintext_password_pages == 0,
            score: (1.0 - penalties).max(0.0),
            details,
            flags: Vec::new(),
        })
    }
}

/// Run every enabled module. Module errors are recorded on the state and
/// the phase carries on; only cancellation propagates.
pub async fn run(
    state: &mut AuditState,
    modules: &[Arc<dyn SecurityModule>],
    enabled: Option<&BTreeSet<String>>,
    _sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<(), AuditError> {
    for module in modules {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        if let Some(enabled) = enabled {
            if !enabled.contains(module.name()) {
                continue;
            }
        }
        match module.run(&state.scout_evidence).await {
            Ok(result) => {
                tracing::debug!(module = %result.module, score = result.score, "security module done");
                state.merge_security(result);
            }
            Err(AuditError::Cancelled) => return Err(AuditError::Cancelled),
            Err(e) => {
                tracing::warn!(module = module.name(), error = %e, "security module failed");
                state.push_error("security", &e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forensics::state::FormSummary;

    fn page(url: &str, tls: bool, headers: &[&str], forms: Vec<FormSummary>) -> ScoutEvidence {
        ScoutEvidence {
            url: url.to_string(),
            final_url: url.to_string(),
            status_code: Some(200),
            title: None,
            headers: headers
                .iter()
                .map(|h| (h.to_string(), "1".to_string()))
                .collect(),
            links: vec![],
            forms,
            uses_tls: tls,
            body_excerpt: String::new(),
            screenshot: None,
            fetched_at: Utc::now(),
            elapsed_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_transport_security_scores_headers() {
        let module = TransportSecurityModule;
        let good = module
            .run(&[page(
                "https://example.com",
                true,
                &["strict-transport-security", "content-security-policy"],
                vec![],
            )])
            .await
            .unwrap();
        assert!(good.passed);
        assert!(good.score > 0.8);
        assert!(good.flags.is_empty());

        let bad = module
            .run(&[page("http://example.com", false, &[], vec![])])
            .await
            .unwrap();
        assert!(!bad.passed);
        assert_eq!(bad.flags, vec!["ssl_absent"]);
    }

    #[tokio::test]
    async fn test_transport_security_needs_evidence() {
        let err = TransportSecurityModule.run(&[]).await.unwrap_err();
        assert_eq!(err.kind(), forensics::error::ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn test_form_capture_flags_plaintext_password() {
        let module = FormCaptureModule;
        let result = module
            .run(&[page(
                "http://shop.example",
                false,
                &[],
                vec![FormSummary {
                    action: Some("/login".into()),
                    method: "post".into(),
                    has_password_field: true,
                    input_count: 2,
                }],
            )])
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.score <= 0.5);
    }

    #[tokio::test]
    async fn test_form_capture_offsite_post() {
        let module = FormCaptureModule;
        let result = module
            .run(&[page(
                "https://shop.example",
                true,
                &[],
                vec![FormSummary {
                    action: Some("https://collector.evil/submit".into()),
                    method: "post".into(),
                    has_password_field: false,
                    input_count: 3,
                }],
            )])
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.details.get("offsite_posts").unwrap(), "1");
        assert!(result.score < 1.0);
    }
}
